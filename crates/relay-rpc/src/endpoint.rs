//! Handshake followed by the main loop, for each role.

use crate::connection::{Connection, ConnectionHandle, ConnectionOptions};
use crate::dispatch::HandlerRegistry;
use crate::errors::{CloseReason, HandshakeError};
use crate::handshake::{self, Accepted, ClientCredentials, CredentialStore};
use crate::stream::PacketStream;

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A connection that has completed its handshake and is running.
#[derive(Debug)]
pub struct Established {
    pub handle: ConnectionHandle,
    /// Yields the close reason once the connection has torn down.
    pub task: JoinHandle<CloseReason>,
}

/// Initiator settings.
#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub credentials: ClientCredentials,
    /// Capability info sent to the acceptor.
    pub info: Value,
    pub handshake_timeout: Duration,
}

/// Acceptor settings.
#[derive(Debug, Clone, Copy)]
pub struct AcceptorConfig {
    /// Interval announced to initiators and used for our own pings.
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
}

/// Authenticate towards an acceptor and start the main loop.
///
/// `handlers` is built from the acceptor's info so that handlers can depend
/// on values it hands out (such as the connection id).
pub async fn connect<S, H>(
    io: S,
    config: &InitiatorConfig,
    handlers: H,
    cancel_token: CancellationToken,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: FnOnce(&Value) -> HandlerRegistry,
{
    let mut stream = PacketStream::new(io);
    let negotiated = handshake::initiate(
        &mut stream,
        &config.credentials,
        config.info.clone(),
        config.handshake_timeout,
    )
    .await?;

    let registry = Arc::new(handlers(&negotiated.remote_info));
    let options = ConnectionOptions::new(config.credentials.client_id.clone())
        .with_heartbeat_interval(negotiated.heartbeat_interval);

    let (handle, task) = Connection::spawn(
        stream,
        negotiated.remote_info,
        registry,
        options,
        cancel_token,
    );
    Ok(Established { handle, task })
}

/// Authenticate an initiator and start the main loop.
///
/// `server_info` runs after the initiator is verified. `handlers` runs once
/// the handshake has completed and may inspect the initiator's info.
pub async fn accept<S, F, Fut, H>(
    io: S,
    credentials: &dyn CredentialStore,
    config: AcceptorConfig,
    server_info: F,
    handlers: H,
    cancel_token: CancellationToken,
) -> Result<(Accepted, Established), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Value>,
    H: FnOnce(&Accepted) -> (String, HandlerRegistry),
{
    let mut stream = PacketStream::new(io);
    let accepted = handshake::accept(
        &mut stream,
        credentials,
        config.heartbeat_interval,
        config.handshake_timeout,
        server_info,
    )
    .await?;

    let (label, registry) = handlers(&accepted);
    let options = ConnectionOptions::new(label).with_heartbeat_interval(config.heartbeat_interval);

    let (handle, task) = Connection::spawn(
        stream,
        accepted.remote_info.clone(),
        Arc::new(registry),
        options,
        cancel_token,
    );
    Ok((accepted, Established { handle, task }))
}
