//! Control node connection lifecycle.
//!
//! Dial, authenticate, serve resource calls until the connection ends, then
//! drop every resource silently and dial again after the reconnect delay.
//!
//! Handlers served to the control node:
//!
//! | kind | method              | args                                 |
//! |------|---------------------|--------------------------------------|
//! | call | `make_resource_ref` |                                      |
//! | call | `resource_call`     | `method, remote_ref, args...`        |

use crate::config::Config;
use crate::errors::WorkerError;
use crate::media::MediaBackend;
use crate::resource::ResourceTable;

use relay_protocol::resource::worker_method;
use relay_rpc::endpoint::{self, InitiatorConfig};
use relay_rpc::handshake::ClientCredentials;
use relay_rpc::{CloseReason, ConnectionHandle, HandlerRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handlers for one connection, backed by `table`.
#[must_use]
pub fn handlers(table: Arc<ResourceTable>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    let minting = Arc::clone(&table);
    handlers.on_call(worker_method::MAKE_RESOURCE_REF, move |_conn, _args| {
        let table = Arc::clone(&minting);
        async move { Ok(json!(table.make_resource_ref())) }
    });

    handlers.on_call(worker_method::RESOURCE_CALL, move |conn, args| {
        let table = Arc::clone(&table);
        async move {
            let method: String = args.get(0, "method")?;
            let remote_ref: String = args.get(1, "remote_ref")?;
            table
                .dispatch(&conn, &method, &remote_ref, &args.tail(2))
                .await
        }
    });

    handlers
}

/// An authenticated connection to the control node.
#[derive(Debug)]
pub struct WorkerSession {
    pub handle: ConnectionHandle,
    pub table: Arc<ResourceTable>,
    task: JoinHandle<CloseReason>,
}

impl WorkerSession {
    /// Wait for the connection to end, then drop all resources.
    pub async fn serve(self) -> CloseReason {
        let reason = self
            .task
            .await
            .unwrap_or_else(|e| CloseReason::Transport(format!("connection task failed: {e}")));

        let dropped = self.table.close_all().await;
        info!(
            target: "worker.connection",
            reason = %reason,
            dropped_resources = dropped,
            "Control node connection closed"
        );
        reason
    }
}

/// The worker process: config plus media capability.
#[derive(Clone)]
pub struct VoiceWorker {
    config: Config,
    backend: Arc<dyn MediaBackend>,
}

impl std::fmt::Debug for VoiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VoiceWorker {
    #[must_use]
    pub fn new(config: Config, backend: Arc<dyn MediaBackend>) -> Self {
        Self { config, backend }
    }

    fn initiator(&self) -> InitiatorConfig {
        InitiatorConfig {
            credentials: ClientCredentials {
                client_id: self.config.client_id.clone(),
                secret: self.config.client_secret.clone(),
            },
            info: self.config.capability_info(),
            handshake_timeout: self.config.handshake_timeout,
        }
    }

    /// Authenticate over `io` and start serving.
    pub async fn establish<S>(
        &self,
        io: S,
        cancel_token: CancellationToken,
    ) -> Result<WorkerSession, WorkerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut table = None;
        let backend = Arc::clone(&self.backend);
        let progress_interval = self.config.progress_interval;

        let established = endpoint::connect(
            io,
            &self.initiator(),
            |info: &Value| {
                let Some(connection_id) = info.get("connection_id").and_then(Value::as_str)
                else {
                    return HandlerRegistry::new();
                };
                let created = ResourceTable::new(connection_id, backend, progress_interval);
                table = Some(Arc::clone(&created));
                handlers(created)
            },
            cancel_token,
        )
        .await?;

        let Some(table) = table else {
            established.handle.close();
            return Err(WorkerError::MissingConnectionId);
        };

        let node = node_name(established.handle.remote_info());
        info!(
            target: "worker.connection",
            connection_id = %table.connection_id(),
            node = %node,
            "Connected to control node"
        );

        Ok(WorkerSession {
            handle: established.handle,
            table,
            task: established.task,
        })
    }

    /// Dial, authenticate and serve one connection.
    async fn serve_once(&self, cancel_token: &CancellationToken) -> Result<CloseReason, WorkerError> {
        let address = &self.config.control_address;
        let stream = tokio::select! {
            () = cancel_token.cancelled() => return Ok(CloseReason::Shutdown),
            dialed = TcpStream::connect(address) => dialed.map_err(|e| WorkerError::Dial {
                address: address.clone(),
                reason: e.to_string(),
            })?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "worker.connection", error = %e, "set_nodelay failed");
        }

        let session = tokio::select! {
            () = cancel_token.cancelled() => return Ok(CloseReason::Shutdown),
            established = self.establish(stream, cancel_token.child_token()) => established?,
        };

        // Cancellation closes the connection through the child token, so
        // serving always ends with the resources dropped.
        Ok(session.serve().await)
    }

    /// Keep a connection to the control node until `cancel_token` fires.
    #[instrument(skip_all, name = "worker.run", fields(client_id = %self.config.client_id))]
    pub async fn run(&self, cancel_token: CancellationToken) {
        loop {
            match self.serve_once(&cancel_token).await {
                Ok(reason) => {
                    info!(target: "worker.connection", reason = %reason, "Connection ended");
                }
                Err(e) => {
                    warn!(target: "worker.connection", error = %e, "Connection attempt failed");
                }
            }

            if cancel_token.is_cancelled() {
                break;
            }

            debug!(
                target: "worker.connection",
                delay_secs = self.config.reconnect_delay.as_secs(),
                "Reconnecting after delay"
            );
            tokio::select! {
                () = cancel_token.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!(target: "worker.connection", "Worker stopped");
    }
}

/// Name the control node announced in its handshake info.
fn node_name(info: &Value) -> &str {
    info.get("name").and_then(Value::as_str).unwrap_or("unknown")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::ClockedBackend;
    use common::secret::SecretString;
    use relay_rpc::endpoint::AcceptorConfig;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(control_address: &str) -> Config {
        Config::from_vars(&HashMap::from([
            ("WORKER_CLIENT_ID".to_string(), "1512".to_string()),
            ("WORKER_CLIENT_SECRET".to_string(), "hello_world".to_string()),
            ("WORKER_CONTROL_ADDRESS".to_string(), control_address.to_string()),
            ("WORKER_RECONNECT_DELAY_SECONDS".to_string(), "0".to_string()),
        ]))
        .unwrap()
    }

    fn worker(control_address: &str) -> VoiceWorker {
        VoiceWorker::new(config(control_address), Arc::new(ClockedBackend::default()))
    }

    fn credentials() -> HashMap<String, SecretString> {
        HashMap::from([("1512".to_string(), SecretString::from("hello_world"))])
    }

    fn acceptor() -> AcceptorConfig {
        AcceptorConfig {
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    /// Control node stand-in that hands out `connection_id` (or not).
    async fn accept_one(
        io: tokio::io::DuplexStream,
        connection_id: Option<&'static str>,
    ) -> relay_rpc::Established {
        let store = credentials();
        let (accepted, established) = endpoint::accept(
            io,
            &store,
            acceptor(),
            move |_client_id| async move {
                json!({ "name": "voice-relay", "connection_id": connection_id })
            },
            |_accepted| ("1512".to_string(), HandlerRegistry::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(accepted.client_id, "1512");
        assert_eq!(accepted.remote_info["max_sessions"], 15);
        established
    }

    #[tokio::test]
    async fn test_establish_serves_resource_refs() {
        let (node_io, worker_io) = tokio::io::duplex(64 * 1024);
        let node = tokio::spawn(accept_one(node_io, Some("1512-00ff")));

        let session = worker("unused:0")
            .establish(worker_io, CancellationToken::new())
            .await
            .unwrap();
        let node = node.await.unwrap();

        let remote_ref: String = node
            .handle
            .call_as(worker_method::MAKE_RESOURCE_REF, vec![], None)
            .await
            .unwrap();
        assert_eq!(remote_ref, "1512-00ff.1");
        assert_eq!(session.table.connection_id(), "1512-00ff");
        assert_eq!(node_name(session.handle.remote_info()), "voice-relay");

        node.handle.close();
        let reason = session.serve().await;
        assert_eq!(reason, CloseReason::Eof);
    }

    #[test]
    fn test_node_name_defaults_when_absent() {
        assert_eq!(node_name(&json!({ "name": "cn-east" })), "cn-east");
        assert_eq!(node_name(&json!({ "name": 7 })), "unknown");
        assert_eq!(node_name(&Value::Null), "unknown");
    }

    #[tokio::test]
    async fn test_missing_connection_id_is_an_error() {
        let (node_io, worker_io) = tokio::io::duplex(64 * 1024);
        let _node = tokio::spawn(accept_one(node_io, None));

        let err = worker("unused:0")
            .establish(worker_io, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::MissingConnectionId));
    }

    #[tokio::test]
    async fn test_run_redials_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let cancel = CancellationToken::new();
        let worker = worker(&address);
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };

        // Drop the first two sockets before the handshake completes.
        for _ in 0..2 {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
    }
}
