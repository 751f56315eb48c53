//! Worker RPC listener.
//!
//! Accepts worker sockets, runs the acceptor handshake and registers each
//! authenticated worker with the [`WorkerRegistry`]. When a worker
//! connection ends, every resource bound on it receives `Down`.
//!
//! Handlers served to workers:
//!
//! | kind | method                 | args                           |
//! |------|------------------------|--------------------------------|
//! | call | `gateway_voice_state`  | `room_id, channel_id \| null`  |
//! | call | `info`                 |                                |
//! | cast | `session_count_update` | `count`                        |
//! | cast | `remote_emit`          | `remote_ref, event, payload`   |

use super::registry::{WorkerLink, WorkerRegistry};
use super::selector::WorkerCapability;
use crate::gateway::ChatGateway;
use crate::observability::metrics;
use crate::proxy::ProxyEvent;

use common::secret::SecretString;
use common::types::{RemoteRef, RoomId, WorkerId};
use relay_protocol::resource::node_method;
use relay_protocol::ResourceEvent;
use relay_rpc::endpoint::{self, AcceptorConfig};
use relay_rpc::handshake::Accepted;
use relay_rpc::{HandlerError, HandlerRegistry};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Accepts and supervises worker connections.
#[derive(Clone)]
pub struct WorkerServer {
    registry: Arc<WorkerRegistry>,
    credentials: Arc<HashMap<String, SecretString>>,
    acceptor: AcceptorConfig,
    node_name: String,
    gateway: Arc<dyn ChatGateway>,
}

impl std::fmt::Debug for WorkerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServer")
            .field("node_name", &self.node_name)
            .field("clients", &self.credentials.len())
            .field("acceptor", &self.acceptor)
            .finish_non_exhaustive()
    }
}

impl WorkerServer {
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        credentials: HashMap<String, SecretString>,
        acceptor: AcceptorConfig,
        node_name: impl Into<String>,
        gateway: Arc<dyn ChatGateway>,
    ) -> Self {
        Self {
            registry,
            credentials: Arc::new(credentials),
            acceptor,
            node_name: node_name.into(),
            gateway,
        }
    }

    /// Accept workers until `cancel_token` fires. Live connections are
    /// closed through child tokens.
    pub async fn serve(self, listener: TcpListener, cancel_token: CancellationToken) {
        info!(
            target: "cn.workers.server",
            addr = ?listener.local_addr().ok(),
            "Worker listener started"
        );

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(target: "cn.workers.server", "Worker listener stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                debug!(target: "cn.workers.server", error = %e, "set_nodelay failed");
                            }
                            let server = self.clone();
                            let token = cancel_token.child_token();
                            tokio::spawn(async move {
                                server.handle_socket(socket, Some(peer), token).await;
                            });
                        }
                        Err(e) => {
                            warn!(target: "cn.workers.server", error = %e, "Accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Run one worker connection to completion.
    #[instrument(skip_all, name = "cn.workers.connection", fields(peer = ?peer))]
    pub async fn handle_socket<S>(
        &self,
        io: S,
        peer: Option<SocketAddr>,
        cancel_token: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Minted once the worker has proven its secret; read again when
        // the handlers are built.
        let minted: Arc<OnceLock<WorkerId>> = Arc::new(OnceLock::new());

        let registry = Arc::clone(&self.registry);
        let node_name = self.node_name.clone();
        let minted_for_info = Arc::clone(&minted);
        let server_info = move |client_id: String| async move {
            match registry.reserve_id(&client_id).await {
                Ok(id) => {
                    let info = json!({ "name": node_name, "connection_id": id });
                    let _ = minted_for_info.set(id);
                    info
                }
                Err(e) => {
                    warn!(target: "cn.workers.server", error = %e, "Connection id reservation failed");
                    json!({ "name": node_name, "connection_id": Value::Null })
                }
            }
        };

        let handlers = |accepted: &Accepted| {
            let label = minted
                .get()
                .map_or_else(|| accepted.client_id.clone(), ToString::to_string);
            (label, self.handlers(minted.get().cloned()))
        };

        let result = endpoint::accept(
            io,
            self.credentials.as_ref(),
            self.acceptor,
            server_info,
            handlers,
            cancel_token,
        )
        .await;

        let (accepted, established) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(target: "cn.workers.server", error = %e, "Worker handshake failed");
                metrics::record_handshake_failure(e.label());
                if let Some(id) = minted.get() {
                    self.registry.release(id).await;
                }
                return;
            }
        };

        let Some(id) = minted.get().cloned() else {
            warn!(
                target: "cn.workers.server",
                client_id = %accepted.client_id,
                "Worker accepted without a connection id"
            );
            metrics::record_handshake_failure("connection_id");
            established.handle.close();
            return;
        };

        let capability: WorkerCapability = match serde_json::from_value(accepted.remote_info) {
            Ok(capability) => capability,
            Err(e) => {
                warn!(
                    target: "cn.workers.server",
                    worker = %id,
                    error = %e,
                    "Worker sent unusable capability info"
                );
                metrics::record_handshake_failure("capability");
                established.handle.close();
                self.registry.release(&id).await;
                return;
            }
        };

        let link = Arc::new(WorkerLink::new(
            id.clone(),
            established.handle.clone(),
            capability,
        ));
        self.registry.register(Arc::clone(&link)).await;

        let (label, reason) = match established.task.await {
            Ok(reason) => (reason.label(), reason.to_string()),
            Err(e) => ("task_failed", format!("connection task failed: {e}")),
        };

        self.registry.unregister(&id).await;
        let notified = link.close_routes(&reason).await;
        metrics::record_worker_disconnect(label);

        info!(
            target: "cn.workers.server",
            worker = %id,
            reason = %reason,
            resources_down = notified,
            "Worker disconnected"
        );
    }

    fn handlers(&self, id: Option<WorkerId>) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();

        let gateway = Arc::clone(&self.gateway);
        handlers.on_call(node_method::GATEWAY_VOICE_STATE, move |_conn, args| {
            let gateway = Arc::clone(&gateway);
            async move {
                let room: RoomId = args.get(0, "room_id")?;
                let channel: Option<String> = args.optional(1, "channel_id")?;
                gateway
                    .update_voice_state(&room, channel.as_deref())
                    .await
                    .map_err(|e| HandlerError::Failed(e.client_message()))?;
                Ok(Value::Null)
            }
        });

        let node_name = self.node_name.clone();
        handlers.on_call(node_method::INFO, move |_conn, _args| {
            let name = node_name.clone();
            async move { Ok(json!(name)) }
        });

        let Some(id) = id else {
            return handlers;
        };

        let registry = Arc::clone(&self.registry);
        let worker = id.clone();
        handlers.on_cast(node_method::SESSION_COUNT_UPDATE, move |_conn, args| {
            let registry = Arc::clone(&registry);
            let worker = worker.clone();
            async move {
                let count: u32 = args.get(0, "count")?;
                if let Some(link) = registry.get(&worker).await {
                    link.set_session_count(count);
                    debug!(
                        target: "cn.workers.server",
                        worker = %worker,
                        sessions = count,
                        "Session count updated"
                    );
                }
                Ok(())
            }
        });

        let registry = Arc::clone(&self.registry);
        handlers.on_cast(node_method::REMOTE_EMIT, move |_conn, args| {
            let registry = Arc::clone(&registry);
            let worker = id.clone();
            async move {
                let remote_ref: RemoteRef = args.get(0, "remote_ref")?;
                let event_name: String = args.get(1, "event")?;
                let payload: Value = args.optional(2, "payload")?.unwrap_or(Value::Null);

                let event = ResourceEvent::from_emit(&event_name, payload)
                    .map_err(|e| HandlerError::InvalidArgs(e.to_string()))?;

                let Some(link) = registry.get(&worker).await else {
                    return Ok(());
                };
                if !link.dispatch_event(&remote_ref, ProxyEvent::from(event)).await {
                    debug!(
                        target: "cn.workers.server",
                        worker = %worker,
                        remote_ref = %remote_ref,
                        event = %event_name,
                        "Dropped event with no subscriber"
                    );
                }
                Ok(())
            }
        });

        handlers
    }
}
