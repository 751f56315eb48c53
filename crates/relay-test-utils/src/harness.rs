//! In-process control node and workers on loopback TCP.
//!
//! [`TestControlNode`] runs the real worker listener, registry, binder and
//! session manager against a [`MockGateway`]. [`TestWorker`] runs the real
//! worker connection loop against any media backend.

use crate::mock_gateway::MockGateway;

use common::secret::SecretString;
use control_node::actors::{ActorMetrics, SessionManagerHandle, SessionOptions};
use control_node::gateway::ChatGateway;
use control_node::media::DirectUrlResolver;
use control_node::routes::{self, AppState};
use control_node::workers::{RegistryBinder, WorkerBinder, WorkerRegistry, WorkerServer};
use relay_rpc::endpoint::AcceptorConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voice_worker::config::Config as WorkerConfig;
use voice_worker::media::MediaBackend;
use voice_worker::VoiceWorker;

/// Call timeout used by the harness binder.
pub const TEST_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Control node with a live worker listener.
///
/// # Example
/// ```rust,ignore
/// let node = TestControlNode::spawn(&[("1512", "hello_world")]).await?;
/// let _worker = TestWorker::spawn(&node, "1512", "hello_world", RecordingBackend::new())?;
/// node.wait_for_workers(1).await?;
///
/// node.sessions().join(channel).await?;
/// ```
pub struct TestControlNode {
    addr: SocketAddr,
    registry: Arc<WorkerRegistry>,
    gateway: Arc<MockGateway>,
    sessions: SessionManagerHandle,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestControlNode {
    /// Bind the worker listener on `127.0.0.1:0` and accept the given
    /// `(client_id, secret)` pairs.
    ///
    /// # Returns
    /// * `Ok(TestControlNode)` - Listening node
    /// * `Err(anyhow::Error)` - If the listener cannot be bound
    pub async fn spawn(credentials: &[(&str, &str)]) -> Result<Self, anyhow::Error> {
        let credentials: HashMap<String, SecretString> = credentials
            .iter()
            .map(|(id, secret)| ((*id).to_string(), SecretString::from(*secret)))
            .collect();

        let registry = Arc::new(WorkerRegistry::new());
        let gateway = Arc::new(MockGateway::new());
        let server = WorkerServer::new(
            Arc::clone(&registry),
            credentials,
            AcceptorConfig {
                heartbeat_interval: Duration::from_secs(5),
                handshake_timeout: Duration::from_secs(5),
            },
            "control-test",
            Arc::clone(&gateway) as Arc<dyn ChatGateway>,
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind worker listener: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, cancel_token.child_token()));

        let binder = RegistryBinder::new(
            Arc::clone(&registry),
            Arc::clone(&gateway) as Arc<dyn ChatGateway>,
            TEST_CALL_TIMEOUT,
        );
        let sessions = SessionManagerHandle::new(
            Arc::new(binder),
            Arc::new(DirectUrlResolver),
            SessionOptions {
                retry_backoff: Duration::from_millis(200),
                idle_timeout: Duration::from_secs(300),
            },
            ActorMetrics::new(),
        );

        Ok(Self {
            addr,
            registry,
            gateway,
            sessions,
            cancel_token,
            _handle: handle,
        })
    }

    /// Worker listener address, as a worker would dial it.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<MockGateway> {
        &self.gateway
    }

    pub fn sessions(&self) -> &SessionManagerHandle {
        &self.sessions
    }

    /// A binder over this node's registry, independent of the session manager.
    pub fn binder(&self) -> Arc<dyn WorkerBinder> {
        Arc::new(RegistryBinder::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.gateway) as Arc<dyn ChatGateway>,
            TEST_CALL_TIMEOUT,
        ))
    }

    /// Admin routes over this node's sessions and registry.
    pub fn app(&self) -> axum::Router {
        routes::build_routes(Arc::new(AppState {
            sessions: self.sessions.clone(),
            registry: Arc::clone(&self.registry),
        }))
    }

    /// Poll until exactly `count` workers are registered.
    pub async fn wait_for_workers(&self, count: usize) -> Result<(), anyhow::Error> {
        for _ in 0..500 {
            if self.registry.len().await == count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(anyhow::anyhow!(
            "registry has {} workers, expected {}",
            self.registry.len().await,
            count
        ))
    }
}

impl Drop for TestControlNode {
    fn drop(&mut self) {
        self.sessions.cancel();
        self.cancel_token.cancel();
    }
}

/// A worker process running its connection loop in the background.
pub struct TestWorker {
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestWorker {
    /// Start a worker that dials `node` with the given credentials.
    pub fn spawn(
        node: &TestControlNode,
        client_id: &str,
        secret: &str,
        backend: impl MediaBackend + 'static,
    ) -> Result<Self, anyhow::Error> {
        Self::spawn_with(node, client_id, secret, backend, &[])
    }

    /// Like [`TestWorker::spawn`] with extra `WORKER_*` variables, e.g.
    /// `("WORKER_REGIONS", "all")`.
    pub fn spawn_with(
        node: &TestControlNode,
        client_id: &str,
        secret: &str,
        backend: impl MediaBackend + 'static,
        extra: &[(&str, &str)],
    ) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("WORKER_CONTROL_ADDRESS".to_string(), node.address()),
            ("WORKER_CLIENT_ID".to_string(), client_id.to_string()),
            ("WORKER_CLIENT_SECRET".to_string(), secret.to_string()),
            ("WORKER_RECONNECT_DELAY_SECONDS".to_string(), "1".to_string()),
            ("WORKER_PROGRESS_INTERVAL_SECONDS".to_string(), "1".to_string()),
        ]);
        for (key, value) in extra {
            vars.insert((*key).to_string(), (*value).to_string());
        }

        let config = WorkerConfig::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create worker config: {}", e))?;
        let worker = VoiceWorker::new(config, Arc::new(backend));

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        Ok(Self {
            cancel_token,
            handle: Some(handle),
        })
    }

    /// Cancel the worker and wait for its resources to be dropped.
    pub async fn stop(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
