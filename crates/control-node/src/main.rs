//! Voice Relay control node
//!
//! # Servers
//!
//! - Worker RPC listener (default: 0.0.0.0:3000)
//! - HTTP server for health, metrics and admin routes (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Initialize logging and load configuration from environment
//! 2. Install the Prometheus metrics recorder
//! 3. Build the worker registry, binder and session manager
//! 4. Bind the worker listener and the HTTP listener
//! 5. Mark ready and wait for a shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::config::ObservabilityConfig;
use control_node::actors::{ActorMetrics, SessionManagerHandle, SessionOptions};
use control_node::config::Config;
use control_node::gateway::{ChatGateway, StandaloneGateway};
use control_node::media::DirectUrlResolver;
use control_node::observability::{health_router, HealthState};
use control_node::routes::{build_routes, AppState};
use control_node::workers::{RegistryBinder, WorkerRegistry, WorkerServer};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_rpc::endpoint::AcceptorConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Time given to listeners to drain after cancellation.
const DRAIN_DELAY: Duration = Duration::from_secs(2);

/// Endpoint reported in synthesized voice sessions.
const STANDALONE_VOICE_ENDPOINT: &str = "standalone.invalid";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ObservabilityConfig::from_vars(
        &std::env::vars().collect(),
        "control_node=info,relay_rpc=info,tower_http=info",
    )
    .init_tracing()?;

    info!("Starting Voice Relay control node");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        rpc_bind_address = %config.rpc_bind_address,
        http_bind_address = %config.http_bind_address,
        workers = config.worker_credentials.len(),
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        call_timeout_secs = config.call_timeout.as_secs(),
        "Configuration loaded successfully"
    );

    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    let shutdown_token = CancellationToken::new();

    // Session plumbing
    let registry = Arc::new(WorkerRegistry::new());
    let health_state = Arc::new(HealthState::new(Arc::clone(&registry)));
    let gateway: Arc<dyn ChatGateway> = Arc::new(StandaloneGateway::new(
        config.node_name.clone(),
        STANDALONE_VOICE_ENDPOINT,
    ));
    let binder = Arc::new(RegistryBinder::new(
        Arc::clone(&registry),
        Arc::clone(&gateway),
        config.call_timeout,
    ));
    let actor_metrics = ActorMetrics::new();
    let sessions = SessionManagerHandle::new(
        binder,
        Arc::new(DirectUrlResolver),
        SessionOptions {
            retry_backoff: config.reconnect_backoff,
            idle_timeout: config.session_idle_timeout,
        },
        Arc::clone(&actor_metrics),
    );

    // Worker listener
    let rpc_addr: SocketAddr = config.rpc_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.rpc_bind_address, "Invalid RPC bind address");
        format!("Invalid RPC bind address: {e}")
    })?;
    let rpc_listener = tokio::net::TcpListener::bind(rpc_addr).await.map_err(|e| {
        error!(error = %e, addr = %rpc_addr, "Failed to bind worker listener");
        format!("Failed to bind worker listener to {rpc_addr}: {e}")
    })?;

    let worker_server = WorkerServer::new(
        Arc::clone(&registry),
        config.worker_credentials.clone(),
        AcceptorConfig {
            heartbeat_interval: config.heartbeat_interval,
            handshake_timeout: config.handshake_timeout,
        },
        config.node_name.clone(),
        gateway,
    );
    let rpc_token = shutdown_token.child_token();
    let rpc_task = tokio::spawn(worker_server.serve(rpc_listener, rpc_token));
    info!(addr = %rpc_addr, "Worker listener bound");

    // HTTP: health, metrics, admin
    let http_addr: SocketAddr = config.http_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.http_bind_address, "Invalid HTTP bind address");
        format!("Invalid HTTP bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app_state = Arc::new(AppState {
        sessions: sessions.clone(),
        registry,
    });
    let app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .merge(build_routes(app_state));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let http_listener = tokio::net::TcpListener::bind(http_addr).await.map_err(|e| {
        error!(error = %e, addr = %http_addr, "Failed to bind HTTP server");
        format!("Failed to bind HTTP server to {http_addr}: {e}")
    })?;

    let http_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %http_addr, "HTTP server starting");
        let server = axum::serve(http_listener, app).with_graceful_shutdown(async move {
            http_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!("Control node running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    // Halt sessions first so workers get a clean disconnect.
    if let Err(e) = sessions.shutdown().await {
        warn!(error = %e, "Session shutdown error");
    }
    sessions.cancel();

    shutdown_token.cancel();
    tokio::time::sleep(DRAIN_DELAY).await;
    if let Err(e) = rpc_task.await {
        warn!(error = %e, "Worker listener task failed");
    }

    info!(
        actor_panics = actor_metrics.panic_count(),
        "Control node shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Without signal handlers there is no graceful shutdown"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Without signal handlers there is no graceful shutdown"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
