//! Voice Relay worker
//!
//! Connects to the control node and serves voice resources until
//! interrupted. A lost connection is re-dialed after
//! `WORKER_RECONNECT_DELAY_SECONDS`.

#![warn(clippy::pedantic)]

use std::sync::Arc;

use common::config::ObservabilityConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use voice_worker::config::Config;
use voice_worker::media::ClockedBackend;
use voice_worker::VoiceWorker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ObservabilityConfig::from_vars(&std::env::vars().collect(), "voice_worker=info,relay_rpc=info")
        .init_tracing()?;

    info!("Starting Voice Relay worker");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        control_address = %config.control_address,
        client_id = %config.client_id,
        max_sessions = config.max_sessions,
        regions = ?config.regions,
        "Configuration loaded successfully"
    );

    let worker = VoiceWorker::new(config, Arc::new(ClockedBackend::default()));
    let shutdown_token = CancellationToken::new();

    let run_token = shutdown_token.clone();
    let run = tokio::spawn(async move { worker.run(run_token).await });

    shutdown_signal().await;
    info!("Shutdown signal received, disconnecting resources...");
    shutdown_token.cancel();

    if let Err(e) = run.await {
        error!(error = %e, "Worker task failed");
    }

    info!("Worker shutdown complete");
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
