//! Health endpoints for the control node.
//!
//! - `GET /health` - liveness, plain `OK`
//! - `GET /ready` - readiness as JSON. Ready once the worker listener is
//!   bound; the body also carries the number of registered workers.
//!
//! A node with zero workers is still ready: sessions wait in
//! `awaiting_worker` until one connects.

use crate::workers::WorkerRegistry;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct HealthState {
    listening: AtomicBool,
    registry: Arc<WorkerRegistry>,
}

impl HealthState {
    #[must_use]
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            listening: AtomicBool::new(false),
            registry,
        }
    }

    pub fn set_ready(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness, e.g. while draining for shutdown.
    pub fn set_not_ready(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    status: &'static str,
    workers: usize,
}

/// Router with `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessBody>) {
    let workers = state.registry.len().await;
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadinessBody {
                status: "ready",
                workers,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessBody {
                status: "not_ready",
                workers,
            }),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::util::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_liveness_is_plain_ok() {
        let app = health_router(Arc::new(HealthState::new(Arc::new(WorkerRegistry::new()))));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"OK");
    }

    #[tokio::test]
    async fn test_readiness_follows_listener_state() {
        let state = Arc::new(HealthState::new(Arc::new(WorkerRegistry::new())));

        let (status, body) = get_json(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");

        state.set_ready();
        let (status, body) = get_json(health_router(Arc::clone(&state)), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["workers"], 0);

        state.set_not_ready();
        let (status, _) = get_json(health_router(state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
