//! HTTP routes for the control node.
//!
//! Defines the admin router and its application state. Health and metrics
//! routes are merged in by the binary.

use crate::actors::SessionManagerHandle;
use crate::handlers;
use crate::workers::WorkerRegistry;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Upper bound for one admin request. A join waits on the chat gateway.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across admin handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManagerHandle,
    pub registry: Arc<WorkerRegistry>,
}

/// Build the admin routes.
///
/// - `GET /workers`
/// - `GET /rooms`, `GET /rooms/:room`
/// - `POST /rooms/:room/join|play|stop|volume`
/// - `DELETE /rooms/:room`
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/workers", get(handlers::list_workers))
        .route("/rooms", get(handlers::list_rooms))
        .route(
            "/rooms/:room",
            get(handlers::get_room).delete(handlers::leave_room),
        )
        .route("/rooms/:room/join", post(handlers::join_room))
        .route("/rooms/:room/play", post(handlers::play_in_room))
        .route("/rooms/:room/stop", post(handlers::stop_room))
        .route("/rooms/:room/volume", post(handlers::set_room_volume))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}
