//! `GET /workers` - registered workers with their load.

use crate::routes::AppState;
use crate::workers::WorkerSummary;
use axum::{extract::State, Json};
use std::sync::Arc;

pub async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerSummary>> {
    let mut workers = state.registry.summaries().await;
    workers.sort_by(|a, b| a.id.cmp(&b.id));
    Json(workers)
}
