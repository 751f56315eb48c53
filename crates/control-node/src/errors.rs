//! Control node error types.
//!
//! Messages shown to end users (session notices, admin responses) come from
//! [`CnError::client_message`], which never includes internal detail. The
//! full error is logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::types::{Region, RoomId};
use relay_rpc::CallError;
use serde::Serialize;
use thiserror::Error;

/// Control node error type.
#[derive(Debug, Error)]
pub enum CnError {
    /// No session exists for the room.
    #[error("Session not found: {0}")]
    SessionNotFound(RoomId),

    /// Selection found no worker able to serve the region.
    #[error("No worker available for region {0}")]
    NoWorkerAvailable(Region),

    /// A call to a worker failed.
    #[error("Worker call failed: {0}")]
    Worker(#[from] CallError),

    /// The chat gateway rejected or failed a request.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// The chat gateway did not confirm a voice join in time.
    #[error("Timed out waiting for the gateway to confirm the voice session")]
    GatewayTimeout,

    /// A media query could not be resolved.
    #[error("Media error: {0}")]
    Media(String),

    /// Malformed request from the admin surface.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The node is shutting down and no longer accepts work.
    #[error("Control node is shutting down")]
    ShuttingDown,

    /// Internal error (actor channel failures and similar).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CnError {
    /// Stable error code for responses and metric labels.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            CnError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            CnError::NoWorkerAvailable(_) => "NO_WORKER_AVAILABLE",
            CnError::Worker(_) => "WORKER_ERROR",
            CnError::Gateway(_) | CnError::GatewayTimeout => "GATEWAY_ERROR",
            CnError::Media(_) => "MEDIA_ERROR",
            CnError::InvalidRequest(_) => "BAD_REQUEST",
            CnError::ShuttingDown => "SHUTTING_DOWN",
            CnError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for the admin surface.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            CnError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            CnError::InvalidRequest(_) | CnError::Media(_) => StatusCode::BAD_REQUEST,
            CnError::NoWorkerAvailable(_) | CnError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CnError::Worker(_) | CnError::Gateway(_) => StatusCode::BAD_GATEWAY,
            CnError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            CnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CnError::SessionNotFound(_) => "Not connected to a voice channel here".to_string(),
            CnError::NoWorkerAvailable(_) => {
                "No voice worker is available right now, retrying".to_string()
            }
            CnError::Worker(_) | CnError::Gateway(_) | CnError::GatewayTimeout => {
                "The voice connection failed, please try again".to_string()
            }
            CnError::Media(reason) | CnError::InvalidRequest(reason) => reason.clone(),
            CnError::ShuttingDown => "Server is shutting down, please try again later".to_string(),
            CnError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether the failure means the worker connection is gone.
    #[must_use]
    pub fn is_worker_down(&self) -> bool {
        matches!(self, CnError::Worker(CallError::Down { .. }))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for CnError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(target: "cn.errors", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}
