//! Worker error types.

use relay_rpc::{CallError, HandlerError, HandshakeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// `resource_call` named a method resources do not have.
    #[error("Unknown resource method: {0}")]
    UnknownMethod(String),

    /// A playback method was called before `connect`.
    #[error("Resource {0} has no media connection")]
    NotConnected(String),

    /// The media capability failed.
    #[error("Media error: {0}")]
    Media(String),

    /// Dialing the control node failed.
    #[error("Failed to reach control node at {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The control node did not hand out a connection id.
    #[error("Control node sent no connection id")]
    MissingConnectionId,

    /// A call to the control node failed.
    #[error("Control node call failed: {0}")]
    Call(#[from] CallError),
}

impl From<WorkerError> for HandlerError {
    fn from(error: WorkerError) -> Self {
        match error {
            WorkerError::UnknownMethod(_) => HandlerError::InvalidArgs(error.to_string()),
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_mapping() {
        let unknown: HandlerError = WorkerError::UnknownMethod("rewind".to_string()).into();
        assert!(matches!(unknown, HandlerError::InvalidArgs(msg) if msg.contains("rewind")));

        let media: HandlerError = WorkerError::Media("decoder crashed".to_string()).into();
        assert_eq!(media, HandlerError::Failed("Media error: decoder crashed".to_string()));
    }
}
