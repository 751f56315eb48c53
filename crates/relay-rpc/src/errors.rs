//! RPC error types.
//!
//! `HandshakeError` is fatal to a connection attempt. `ConnectionError` ends
//! an established connection and is reported through [`CloseReason`].
//! `CallError` is returned to a single caller and never affects the
//! connection. `HandlerError` is what local handlers return; for calls it is
//! reported back to the peer as an exception message.

use relay_protocol::CodecError;
use std::fmt;
use thiserror::Error;

/// Errors reading or writing packets on a stream.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Framing, serialization or transport failure.
    #[error("Transport error: {0}")]
    Codec(#[from] CodecError),

    /// Peer closed the stream.
    #[error("Connection closed by peer")]
    Eof,

    /// Received an opcode outside the allowed set.
    #[error("Expected one of {expected:?}, got '{got}'")]
    UnexpectedOp {
        expected: Vec<&'static str>,
        got: String,
    },

    /// Payload did not match the opcode's shape.
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// Handshake failures.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Acceptor has no secret registered for the presented client id.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Initiator digest did not verify.
    #[error("Bad secret for client: {0}")]
    BadSecret(String),

    /// Acceptor digest did not verify on the initiator.
    #[error("Server hash mismatch")]
    ServerDigestMismatch,

    /// Peer sent `auth:fail`.
    #[error("Rejected by peer: {0}")]
    Rejected(String),

    /// Exchange did not finish before the deadline.
    #[error("Handshake timed out")]
    Timeout,

    /// Wrong opcode, malformed payload or transport failure.
    #[error("Handshake protocol error: {0}")]
    Protocol(#[from] ConnectionError),

    /// Nonce generation failed.
    #[error("Handshake crypto error: {0}")]
    Crypto(String),
}

impl HandshakeError {
    /// Short label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            HandshakeError::UnknownClient(_) => "unknown_client",
            HandshakeError::BadSecret(_) => "bad_secret",
            HandshakeError::ServerDigestMismatch => "server_digest_mismatch",
            HandshakeError::Rejected(_) => "rejected",
            HandshakeError::Timeout => "timeout",
            HandshakeError::Protocol(_) => "protocol",
            HandshakeError::Crypto(_) => "crypto",
        }
    }
}

/// Failure of a single outgoing `call`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Peer has no handler for the method.
    #[error("Remote method not found: {method}")]
    NotFound { method: String },

    /// No response arrived before the deadline.
    #[error("Call to {method} timed out")]
    Timeout { method: String },

    /// Connection closed while the call was outstanding (or before it was sent).
    #[error("Connection down during call to {method}")]
    Down { method: String },

    /// Peer reported an unspecified failure.
    #[error("Remote call to {method} failed")]
    Unknown { method: String },

    /// Peer handler failed with a message.
    #[error("Remote error: {message}")]
    Remote { message: String },

    /// Arguments or result could not be (de)serialized.
    #[error("Call serialization error: {0}")]
    Serialization(String),
}

impl CallError {
    /// Short label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            CallError::NotFound { .. } => "not_found",
            CallError::Timeout { .. } => "timeout",
            CallError::Down { .. } => "down",
            CallError::Unknown { .. } => "unknown",
            CallError::Remote { .. } => "remote",
            CallError::Serialization(_) => "serialization",
        }
    }
}

/// Failure inside a locally registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Arguments missing or of the wrong shape.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Handler ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// Why a connection's main loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// A ping went unanswered for a full heartbeat interval.
    PingTimeout,
    /// Peer closed the stream.
    Eof,
    /// Transport or framing failure.
    Transport(String),
    /// Peer sent a packet that could not be interpreted.
    Protocol(String),
    /// Local side asked the connection to stop.
    Shutdown,
}

impl CloseReason {
    /// Short label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            CloseReason::PingTimeout => "ping_timeout",
            CloseReason::Eof => "eof",
            CloseReason::Transport(_) => "transport",
            CloseReason::Protocol(_) => "protocol",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PingTimeout => f.write_str("ping timeout"),
            CloseReason::Eof => f.write_str("connection closed by peer"),
            CloseReason::Transport(detail) => write!(f, "transport error: {detail}"),
            CloseReason::Protocol(detail) => write!(f, "protocol error: {detail}"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_timeout_display() {
        assert_eq!(CloseReason::PingTimeout.to_string(), "ping timeout");
    }

    #[test]
    fn test_call_error_messages_name_the_method() {
        let err = CallError::NotFound {
            method: "make_resource_ref".to_string(),
        };
        assert!(err.to_string().contains("make_resource_ref"));
        assert_eq!(err.label(), "not_found");
    }

    #[test]
    fn test_unexpected_op_lists_expected() {
        let err = ConnectionError::UnexpectedOp {
            expected: vec!["auth:login"],
            got: "ping".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("auth:login"));
        assert!(msg.contains("ping"));
    }
}
