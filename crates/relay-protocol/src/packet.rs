//! The `{op, d}` record carried by every frame, and the payload shapes of the
//! reserved opcodes.

use crate::codec::CodecError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Reserved opcodes.
pub mod op {
    /// Initiator proves knowledge of the shared secret.
    pub const AUTH_LOGIN: &str = "auth:login";
    /// Handshake step accepted (sent by both sides).
    pub const AUTH_SUCCESS: &str = "auth:success";
    /// Handshake rejected (sent by either side).
    pub const AUTH_FAIL: &str = "auth:fail";
    /// Heartbeat probe.
    pub const PING: &str = "ping";
    /// Heartbeat reply, echoing the ping payload.
    pub const PONG: &str = "pong";
    /// Correlated remote invocation.
    pub const CALL: &str = "call";
    /// Reply to a `call`, correlated by `ref`.
    pub const CALL_RESPONSE: &str = "call:response";
    /// Fire-and-forget remote invocation.
    pub const CAST: &str = "cast";
}

/// A single protocol record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Opcode.
    pub op: String,
    /// Opcode-specific payload.
    #[serde(rename = "d")]
    pub data: Value,
}

impl Packet {
    /// Create a packet from an already-built JSON payload.
    #[must_use]
    pub fn new(op: impl Into<String>, data: Value) -> Self {
        Self {
            op: op.into(),
            data,
        }
    }

    /// Create a packet by serializing a typed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn from_payload<T: Serialize>(op: &str, payload: &T) -> Result<Self, CodecError> {
        let data =
            serde_json::to_value(payload).map_err(|e| CodecError::InvalidFormat(e.to_string()))?;
        Ok(Self::new(op, data))
    }

    /// Decode the payload into a typed structure.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not have the expected shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        T::deserialize(&self.data).map_err(|e| {
            CodecError::InvalidFormat(format!("malformed '{}' payload: {e}", self.op))
        })
    }
}

/// `auth:login` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPayload {
    pub client_id: String,
    pub client_nonce: String,
    /// Hex `HMAC-SHA256(secret, client_id + ":" + nonce)`.
    pub digest: String,
}

/// `auth:success` payload sent by the acceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerAuthSuccess {
    /// Hex `HMAC-SHA256(secret, client_id + ":" + nonce + ":" + client_digest)`.
    pub digest: String,
    /// Seconds between heartbeat pings.
    pub heartbeat_interval: u64,
    /// Acceptor capability info.
    pub info: Value,
}

/// `auth:success` payload sent by the initiator to complete the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAuthSuccess {
    pub info: Value,
}

/// `auth:fail` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFail {
    pub reason: String,
}

/// `call` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Remote method name.
    #[serde(rename = "f")]
    pub method: String,
    /// Per-connection correlation id.
    #[serde(rename = "ref")]
    pub reference: u64,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// `cast` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastRequest {
    #[serde(rename = "f")]
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Wire value of the `exception` field for an unknown method.
pub const EXCEPTION_NOT_EXISTS: &str = "not_exists";

/// Wire value of the `exception` field for an unspecified remote failure.
pub const EXCEPTION_UNKNOWN: &str = "unknown";

/// The `exception` field of a `call:response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallException {
    /// `"not_exists"` or `"unknown"`.
    Code(String),
    /// A handler failure with its message.
    Message { message: String },
}

/// `call:response` payload.
///
/// Exactly one of `result` and `exception` is present. A present `result`
/// may legitimately be JSON `null`, which is why it is not a plain
/// `Option<Value>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    #[serde(rename = "ref")]
    pub reference: u64,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<CallException>,
}

impl CallResponse {
    /// A successful response.
    #[must_use]
    pub fn ok(reference: u64, result: Value) -> Self {
        Self {
            reference,
            result: Some(result),
            exception: None,
        }
    }

    /// A response for a method with no registered handler.
    #[must_use]
    pub fn not_exists(reference: u64) -> Self {
        Self {
            reference,
            result: None,
            exception: Some(CallException::Code(EXCEPTION_NOT_EXISTS.to_string())),
        }
    }

    /// A response for a handler that failed.
    #[must_use]
    pub fn failed(reference: u64, message: impl Into<String>) -> Self {
        Self {
            reference,
            result: None,
            exception: Some(CallException::Message {
                message: message.into(),
            }),
        }
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
