//! Method and event names used between the control node and its workers on
//! top of `call`/`cast`.
//!
//! Resource methods travel as `call resource_call(method, remote_ref, args...)`.
//! Resource events travel as `cast remote_emit(remote_ref, event, payload)`.

use crate::codec::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Methods the worker serves.
pub mod worker_method {
    /// Mint a new remote resource reference.
    pub const MAKE_RESOURCE_REF: &str = "make_resource_ref";
    /// Invoke a method on the resource named by a remote reference.
    pub const RESOURCE_CALL: &str = "resource_call";
}

/// Methods the control node serves.
pub mod node_method {
    /// Update (or clear) the bot's voice state on the chat gateway.
    pub const GATEWAY_VOICE_STATE: &str = "gateway_voice_state";
    /// Node name.
    pub const INFO: &str = "info";
    /// Cast: number of resources the worker currently holds.
    pub const SESSION_COUNT_UPDATE: &str = "session_count_update";
    /// Cast: event raised by a resource.
    pub const REMOTE_EMIT: &str = "remote_emit";
}

/// Methods dispatched through `resource_call`.
pub mod resource_method {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const PLAY: &str = "play";
    pub const SET_VOLUME: &str = "set_volume";
    pub const STOP: &str = "stop";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
}

/// Asynchronous event raised by a worker-held resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ResourceEvent {
    #[serde(rename = "playback:start")]
    PlaybackStart { playback_ref: String },

    /// Periodic position report. `elapsed` is in seconds.
    #[serde(rename = "playback:progress")]
    PlaybackProgress { playback_ref: String, elapsed: f64 },

    #[serde(rename = "playback:done")]
    PlaybackDone { playback_ref: String },

    /// The resource is gone on the worker side.
    #[serde(rename = "remote:down")]
    RemoteDown {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ResourceEvent {
    /// Event name as sent on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ResourceEvent::PlaybackStart { .. } => "playback:start",
            ResourceEvent::PlaybackProgress { .. } => "playback:progress",
            ResourceEvent::PlaybackDone { .. } => "playback:done",
            ResourceEvent::RemoteDown { .. } => "remote:down",
        }
    }

    /// Arguments for `cast remote_emit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be represented as JSON.
    pub fn to_emit_args(&self, remote_ref: &str) -> Result<Vec<Value>, CodecError> {
        let mut tagged =
            serde_json::to_value(self).map_err(|e| CodecError::InvalidFormat(e.to_string()))?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);

        Ok(vec![
            Value::String(remote_ref.to_string()),
            Value::String(self.name().to_string()),
            payload,
        ])
    }

    /// Rebuild an event from the `event` and `payload` arguments of
    /// `remote_emit`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown event names or malformed payloads.
    pub fn from_emit(event: &str, payload: Value) -> Result<Self, CodecError> {
        let payload = if payload.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            payload
        };

        serde_json::from_value(serde_json::json!({ "event": event, "payload": payload }))
            .map_err(|e| CodecError::InvalidFormat(format!("malformed '{event}' event: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_emit_args_shape() {
        let event = ResourceEvent::PlaybackProgress {
            playback_ref: "1512-00ff.1.2".to_string(),
            elapsed: 5.0,
        };

        let args = event.to_emit_args("1512-00ff.1").unwrap();
        assert_eq!(
            args,
            vec![
                json!("1512-00ff.1"),
                json!("playback:progress"),
                json!({"playback_ref": "1512-00ff.1.2", "elapsed": 5.0}),
            ]
        );
    }

    #[test]
    fn test_from_emit_parses_known_events() {
        let done =
            ResourceEvent::from_emit("playback:done", json!({"playback_ref": "r.1"})).unwrap();
        assert_eq!(
            done,
            ResourceEvent::PlaybackDone {
                playback_ref: "r.1".to_string()
            }
        );

        let down = ResourceEvent::from_emit("remote:down", Value::Null).unwrap();
        assert_eq!(down, ResourceEvent::RemoteDown { reason: None });
    }

    #[test]
    fn test_from_emit_rejects_unknown_event() {
        let err = ResourceEvent::from_emit("playback:rewind", json!({})).unwrap_err();
        assert!(err.to_string().contains("playback:rewind"));
    }

    #[test]
    fn test_from_emit_rejects_missing_fields() {
        assert!(ResourceEvent::from_emit("playback:progress", json!({"playback_ref": "r"})).is_err());
    }
}
