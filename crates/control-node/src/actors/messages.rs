//! Message types for the session manager.
//!
//! Requests carry a `oneshot` sender for the reply. Intents for a single
//! room are defined with the syncer in [`super::syncer::Intent`].

use super::syncer::{FsmState, SessionNotice, SessionSnapshot};
use crate::errors::CnError;

use common::types::{ChannelRef, RoomId, WorkerId};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

/// Messages sent to `SessionManagerActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Create the session if needed and connect it if it is idle.
    Join {
        channel: ChannelRef,
        respond_to: oneshot::Sender<Result<SessionInfo, CnError>>,
    },

    /// Play an already resolved URL.
    Play {
        room: RoomId,
        url: String,
        respond_to: oneshot::Sender<Result<(), CnError>>,
    },

    Stop {
        room: RoomId,
        respond_to: oneshot::Sender<Result<(), CnError>>,
    },

    SetVolume {
        room: RoomId,
        volume: f64,
        respond_to: oneshot::Sender<Result<(), CnError>>,
    },

    /// Halt the session and forget it.
    Leave {
        room: RoomId,
        respond_to: oneshot::Sender<Result<(), CnError>>,
    },

    GetSession {
        room: RoomId,
        respond_to: oneshot::Sender<Result<SessionInfo, CnError>>,
    },

    Subscribe {
        room: RoomId,
        respond_to: oneshot::Sender<Result<broadcast::Receiver<SessionNotice>, CnError>>,
    },

    ListSessions {
        respond_to: oneshot::Sender<Vec<SessionInfo>>,
    },

    /// Halt every session and stop accepting joins.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Session state as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub room: RoomId,
    pub state: FsmState,
    pub channel: Option<ChannelRef>,
    pub url: Option<String>,
    pub volume: f64,
    pub worker: Option<WorkerId>,
    /// Seconds into the current track.
    pub position_secs: Option<f64>,
}

impl SessionInfo {
    #[must_use]
    pub fn from_snapshot(snapshot: &SessionSnapshot, now: Instant) -> Self {
        Self {
            room: snapshot.room.clone(),
            state: snapshot.state.fsm_state,
            channel: snapshot.state.channel.clone(),
            url: snapshot.state.url.clone(),
            volume: snapshot.state.volume,
            worker: snapshot.worker.clone(),
            position_secs: snapshot.position(now).map(|p| p.as_secs_f64()),
        }
    }
}
