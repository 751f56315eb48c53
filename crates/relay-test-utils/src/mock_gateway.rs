//! Mock chat gateway.

use async_trait::async_trait;
use common::types::{ChannelRef, RoomId, VoiceSession};
use control_node::errors::CnError;
use control_node::gateway::ChatGateway;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Gateway call as recorded by [`MockGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Join(ChannelRef),
    Leave(RoomId),
    VoiceState {
        room: RoomId,
        channel_id: Option<String>,
    },
}

/// Gateway that confirms joins immediately (or refuses them) and records
/// every call.
#[derive(Debug, Default)]
pub struct MockGateway {
    calls: Mutex<Vec<GatewayCall>>,
    refuse_joins: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later joins fail with a gateway timeout.
    pub fn refuse_joins(&self, refuse: bool) {
        self.refuse_joins.store(refuse, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn joins(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::Join(_)))
            .count()
    }

    pub fn leaves(&self) -> Vec<RoomId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Leave(room) => Some(room),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatGateway for MockGateway {
    async fn join_channel(&self, channel: &ChannelRef) -> Result<VoiceSession, CnError> {
        self.record(GatewayCall::Join(channel.clone()));
        if self.refuse_joins.load(Ordering::SeqCst) {
            return Err(CnError::GatewayTimeout);
        }

        Ok(VoiceSession {
            guild_id: channel.room_id.clone(),
            channel_id: channel.channel_id.clone(),
            user_id: "test-bot".to_string(),
            session_id: format!("session-{}", channel.room_id),
            endpoint: "voice.test:443".to_string(),
            token: "test-token".to_string(),
        })
    }

    async fn leave_channel(&self, room: &RoomId) -> Result<(), CnError> {
        self.record(GatewayCall::Leave(room.clone()));
        Ok(())
    }

    async fn update_voice_state(
        &self,
        room: &RoomId,
        channel_id: Option<&str>,
    ) -> Result<(), CnError> {
        self.record(GatewayCall::VoiceState {
            room: room.clone(),
            channel_id: channel_id.map(str::to_string),
        });
        Ok(())
    }
}
