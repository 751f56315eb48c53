//! Chat gateway collaborator.
//!
//! The control node never talks to the chat network directly. It needs three
//! things from it: join a voice channel (and learn the session data a worker
//! needs to open the media connection), leave, and raw voice-state updates
//! requested by workers.
//!
//! [`GatewayVoiceJoiner`] implements the join handshake on top of any
//! [`GatewaySocket`]: it subscribes to pushed events *before* asking to join,
//! then waits for both the bot's `VOICE_STATE_UPDATE` and the
//! `VOICE_SERVER_UPDATE` for the room.

use crate::errors::CnError;

use async_trait::async_trait;
use common::types::{ChannelRef, RoomId, VoiceSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// How long to wait for the gateway to confirm a join.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Voice operations the control node needs from the chat gateway.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Join `channel` and return the voice session data once confirmed.
    async fn join_channel(&self, channel: &ChannelRef) -> Result<VoiceSession, CnError>;

    /// Leave whatever voice channel the bot is in for `room`.
    async fn leave_channel(&self, room: &RoomId) -> Result<(), CnError>;

    /// Send a raw voice-state update (`None` leaves).
    async fn update_voice_state(
        &self,
        room: &RoomId,
        channel_id: Option<&str>,
    ) -> Result<(), CnError>;
}

/// Voice events pushed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    VoiceStateUpdate {
        guild_id: RoomId,
        user_id: String,
        session_id: String,
        channel_id: Option<String>,
    },
    VoiceServerUpdate {
        guild_id: RoomId,
        endpoint: String,
        token: String,
    },
}

/// Low-level gateway connection.
#[async_trait]
pub trait GatewaySocket: Send + Sync {
    /// The bot's own user id.
    fn user_id(&self) -> &str;

    /// Subscribe to pushed voice events.
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;

    async fn send_voice_state(
        &self,
        room: &RoomId,
        channel_id: Option<&str>,
        self_mute: bool,
    ) -> Result<(), CnError>;
}

/// [`ChatGateway`] built on a [`GatewaySocket`].
#[derive(Debug)]
pub struct GatewayVoiceJoiner<S> {
    socket: Arc<S>,
    join_timeout: Duration,
}

impl<S: GatewaySocket> GatewayVoiceJoiner<S> {
    pub fn new(socket: Arc<S>) -> Self {
        Self {
            socket,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    async fn wait_for_session(
        &self,
        mut events: broadcast::Receiver<GatewayEvent>,
        room: &RoomId,
    ) -> Result<(String, String, String), CnError> {
        let mut session_id = None;
        let mut server = None;

        loop {
            if let (Some(session_id), Some((endpoint, token))) = (&session_id, &server) {
                return Ok((
                    String::clone(session_id),
                    String::clone(endpoint),
                    String::clone(token),
                ));
            }

            match events.recv().await {
                Ok(GatewayEvent::VoiceStateUpdate {
                    guild_id,
                    user_id,
                    session_id: sid,
                    ..
                }) if &guild_id == room && user_id == self.socket.user_id() => {
                    session_id = Some(sid);
                }
                Ok(GatewayEvent::VoiceServerUpdate {
                    guild_id,
                    endpoint,
                    token,
                }) if &guild_id == room => {
                    server = Some((endpoint, token));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "cn.gateway",
                        room = %room,
                        skipped,
                        "Gateway event subscriber lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CnError::Gateway("gateway event stream closed".to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl<S: GatewaySocket + 'static> ChatGateway for GatewayVoiceJoiner<S> {
    async fn join_channel(&self, channel: &ChannelRef) -> Result<VoiceSession, CnError> {
        // Subscribe before requesting so neither reply can be missed.
        let events = self.socket.subscribe();

        self.socket
            .send_voice_state(&channel.room_id, Some(&channel.channel_id), false)
            .await?;

        let (session_id, endpoint, token) = tokio::time::timeout(
            self.join_timeout,
            self.wait_for_session(events, &channel.room_id),
        )
        .await
        .map_err(|_| CnError::GatewayTimeout)??;

        debug!(
            target: "cn.gateway",
            room = %channel.room_id,
            channel = %channel.channel_id,
            "Voice join confirmed"
        );

        Ok(VoiceSession {
            guild_id: channel.room_id.clone(),
            channel_id: channel.channel_id.clone(),
            user_id: self.socket.user_id().to_string(),
            session_id,
            endpoint,
            token,
        })
    }

    async fn leave_channel(&self, room: &RoomId) -> Result<(), CnError> {
        self.socket.send_voice_state(room, None, true).await
    }

    async fn update_voice_state(
        &self,
        room: &RoomId,
        channel_id: Option<&str>,
    ) -> Result<(), CnError> {
        self.socket.send_voice_state(room, channel_id, false).await
    }
}

/// Gateway for deployments without a chat network: joins are confirmed
/// immediately with synthesized session data.
#[derive(Debug, Clone)]
pub struct StandaloneGateway {
    user_id: String,
    endpoint: String,
}

impl StandaloneGateway {
    pub fn new(user_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ChatGateway for StandaloneGateway {
    async fn join_channel(&self, channel: &ChannelRef) -> Result<VoiceSession, CnError> {
        Ok(VoiceSession {
            guild_id: channel.room_id.clone(),
            channel_id: channel.channel_id.clone(),
            user_id: self.user_id.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
            endpoint: self.endpoint.clone(),
            token: uuid::Uuid::new_v4().simple().to_string(),
        })
    }

    async fn leave_channel(&self, room: &RoomId) -> Result<(), CnError> {
        debug!(target: "cn.gateway", room = %room, "Standalone leave");
        Ok(())
    }

    async fn update_voice_state(
        &self,
        room: &RoomId,
        channel_id: Option<&str>,
    ) -> Result<(), CnError> {
        debug!(
            target: "cn.gateway",
            room = %room,
            channel = ?channel_id,
            "Standalone voice state update"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::Region;
    use tokio::sync::Mutex;

    /// Socket that records requests and lets the test push events.
    struct ScriptedSocket {
        events: broadcast::Sender<GatewayEvent>,
        sent: Mutex<Vec<(RoomId, Option<String>, bool)>>,
        reply: Option<Vec<GatewayEvent>>,
    }

    impl ScriptedSocket {
        fn new(reply: Option<Vec<GatewayEvent>>) -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                events,
                sent: Mutex::new(Vec::new()),
                reply,
            }
        }
    }

    #[async_trait]
    impl GatewaySocket for ScriptedSocket {
        fn user_id(&self) -> &str {
            "bot-1"
        }

        fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
            self.events.subscribe()
        }

        async fn send_voice_state(
            &self,
            room: &RoomId,
            channel_id: Option<&str>,
            self_mute: bool,
        ) -> Result<(), CnError> {
            self.sent
                .lock()
                .await
                .push((room.clone(), channel_id.map(str::to_string), self_mute));
            if let Some(reply) = &self.reply {
                for event in reply {
                    let _ = self.events.send(event.clone());
                }
            }
            Ok(())
        }
    }

    fn channel() -> ChannelRef {
        ChannelRef {
            room_id: RoomId::from("g1"),
            channel_id: "c1".to_string(),
            region: Region::from("us-east"),
        }
    }

    fn state_update(guild: &str, user: &str) -> GatewayEvent {
        GatewayEvent::VoiceStateUpdate {
            guild_id: RoomId::from(guild),
            user_id: user.to_string(),
            session_id: format!("session-{user}"),
            channel_id: Some("c1".to_string()),
        }
    }

    fn server_update(guild: &str) -> GatewayEvent {
        GatewayEvent::VoiceServerUpdate {
            guild_id: RoomId::from(guild),
            endpoint: "voice.example:443".to_string(),
            token: "tok".to_string(),
        }
    }

    #[tokio::test]
    async fn test_join_waits_for_both_updates() {
        let socket = Arc::new(ScriptedSocket::new(Some(vec![
            state_update("g1", "someone-else"),
            server_update("g2"),
            server_update("g1"),
            state_update("g1", "bot-1"),
        ])));
        let gateway = GatewayVoiceJoiner::new(Arc::clone(&socket));

        let session = gateway.join_channel(&channel()).await.unwrap();

        assert_eq!(session.session_id, "session-bot-1");
        assert_eq!(session.endpoint, "voice.example:443");
        assert_eq!(session.user_id, "bot-1");
        assert_eq!(
            socket.sent.lock().await.as_slice(),
            &[(RoomId::from("g1"), Some("c1".to_string()), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out_without_server_update() {
        let socket = Arc::new(ScriptedSocket::new(Some(vec![state_update("g1", "bot-1")])));
        let gateway = GatewayVoiceJoiner::new(socket).with_join_timeout(Duration::from_secs(10));

        let err = gateway.join_channel(&channel()).await.unwrap_err();
        assert!(matches!(err, CnError::GatewayTimeout));
    }

    #[tokio::test]
    async fn test_leave_sends_null_channel_muted() {
        let socket = Arc::new(ScriptedSocket::new(None));
        let gateway = GatewayVoiceJoiner::new(Arc::clone(&socket));

        gateway.leave_channel(&RoomId::from("g1")).await.unwrap();
        gateway
            .update_voice_state(&RoomId::from("g1"), Some("c2"))
            .await
            .unwrap();

        let sent = socket.sent.lock().await;
        assert_eq!(sent[0], (RoomId::from("g1"), None, true));
        assert_eq!(sent[1], (RoomId::from("g1"), Some("c2".to_string()), false));
    }

    #[tokio::test]
    async fn test_standalone_gateway_synthesizes_session() {
        let gateway = StandaloneGateway::new("relay-bot", "local");
        let session = gateway.join_channel(&channel()).await.unwrap();

        assert_eq!(session.guild_id, RoomId::from("g1"));
        assert_eq!(session.user_id, "relay-bot");
        assert_eq!(session.endpoint, "local");
        assert!(!session.session_id.is_empty());
    }
}
