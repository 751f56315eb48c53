//! Common data types for Voice Relay components.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a chat room (guild). One playback session exists per room.
    RoomId
);

string_id!(
    /// Coarse network-locality tag, e.g. `us-east`.
    Region
);

string_id!(
    /// Server-minted identifier of a connected worker: `{client_id}-{hex suffix}`.
    WorkerId
);

string_id!(
    /// Worker-minted identifier of the media resource held for one session.
    RemoteRef
);

string_id!(
    /// Worker-minted identifier of one playback started on a resource.
    PlaybackRef
);

/// A voice channel inside a room, along with the region it is served from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Room (guild) the channel belongs to.
    pub room_id: RoomId,
    /// Channel identifier within the room.
    pub channel_id: String,
    /// Region the room's voice traffic is served from.
    pub region: Region,
}

/// Voice session data handed out by the chat gateway once a join is confirmed.
///
/// The control node forwards this to the worker so that it can open the media
/// connection on the bot's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSession {
    /// Room (guild) id.
    pub guild_id: RoomId,
    /// Joined channel id.
    pub channel_id: String,
    /// Bot user id on the chat network.
    pub user_id: String,
    /// Session id from the voice-state update.
    pub session_id: String,
    /// Voice server endpoint from the voice-server update.
    pub endpoint: String,
    /// Voice server token from the voice-server update.
    pub token: String,
}
