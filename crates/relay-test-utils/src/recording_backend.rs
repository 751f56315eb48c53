//! Worker media backend that records what it was asked to do.
//!
//! Playbacks are [`ClockedPlayback`]s, so positions and completion follow
//! the tokio clock and work under `start_paused`.

use async_trait::async_trait;
use common::types::VoiceSession;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use voice_worker::errors::WorkerError;
use voice_worker::media::{ClockedPlayback, MediaBackend, MediaSession, Playback};

/// A playback started through the backend.
#[derive(Debug, Clone)]
pub struct StartedPlayback {
    pub room: String,
    pub url: String,
    pub offset: Duration,
    pub playback: Arc<ClockedPlayback>,
}

#[derive(Debug, Default)]
struct Recorded {
    connects: Vec<VoiceSession>,
    closes: Vec<String>,
    playbacks: Vec<StartedPlayback>,
}

/// Cheap to clone; clones share the recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingBackend {
    track_length: Option<Duration>,
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingBackend {
    /// Tracks play forever.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every track ends after `length`.
    pub fn with_track_length(length: Duration) -> Self {
        Self {
            track_length: Some(length),
            ..Self::default()
        }
    }

    pub fn connects(&self) -> Vec<VoiceSession> {
        self.recorded.lock().unwrap().connects.clone()
    }

    /// Rooms whose media connection was closed, in order.
    pub fn closes(&self) -> Vec<String> {
        self.recorded.lock().unwrap().closes.clone()
    }

    pub fn playbacks(&self) -> Vec<StartedPlayback> {
        self.recorded.lock().unwrap().playbacks.clone()
    }

    pub fn last_playback(&self) -> Option<StartedPlayback> {
        self.recorded.lock().unwrap().playbacks.last().cloned()
    }
}

#[async_trait]
impl MediaBackend for RecordingBackend {
    async fn connect(&self, session: &VoiceSession) -> Result<Arc<dyn MediaSession>, WorkerError> {
        self.recorded.lock().unwrap().connects.push(session.clone());
        Ok(Arc::new(RecordingSession {
            room: session.guild_id.to_string(),
            track_length: self.track_length,
            recorded: Arc::clone(&self.recorded),
        }))
    }
}

struct RecordingSession {
    room: String,
    track_length: Option<Duration>,
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl MediaSession for RecordingSession {
    async fn start(
        &self,
        url: &str,
        volume: f64,
        offset: Duration,
    ) -> Result<Arc<dyn Playback>, WorkerError> {
        let playback = Arc::new(ClockedPlayback::start(self.track_length, volume, offset));
        self.recorded.lock().unwrap().playbacks.push(StartedPlayback {
            room: self.room.clone(),
            url: url.to_string(),
            offset,
            playback: Arc::clone(&playback),
        });
        Ok(playback)
    }

    async fn close(&self) {
        self.recorded.lock().unwrap().closes.push(self.room.clone());
    }
}
