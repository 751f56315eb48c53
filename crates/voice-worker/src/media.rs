//! Media capability.
//!
//! A [`MediaBackend`] opens a [`MediaSession`] from the gateway's voice
//! session data; a session starts [`Playback`]s. Encoding and transport are
//! the backend's business. [`ClockedBackend`] keeps time only and is what the
//! binary runs when no encoder is linked.

use crate::errors::WorkerError;

use async_trait::async_trait;
use common::types::VoiceSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Open a media connection into the session's channel.
    async fn connect(&self, session: &VoiceSession) -> Result<Arc<dyn MediaSession>, WorkerError>;
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Start `url` at `offset` into the track.
    async fn start(
        &self,
        url: &str,
        volume: f64,
        offset: Duration,
    ) -> Result<Arc<dyn Playback>, WorkerError>;

    /// Close the media connection.
    async fn close(&self);
}

/// One running track.
#[async_trait]
pub trait Playback: Send + Sync {
    /// Position in the track, including the start offset.
    fn position(&self) -> Duration;

    fn set_volume(&self, volume: f64);

    fn pause(&self);

    fn resume(&self);

    fn stop(&self);

    /// Resolves once the track has played to its end. Never resolves for a
    /// stopped playback.
    async fn finished(&self);
}

/// Time-only backend.
#[derive(Debug, Clone, Default)]
pub struct ClockedBackend {
    /// Every track ends after this long. `None` plays forever.
    track_length: Option<Duration>,
}

impl ClockedBackend {
    #[must_use]
    pub fn new(track_length: Option<Duration>) -> Self {
        Self { track_length }
    }
}

#[async_trait]
impl MediaBackend for ClockedBackend {
    async fn connect(&self, session: &VoiceSession) -> Result<Arc<dyn MediaSession>, WorkerError> {
        if session.endpoint.is_empty() {
            return Err(WorkerError::Media("voice endpoint missing".to_string()));
        }

        info!(
            target: "worker.media",
            room = %session.guild_id,
            channel_id = %session.channel_id,
            endpoint = %session.endpoint,
            "Media connection opened"
        );
        Ok(Arc::new(ClockedSession {
            track_length: self.track_length,
            closed: AtomicBool::new(false),
        }))
    }
}

struct ClockedSession {
    track_length: Option<Duration>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaSession for ClockedSession {
    async fn start(
        &self,
        url: &str,
        volume: f64,
        offset: Duration,
    ) -> Result<Arc<dyn Playback>, WorkerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::Media("media connection closed".to_string()));
        }

        debug!(target: "worker.media", url = %url, offset_secs = offset.as_secs_f64(), "Playback started");
        Ok(Arc::new(ClockedPlayback::start(
            self.track_length,
            volume,
            offset,
        )))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Clock {
    /// Position accumulated before `running_since`.
    base: Duration,
    /// `None` while paused.
    running_since: Option<Instant>,
    volume: f64,
}

impl Clock {
    fn position(&self, now: Instant) -> Duration {
        self.base
            + self
                .running_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }
}

/// Playback whose position follows the tokio clock.
#[derive(Debug)]
pub struct ClockedPlayback {
    clock: Mutex<Clock>,
    length: Option<Duration>,
    changed: Notify,
    stopped: CancellationToken,
}

impl ClockedPlayback {
    #[must_use]
    pub fn start(length: Option<Duration>, volume: f64, offset: Duration) -> Self {
        Self {
            clock: Mutex::new(Clock {
                base: offset,
                running_since: Some(Instant::now()),
                volume,
            }),
            length,
            changed: Notify::new(),
            stopped: CancellationToken::new(),
        }
    }

    fn with_clock<T>(&self, f: impl FnOnce(&mut Clock) -> T) -> T {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut clock)
    }

    #[must_use]
    pub fn volume(&self) -> f64 {
        self.with_clock(|clock| clock.volume)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.with_clock(|clock| clock.running_since.is_none())
    }
}

#[async_trait]
impl Playback for ClockedPlayback {
    fn position(&self) -> Duration {
        self.with_clock(|clock| clock.position(Instant::now()))
    }

    fn set_volume(&self, volume: f64) {
        self.with_clock(|clock| clock.volume = volume);
    }

    fn pause(&self) {
        let now = Instant::now();
        self.with_clock(|clock| {
            if clock.running_since.is_some() {
                clock.base = clock.position(now);
                clock.running_since = None;
            }
        });
        self.changed.notify_waiters();
    }

    fn resume(&self) {
        self.with_clock(|clock| {
            if clock.running_since.is_none() {
                clock.running_since = Some(Instant::now());
            }
        });
        self.changed.notify_waiters();
    }

    fn stop(&self) {
        self.stopped.cancel();
    }

    async fn finished(&self) {
        let Some(length) = self.length else {
            std::future::pending::<()>().await;
            return;
        };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (position, running) =
                self.with_clock(|clock| (clock.position(Instant::now()), clock.running_since.is_some()));

            if self.stopped.is_cancelled() {
                std::future::pending::<()>().await;
            }
            if position >= length {
                return;
            }

            if running {
                tokio::select! {
                    () = tokio::time::sleep(length - position) => {}
                    () = &mut notified => {}
                    () = self.stopped.cancelled() => {}
                }
            } else {
                tokio::select! {
                    () = &mut notified => {}
                    () = self.stopped.cancelled() => {}
                }
            }
        }
    }
}
