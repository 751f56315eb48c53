//! `SessionManagerActor` - owns one [`SyncerActor`] per room.
//!
//! - Sessions are created lazily on `join`; a join only connects a session
//!   that is `Disconnected`.
//! - `play` resolves the query through the [`MediaResolver`] before the URL
//!   reaches the syncer.
//! - A periodic sweep drops sessions whose actor has exited and halts
//!   sessions that have been idle for longer than the idle timeout.
//! - Shutdown halts every session.

use super::messages::{SessionInfo, SessionMessage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::syncer::{FsmState, SessionNotice, SyncerActor, SyncerHandle};
use crate::errors::CnError;
use crate::media::{MediaResolver, TrackInfo};
use crate::workers::binder::WorkerBinder;

use common::types::{ChannelRef, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const MANAGER_CHANNEL_BUFFER: usize = 1000;

/// Upper bound for session volume (2.0 = 200%).
pub const MAX_VOLUME: f64 = 2.0;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long a halted syncer may take to disconnect its worker.
const HALT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Syncer backoff between binding attempts.
    pub retry_backoff: Duration,
    /// Idle sessions are halted after this long.
    pub idle_timeout: Duration,
}

impl SessionOptions {
    fn sweep_interval(&self) -> Duration {
        (self.idle_timeout / 4).max(MIN_SWEEP_INTERVAL)
    }
}

/// Handle to the `SessionManagerActor`.
#[derive(Clone)]
pub struct SessionManagerHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    resolver: Arc<dyn MediaResolver>,
    mailbox: Arc<MailboxMonitor>,
}

impl std::fmt::Debug for SessionManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManagerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SessionManagerHandle {
    /// Spawn the manager and return a handle to it.
    #[must_use]
    pub fn new(
        binder: Arc<dyn WorkerBinder>,
        resolver: Arc<dyn MediaResolver>,
        options: SessionOptions,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(MANAGER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let instance_id = uuid::Uuid::new_v4().to_string();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::SessionManager, &instance_id));

        let actor = SessionManagerActor {
            instance_id,
            receiver,
            cancel_token: cancel_token.clone(),
            binder,
            options,
            sessions: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            resolver,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, CnError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        self.sender.send(message(tx)).await.map_err(|e| {
            self.mailbox.record_unsent();
            CnError::Internal(format!("channel send failed: {e}"))
        })?;

        rx.await
            .map_err(|e| CnError::Internal(format!("response receive failed: {e}")))
    }

    /// Join `channel`, creating the room's session if needed.
    pub async fn join(&self, channel: ChannelRef) -> Result<SessionInfo, CnError> {
        self.request(|respond_to| SessionMessage::Join {
            channel,
            respond_to,
        })
        .await?
    }

    /// Resolve `query` and play it in `room`.
    pub async fn play(&self, room: RoomId, query: &str) -> Result<TrackInfo, CnError> {
        let track = self.resolver.resolve(query).await?;
        let url = track.playable_url.clone();

        self.request(|respond_to| SessionMessage::Play {
            room,
            url,
            respond_to,
        })
        .await??;
        Ok(track)
    }

    pub async fn stop(&self, room: RoomId) -> Result<(), CnError> {
        self.request(|respond_to| SessionMessage::Stop { room, respond_to })
            .await?
    }

    pub async fn set_volume(&self, room: RoomId, volume: f64) -> Result<(), CnError> {
        self.request(|respond_to| SessionMessage::SetVolume {
            room,
            volume,
            respond_to,
        })
        .await?
    }

    /// Halt the room's session and forget it.
    pub async fn leave(&self, room: RoomId) -> Result<(), CnError> {
        self.request(|respond_to| SessionMessage::Leave { room, respond_to })
            .await?
    }

    pub async fn session(&self, room: RoomId) -> Result<SessionInfo, CnError> {
        self.request(|respond_to| SessionMessage::GetSession { room, respond_to })
            .await?
    }

    /// Subscribe to the room's user-visible notices.
    pub async fn subscribe(
        &self,
        room: RoomId,
    ) -> Result<broadcast::Receiver<SessionNotice>, CnError> {
        self.request(|respond_to| SessionMessage::Subscribe { room, respond_to })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>, CnError> {
        self.request(|respond_to| SessionMessage::ListSessions { respond_to })
            .await
    }

    /// Halt every session; later joins fail with `ShuttingDown`.
    pub async fn shutdown(&self) -> Result<(), CnError> {
        self.request(|respond_to| SessionMessage::Shutdown { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ManagedSession {
    handle: SyncerHandle,
    task: JoinHandle<()>,
}

/// The `SessionManagerActor` implementation.
pub struct SessionManagerActor {
    instance_id: String,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    binder: Arc<dyn WorkerBinder>,
    options: SessionOptions,
    sessions: HashMap<RoomId, ManagedSession>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionManagerActor {
    #[instrument(skip_all, name = "cn.actor.sessions", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "cn.actor.sessions",
            instance_id = %self.instance_id,
            idle_timeout_secs = self.options.idle_timeout.as_secs(),
            "SessionManagerActor started"
        );

        let mut sweep = tokio::time::interval(self.options.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cn.actor.sessions",
                        instance_id = %self.instance_id,
                        "SessionManagerActor received cancellation signal"
                    );
                    self.halt_all().await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                        }
                        None => {
                            info!(
                                target: "cn.actor.sessions",
                                instance_id = %self.instance_id,
                                "SessionManagerActor channel closed, exiting"
                            );
                            self.halt_all().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cn.actor.sessions",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.processed(),
            "SessionManagerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                channel,
                respond_to,
            } => {
                let _ = respond_to.send(self.join(channel).await);
            }
            SessionMessage::Play {
                room,
                url,
                respond_to,
            } => {
                let result = match self.live(&room) {
                    Ok(handle) => handle.play(url).await,
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
            SessionMessage::Stop { room, respond_to } => {
                let result = match self.live(&room) {
                    Ok(handle) => handle.stop().await,
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
            SessionMessage::SetVolume {
                room,
                volume,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_volume(&room, volume).await);
            }
            SessionMessage::Leave { room, respond_to } => {
                let _ = respond_to.send(self.leave(&room).await);
            }
            SessionMessage::GetSession { room, respond_to } => {
                let result = self
                    .live(&room)
                    .map(|handle| SessionInfo::from_snapshot(&handle.snapshot(), Instant::now()));
                let _ = respond_to.send(result);
            }
            SessionMessage::Subscribe { room, respond_to } => {
                let _ = respond_to.send(self.live(&room).map(SyncerHandle::subscribe));
            }
            SessionMessage::ListSessions { respond_to } => {
                let now = Instant::now();
                let mut sessions: Vec<SessionInfo> = self
                    .sessions
                    .values()
                    .filter(|s| !s.handle.is_closed())
                    .map(|s| SessionInfo::from_snapshot(&s.handle.snapshot(), now))
                    .collect();
                sessions.sort_by(|a, b| a.room.cmp(&b.room));
                let _ = respond_to.send(sessions);
            }
            SessionMessage::Shutdown { respond_to } => {
                self.halt_all().await;
                let _ = respond_to.send(());
            }
        }
    }

    fn live(&self, room: &RoomId) -> Result<&SyncerHandle, CnError> {
        self.sessions
            .get(room)
            .map(|s| &s.handle)
            .filter(|handle| !handle.is_closed())
            .ok_or_else(|| CnError::SessionNotFound(room.clone()))
    }

    async fn join(&mut self, channel: ChannelRef) -> Result<SessionInfo, CnError> {
        if !self.accepting_new {
            return Err(CnError::ShuttingDown);
        }

        let room = channel.room_id.clone();
        if self.live(&room).is_err() {
            // Replace a session whose actor has already exited.
            self.sessions.remove(&room);

            let (handle, task) = SyncerActor::spawn(
                room.clone(),
                Arc::clone(&self.binder),
                self.options.retry_backoff,
                self.cancel_token.child_token(),
            );
            self.sessions
                .insert(room.clone(), ManagedSession { handle, task });
            self.metrics.set_active_sessions(self.sessions.len());

            debug!(
                target: "cn.actor.sessions",
                room = %room,
                total_sessions = self.sessions.len(),
                "Session created"
            );
        }

        let handle = self.live(&room)?;
        let snapshot = handle.snapshot();
        if snapshot.state.fsm_state == FsmState::Disconnected {
            handle.connect(channel).await?;
        }
        Ok(SessionInfo::from_snapshot(&snapshot, Instant::now()))
    }

    async fn set_volume(&self, room: &RoomId, volume: f64) -> Result<(), CnError> {
        if !volume.is_finite() || !(0.0..=MAX_VOLUME).contains(&volume) {
            return Err(CnError::InvalidRequest(format!(
                "volume must be between 0 and {MAX_VOLUME}"
            )));
        }
        self.live(room)?.set_volume(volume).await
    }

    async fn leave(&mut self, room: &RoomId) -> Result<(), CnError> {
        let managed = self
            .sessions
            .remove(room)
            .ok_or_else(|| CnError::SessionNotFound(room.clone()))?;
        self.metrics.set_active_sessions(self.sessions.len());

        if managed.handle.halt().await.is_err() {
            // Already exited.
            return Ok(());
        }

        // Don't block the message loop on the worker disconnect.
        let room = room.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(HALT_TIMEOUT, managed.task).await.is_err() {
                warn!(
                    target: "cn.actor.sessions",
                    room = %room,
                    "Session halt timed out"
                );
            }
        });
        Ok(())
    }

    /// Drop exited sessions and halt idle ones.
    async fn sweep(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.options.idle_timeout;

        let finished: Vec<RoomId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.task.is_finished())
            .map(|(room, _)| room.clone())
            .collect();

        for room in finished {
            let Some(managed) = self.sessions.remove(&room) else {
                continue;
            };
            if let Err(join_error) = managed.task.await {
                if join_error.is_panic() {
                    error!(
                        target: "cn.actor.sessions",
                        room = %room,
                        error = ?join_error,
                        "Syncer actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Syncer);
                }
            }
        }

        let idle: Vec<RoomId> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.handle
                    .snapshot()
                    .idle_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= idle_timeout)
            })
            .map(|(room, _)| room.clone())
            .collect();

        for room in idle {
            info!(
                target: "cn.actor.sessions",
                room = %room,
                idle_timeout_secs = idle_timeout.as_secs(),
                "Evicting idle session"
            );
            let _ = self.leave(&room).await;
        }

        self.metrics.set_active_sessions(self.sessions.len());
    }

    async fn halt_all(&mut self) {
        self.accepting_new = false;
        info!(
            target: "cn.actor.sessions",
            instance_id = %self.instance_id,
            session_count = self.sessions.len(),
            "Halting all sessions"
        );

        for managed in self.sessions.values() {
            if managed.handle.halt().await.is_err() {
                managed.handle.cancel();
            }
        }

        for (room, managed) in self.sessions.drain() {
            match tokio::time::timeout(HALT_TIMEOUT, managed.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "cn.actor.sessions",
                        room = %room,
                        error = ?e,
                        "Syncer actor failed during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cn.actor.sessions",
                        room = %room,
                        "Syncer halt timed out"
                    );
                }
            }
        }

        self.metrics.set_active_sessions(0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::DirectUrlResolver;
    use crate::workers::binder::{Binding, VoiceBackend};
    use async_trait::async_trait;
    use common::types::{PlaybackRef, Region, RemoteRef, WorkerId};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct SilentBackend;

    #[async_trait]
    impl VoiceBackend for SilentBackend {
        async fn play(
            &self,
            _volume: f64,
            _url: &str,
            _offset: Duration,
        ) -> Result<PlaybackRef, CnError> {
            Ok(PlaybackRef::from("w1.1.1"))
        }

        async fn set_volume(&self, _volume: f64) -> Result<(), CnError> {
            Ok(())
        }

        async fn stop(&self) -> Result<bool, CnError> {
            Ok(true)
        }

        async fn disconnect(&self) -> Result<(), CnError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingBinder {
        binds: AtomicU32,
        unavailable: AtomicBool,
    }

    #[async_trait]
    impl WorkerBinder for CountingBinder {
        async fn bind(&self, channel: &ChannelRef) -> Result<Binding, CnError> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CnError::NoWorkerAvailable(channel.region.clone()));
            }
            let (_tx, events) = tokio::sync::mpsc::unbounded_channel();
            Ok(Binding {
                worker: WorkerId::from("w1"),
                remote_ref: RemoteRef::from("w1.1"),
                backend: Arc::new(SilentBackend),
                events,
            })
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            retry_backoff: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
        }
    }

    fn manager(binder: &Arc<CountingBinder>) -> (SessionManagerHandle, Arc<ActorMetrics>) {
        let metrics = ActorMetrics::new();
        let handle = SessionManagerHandle::new(
            Arc::clone(binder) as Arc<dyn WorkerBinder>,
            Arc::new(DirectUrlResolver),
            options(),
            Arc::clone(&metrics),
        );
        (handle, metrics)
    }

    fn channel(room: &str) -> ChannelRef {
        ChannelRef {
            room_id: RoomId::from(room),
            channel_id: "c1".to_string(),
            region: Region::from("us-east"),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_creates_and_connects_session() {
        let binder = Arc::new(CountingBinder::default());
        let (manager, metrics) = manager(&binder);

        manager.join(channel("g1")).await.unwrap();
        settle().await;

        let info = manager.session(RoomId::from("g1")).await.unwrap();
        assert_eq!(info.state, FsmState::Connected);
        assert_eq!(info.worker, Some(WorkerId::from("w1")));
        assert_eq!(metrics.session_count(), 1);

        // Already connected: a second join does not rebind.
        manager.join(channel("g1")).await.unwrap();
        settle().await;
        assert_eq!(binder.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_room_is_not_found() {
        let binder = Arc::new(CountingBinder::default());
        let (manager, _) = manager(&binder);
        let room = RoomId::from("nowhere");

        assert!(matches!(
            manager.session(room.clone()).await,
            Err(CnError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.stop(room.clone()).await,
            Err(CnError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.play(room.clone(), "https://cdn.example/a.ogg").await,
            Err(CnError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager.leave(room.clone()).await,
            Err(CnError::SessionNotFound(_))
        ));
        assert!(manager.subscribe(room).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_resolves_query() {
        let binder = Arc::new(CountingBinder::default());
        let (manager, _) = manager(&binder);
        let room = RoomId::from("g1");

        manager.join(channel("g1")).await.unwrap();
        let track = manager
            .play(room.clone(), "https://cdn.example/music/a.ogg")
            .await
            .unwrap();
        assert_eq!(track.title, "a.ogg");
        settle().await;

        let info = manager.session(room.clone()).await.unwrap();
        assert_eq!(info.url.as_deref(), Some("https://cdn.example/music/a.ogg"));
        assert_eq!(info.position_secs.map(f64::round), Some(0.0));

        let err = manager.play(room, "not a url").await.unwrap_err();
        assert!(matches!(err, CnError::Media(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_bounds() {
        let binder = Arc::new(CountingBinder::default());
        let (manager, _) = manager(&binder);
        let room = RoomId::from("g1");
        manager.join(channel("g1")).await.unwrap();

        assert!(manager.set_volume(room.clone(), 0.5).await.is_ok());
        assert!(matches!(
            manager.set_volume(room.clone(), 2.5).await,
            Err(CnError::InvalidRequest(_))
        ));
        assert!(manager.set_volume(room, f64::NAN).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_removes_session() {
        let binder = Arc::new(CountingBinder::default());
        let (manager, metrics) = manager(&binder);
        let room = RoomId::from("g1");

        manager.join(channel("g1")).await.unwrap();
        manager.leave(room.clone()).await.unwrap();

        assert!(manager.session(room).await.is_err());
        assert!(manager.list().await.unwrap().is_empty());
        assert_eq!(metrics.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let binder = Arc::new(CountingBinder::default());
        let (manager, _) = manager(&binder);

        manager.join(channel("idle")).await.unwrap();
        manager.join(channel("busy")).await.unwrap();
        manager
            .play(RoomId::from("busy"), "https://cdn.example/a.ogg")
            .await
            .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(90)).await;
        settle().await;

        let rooms: Vec<RoomId> = manager
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.room)
            .collect();
        assert_eq!(rooms, vec![RoomId::from("busy")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_session_keeps_retrying_until_evicted() {
        let binder = Arc::new(CountingBinder::default());
        binder.unavailable.store(true, Ordering::SeqCst);
        let (manager, _) = manager(&binder);

        manager.join(channel("g1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(binder.binds.load(Ordering::SeqCst) >= 4);
        let info = manager.session(RoomId::from("g1")).await.unwrap();
        assert_eq!(info.state, FsmState::AwaitingWorker);

        // Still idle without a worker, so eventually evicted.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_halts_sessions_and_rejects_joins() {
        let binder = Arc::new(CountingBinder::default());
        let (manager, metrics) = manager(&binder);

        manager.join(channel("g1")).await.unwrap();
        manager.join(channel("g2")).await.unwrap();
        manager.shutdown().await.unwrap();

        assert!(manager.list().await.unwrap().is_empty());
        assert_eq!(metrics.session_count(), 0);
        assert!(matches!(
            manager.join(channel("g3")).await,
            Err(CnError::ShuttingDown)
        ));
    }
}
