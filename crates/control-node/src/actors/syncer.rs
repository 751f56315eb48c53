//! `SyncerActor` - per-room desired-state machine.
//!
//! Every change to a session (join, play, stop, volume, worker loss, playback
//! reports, halt) arrives as an [`Intent`]. The actor handles one intent at a
//! time in two steps:
//!
//! 1. [`transition`] computes the next [`DesiredState`] without any I/O.
//! 2. Reconciliation makes the bound worker match it, branching on the new
//!    [`FsmState`]:
//!    - `AwaitingWorker`: cancel the retry timer, drop the old binding, bind
//!      a new worker. On failure retry after the backoff.
//!    - `Connected`: stop, play, or set the volume depending on what changed.
//!      A fresh binding replays the current URL from where it was.
//!    - `Halted`: cancel the retry timer, drop the binding, exit.
//!
//! Worker events (progress, done, down) are fed back in as intents through
//! an internal queue, so they are serialized with user intents.

use super::metrics::{ActorType, MailboxMonitor};
use crate::errors::CnError;
use crate::observability::metrics;
use crate::proxy::ProxyEvent;
use crate::workers::binder::{VoiceBackend, WorkerBinder};

use common::types::{ChannelRef, PlaybackRef, RoomId, WorkerId};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Delay before retrying a failed worker binding.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

const SYNCER_CHANNEL_BUFFER: usize = 256;
const NOTICE_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmState {
    Disconnected,
    AwaitingWorker,
    Connected,
    Halted,
}

/// What the session should look like.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub fsm_state: FsmState,
    pub channel: Option<ChannelRef>,
    pub url: Option<String>,
    pub volume: f64,
    /// When the current track would have started had it played without
    /// interruption.
    pub playback_started_at: Option<Instant>,
    /// Playback reference returned by the worker for the current track.
    pub playback_ref: Option<PlaybackRef>,
    /// Generation of the current binding, bumped on every successful bind.
    pub binding: u64,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            fsm_state: FsmState::Disconnected,
            channel: None,
            url: None,
            volume: 1.0,
            playback_started_at: None,
            playback_ref: None,
            binding: 0,
        }
    }
}

impl DesiredState {
    /// Nothing to play, or not in a channel at all.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        match self.fsm_state {
            FsmState::Disconnected => true,
            FsmState::AwaitingWorker | FsmState::Connected => self.url.is_none(),
            FsmState::Halted => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Connect { channel: ChannelRef },
    /// The resource bound in generation `binding` is gone.
    WorkerDown { binding: u64, reason: String },
    Play { url: String },
    Stop,
    SetVolume { volume: f64 },
    PlaybackProgress {
        playback_ref: PlaybackRef,
        elapsed: Duration,
    },
    PlaybackFinished { playback_ref: PlaybackRef },
    Halt,
    /// Re-run reconciliation after a failed binding.
    Retry,
}

impl Intent {
    /// Label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Intent::Connect { .. } => "connect",
            Intent::WorkerDown { .. } => "worker_down",
            Intent::Play { .. } => "play",
            Intent::Stop => "stop",
            Intent::SetVolume { .. } => "set_volume",
            Intent::PlaybackProgress { .. } => "playback_progress",
            Intent::PlaybackFinished { .. } => "playback_finished",
            Intent::Halt => "halt",
            Intent::Retry => "retry",
        }
    }
}

/// Compute the next desired state. Pure.
#[must_use]
pub fn transition(state: &DesiredState, intent: &Intent, now: Instant) -> DesiredState {
    let mut next = state.clone();
    if state.fsm_state == FsmState::Halted {
        return next;
    }

    match intent {
        Intent::Connect { channel } => {
            next.fsm_state = FsmState::AwaitingWorker;
            next.channel = Some(channel.clone());
        }
        Intent::WorkerDown { binding, .. } => {
            if state.fsm_state == FsmState::Connected && *binding == state.binding {
                next.fsm_state = FsmState::AwaitingWorker;
            }
        }
        Intent::Play { url } => {
            if state.url.as_ref() != Some(url) {
                next.url = Some(url.clone());
                next.playback_started_at = None;
            }
        }
        Intent::Stop => {
            next.url = None;
            next.playback_started_at = None;
        }
        Intent::SetVolume { volume } => {
            next.volume = *volume;
        }
        Intent::PlaybackProgress {
            playback_ref,
            elapsed,
        } => {
            if state.playback_ref.as_ref() == Some(playback_ref) {
                next.playback_started_at = Some(now.checked_sub(*elapsed).unwrap_or(now));
            }
        }
        Intent::PlaybackFinished { playback_ref } => {
            if state.playback_ref.as_ref() == Some(playback_ref) {
                next.url = None;
                next.playback_ref = None;
                next.playback_started_at = None;
            }
        }
        Intent::Halt => {
            next.fsm_state = FsmState::Halted;
        }
        Intent::Retry => {}
    }

    next
}

/// User-visible session events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotice {
    WorkerConnected { worker: WorkerId },
    PlaybackStarted {
        url: String,
        playback_ref: PlaybackRef,
        offset_secs: f64,
    },
    PlaybackFinished { url: String },
    WorkerLost { reason: String },
    /// No worker could be bound. Sent once per outage.
    Unavailable { message: String },
}

/// Published after every intent.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub room: RoomId,
    pub state: DesiredState,
    pub worker: Option<WorkerId>,
    /// Since when [`DesiredState::is_idle`] has held.
    pub idle_since: Option<Instant>,
}

impl SessionSnapshot {
    /// Position in the current track.
    #[must_use]
    pub fn position(&self, now: Instant) -> Option<Duration> {
        self.state
            .playback_started_at
            .map(|started| now.saturating_duration_since(started))
    }
}

/// Handle to a `SyncerActor`.
#[derive(Clone)]
pub struct SyncerHandle {
    room: RoomId,
    sender: mpsc::Sender<Intent>,
    cancel_token: CancellationToken,
    snapshot: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    mailbox: Arc<MailboxMonitor>,
}

impl std::fmt::Debug for SyncerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncerHandle")
            .field("room", &self.room)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SyncerHandle {
    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Queue an intent.
    pub async fn submit(&self, intent: Intent) -> Result<(), CnError> {
        self.mailbox.record_enqueue();
        self.sender.send(intent).await.map_err(|e| {
            self.mailbox.record_unsent();
            CnError::Internal(format!("channel send failed: {e}"))
        })
    }

    /// Intents submitted but not yet taken by the actor.
    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.depth()
    }

    pub async fn connect(&self, channel: ChannelRef) -> Result<(), CnError> {
        self.submit(Intent::Connect { channel }).await
    }

    pub async fn play(&self, url: impl Into<String>) -> Result<(), CnError> {
        self.submit(Intent::Play { url: url.into() }).await
    }

    pub async fn stop(&self) -> Result<(), CnError> {
        self.submit(Intent::Stop).await
    }

    pub async fn set_volume(&self, volume: f64) -> Result<(), CnError> {
        self.submit(Intent::SetVolume { volume }).await
    }

    pub async fn halt(&self) -> Result<(), CnError> {
        self.submit(Intent::Halt).await
    }

    /// Latest published state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch published states.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Stop the actor as if halted.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// The actor has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Result of one reconciliation step.
enum Reconciled {
    Done,
    /// A call failed because the worker is gone.
    WorkerLost(String),
    Halted,
}

struct Bound {
    worker: WorkerId,
    backend: Arc<dyn VoiceBackend>,
    forwarder: JoinHandle<()>,
}

/// The `SyncerActor` implementation.
pub struct SyncerActor {
    room: RoomId,
    state: DesiredState,
    receiver: mpsc::Receiver<Intent>,
    internal_tx: mpsc::UnboundedSender<Intent>,
    internal_rx: mpsc::UnboundedReceiver<Intent>,
    binder: Arc<dyn WorkerBinder>,
    retry_backoff: Duration,
    cancel_token: CancellationToken,
    bound: Option<Bound>,
    retry: Option<JoinHandle<()>>,
    unavailable_notified: bool,
    idle_since: Option<Instant>,
    snapshot: watch::Sender<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    mailbox: Arc<MailboxMonitor>,
}

impl SyncerActor {
    /// Spawn a syncer for `room`.
    pub fn spawn(
        room: RoomId,
        binder: Arc<dyn WorkerBinder>,
        retry_backoff: Duration,
        cancel_token: CancellationToken,
    ) -> (SyncerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SYNCER_CHANNEL_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Syncer, room.as_str()));

        let state = DesiredState::default();
        let idle_since = Some(Instant::now());
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            room: room.clone(),
            state: state.clone(),
            worker: None,
            idle_since,
        });

        let actor = Self {
            room: room.clone(),
            state,
            receiver,
            internal_tx,
            internal_rx,
            binder,
            retry_backoff,
            cancel_token: cancel_token.clone(),
            bound: None,
            retry: None,
            unavailable_notified: false,
            idle_since,
            snapshot: snapshot_tx,
            notices: notices.clone(),
            mailbox: Arc::clone(&mailbox),
        };

        let task = tokio::spawn(actor.run());
        let handle = SyncerHandle {
            room,
            sender,
            cancel_token,
            snapshot: snapshot_rx,
            notices,
            mailbox,
        };
        (handle, task)
    }

    #[instrument(skip_all, name = "cn.actor.syncer", fields(room = %self.room))]
    async fn run(mut self) {
        debug!(target: "cn.actor.syncer", room = %self.room, "SyncerActor started");

        loop {
            let intent = tokio::select! {
                () = self.cancel_token.cancelled() => Intent::Halt,
                Some(intent) = self.internal_rx.recv() => intent,
                msg = self.receiver.recv() => match msg {
                    Some(intent) => {
                        self.mailbox.record_dequeue();
                        intent
                    }
                    None => {
                        debug!(
                            target: "cn.actor.syncer",
                            room = %self.room,
                            "All handles dropped, halting"
                        );
                        Intent::Halt
                    }
                },
            };

            let flow = self.handle_intent(intent).await;
            self.mailbox.record_processed();

            if flow.is_break() {
                break;
            }
        }

        info!(
            target: "cn.actor.syncer",
            room = %self.room,
            intents_processed = self.mailbox.processed(),
            "SyncerActor stopped"
        );
    }

    async fn handle_intent(&mut self, intent: Intent) -> ControlFlow<()> {
        let mut pending = Some(intent);

        while let Some(intent) = pending.take() {
            metrics::record_syncer_intent(intent.kind());

            let prev = self.state.clone();
            self.state = transition(&prev, &intent, Instant::now());
            self.announce(&prev, &intent);

            let outcome = self.reconcile(&prev).await;
            self.publish();

            match outcome {
                Reconciled::Done => {}
                Reconciled::WorkerLost(reason) => {
                    pending = Some(Intent::WorkerDown {
                        binding: self.state.binding,
                        reason,
                    });
                }
                Reconciled::Halted => return ControlFlow::Break(()),
            }
        }

        ControlFlow::Continue(())
    }

    /// Notices that follow directly from a transition.
    fn announce(&self, prev: &DesiredState, intent: &Intent) {
        match intent {
            Intent::WorkerDown { reason, .. }
                if prev.fsm_state == FsmState::Connected
                    && self.state.fsm_state == FsmState::AwaitingWorker =>
            {
                warn!(
                    target: "cn.actor.syncer",
                    room = %self.room,
                    reason = %reason,
                    "Worker lost, rebinding"
                );
                self.notify(SessionNotice::WorkerLost {
                    reason: reason.clone(),
                });
            }
            Intent::PlaybackFinished { .. } if self.state.url.is_none() => {
                if let Some(url) = &prev.url {
                    self.notify(SessionNotice::PlaybackFinished { url: url.clone() });
                }
            }
            _ => {}
        }
    }

    async fn reconcile(&mut self, prev: &DesiredState) -> Reconciled {
        match self.state.fsm_state {
            FsmState::Disconnected => Reconciled::Done,
            FsmState::AwaitingWorker => self.bind().await,
            FsmState::Connected => self.sync(Some(prev)).await,
            FsmState::Halted => {
                self.cancel_retry();
                self.release_binding().await;
                Reconciled::Halted
            }
        }
    }

    async fn bind(&mut self) -> Reconciled {
        self.cancel_retry();
        self.release_binding().await;

        let Some(channel) = self.state.channel.clone() else {
            warn!(target: "cn.actor.syncer", room = %self.room, "No channel to bind");
            self.state.fsm_state = FsmState::Disconnected;
            return Reconciled::Done;
        };

        let binding = match self.binder.bind(&channel).await {
            Ok(binding) => binding,
            Err(e) => {
                warn!(
                    target: "cn.actor.syncer",
                    room = %self.room,
                    error = %e,
                    retry_in_ms = u64::try_from(self.retry_backoff.as_millis()).unwrap_or(u64::MAX),
                    "Worker binding failed"
                );
                self.schedule_retry();
                if !self.unavailable_notified {
                    self.unavailable_notified = true;
                    self.notify(SessionNotice::Unavailable {
                        message: e.client_message(),
                    });
                }
                return Reconciled::Done;
            }
        };

        self.state.binding += 1;
        self.state.fsm_state = FsmState::Connected;
        // Nothing is playing on a fresh resource.
        self.state.playback_ref = None;
        self.unavailable_notified = false;

        info!(
            target: "cn.actor.syncer",
            room = %self.room,
            worker = %binding.worker,
            remote_ref = %binding.remote_ref,
            generation = self.state.binding,
            "Session bound"
        );
        self.notify(SessionNotice::WorkerConnected {
            worker: binding.worker.clone(),
        });

        let forwarder = spawn_forwarder(binding.events, self.internal_tx.clone(), self.state.binding);
        self.bound = Some(Bound {
            worker: binding.worker,
            backend: binding.backend,
            forwarder,
        });

        match self.sync(None).await {
            Reconciled::WorkerLost(reason) => {
                // The worker died right after binding; back off instead of
                // spinning on it until it is unregistered.
                self.notify(SessionNotice::WorkerLost { reason });
                self.state.fsm_state = FsmState::AwaitingWorker;
                self.release_binding().await;
                self.schedule_retry();
                Reconciled::Done
            }
            other => other,
        }
    }

    /// Make the bound worker match the desired state. `prev` is `None` right
    /// after a new binding.
    async fn sync(&mut self, prev: Option<&DesiredState>) -> Reconciled {
        let Some(backend) = self.bound.as_ref().map(|b| Arc::clone(&b.backend)) else {
            return Reconciled::WorkerLost("no worker bound".to_string());
        };

        let result = match (self.state.url.clone(), prev) {
            (None, prev) => {
                let unconfirmed =
                    prev.is_some_and(|p| p.url.is_some() && p.playback_ref.is_none());
                self.stop_current(backend.as_ref(), unconfirmed).await
            }
            (Some(url), None) => self.start(backend.as_ref(), url, true).await,
            (Some(url), Some(prev)) if prev.url.as_ref() != Some(&url) => {
                self.start(backend.as_ref(), url, false).await
            }
            // The worker never confirmed this track.
            (Some(url), Some(_)) if self.state.playback_ref.is_none() => {
                self.start(backend.as_ref(), url, true).await
            }
            (Some(_), Some(prev)) if (prev.volume - self.state.volume).abs() > f64::EPSILON => {
                backend.set_volume(self.state.volume).await
            }
            _ => Ok(()),
        };

        match result {
            Ok(()) => Reconciled::Done,
            Err(e) if e.is_worker_down() => Reconciled::WorkerLost(e.to_string()),
            Err(e) => {
                warn!(
                    target: "cn.actor.syncer",
                    room = %self.room,
                    error = %e,
                    "Reconciliation call failed"
                );
                Reconciled::Done
            }
        }
    }

    async fn start(
        &mut self,
        backend: &dyn VoiceBackend,
        url: String,
        resume: bool,
    ) -> Result<(), CnError> {
        let now = Instant::now();
        let offset = if resume {
            self.state
                .playback_started_at
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };

        // Unconfirmed until the worker answers.
        self.state.playback_ref = None;
        let playback_ref = backend.play(self.state.volume, &url, offset).await?;

        debug!(
            target: "cn.actor.syncer",
            room = %self.room,
            playback_ref = %playback_ref,
            offset_secs = offset.as_secs_f64(),
            "Playback started"
        );
        self.state.playback_ref = Some(playback_ref.clone());
        self.state.playback_started_at = Some(now.checked_sub(offset).unwrap_or(now));
        self.notify(SessionNotice::PlaybackStarted {
            url,
            playback_ref,
            offset_secs: offset.as_secs_f64(),
        });
        Ok(())
    }

    /// Stop the current track. `unconfirmed` means a play went out without
    /// an answer, so the worker may be playing anyway.
    async fn stop_current(
        &mut self,
        backend: &dyn VoiceBackend,
        unconfirmed: bool,
    ) -> Result<(), CnError> {
        if self.state.playback_ref.take().is_none() && !unconfirmed {
            return Ok(());
        }
        backend.stop().await.map(|_| ())
    }

    /// Disconnect the bound worker, if any.
    async fn release_binding(&mut self) {
        let Some(bound) = self.bound.take() else {
            return;
        };
        bound.forwarder.abort();

        if let Err(e) = bound.backend.disconnect().await {
            debug!(
                target: "cn.actor.syncer",
                room = %self.room,
                worker = %bound.worker,
                error = %e,
                "Disconnect from worker failed"
            );
        }
    }

    fn schedule_retry(&mut self) {
        self.cancel_retry();
        let internal = self.internal_tx.clone();
        let backoff = self.retry_backoff;
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = internal.send(Intent::Retry);
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn publish(&mut self) {
        if self.state.is_idle() {
            self.idle_since.get_or_insert_with(Instant::now);
        } else {
            self.idle_since = None;
        }

        self.snapshot.send_replace(SessionSnapshot {
            room: self.room.clone(),
            state: self.state.clone(),
            worker: self.bound.as_ref().map(|b| b.worker.clone()),
            idle_since: self.idle_since,
        });
    }
}

/// Turn resource events into intents for the binding of generation `binding`.
fn spawn_forwarder(
    mut events: mpsc::UnboundedReceiver<ProxyEvent>,
    internal: mpsc::UnboundedSender<Intent>,
    binding: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let intent = match event {
                ProxyEvent::PlaybackStarted { .. } => continue,
                ProxyEvent::PlaybackProgress {
                    playback_ref,
                    elapsed,
                } => Intent::PlaybackProgress {
                    playback_ref,
                    elapsed,
                },
                ProxyEvent::PlaybackDone { playback_ref } => {
                    Intent::PlaybackFinished { playback_ref }
                }
                ProxyEvent::Down { reason } => Intent::WorkerDown { binding, reason },
            };
            if internal.send(intent).is_err() {
                break;
            }
        }
    })
}
