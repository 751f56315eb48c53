//! Resource table for one control node connection.
//!
//! The control node addresses worker-held voice resources by `remote_ref`
//! (`"{connection_id}.{seq}"`). Resources are created on first use by
//! `resource_call` and dropped by `disconnect` or when the connection ends.
//! Every creation and removal is reported with `session_count_update`.
//!
//! While a track plays, its resource emits `playback:start`, a
//! `playback:progress` every progress interval, and one `playback:done`
//! when the track reaches its end. A stopped or replaced track emits
//! nothing further.

use crate::errors::WorkerError;
use crate::media::{MediaBackend, MediaSession, Playback};

use common::types::{RoomId, VoiceSession};
use relay_protocol::resource::{node_method, resource_method};
use relay_protocol::ResourceEvent;
use relay_rpc::{Args, ConnectionHandle, HandlerError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Deadline for asking the control node to clear the gateway voice state.
const GATEWAY_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Resources held for one control node connection.
pub struct ResourceTable {
    connection_id: String,
    backend: Arc<dyn MediaBackend>,
    progress_interval: Duration,
    next_ref: AtomicU64,
    resources: Mutex<HashMap<String, Arc<Resource>>>,
}

impl std::fmt::Debug for ResourceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTable")
            .field("connection_id", &self.connection_id)
            .field("progress_interval", &self.progress_interval)
            .finish_non_exhaustive()
    }
}

impl ResourceTable {
    #[must_use]
    pub fn new(
        connection_id: impl Into<String>,
        backend: Arc<dyn MediaBackend>,
        progress_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_id: connection_id.into(),
            backend,
            progress_interval,
            next_ref: AtomicU64::new(0),
            resources: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Mint the next `remote_ref` for this connection.
    pub fn make_resource_ref(&self) -> String {
        let seq = self.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{seq}", self.connection_id)
    }

    pub async fn len(&self) -> usize {
        self.resources.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.lock().await.is_empty()
    }

    /// Run `method` on the resource named `remote_ref`.
    #[instrument(skip_all, name = "worker.resource.call", fields(method = %method, remote_ref = %remote_ref))]
    pub async fn dispatch(
        &self,
        conn: &ConnectionHandle,
        method: &str,
        remote_ref: &str,
        args: &Args,
    ) -> Result<Value, HandlerError> {
        if method == resource_method::DISCONNECT {
            let silent = args.optional::<bool>(0, "silent")?.unwrap_or(false);
            if let Some(resource) = self.remove(conn, remote_ref).await {
                resource.disconnect(silent).await;
            }
            return Ok(Value::Null);
        }

        let known = [
            resource_method::CONNECT,
            resource_method::PLAY,
            resource_method::SET_VOLUME,
            resource_method::STOP,
            resource_method::PAUSE,
            resource_method::RESUME,
        ];
        if !known.contains(&method) {
            return Err(WorkerError::UnknownMethod(method.to_string()).into());
        }

        let resource = self.get_or_create(conn, remote_ref).await;
        match method {
            resource_method::CONNECT => {
                let session: VoiceSession = args.get(0, "voice_session")?;
                resource.connect(self.backend.as_ref(), session).await?;
                Ok(Value::Null)
            }
            resource_method::PLAY => {
                let volume: f64 = args.get(0, "volume")?;
                let url: String = args.get(1, "url")?;
                let offset = args.optional::<f64>(2, "offset")?.unwrap_or(0.0);
                let offset = Duration::try_from_secs_f64(offset)
                    .map_err(|e| HandlerError::InvalidArgs(format!("argument 'offset': {e}")))?;
                let playback_ref = resource.play(volume, &url, offset).await?;
                Ok(json!(playback_ref))
            }
            resource_method::SET_VOLUME => {
                let volume: f64 = args.get(0, "volume")?;
                resource.set_volume(volume).await;
                Ok(Value::Null)
            }
            resource_method::STOP => Ok(json!(resource.stop().await)),
            resource_method::PAUSE => Ok(json!(resource.pause().await)),
            _ => Ok(json!(resource.resume().await)),
        }
    }

    async fn get_or_create(&self, conn: &ConnectionHandle, remote_ref: &str) -> Arc<Resource> {
        let (resource, count) = {
            let mut resources = self.resources.lock().await;
            if let Some(existing) = resources.get(remote_ref) {
                return Arc::clone(existing);
            }

            let resource = Arc::new(Resource::new(
                remote_ref.to_string(),
                conn.clone(),
                self.progress_interval,
            ));
            resources.insert(remote_ref.to_string(), Arc::clone(&resource));
            (resource, resources.len())
        };

        debug!(target: "worker.resource", remote_ref = %remote_ref, count, "Resource created");
        report_count(conn, count).await;
        resource
    }

    async fn remove(&self, conn: &ConnectionHandle, remote_ref: &str) -> Option<Arc<Resource>> {
        let (resource, count) = {
            let mut resources = self.resources.lock().await;
            let resource = resources.remove(remote_ref)?;
            (resource, resources.len())
        };

        debug!(target: "worker.resource", remote_ref = %remote_ref, count, "Resource removed");
        report_count(conn, count).await;
        Some(resource)
    }

    /// Drop every resource without touching the gateway. Used once the
    /// control node connection has ended.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<Resource>> = {
            let mut resources = self.resources.lock().await;
            resources.drain().map(|(_, resource)| resource).collect()
        };

        for resource in &drained {
            resource.disconnect(true).await;
        }
        drained.len()
    }
}

async fn report_count(conn: &ConnectionHandle, count: usize) {
    if let Err(e) = conn
        .cast(node_method::SESSION_COUNT_UPDATE, vec![json!(count)])
        .await
    {
        debug!(target: "worker.resource", error = %e, "Session count update not sent");
    }
}

async fn emit(conn: &ConnectionHandle, remote_ref: &str, event: &ResourceEvent) {
    let args = match event.to_emit_args(remote_ref) {
        Ok(args) => args,
        Err(e) => {
            warn!(target: "worker.resource", event = event.name(), error = %e, "Event not encodable");
            return;
        }
    };

    if let Err(e) = conn.cast(node_method::REMOTE_EMIT, args).await {
        debug!(target: "worker.resource", event = event.name(), error = %e, "Event not sent");
    }
}

struct Current {
    playback_ref: String,
    playback: Arc<dyn Playback>,
    watcher: CancellationToken,
}

impl Current {
    fn halt(self) {
        self.watcher.cancel();
        self.playback.stop();
    }
}

#[derive(Default)]
struct ResourceState {
    media: Option<Arc<dyn MediaSession>>,
    room: Option<RoomId>,
    current: Option<Current>,
    playback_seq: u64,
}

/// One voice resource.
pub struct Resource {
    remote_ref: String,
    conn: ConnectionHandle,
    progress_interval: Duration,
    state: Arc<Mutex<ResourceState>>,
}

impl Resource {
    fn new(remote_ref: String, conn: ConnectionHandle, progress_interval: Duration) -> Self {
        Self {
            remote_ref,
            conn,
            progress_interval,
            state: Arc::new(Mutex::new(ResourceState::default())),
        }
    }

    async fn connect(
        &self,
        backend: &dyn MediaBackend,
        session: VoiceSession,
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        if state.media.is_some() {
            return Ok(());
        }

        state.media = Some(backend.connect(&session).await?);
        state.room = Some(session.guild_id);
        info!(target: "worker.resource", remote_ref = %self.remote_ref, "Resource connected");
        Ok(())
    }

    async fn play(&self, volume: f64, url: &str, offset: Duration) -> Result<String, WorkerError> {
        let mut state = self.state.lock().await;
        let media = state
            .media
            .clone()
            .ok_or_else(|| WorkerError::NotConnected(self.remote_ref.clone()))?;

        if let Some(previous) = state.current.take() {
            previous.halt();
        }

        state.playback_seq += 1;
        let playback_ref = format!("{}.{}", self.remote_ref, state.playback_seq);
        let playback = media.start(url, volume, offset).await?;

        emit(
            &self.conn,
            &self.remote_ref,
            &ResourceEvent::PlaybackStart {
                playback_ref: playback_ref.clone(),
            },
        )
        .await;

        let watcher = CancellationToken::new();
        tokio::spawn(watch_playback(
            self.conn.clone(),
            self.remote_ref.clone(),
            playback_ref.clone(),
            Arc::clone(&playback),
            Arc::clone(&self.state),
            self.progress_interval,
            watcher.clone(),
        ));

        state.current = Some(Current {
            playback_ref: playback_ref.clone(),
            playback,
            watcher,
        });
        Ok(playback_ref)
    }

    async fn set_volume(&self, volume: f64) {
        if let Some(current) = &self.state.lock().await.current {
            current.playback.set_volume(volume);
        }
    }

    async fn stop(&self) -> bool {
        match self.state.lock().await.current.take() {
            Some(current) => {
                current.halt();
                true
            }
            None => false,
        }
    }

    async fn pause(&self) -> bool {
        match &self.state.lock().await.current {
            Some(current) => {
                current.playback.pause();
                true
            }
            None => false,
        }
    }

    async fn resume(&self) -> bool {
        match &self.state.lock().await.current {
            Some(current) => {
                current.playback.resume();
                true
            }
            None => false,
        }
    }

    /// Stop playback and close the media connection. Unless `silent`, the
    /// control node is asked to clear the gateway voice state.
    async fn disconnect(&self, silent: bool) {
        let (media, room) = {
            let mut state = self.state.lock().await;
            if let Some(current) = state.current.take() {
                current.halt();
            }
            (state.media.take(), state.room.take())
        };

        let Some(media) = media else {
            return;
        };
        media.close().await;
        info!(target: "worker.resource", remote_ref = %self.remote_ref, silent, "Resource disconnected");

        if silent {
            return;
        }
        if let Some(room) = room {
            if let Err(e) = self
                .conn
                .call(
                    node_method::GATEWAY_VOICE_STATE,
                    vec![json!(room), Value::Null],
                    Some(GATEWAY_CALL_TIMEOUT),
                )
                .await
            {
                warn!(
                    target: "worker.resource",
                    remote_ref = %self.remote_ref,
                    error = %e,
                    "Failed to clear gateway voice state"
                );
            }
        }
    }
}

/// Report progress until the track ends or is halted.
async fn watch_playback(
    conn: ConnectionHandle,
    remote_ref: String,
    playback_ref: String,
    playback: Arc<dyn Playback>,
    state: Arc<Mutex<ResourceState>>,
    interval: Duration,
    halted: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = halted.cancelled() => return,
            () = playback.finished() => break,
            _ = ticker.tick() => {
                let elapsed = playback.position().as_secs_f64();
                emit(
                    &conn,
                    &remote_ref,
                    &ResourceEvent::PlaybackProgress { playback_ref: playback_ref.clone(), elapsed },
                )
                .await;
            }
        }
    }

    {
        let mut state = state.lock().await;
        if halted.is_cancelled() {
            return;
        }
        if state
            .current
            .as_ref()
            .is_some_and(|current| current.playback_ref == playback_ref)
        {
            state.current = None;
        }
    }

    debug!(target: "worker.resource", playback_ref = %playback_ref, "Playback finished");
    emit(&conn, &remote_ref, &ResourceEvent::PlaybackDone { playback_ref }).await;
}
