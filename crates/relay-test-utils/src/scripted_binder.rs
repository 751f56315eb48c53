//! Worker binder with scripted outcomes.
//!
//! Each `bind` takes the next [`BindOutcome`] from the script, falling back
//! to [`BindOutcome::Bound`] once the script runs out. Every successful bind
//! hands out a [`FakeVoiceBackend`] and keeps the sending half of its event
//! channel so tests can play the worker's part.

use async_trait::async_trait;
use common::types::{ChannelRef, PlaybackRef, RemoteRef, WorkerId};
use control_node::errors::CnError;
use control_node::proxy::ProxyEvent;
use control_node::workers::{Binding, VoiceBackend, WorkerBinder};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Operation seen by a [`FakeVoiceBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceCall {
    Play {
        volume: f64,
        url: String,
        offset: Duration,
    },
    SetVolume(f64),
    Stop,
    Disconnect,
}

/// Backend that records calls and mints `{remote_ref}.{n}` playback refs.
#[derive(Debug)]
pub struct FakeVoiceBackend {
    remote_ref: RemoteRef,
    calls: Mutex<Vec<VoiceCall>>,
    playbacks: AtomicU32,
}

impl FakeVoiceBackend {
    pub fn new(remote_ref: RemoteRef) -> Self {
        Self {
            remote_ref,
            calls: Mutex::new(Vec::new()),
            playbacks: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> Vec<VoiceCall> {
        self.calls.lock().unwrap().clone()
    }

    /// URLs passed to `play`, in order.
    pub fn played_urls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                VoiceCall::Play { url, .. } => Some(url),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: VoiceCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VoiceBackend for FakeVoiceBackend {
    async fn play(
        &self,
        volume: f64,
        url: &str,
        offset: Duration,
    ) -> Result<PlaybackRef, CnError> {
        self.record(VoiceCall::Play {
            volume,
            url: url.to_string(),
            offset,
        });
        let n = self.playbacks.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PlaybackRef::from(format!("{}.{n}", self.remote_ref)))
    }

    async fn set_volume(&self, volume: f64) -> Result<(), CnError> {
        self.record(VoiceCall::SetVolume(volume));
        Ok(())
    }

    async fn stop(&self) -> Result<bool, CnError> {
        self.record(VoiceCall::Stop);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<(), CnError> {
        self.record(VoiceCall::Disconnect);
        Ok(())
    }
}

/// What the next `bind` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    NoWorker,
    GatewayTimeout,
}

/// A binding handed out by [`ScriptedBinder`].
#[derive(Debug, Clone)]
pub struct ScriptedBinding {
    pub channel: ChannelRef,
    pub remote_ref: RemoteRef,
    pub backend: Arc<FakeVoiceBackend>,
    pub events: mpsc::UnboundedSender<ProxyEvent>,
}

impl ScriptedBinding {
    /// Deliver an event as if the worker had emitted it.
    pub fn emit(&self, event: ProxyEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn down(&self, reason: &str) -> bool {
        self.emit(ProxyEvent::Down {
            reason: reason.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ScriptedBinder {
    script: Mutex<VecDeque<BindOutcome>>,
    attempts: AtomicU32,
    bindings: Mutex<Vec<ScriptedBinding>>,
}

impl ScriptedBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: impl IntoIterator<Item = BindOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Queue more outcomes behind the current script.
    pub fn push(&self, outcome: BindOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Total `bind` calls, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn bindings(&self) -> Vec<ScriptedBinding> {
        self.bindings.lock().unwrap().clone()
    }

    /// The most recent successful binding.
    pub fn last_binding(&self) -> Option<ScriptedBinding> {
        self.bindings.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl WorkerBinder for ScriptedBinder {
    async fn bind(&self, channel: &ChannelRef) -> Result<Binding, CnError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BindOutcome::Bound);

        match outcome {
            BindOutcome::NoWorker => Err(CnError::NoWorkerAvailable(channel.region.clone())),
            BindOutcome::GatewayTimeout => Err(CnError::GatewayTimeout),
            BindOutcome::Bound => {
                let remote_ref = RemoteRef::from(format!("fake-worker.{attempt}"));
                let backend = Arc::new(FakeVoiceBackend::new(remote_ref.clone()));
                let (events_tx, events) = mpsc::unbounded_channel();

                self.bindings.lock().unwrap().push(ScriptedBinding {
                    channel: channel.clone(),
                    remote_ref: remote_ref.clone(),
                    backend: Arc::clone(&backend),
                    events: events_tx,
                });

                Ok(Binding {
                    worker: WorkerId::from("fake-worker"),
                    remote_ref,
                    backend,
                    events,
                })
            }
        }
    }
}
