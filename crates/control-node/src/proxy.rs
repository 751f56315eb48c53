//! Remote proxy: a typed stub for one worker-held resource.
//!
//! Every method is a `call resource_call(method, remote_ref, args...)` on the
//! worker connection, bounded by the configured call timeout.
//!
//! Events the worker casts back (`remote_emit`) are routed by `remote_ref`
//! to the subscriber registered when the proxy was created. Per resource,
//! `playback:done` is delivered at most once per playback and `Down` at most
//! once in total; after `Down` or `disconnect` the route is gone.

use crate::observability::metrics;

use common::types::{PlaybackRef, RemoteRef, VoiceSession};
use relay_protocol::resource::{resource_method, worker_method};
use relay_protocol::ResourceEvent;
use relay_rpc::{CallError, ConnectionHandle};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Event delivered to the owner of a proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    PlaybackStarted { playback_ref: PlaybackRef },
    PlaybackProgress {
        playback_ref: PlaybackRef,
        elapsed: Duration,
    },
    PlaybackDone { playback_ref: PlaybackRef },
    /// The resource or its worker is gone.
    Down { reason: String },
}

impl From<ResourceEvent> for ProxyEvent {
    fn from(event: ResourceEvent) -> Self {
        match event {
            ResourceEvent::PlaybackStart { playback_ref } => ProxyEvent::PlaybackStarted {
                playback_ref: playback_ref.into(),
            },
            ResourceEvent::PlaybackProgress {
                playback_ref,
                elapsed,
            } => ProxyEvent::PlaybackProgress {
                playback_ref: playback_ref.into(),
                elapsed: Duration::try_from_secs_f64(elapsed).unwrap_or_default(),
            },
            ResourceEvent::PlaybackDone { playback_ref } => ProxyEvent::PlaybackDone {
                playback_ref: playback_ref.into(),
            },
            ResourceEvent::RemoteDown { reason } => ProxyEvent::Down {
                reason: reason.unwrap_or_else(|| "resource lost".to_string()),
            },
        }
    }
}

struct Route {
    sender: mpsc::UnboundedSender<ProxyEvent>,
    finished: HashSet<PlaybackRef>,
}

/// Per-connection routing table from `remote_ref` to proxy subscriber.
#[derive(Default)]
pub struct EventRoutes {
    routes: Mutex<HashMap<RemoteRef, Route>>,
}

impl fmt::Debug for EventRoutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRoutes").finish_non_exhaustive()
    }
}

impl EventRoutes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the subscriber for `remote_ref`, replacing any previous one.
    pub async fn subscribe(&self, remote_ref: RemoteRef) -> mpsc::UnboundedReceiver<ProxyEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routes.lock().await.insert(
            remote_ref,
            Route {
                sender,
                finished: HashSet::new(),
            },
        );
        receiver
    }

    pub async fn unsubscribe(&self, remote_ref: &RemoteRef) {
        self.routes.lock().await.remove(remote_ref);
    }

    /// Deliver one event. Returns `false` if it was dropped (no subscriber,
    /// or a duplicate terminal event).
    pub async fn dispatch(&self, remote_ref: &RemoteRef, event: ProxyEvent) -> bool {
        let mut routes = self.routes.lock().await;

        match &event {
            ProxyEvent::Down { .. } => {
                let Some(route) = routes.remove(remote_ref) else {
                    return false;
                };
                route.sender.send(event).is_ok()
            }
            ProxyEvent::PlaybackDone { playback_ref } => {
                let Some(route) = routes.get_mut(remote_ref) else {
                    return false;
                };
                if !route.finished.insert(playback_ref.clone()) {
                    return false;
                }
                route.sender.send(event).is_ok()
            }
            ProxyEvent::PlaybackStarted { .. } | ProxyEvent::PlaybackProgress { .. } => routes
                .get(remote_ref)
                .is_some_and(|route| route.sender.send(event).is_ok()),
        }
    }

    /// Deliver `Down` to every subscriber and clear the table.
    pub async fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<Route> = self.routes.lock().await.drain().map(|(_, r)| r).collect();
        for route in &drained {
            let _ = route.sender.send(ProxyEvent::Down {
                reason: reason.to_string(),
            });
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.routes.lock().await.len()
    }
}

/// Stub for one remote resource on one worker.
#[derive(Clone)]
pub struct RemoteProxy {
    conn: ConnectionHandle,
    routes: Arc<EventRoutes>,
    remote_ref: RemoteRef,
    call_timeout: Duration,
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("worker", &self.conn.label())
            .field("remote_ref", &self.remote_ref)
            .finish()
    }
}

impl RemoteProxy {
    /// Ask the worker behind `conn` to mint a resource and bind a proxy to it.
    ///
    /// The returned receiver yields the resource's events.
    pub async fn create(
        conn: ConnectionHandle,
        routes: Arc<EventRoutes>,
        call_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProxyEvent>), CallError> {
        let started = Instant::now();
        let minted = conn
            .call_as::<RemoteRef>(worker_method::MAKE_RESOURCE_REF, vec![], Some(call_timeout))
            .await;
        record(worker_method::MAKE_RESOURCE_REF, &minted, started);
        let remote_ref = minted?;

        let events = routes.subscribe(remote_ref.clone()).await;
        debug!(
            target: "cn.proxy",
            worker = %conn.label(),
            remote_ref = %remote_ref,
            "Remote resource created"
        );

        Ok((
            Self {
                conn,
                routes,
                remote_ref,
                call_timeout,
            },
            events,
        ))
    }

    #[must_use]
    pub fn remote_ref(&self) -> &RemoteRef {
        &self.remote_ref
    }

    /// Label of the worker connection.
    #[must_use]
    pub fn worker(&self) -> &str {
        self.conn.label()
    }

    /// Open the media connection with the gateway's session data.
    pub async fn connect(&self, session: &VoiceSession) -> Result<(), CallError> {
        let session = serde_json::to_value(session)
            .map_err(|e| CallError::Serialization(e.to_string()))?;
        self.invoke(resource_method::CONNECT, vec![session])
            .await
            .map(|_| ())
    }

    /// Close the media connection and drop the resource. Events stop
    /// flowing regardless of the outcome.
    pub async fn disconnect(&self, silent: bool) -> Result<(), CallError> {
        self.routes.unsubscribe(&self.remote_ref).await;
        self.invoke(resource_method::DISCONNECT, vec![json!(silent)])
            .await
            .map(|_| ())
    }

    /// Start `url` at `offset` and return the worker's playback reference.
    pub async fn play(
        &self,
        volume: f64,
        url: &str,
        offset: Duration,
    ) -> Result<PlaybackRef, CallError> {
        self.invoke_as(
            resource_method::PLAY,
            vec![json!(volume), json!(url), json!(offset.as_secs_f64())],
        )
        .await
    }

    pub async fn set_volume(&self, volume: f64) -> Result<(), CallError> {
        self.invoke(resource_method::SET_VOLUME, vec![json!(volume)])
            .await
            .map(|_| ())
    }

    /// Returns whether something was playing.
    pub async fn stop(&self) -> Result<bool, CallError> {
        self.invoke_as(resource_method::STOP, vec![]).await
    }

    /// Returns whether something was playing.
    pub async fn pause(&self) -> Result<bool, CallError> {
        self.invoke_as(resource_method::PAUSE, vec![]).await
    }

    /// Returns whether something was paused or playing.
    pub async fn resume(&self) -> Result<bool, CallError> {
        self.invoke_as(resource_method::RESUME, vec![]).await
    }

    /// Invoke an arbitrary resource method.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let mut call_args = Vec::with_capacity(args.len() + 2);
        call_args.push(json!(method));
        call_args.push(json!(self.remote_ref));
        call_args.extend(args);

        let started = Instant::now();
        let result = self
            .conn
            .call(
                worker_method::RESOURCE_CALL,
                call_args,
                Some(self.call_timeout),
            )
            .await;
        record(method, &result, started);

        // The worker reports its own method in failures; name the resource
        // method instead so callers can tell calls apart.
        result.map_err(|e| match e {
            CallError::NotFound { .. } => CallError::NotFound {
                method: method.to_string(),
            },
            CallError::Timeout { .. } => CallError::Timeout {
                method: method.to_string(),
            },
            CallError::Down { .. } => CallError::Down {
                method: method.to_string(),
            },
            CallError::Unknown { .. } => CallError::Unknown {
                method: method.to_string(),
            },
            other => other,
        })
    }

    async fn invoke_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, CallError> {
        let value = self.invoke(method, args).await?;
        serde_json::from_value(value).map_err(|e| CallError::Serialization(e.to_string()))
    }
}

fn record<T>(method: &str, result: &Result<T, CallError>, started: Instant) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.label(),
    };
    metrics::record_remote_call(method, outcome, started.elapsed());
}
