//! Binding a session to a worker.
//!
//! A binding is one remote resource on one worker whose media connection is
//! already open in the requested channel. Syncers only ever see the
//! [`WorkerBinder`] and [`VoiceBackend`] traits; [`RegistryBinder`] is the
//! production implementation on top of the registry, the remote proxy and
//! the chat gateway.

use super::registry::WorkerRegistry;
use crate::errors::CnError;
use crate::gateway::ChatGateway;
use crate::observability::metrics;
use crate::proxy::{ProxyEvent, RemoteProxy};

use async_trait::async_trait;
use common::types::{ChannelRef, PlaybackRef, RemoteRef, RoomId, WorkerId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Playback operations on a bound resource.
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Start `url` at `offset` and return its playback reference.
    async fn play(&self, volume: f64, url: &str, offset: Duration)
        -> Result<PlaybackRef, CnError>;

    async fn set_volume(&self, volume: f64) -> Result<(), CnError>;

    /// Returns whether something was playing.
    async fn stop(&self) -> Result<bool, CnError>;

    /// Tear the resource down and leave the channel.
    async fn disconnect(&self) -> Result<(), CnError>;
}

/// A live resource bound to a session.
pub struct Binding {
    pub worker: WorkerId,
    pub remote_ref: RemoteRef,
    pub backend: Arc<dyn VoiceBackend>,
    /// Events raised by the resource. Ends with `Down` or when the
    /// backend is disconnected.
    pub events: mpsc::UnboundedReceiver<ProxyEvent>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("worker", &self.worker)
            .field("remote_ref", &self.remote_ref)
            .finish_non_exhaustive()
    }
}

/// Obtains a bound resource for a channel.
#[async_trait]
pub trait WorkerBinder: Send + Sync {
    async fn bind(&self, channel: &ChannelRef) -> Result<Binding, CnError>;
}

/// Binder backed by the live worker registry.
#[derive(Clone)]
pub struct RegistryBinder {
    registry: Arc<WorkerRegistry>,
    gateway: Arc<dyn ChatGateway>,
    call_timeout: Duration,
}

impl fmt::Debug for RegistryBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBinder")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl RegistryBinder {
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        gateway: Arc<dyn ChatGateway>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            gateway,
            call_timeout,
        }
    }
}

#[async_trait]
impl WorkerBinder for RegistryBinder {
    #[instrument(skip_all, name = "cn.binder.bind", fields(room = %channel.room_id, region = %channel.region))]
    async fn bind(&self, channel: &ChannelRef) -> Result<Binding, CnError> {
        let Some(link) = self.registry.select(&channel.region).await else {
            metrics::record_worker_selection("none_eligible");
            return Err(CnError::NoWorkerAvailable(channel.region.clone()));
        };
        metrics::record_worker_selection("success");

        // Held until bind returns. Concurrent binds see the slot taken; the
        // worker's own count covers the resource once it exists.
        let _reservation = link.reserve_bind();

        let (proxy, events) = link.create_proxy(self.call_timeout).await?;

        let session = match self.gateway.join_channel(channel).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(cleanup) = proxy.disconnect(true).await {
                    debug!(target: "cn.binder", error = %cleanup, "Resource cleanup failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = proxy.connect(&session).await {
            warn!(
                target: "cn.binder",
                worker = %link.id(),
                error = %e,
                "Worker failed to open media connection"
            );
            if let Err(cleanup) = proxy.disconnect(true).await {
                debug!(target: "cn.binder", error = %cleanup, "Resource cleanup failed");
            }
            if let Err(leave) = self.gateway.leave_channel(&channel.room_id).await {
                debug!(target: "cn.binder", error = %leave, "Gateway leave failed");
            }
            return Err(e.into());
        }

        info!(
            target: "cn.binder",
            worker = %link.id(),
            remote_ref = %proxy.remote_ref(),
            "Session bound to worker"
        );

        Ok(Binding {
            worker: link.id().clone(),
            remote_ref: proxy.remote_ref().clone(),
            backend: Arc::new(GatewayBoundProxy {
                proxy,
                gateway: Arc::clone(&self.gateway),
                room: channel.room_id.clone(),
            }),
            events,
        })
    }
}

/// Remote proxy that also leaves the gateway channel on disconnect.
struct GatewayBoundProxy {
    proxy: RemoteProxy,
    gateway: Arc<dyn ChatGateway>,
    room: RoomId,
}

#[async_trait]
impl VoiceBackend for GatewayBoundProxy {
    async fn play(
        &self,
        volume: f64,
        url: &str,
        offset: Duration,
    ) -> Result<PlaybackRef, CnError> {
        Ok(self.proxy.play(volume, url, offset).await?)
    }

    async fn set_volume(&self, volume: f64) -> Result<(), CnError> {
        Ok(self.proxy.set_volume(volume).await?)
    }

    async fn stop(&self) -> Result<bool, CnError> {
        Ok(self.proxy.stop().await?)
    }

    async fn disconnect(&self) -> Result<(), CnError> {
        let remote = self.proxy.disconnect(true).await;
        self.gateway.leave_channel(&self.room).await?;
        Ok(remote?)
    }
}
