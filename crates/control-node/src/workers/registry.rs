//! Worker registry.
//!
//! Tracks every worker that has completed the handshake. Connection ids are
//! minted as `{client_id}-{8 hex chars}` and regenerated until unique among
//! registered and reserved ids.
//!
//! The registry is shared between the RPC listener (register/unregister),
//! the binder (selection) and the admin routes (snapshots), so its state sits
//! behind an `RwLock`.

use super::selector::{self, WorkerCapability, WorkerLoad};
use crate::errors::CnError;
use crate::observability::metrics;
use crate::proxy::{EventRoutes, ProxyEvent, RemoteProxy};

use common::types::{Region, RemoteRef, WorkerId};
use relay_rpc::{CallError, ConnectionHandle, LatencyStats};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Random suffix length in bytes (hex encoded).
const ID_SUFFIX_LEN: usize = 4;

/// One connected worker.
#[derive(Debug)]
pub struct WorkerLink {
    id: WorkerId,
    conn: ConnectionHandle,
    capability: WorkerCapability,
    sessions: AtomicU32,
    binding: AtomicU32,
    routes: Arc<EventRoutes>,
}

impl WorkerLink {
    #[must_use]
    pub fn new(id: WorkerId, conn: ConnectionHandle, capability: WorkerCapability) -> Self {
        Self {
            id,
            conn,
            capability,
            sessions: AtomicU32::new(0),
            binding: AtomicU32::new(0),
            routes: Arc::new(EventRoutes::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    #[must_use]
    pub fn capability(&self) -> &WorkerCapability {
        &self.capability
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Sessions the worker last reported.
    #[must_use]
    pub fn session_count(&self) -> u32 {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn set_session_count(&self, count: u32) {
        self.sessions.store(count, Ordering::SeqCst);
    }

    /// Count a bind in flight until the returned guard drops.
    #[must_use]
    pub fn reserve_bind(self: &Arc<Self>) -> BindReservation {
        self.binding.fetch_add(1, Ordering::SeqCst);
        BindReservation {
            link: Arc::clone(self),
        }
    }

    /// Binds currently in flight on this worker.
    #[must_use]
    pub fn binds_in_flight(&self) -> u32 {
        self.binding.load(Ordering::SeqCst)
    }

    /// Reported sessions plus binds in flight.
    #[must_use]
    pub fn load(&self) -> WorkerLoad {
        WorkerLoad {
            id: self.id.clone(),
            sessions: self.session_count().saturating_add(self.binds_in_flight()),
            max_sessions: self.capability.max_sessions,
            acceptable_regions: self.capability.acceptable_regions.clone(),
        }
    }

    /// Mint a resource on this worker and return a proxy bound to it.
    pub async fn create_proxy(
        &self,
        call_timeout: Duration,
    ) -> Result<(RemoteProxy, mpsc::UnboundedReceiver<ProxyEvent>), CallError> {
        RemoteProxy::create(self.conn.clone(), Arc::clone(&self.routes), call_timeout).await
    }

    /// Route an event cast by the worker to the matching proxy.
    pub async fn dispatch_event(&self, remote_ref: &RemoteRef, event: ProxyEvent) -> bool {
        self.routes.dispatch(remote_ref, event).await
    }

    /// Tell every bound proxy that the worker is gone.
    pub async fn close_routes(&self, reason: &str) -> usize {
        self.routes.close_all(reason).await
    }

    pub async fn summary(&self) -> WorkerSummary {
        let latency: LatencyStats = self.conn.latency().await;
        WorkerSummary {
            id: self.id.clone(),
            sessions: self.session_count(),
            max_sessions: self.capability.max_sessions,
            acceptable_regions: self.capability.acceptable_regions.clone(),
            bound_resources: self.routes.len().await,
            latency_ms: latency.average.map(|d| d.as_secs_f64() * 1000.0),
        }
    }
}

/// A bind in flight on one worker. Dropping it releases the slot.
#[derive(Debug)]
pub struct BindReservation {
    link: Arc<WorkerLink>,
}

impl Drop for BindReservation {
    fn drop(&mut self) {
        let _ = self
            .link
            .binding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Worker state as exposed on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub sessions: u32,
    pub max_sessions: u32,
    pub acceptable_regions: selector::AcceptableRegions,
    pub bound_resources: usize,
    /// Average heartbeat round trip, once measured.
    pub latency_ms: Option<f64>,
}

#[derive(Default)]
struct RegistryState {
    workers: HashMap<WorkerId, Arc<WorkerLink>>,
    reserved: HashSet<WorkerId>,
}

/// Set of live workers.
pub struct WorkerRegistry {
    state: RwLock<RegistryState>,
    rng: SystemRandom,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry").finish_non_exhaustive()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            rng: SystemRandom::new(),
        }
    }

    /// Mint a connection id for `client_id` and hold it until it is
    /// registered or released.
    pub async fn reserve_id(&self, client_id: &str) -> Result<WorkerId, CnError> {
        let mut state = self.state.write().await;

        loop {
            let mut suffix = [0u8; ID_SUFFIX_LEN];
            self.rng
                .fill(&mut suffix)
                .map_err(|_| CnError::Internal("connection id generation failed".to_string()))?;

            let candidate = WorkerId(format!("{client_id}-{}", hex::encode(suffix)));
            if !state.workers.contains_key(&candidate) && !state.reserved.contains(&candidate) {
                state.reserved.insert(candidate.clone());
                return Ok(candidate);
            }
        }
    }

    /// Drop a reservation that never became a registration.
    pub async fn release(&self, id: &WorkerId) {
        self.state.write().await.reserved.remove(id);
    }

    pub async fn register(&self, link: Arc<WorkerLink>) {
        let count = {
            let mut state = self.state.write().await;
            state.reserved.remove(link.id());
            state.workers.insert(link.id().clone(), Arc::clone(&link));
            state.workers.len()
        };

        metrics::set_workers_connected(count);
        info!(
            target: "cn.registry",
            worker = %link.id(),
            max_sessions = link.capability().max_sessions,
            workers = count,
            "Worker registered"
        );
    }

    pub async fn unregister(&self, id: &WorkerId) -> Option<Arc<WorkerLink>> {
        let (removed, count) = {
            let mut state = self.state.write().await;
            (state.workers.remove(id), state.workers.len())
        };

        if removed.is_some() {
            metrics::set_workers_connected(count);
            info!(
                target: "cn.registry",
                worker = %id,
                workers = count,
                "Worker unregistered"
            );
        }
        removed
    }

    pub async fn get(&self, id: &WorkerId) -> Option<Arc<WorkerLink>> {
        self.state.read().await.workers.get(id).cloned()
    }

    /// Pick a worker for `region`. Pure read of current state.
    pub async fn select(&self, region: &Region) -> Option<Arc<WorkerLink>> {
        let state = self.state.read().await;

        // Sort for a stable tie-break independent of hash order.
        let mut loads: Vec<WorkerLoad> = state.workers.values().map(|w| w.load()).collect();
        loads.sort_by(|a, b| a.id.cmp(&b.id));

        let picked = selector::select(&loads, region)?;
        debug!(
            target: "cn.registry",
            region = %region,
            worker = %picked.id,
            sessions = picked.sessions,
            "Worker selected"
        );
        state.workers.get(&picked.id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Summaries of all workers, sorted by id.
    pub async fn summaries(&self) -> Vec<WorkerSummary> {
        let links: Vec<Arc<WorkerLink>> = self.state.read().await.workers.values().cloned().collect();

        let mut summaries = Vec::with_capacity(links.len());
        for link in links {
            summaries.push(link.summary().await);
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::workers::selector::AcceptableRegions;
    use relay_rpc::{Connection, ConnectionOptions, HandlerRegistry, PacketStream};
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    fn idle_connection(label: &str) -> ConnectionHandle {
        let (a, b) = tokio::io::duplex(1024);
        let (handle, _) = Connection::spawn(
            PacketStream::new(a),
            Value::Null,
            Arc::new(HandlerRegistry::new()),
            ConnectionOptions::new(label),
            CancellationToken::new(),
        );
        // Keep the far end open for the life of the test runtime.
        tokio::spawn(async move {
            let _keep = b;
            std::future::pending::<()>().await;
        });
        handle
    }

    fn link(id: &str, sessions: u32, max: u32, regions: AcceptableRegions) -> Arc<WorkerLink> {
        let link = WorkerLink::new(
            WorkerId::from(id),
            idle_connection(id),
            WorkerCapability {
                max_sessions: max,
                acceptable_regions: regions,
            },
        );
        link.set_session_count(sessions);
        Arc::new(link)
    }

    #[tokio::test]
    async fn test_reserved_ids_have_client_prefix_and_hex_suffix() {
        let registry = WorkerRegistry::new();
        let id = registry.reserve_id("1512").await.unwrap();

        let suffix = id.as_str().strip_prefix("1512-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_reserved_ids_are_unique() {
        let registry = WorkerRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(registry.reserve_id("1512").await.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_register_select_unregister() {
        let registry = WorkerRegistry::new();
        let region = Region::from("us-east");

        assert!(registry.select(&region).await.is_none());

        registry
            .register(link(
                "A",
                2,
                5,
                AcceptableRegions::Only(vec![Region::from("us-east")]),
            ))
            .await;
        registry
            .register(link("B", 1, 5, AcceptableRegions::All))
            .await;
        assert_eq!(registry.len().await, 2);

        let picked = registry.select(&region).await.unwrap();
        assert_eq!(picked.id().as_str(), "A");

        let picked = registry.select(&Region::from("eu-west")).await.unwrap();
        assert_eq!(picked.id().as_str(), "B");

        assert!(registry.unregister(&WorkerId::from("A")).await.is_some());
        assert!(registry.unregister(&WorkerId::from("A")).await.is_none());

        let picked = registry.select(&region).await.unwrap();
        assert_eq!(picked.id().as_str(), "B");
    }

    #[tokio::test]
    async fn test_session_count_updates_affect_selection() {
        let registry = WorkerRegistry::new();
        let a = link("A", 0, 2, AcceptableRegions::All);
        let b = link("B", 1, 2, AcceptableRegions::All);
        registry.register(Arc::clone(&a)).await;
        registry.register(Arc::clone(&b)).await;

        let region = Region::from("us-west");
        assert_eq!(registry.select(&region).await.unwrap().id().as_str(), "A");

        a.set_session_count(2);
        assert_eq!(registry.select(&region).await.unwrap().id().as_str(), "B");

        b.set_session_count(2);
        assert!(registry.select(&region).await.is_none());
    }

    #[tokio::test]
    async fn test_bind_reservation_counts_until_dropped() {
        let registry = WorkerRegistry::new();
        let a = link("A", 1, 2, AcceptableRegions::All);
        registry.register(Arc::clone(&a)).await;
        let region = Region::from("us-west");

        let reservation = a.reserve_bind();
        assert_eq!(a.load().sessions, 2);
        assert!(registry.select(&region).await.is_none());
        assert_eq!(a.session_count(), 1);

        drop(reservation);
        assert_eq!(a.binds_in_flight(), 0);
        assert_eq!(registry.select(&region).await.unwrap().id().as_str(), "A");
    }

    #[tokio::test]
    async fn test_summaries_are_sorted() {
        let registry = WorkerRegistry::new();
        registry.register(link("b", 0, 1, AcceptableRegions::All)).await;
        registry.register(link("a", 0, 1, AcceptableRegions::All)).await;

        let ids: Vec<String> = registry
            .summaries()
            .await
            .into_iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_release_frees_reservation() {
        let registry = WorkerRegistry::new();
        let id = registry.reserve_id("1512").await.unwrap();
        registry.release(&id).await;
        assert!(registry.state.read().await.reserved.is_empty());
    }
}
