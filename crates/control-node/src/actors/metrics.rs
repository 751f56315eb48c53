//! Mailbox depth and actor health.
//!
//! | Actor          | Elevated | Backlogged |
//! |----------------|----------|------------|
//! | SessionManager | > 100    | > 500      |
//! | Syncer         | > 32     | > 128      |
//!
//! A syncer falls behind when a worker call is slow, so its limits are much
//! lower than the manager's. Depth is exported per actor kind as
//! `cn_actor_mailbox_depth`.

use crate::observability::metrics;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The two actor kinds in the control node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `SessionManagerActor`, one per process.
    SessionManager,
    /// `SyncerActor`, one per room.
    Syncer,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::SessionManager => "session_manager",
            ActorType::Syncer => "syncer",
        }
    }

    /// `(elevated, backlogged)` depth limits.
    #[must_use]
    pub const fn limits(&self) -> (usize, usize) {
        match self {
            ActorType::SessionManager => (100, 500),
            ActorType::Syncer => (32, 128),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backlog {
    Clear,
    Elevated,
    Backlogged,
}

/// Queue depth of one actor's mailbox, shared by the actor and its handles.
///
/// Handles call `record_enqueue` before sending (and `record_unsent` if the
/// send fails); the actor calls `record_dequeue` when it takes a message off
/// the mailbox and `record_processed` once the message is handled.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_mailbox_enqueue(self.actor_type.as_str());

        let (elevated, backlogged) = self.actor_type.limits();
        if depth > backlogged {
            warn!(
                target: "cn.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox backlogged"
            );
        } else if depth == elevated + 1 {
            debug!(
                target: "cn.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox depth elevated"
            );
        }
    }

    pub fn record_dequeue(&self) {
        self.drain_one();
    }

    /// The send after `record_enqueue` failed.
    pub fn record_unsent(&self) {
        self.drain_one();
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn drain_one(&self) {
        // A dequeue without a matching enqueue must not wrap.
        let drained = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1))
            .is_ok();
        if drained {
            metrics::record_mailbox_dequeue(self.actor_type.as_str());
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn backlog(&self) -> Backlog {
        let depth = self.depth();
        let (elevated, backlogged) = self.actor_type.limits();
        if depth > backlogged {
            Backlog::Backlogged
        } else if depth > elevated {
            Backlog::Elevated
        } else {
            Backlog::Clear
        }
    }
}

/// Process-wide session and actor counters.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_sessions: AtomicUsize,
    actor_panics: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count, Ordering::Relaxed);
        metrics::set_sessions_active(count);
    }

    /// An actor task ended by panicking.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_actor_panic(actor_type.as_str());
        error!(
            target: "cn.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panicked"
        );
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}
