//! Session actors.
//!
//! ```text
//! SessionManagerActor (singleton)
//! └── supervises N SyncerActors
//!     └── SyncerActor (one per room)
//!         └── holds at most one worker Binding
//! ```
//!
//! - [`sessions`] - `SessionManagerActor`, creates and evicts sessions
//! - [`syncer`] - `SyncerActor`, reconciles one room with its worker
//! - [`messages`] - Manager message types
//! - [`metrics`] - Mailbox monitoring and actor counters

pub mod messages;
pub mod metrics;
pub mod sessions;
pub mod syncer;

pub use messages::{SessionInfo, SessionMessage};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use sessions::{SessionManagerActor, SessionManagerHandle, SessionOptions};
pub use syncer::{
    transition, DesiredState, FsmState, Intent, SessionNotice, SessionSnapshot, SyncerActor,
    SyncerHandle,
};
