//! Worker side of the control node: who is connected, who gets the next
//! session, and how a session is bound to a worker.

pub mod binder;
pub mod registry;
pub mod selector;
pub mod server;

pub use binder::{Binding, RegistryBinder, VoiceBackend, WorkerBinder};
pub use registry::{BindReservation, WorkerLink, WorkerRegistry, WorkerSummary};
pub use selector::{AcceptableRegions, WorkerCapability};
pub use server::WorkerServer;
