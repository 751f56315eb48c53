//! Voice Relay worker library.
//!
//! A worker dials the control node, authenticates with its shared secret and
//! holds voice resources on the node's behalf: one media connection and at
//! most one playing track per resource.
//!
//! # Modules
//!
//! - [`worker`] - connection lifecycle and handlers
//! - [`resource`] - resource table keyed by `remote_ref`
//! - [`media`] - media capability traits and the clocked backend
//! - [`config`] - `WORKER_*` configuration

#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod media;
pub mod resource;
pub mod worker;

pub use worker::{VoiceWorker, WorkerSession};
