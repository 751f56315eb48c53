//! Voice Relay control node library.
//!
//! The control node accepts worker connections, selects a worker for each
//! voice session and keeps every session's desired playback state in sync
//! with the worker that holds it.
//!
//! # Modules
//!
//! - [`workers`] - worker listener, registry, selection and binding
//! - [`proxy`] - typed stubs for worker-held resources
//! - [`actors`] - session manager and per-room syncers
//! - [`gateway`] - chat gateway collaborator
//! - [`media`] - media resolver collaborator
//! - [`routes`] / [`handlers`] - admin HTTP surface
//! - [`observability`] - health probes and Prometheus metrics

#![warn(clippy::pedantic)]

pub mod actors;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod media;
pub mod observability;
pub mod proxy;
pub mod routes;
pub mod workers;
