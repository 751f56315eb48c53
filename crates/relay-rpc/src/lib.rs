//! Voice Relay RPC engine.
//!
//! A [`Connection`] owns one framed byte stream after the handshake has
//! completed. It answers heartbeats, sends its own pings, and dispatches
//! `call` and `cast` packets to a [`HandlerRegistry`]. Outgoing calls are
//! correlated by a per-connection reference and resolve to a [`CallError`]
//! on timeout or when the connection goes down.
//!
//! Both roles share the engine; they differ only in the [`handshake`] they
//! run first. [`endpoint`] glues the two together.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut handlers = HandlerRegistry::new();
//! handlers.on_call("info", |_conn, _args| async { Ok(json!("voice-relay")) });
//!
//! let established = endpoint::connect(socket, &credentials, own_info, options, handlers).await?;
//! let name = established.handle.call("info", vec![], Some(CALL_TIMEOUT)).await?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod errors;
pub mod handshake;
pub mod heartbeat;
pub mod stream;

pub use connection::{Connection, ConnectionHandle, ConnectionOptions};
pub use dispatch::{Args, HandlerRegistry};
pub use endpoint::Established;
pub use errors::{CallError, CloseReason, ConnectionError, HandlerError, HandshakeError};
pub use heartbeat::LatencyStats;
pub use stream::PacketStream;
