//! # Voice Relay Test Utilities
//!
//! Mocks and harnesses for testing the control node and the worker without
//! a chat network or a media encoder.
//!
//! ## Modules
//!
//! - `mock_gateway` - Chat gateway that records joins, leaves and voice states
//! - `scripted_binder` - Worker binder with scripted outcomes and fake backends
//! - `recording_backend` - Worker media backend that records every playback
//! - `harness` - Control node worker listener plus in-process workers on loopback TCP
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let node = TestControlNode::spawn(&[("1512", "hello_world")]).await?;
//!     let backend = RecordingBackend::new();
//!     let worker = TestWorker::spawn(&node, "1512", "hello_world", backend.clone())?;
//!
//!     node.wait_for_workers(1).await?;
//!     // Bind through node.binder() and drive the resource...
//!     worker.stop().await;
//!     Ok(())
//! }
//! ```

pub mod harness;
pub mod mock_gateway;
pub mod recording_backend;
pub mod scripted_binder;

pub use harness::*;
pub use mock_gateway::*;
pub use recording_backend::*;
pub use scripted_binder::*;
