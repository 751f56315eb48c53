//! Wire protocol for the Voice Relay control/worker link.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON shaped as `{"op": <opcode>, "d": <payload>}`.
//!
//! - [`packet`] - the `{op, d}` record, opcode names and typed payloads
//! - [`codec`] - framing, plus a `tokio_util::codec` adapter
//! - [`resource`] - method and event names layered on `call`/`cast`

#![warn(clippy::pedantic)]

pub mod codec;
pub mod packet;
pub mod resource;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_LEN};
pub use packet::{op, Packet};
pub use resource::ResourceEvent;
