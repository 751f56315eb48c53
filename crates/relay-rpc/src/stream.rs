//! Packet-level access to a transport.

use crate::errors::ConnectionError;
use futures::{SinkExt, StreamExt};
use relay_protocol::{FrameCodec, Packet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// A transport framed into [`Packet`]s.
///
/// Used directly during the handshake, then handed to
/// [`Connection::spawn`](crate::Connection::spawn) for the main loop.
#[derive(Debug)]
pub struct PacketStream<S> {
    framed: Framed<S, FrameCodec>,
}

impl<S> PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Frame a raw transport with the default frame limit.
    pub fn new(io: S) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::default()),
        }
    }

    /// Write one packet and flush it.
    pub async fn write_packet(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.framed.send(packet).await?;
        Ok(())
    }

    /// Read one packet.
    ///
    /// When `expected` is non-empty the opcode must be one of them.
    pub async fn read_packet(
        &mut self,
        expected: &[&'static str],
    ) -> Result<Packet, ConnectionError> {
        let packet = self.next().await?.ok_or(ConnectionError::Eof)?;

        if !expected.is_empty() && !expected.contains(&packet.op.as_str()) {
            return Err(ConnectionError::UnexpectedOp {
                expected: expected.to_vec(),
                got: packet.op,
            });
        }

        Ok(packet)
    }

    /// Read the next packet, or `None` on a clean end of stream.
    ///
    /// Cancel safe.
    pub(crate) async fn next(&mut self) -> Result<Option<Packet>, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Recover the underlying transport.
    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}
