//! Codec for encoding and decoding length-prefixed packets.

use crate::packet::Packet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest accepted frame body (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Underlying transport failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared frame length exceeds the configured maximum
    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame body is not a valid `{op, d}` record
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),
}

/// Encode a packet to bytes
///
/// # Errors
///
/// Returns an error if the packet cannot be serialized or is too large
pub fn encode_packet(packet: &Packet) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    write_frame(packet, MAX_FRAME_LEN, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the frame is still
/// incomplete.
///
/// # Errors
///
/// Returns an error if the length prefix exceeds [`MAX_FRAME_LEN`] or the
/// body is not a valid record
pub fn decode_packet(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
    read_frame(buf, MAX_FRAME_LEN)
}

fn write_frame(packet: &Packet, max_len: usize, dst: &mut BytesMut) -> Result<(), CodecError> {
    let body = serde_json::to_vec(packet).map_err(|e| CodecError::InvalidFormat(e.to_string()))?;

    if body.len() > max_len {
        return Err(CodecError::FrameTooLarge {
            len: body.len(),
            max: max_len,
        });
    }

    let len = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge {
        len: body.len(),
        max: max_len,
    })?;

    dst.reserve(LENGTH_PREFIX_LEN + body.len());
    dst.put_u32(len);
    dst.extend_from_slice(&body);
    Ok(())
}

fn read_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<Packet>, CodecError> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_LEN) else {
        return Ok(None);
    };

    let mut prefix = prefix;
    let len = prefix.get_u32() as usize;

    if len > max_len {
        return Err(CodecError::FrameTooLarge { len, max: max_len });
    }

    if buf.len() < LENGTH_PREFIX_LEN + len {
        buf.reserve(LENGTH_PREFIX_LEN + len - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_LEN);
    let body = buf.split_to(len);

    let packet: Packet =
        serde_json::from_slice(&body).map_err(|e| CodecError::InvalidFormat(e.to_string()))?;
    Ok(Some(packet))
}

/// `tokio_util` codec for packet streams.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Create a codec with a custom frame limit.
    #[must_use]
    pub const fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        read_frame(src, self.max_frame_len)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ))),
        }
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        write_frame(&packet, self.max_frame_len, dst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::packet::op;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_util::codec::Framed;

    #[test]
    fn test_encode_layout() {
        let packet = Packet::new(op::PONG, json!(true));
        let bytes = encode_packet(&packet).unwrap();

        let body = br#"{"op":"pong","d":true}"#;
        assert_eq!(&bytes[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&bytes[4..], &body[..]);
    }

    #[test]
    fn test_roundtrip_structured_payload() {
        let packet = Packet::new(
            op::CALL,
            json!({"f": "play", "ref": 1, "args": [0.5, "https://a/b.webm", 12.5]}),
        );
        let mut buf = BytesMut::from(&encode_packet(&packet).unwrap()[..]);

        let decoded = decode_packet(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let packet = Packet::new(op::PING, json!(true));
        let encoded = encode_packet(&packet).unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decode_packet(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 1);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(decode_packet(&mut buf).unwrap().unwrap(), packet);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::try_from(MAX_FRAME_LEN + 1).unwrap());

        let err = decode_packet(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.extend_from_slice(b"nope!");

        let err = decode_packet(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFormat(_)));
    }

    #[test]
    fn test_missing_op_is_rejected() {
        let body = br#"{"d": 1}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(body);

        assert!(matches!(
            decode_packet(&mut buf),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_custom_limit_applies_to_encode() {
        let mut codec = FrameCodec::with_max_frame_len(8);
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Packet::new(op::PING, json!("far too long")), &mut dst)
            .unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 8, .. }));
    }

    #[tokio::test]
    async fn test_framed_stream_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Framed::new(a, FrameCodec::default());
        let mut right = Framed::new(b, FrameCodec::default());

        // Larger than the duplex buffer so the frame arrives in pieces.
        let big = "x".repeat(500);
        let sent = vec![
            Packet::new(op::PING, json!(true)),
            Packet::new(op::CAST, json!({"f": "note", "args": [big]})),
        ];

        let to_send = sent.clone();
        let writer = tokio::spawn(async move {
            for packet in to_send {
                left.send(packet).await.unwrap();
            }
        });

        for expected in &sent {
            let got = right.next().await.unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let (a, b) = tokio::io::duplex(64);
        let mut right = Framed::new(b, FrameCodec::default());

        let mut raw = a;
        tokio::io::AsyncWriteExt::write_all(&mut raw, &[0, 0, 0, 10, b'{'])
            .await
            .unwrap();
        drop(raw);

        let result = right.next().await.unwrap();
        assert!(matches!(result, Err(CodecError::Io(_))));
    }
}
