//! Length-prefix framing for envelopes.
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len (BE)   | length of bytes that follow|
//! +----------------------+----------------------------+
//! | JSON object          | encoded envelope           |
//! +----------------------+----------------------------+
//! ```

use crate::codec::{decode, encode, Envelope};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Default maximum frame body size (64 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Bytes requested from the socket per read
pub const READ_CHUNK_SIZE: usize = 1024;

/// Encode an envelope into a single length-prefixed frame
pub fn encode_frame(envelope: &Envelope, max_frame_size: usize) -> Result<Bytes, WireError> {
    let body = encode(envelope)?;
    if body.len() > max_frame_size {
        return Err(WireError::FrameTooLarge(body.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Frame decoder for parsing incoming envelopes
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one envelope from the front of `buf`, if a whole frame is there
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::FrameTooLarge(frame_len));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + frame_len {
            buf.reserve(LENGTH_PREFIX_SIZE + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let body = buf.split_to(frame_len);
        trace!("Decoding frame of {} bytes, {} bytes left in buffer", frame_len, buf.len());
        decode(&body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn test_coalesced_frames_decode_in_order() {
        let first = encode_frame(&Command::Conn(true).into(), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let second = encode_frame(&Command::Limit(3).into(), DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        let a = decoder.decode(&mut buf).unwrap().unwrap();
        let b = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(a, Envelope::from(Command::Conn(true)));
        assert_eq!(b, Envelope::from(Command::Limit(3)));
        assert!(buf.is_empty());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_split_frame_waits_for_rest() {
        let frame = encode_frame(
            &Command::Text("a somewhat longer message".into()).into(),
            DEFAULT_MAX_FRAME_SIZE,
        )
        .unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&frame[..7]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[7..]);
        let envelope = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            envelope,
            Envelope::from(Command::Text("a somewhat longer message".into()))
        );
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let envelope = Envelope::from(Command::Text("x".repeat(64)));
        assert!(matches!(
            encode_frame(&envelope, 16),
            Err(WireError::FrameTooLarge(_))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        let mut decoder = FrameDecoder::with_max_frame_size(1024);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::FrameTooLarge(1_000_000))
        ));
    }

    #[test]
    fn test_malformed_body_is_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"hello");
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::MalformedEnvelope(_))
        ));
    }
}
