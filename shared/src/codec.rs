//! Length-prefixed codec for channel framing
//!
//! Every frame on a FleetSync channel, in either direction, is:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf Envelope ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::Envelope;

/// Maximum frame body size (10 MB)
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Invalid message length prefix: {0}")]
    InvalidLength(u32),

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    EncodeError(#[from] prost::EncodeError),
}

/// Encode an Envelope into a standalone frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + envelope.encoded_len());
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Append a frame for `envelope` to `buf`
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), CodecError> {
    let msg_len = envelope.encoded_len();
    if msg_len > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::MessageTooLarge(msg_len));
    }

    buf.reserve(LENGTH_PREFIX + msg_len);
    buf.put_u32(msg_len as u32);
    envelope.encode(buf)?;
    Ok(())
}

/// Try to decode one frame from the front of `buf`
///
/// Returns:
/// - `Ok(Some(envelope))` if a complete frame was consumed
/// - `Ok(None)` if more data is needed (nothing is consumed)
/// - `Err(...)` if the frame is invalid; the channel should be dropped
pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(msg_len));
    }

    if buf.len() < LENGTH_PREFIX + msg_len as usize {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX);
    let body = buf.split_to(msg_len as usize);
    Ok(Some(Envelope::decode(body)?))
}

/// Streaming decoder that accumulates reads until whole frames are available
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data read from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete frame, if any
    ///
    /// Call repeatedly until it returns `Ok(None)` to drain all buffered frames
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Whether a partial frame is waiting for more bytes
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }
}
