//! Wire-level frame splitting and assembly.
//!
//! ```text
//! Frame  := Header Payload
//! Header := type:u32 payload_len:u32      (8 bytes, little-endian)
//! ```
//!
//! The codec is operated manually by the [`Messenger`](crate::msg::Messenger)
//! over its per-stream receive buffers; a complete frame's bytes are
//! always consumed from the buffer before anyone looks at the payload,
//! so downstream errors can never leave the stream misaligned.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TetherError;

/// Fixed size of the frame header.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single frame's payload. A header declaring more
/// than this means framing can no longer be trusted on that stream.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// One length-prefixed, typed record on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_tag: u32,
    pub payload: Bytes,
}

/// Splits/assembles frames. Stateless; one instance may serve any
/// number of unrelated buffers.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TetherError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let type_tag = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let payload_len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TetherError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < HEADER_SIZE + payload_len {
            // Not enough data; wait for more.
            return Ok(None);
        }

        let mut frame = src.split_to(HEADER_SIZE + payload_len);
        frame.advance(HEADER_SIZE);

        Ok(Some(Frame {
            type_tag,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TetherError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), TetherError> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TetherError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u32_le(item.type_tag);
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
