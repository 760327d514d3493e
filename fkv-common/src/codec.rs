//! # Frame Codec
//!
//! Purpose: Convert frame lengths between host and network byte order and
//! build or split length-prefixed frames.
//!
//! ## Design Principles
//!
//! 1. **Symmetric Format**: Requests and responses share one layout.
//! 2. **Explicit Byte Order**: Lengths always travel big-endian; decoding is a
//!    real network-to-host conversion, never a reuse of the encoder.
//! 3. **Buffer Friendly**: Frames are appended to caller-owned `BytesMut`
//!    buffers so the hot path can reuse allocations.
//!
//! ## Frame Layout
//!
//! ```text
//! +----------------------+-----------------------------+
//! | length: u32 BE (4B)  | payload: `length` bytes     |
//! +----------------------+-----------------------------+
//! ```
//!
//! There is no magic number, version byte, or checksum; integrity is left to
//! TCP.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, FrameResult};

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a single frame can describe.
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize;

/// Encodes a payload length into network byte order.
#[inline]
pub const fn encode_length(len: u32) -> [u8; FRAME_HEADER_LEN] {
    len.to_be_bytes()
}

/// Decodes a network byte order length prefix.
#[inline]
pub const fn decode_length(header: [u8; FRAME_HEADER_LEN]) -> u32 {
    u32::from_be_bytes(header)
}

/// Builds the length prefix for a payload of `len` bytes.
pub fn frame_header(len: usize) -> FrameResult<[u8; FRAME_HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge { len })?;
    Ok(encode_length(len))
}

/// Appends one complete frame (prefix followed by payload) to `out`.
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) -> FrameResult<()> {
    let header = frame_header(payload.len())?;
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.put_slice(&header);
    out.put_slice(payload);
    Ok(())
}

/// Splits one complete frame off the front of `buf`.
///
/// Returns `None` and leaves `buf` untouched while the frame is incomplete.
pub fn decode_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    let len = decode_length(header) as usize;
    if buf.len() - FRAME_HEADER_LEN < len {
        buf.reserve(FRAME_HEADER_LEN + len - buf.len());
        return None;
    }
    buf.advance(FRAME_HEADER_LEN);
    Some(buf.split_to(len).freeze())
}
