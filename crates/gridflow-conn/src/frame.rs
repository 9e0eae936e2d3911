//! Wire frame header encoding and decoding.
//!
//! Every message on a connection is one frame:
//!
//! ```text
//! +----------------+----------------+------------------+------------------+
//! | cookie (i64 LE)| type (i64 LE)  | length (u64 LE)  | payload          |
//! +----------------+----------------+------------------+------------------+
//! ```
//!
//! The cookie is a shared-secret constant validated on every frame; the type
//! tag is opaque to this layer; the length is the payload byte count. The
//! encoding is pinned to little-endian so that hosts of different
//! architectures sharing a loopback TCP connection agree on the format.

use bytes::{BufMut, BytesMut};

use crate::error::{ConnectionError, ConnectionResult, MAX_FRAME_SIZE};

/// Size in bytes of the fixed frame header.
pub const HEADER_SIZE: usize = 24;

/// Decoded frame header: cookie, type tag, and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Shared-secret protocol cookie.
    pub cookie: i64,
    /// Application-defined message type tag.
    pub message_type: i64,
    /// Byte length of the payload that follows the header.
    pub length: u64,
}

impl FrameHeader {
    /// Create a header for a payload of `length` bytes.
    #[must_use]
    pub const fn new(cookie: i64, message_type: i64, length: u64) -> Self {
        Self {
            cookie,
            message_type,
            length,
        }
    }

    /// Append the 24-byte wire encoding of this header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_i64_le(self.cookie);
        buf.put_i64_le(self.message_type);
        buf.put_u64_le(self.length);
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes.
    #[must_use]
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let cookie = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let message_type = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let length = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        Self {
            cookie,
            message_type,
            length,
        }
    }

    /// Validate the payload length against [`MAX_FRAME_SIZE`].
    ///
    /// Called before the body buffer is allocated so a corrupt header cannot
    /// trigger an oversized allocation.
    pub fn check_length(&self) -> ConnectionResult<()> {
        if self.length > MAX_FRAME_SIZE {
            return Err(ConnectionError::frame_too_large(self.length));
        }
        Ok(())
    }
}
