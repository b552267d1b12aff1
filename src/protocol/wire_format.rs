//! Wire format for frame length prefixes.
//!
//! Every frame is a 4-byte length followed by exactly that many payload bytes:
//! ```text
//! ┌──────────────┬─────────────────────┐
//! │ Length       │ Payload             │
//! │ 4 bytes      │ Length bytes        │
//! │ uint32 LE    │ (envelope bytes)    │
//! └──────────────┴─────────────────────┘
//! ```
//!
//! The length is Little Endian. There is no delimiter and no escaping, so
//! back-to-back frames on one stream are split in O(1).

use crate::error::{OffloadError, Result};

/// Length prefix size in bytes (fixed, exactly 4).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame size (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Encode a frame length to its Little Endian prefix.
///
/// Fails with `FrameTooLarge` if the length exceeds `max_size` or cannot be
/// represented in 32 bits.
///
/// # Example
///
/// ```
/// use pipe_offload::protocol::encode_length;
///
/// let prefix = encode_length(0x0102, 1024).unwrap();
/// assert_eq!(prefix, [0x02, 0x01, 0x00, 0x00]);
/// ```
pub fn encode_length(len: usize, max_size: usize) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    check_length(len, max_size)?;
    let len = u32::try_from(len).map_err(|_| OffloadError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    Ok(len.to_le_bytes())
}

/// Decode a length prefix and validate it against `max_size`.
///
/// Returns `Ok(None)` if the buffer is shorter than the prefix.
pub fn decode_length(buf: &[u8], max_size: usize) -> Result<Option<usize>> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    check_length(len, max_size)?;
    Ok(Some(len))
}

/// Check a frame length against the configured cap.
#[inline]
pub fn check_length(len: usize, max_size: usize) -> Result<()> {
    if len > max_size {
        return Err(OffloadError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }
    Ok(())
}

/// Build a complete frame (prefix + payload) in one buffer.
pub fn build_frame(payload: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let prefix = encode_length(payload.len(), max_size)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(payload);
    Ok(frame)
}
