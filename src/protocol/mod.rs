//! Protocol module - framing, frame channel, and envelopes.
//!
//! This module implements the transport layer shared by client and worker:
//! - 4-byte Little Endian length prefix encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Timeout-bounded frame reads and vectored frame writes
//! - Request/response envelope records

mod channel;
mod envelope;
mod frame_buffer;
mod wire_format;

pub use channel::{read_frame, try_read_frame, write_frame};
pub use envelope::{Metrics, RequestEnvelope, ResponseEnvelope, ResponseStatus};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    build_frame, check_length, decode_length, encode_length, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_PREFIX_SIZE,
};
