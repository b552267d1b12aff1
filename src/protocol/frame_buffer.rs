//! Reassembly of frames from arbitrarily chunked pipe reads.
//!
//! Pipe reads split and merge frames freely. [`FrameBuffer`] keeps the
//! unconsumed bytes in one `BytesMut` and remembers a parsed length prefix
//! so it is not decoded twice while the body trickles in.
//!
//! # Example
//!
//! ```
//! use pipe_offload::protocol::{build_frame, FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
//!
//! let mut frames = FrameBuffer::new();
//! let wire = build_frame(br#"{"request_id":1}"#, DEFAULT_MAX_FRAME_SIZE).unwrap();
//!
//! assert!(frames.push(&wire[..6]).unwrap().is_empty());
//! let complete = frames.push(&wire[6..]).unwrap();
//! assert_eq!(&complete[0][..], br#"{"request_id":1}"#);
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{decode_length, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
use crate::error::Result;

/// Initial buffer capacity; matches the client's read chunk.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Accumulates bytes and yields complete frame bodies.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    /// Body length of the frame in progress, once its prefix is consumed.
    body_len: Option<usize>,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Buffer capped at [`DEFAULT_MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            body_len: None,
            max_frame_size,
        }
    }

    /// Append `data` and drain every frame it completes.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` when a prefix announces more than the cap. The
    /// stream is unusable afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buf.extend_from_slice(data);
        let mut complete = Vec::new();
        while let Some(frame) = self.next_frame()? {
            complete.push(frame);
        }
        Ok(complete)
    }

    /// Take the next complete frame body out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let len = match self.body_len {
            Some(len) => len,
            None => match decode_length(&self.buf, self.max_frame_size)? {
                Some(len) => {
                    self.buf.advance(LENGTH_PREFIX_SIZE);
                    self.body_len = Some(len);
                    len
                }
                None => return Ok(None),
            },
        };

        if self.buf.len() < len {
            return Ok(None);
        }
        self.body_len = None;
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes held but not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True while a frame is cut short, so end-of-stream here is an error.
    pub fn has_partial_frame(&self) -> bool {
        self.body_len.is_some() || !self.buf.is_empty()
    }

    /// Drop buffered bytes and any half-parsed frame.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.body_len = None;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OffloadError;
    use crate::protocol::build_frame;

    fn framed(body: &[u8]) -> Vec<u8> {
        build_frame(body, DEFAULT_MAX_FRAME_SIZE).unwrap()
    }

    fn stream_of(bodies: &[&[u8]]) -> Vec<u8> {
        bodies.iter().flat_map(|b| framed(b)).collect()
    }

    #[test]
    fn test_back_to_back_envelopes() {
        let wire = stream_of(&[br#"{"request_id":1}"#, br#"{"request_id":2}"#, b"\x81\xa1a\x01"]);
        let mut frames = FrameBuffer::new();

        let out = frames.push(&wire).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(&out[1][..], br#"{"request_id":2}"#);
        assert_eq!(&out[2][..], b"\x81\xa1a\x01");
        assert!(frames.is_empty());
        assert!(!frames.has_partial_frame());
    }

    #[test]
    fn test_split_inside_prefix() {
        let wire = framed(b"payload");
        let mut frames = FrameBuffer::new();

        assert!(frames.push(&wire[..3]).unwrap().is_empty());
        assert!(frames.has_partial_frame());
        assert_eq!(frames.len(), 3);

        let out = frames.push(&wire[3..]).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"payload")]);
    }

    #[test]
    fn test_split_inside_body() {
        let body = vec![0xAB; 300];
        let wire = framed(&body);
        let mut frames = FrameBuffer::new();

        assert!(frames.push(&wire[..LENGTH_PREFIX_SIZE + 100]).unwrap().is_empty());
        assert_eq!(frames.len(), 100);
        assert!(frames.has_partial_frame());

        let out = frames.push(&wire[LENGTH_PREFIX_SIZE + 100..]).unwrap();
        assert_eq!(&out[0][..], &body[..]);
    }

    #[test]
    fn test_frame_and_a_half() {
        let wire = stream_of(&[b"one", b"two"]);
        let cut = wire.len() - 2;
        let mut frames = FrameBuffer::new();

        let out = frames.push(&wire[..cut]).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"one")]);
        assert!(frames.has_partial_frame());

        let out = frames.push(&wire[cut..]).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_zero_length_frame() {
        let mut frames = FrameBuffer::new();
        let out = frames.push(&framed(b"")).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_empty());
    }

    #[test]
    fn test_oversize_prefix_rejected() {
        let mut frames = FrameBuffer::with_max_frame_size(16);
        let err = frames.push(&17u32.to_le_bytes()).unwrap_err();
        assert!(matches!(err, OffloadError::FrameTooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn test_clear_discards_partial_frame() {
        let mut frames = FrameBuffer::new();
        frames.push(&framed(b"abcdef")[..LENGTH_PREFIX_SIZE + 2]).unwrap();
        frames.clear();
        assert!(!frames.has_partial_frame());

        let out = frames.push(&framed(b"fresh")).unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"fresh")]);
    }

    #[test]
    fn test_single_byte_reads() {
        let wire = stream_of(&[b"a", b"bc"]);
        let mut frames = FrameBuffer::new();
        let out: Vec<Bytes> = wire
            .iter()
            .flat_map(|byte| frames.push(std::slice::from_ref(byte)).unwrap())
            .collect();
        assert_eq!(out, vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")]);
    }
}
