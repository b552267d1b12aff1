//! Frame channel: reading and writing whole frames on a byte stream.
//!
//! Writes use scatter/gather I/O (prefix + payload in one `write_vectored`)
//! and loop until the whole frame has been accepted. Reads honor one overall
//! deadline for the complete frame.

use std::io::IoSlice;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire_format::{check_length, encode_length, LENGTH_PREFIX_SIZE};
use crate::error::{OffloadError, Result};

/// Write one frame to the stream and flush it.
///
/// Fails with `FrameTooLarge` before writing anything if the payload exceeds
/// `max_size`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let prefix = encode_length(payload.len(), max_size)?;
    let total_size = LENGTH_PREFIX_SIZE + payload.len();

    let mut total_written = 0;
    while total_written < total_size {
        let slices = remaining_slices(&prefix, payload, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(OffloadError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the part of the frame not yet written.
fn remaining_slices<'a>(
    prefix: &'a [u8; LENGTH_PREFIX_SIZE],
    payload: &'a [u8],
    skip_bytes: usize,
) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(2);

    if let Some(rest) = prefix.get(skip_bytes..) {
        if !rest.is_empty() {
            slices.push(IoSlice::new(rest));
        }
    }

    let start_in_payload = skip_bytes.saturating_sub(LENGTH_PREFIX_SIZE);
    if let Some(rest) = payload.get(start_in_payload..) {
        if !rest.is_empty() {
            slices.push(IoSlice::new(rest));
        }
    }

    slices
}

/// Read exactly one frame.
///
/// `timeout` bounds the whole frame (None blocks indefinitely). A stream that
/// closes before the frame is complete, including before its first byte,
/// fails with `EndOfStream`.
pub async fn read_frame<R>(reader: &mut R, timeout: Option<Duration>, max_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    try_read_frame(reader, timeout, max_size)
        .await?
        .ok_or(OffloadError::EndOfStream)
}

/// Read one frame, returning `Ok(None)` if the stream closed cleanly on a
/// frame boundary.
pub async fn try_read_frame<R>(
    reader: &mut R,
    timeout: Option<Duration>,
    max_size: usize,
) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let read = read_frame_inner(reader, max_size);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| OffloadError::Timeout)?,
        None => read.await,
    }
}

async fn read_frame_inner<R>(reader: &mut R, max_size: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(OffloadError::EndOfStream);
        }
        filled += n;
    }

    let len = u32::from_le_bytes(prefix) as usize;
    check_length(len, max_size)?;

    let mut payload = BytesMut::zeroed(len);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => OffloadError::EndOfStream,
            _ => OffloadError::Io(e),
        })?;

    Ok(Some(payload.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
    use std::time::Instant;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = duplex(64);

        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"hello".to_vec(),
            vec![0x00, 0xFF],
            (0..=255).collect(),
        ];

        let expected = payloads.clone();
        let writer = tokio::spawn(async move {
            for payload in &payloads {
                write_frame(&mut client, payload, DEFAULT_MAX_FRAME_SIZE)
                    .await
                    .unwrap();
            }
        });

        for payload in expected {
            let frame = read_frame(&mut server, None, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            assert_eq!(&frame[..], &payload[..]);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_write_rejected_without_partial_write() {
        let mut sink: Vec<u8> = Vec::new();

        let result = write_frame(&mut sink, &[0u8; 17], 16).await;

        assert!(matches!(
            result,
            Err(OffloadError::FrameTooLarge { size: 17, max: 16 })
        ));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_write_exact_bytes() {
        let mut sink: Vec<u8> = Vec::new();
        write_frame(&mut sink, b"abc", 16).await.unwrap();
        assert_eq!(sink, vec![3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_oversize_read_rejected() {
        let bytes = 1000u32.to_le_bytes();
        let mut reader: &[u8] = &bytes;

        let result = read_frame(&mut reader, None, 100).await;

        assert!(matches!(
            result,
            Err(OffloadError::FrameTooLarge { size: 1000, max: 100 })
        ));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_client, mut server) = duplex(64);
        let start = Instant::now();

        let result = read_frame(&mut server, Some(Duration::from_millis(50)), 1024).await;

        assert!(matches!(result, Err(OffloadError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_end_of_stream_mid_length() {
        let bytes = [5u8, 0];
        let mut reader: &[u8] = &bytes;

        let result = read_frame(&mut reader, None, 1024).await;
        assert!(matches!(result, Err(OffloadError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_end_of_stream_mid_payload() {
        let bytes = [5u8, 0, 0, 0, b'a', b'b'];
        let mut reader: &[u8] = &bytes;

        let result = read_frame(&mut reader, None, 1024).await;
        assert!(matches!(result, Err(OffloadError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_clean_close_on_boundary() {
        let mut reader: &[u8] = &[];

        assert!(try_read_frame(&mut reader, None, 1024).await.unwrap().is_none());

        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut reader, None, 1024).await,
            Err(OffloadError::EndOfStream)
        ));
    }

    #[test]
    fn test_remaining_slices() {
        let prefix = [3u8, 0, 0, 0];
        let payload = b"abc";

        let slices = remaining_slices(&prefix, payload, 0);
        assert_eq!(slices.len(), 2);

        let slices = remaining_slices(&prefix, payload, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 2);

        let slices = remaining_slices(&prefix, payload, LENGTH_PREFIX_SIZE + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(&slices[0][..], b"bc");
    }
}
