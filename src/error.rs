//! Error types for pipe-offload.

use thiserror::Error;

/// Main error type for all offload operations.
#[derive(Debug, Error)]
pub enum OffloadError {
    /// I/O error on the worker pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame length exceeds the configured cap.
    #[error("Frame size {size} exceeds max {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// No frame or no correlated response before the deadline.
    #[error("Timed out waiting for worker response")]
    Timeout,

    /// Stream closed before the expected number of bytes arrived.
    #[error("Stream closed before a complete frame was read")]
    EndOfStream,

    /// The worker closed its stream; every in-flight call on the client fails.
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// The worker process could not be started or is not reachable.
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The client was closed while the call was pending.
    #[error("Client closed")]
    ClientClosed,

    /// The worker rejected the request.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The worker failed while handling a valid request.
    #[error("Worker internal error: {0}")]
    InternalError(String),

    /// The caller's cancel check fired before a response arrived.
    #[error("Request cancelled")]
    Cancelled,

    /// A codec was requested whose implementation is not compiled in.
    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    /// A codec name that is not part of the protocol.
    #[error("Unknown codec '{0}'")]
    UnknownCodec(String),

    /// Payload could not be encoded with the requested codec.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Payload or envelope could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Protocol violation (unexpected status, malformed envelope, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid client or pool configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[cfg(feature = "msgpack")]
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[cfg(feature = "msgpack")]
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl OffloadError {
    /// Whether issuing the same call again (with a fresh request id) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OffloadError::Timeout
                | OffloadError::WorkerCrashed(_)
                | OffloadError::WorkerUnavailable(_)
        )
    }

    /// Short, stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OffloadError::Io(_) => "Io",
            OffloadError::FrameTooLarge { .. } => "FrameTooLarge",
            OffloadError::Timeout => "Timeout",
            OffloadError::EndOfStream => "EndOfStream",
            OffloadError::WorkerCrashed(_) => "WorkerCrashed",
            OffloadError::WorkerUnavailable(_) => "WorkerUnavailable",
            OffloadError::ClientClosed => "ClientClosed",
            OffloadError::InvalidInput(_) => "InvalidInput",
            OffloadError::InternalError(_) => "InternalError",
            OffloadError::Cancelled => "Cancelled",
            OffloadError::CodecUnavailable(_) => "CodecUnavailable",
            OffloadError::UnknownCodec(_) => "UnknownCodec",
            OffloadError::Encode(_) => "Encode",
            OffloadError::Decode(_) => "Decode",
            OffloadError::Protocol(_) => "Protocol",
            OffloadError::Config(_) => "Config",
            OffloadError::Json(_) => "Json",
            #[cfg(feature = "msgpack")]
            OffloadError::MsgPackEncode(_) => "MsgPackEncode",
            #[cfg(feature = "msgpack")]
            OffloadError::MsgPackDecode(_) => "MsgPackDecode",
        }
    }

    /// Whether the error means the worker behind the client is gone.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            OffloadError::WorkerCrashed(_) | OffloadError::WorkerUnavailable(_)
        )
    }
}

/// Result type alias using OffloadError.
pub type Result<T> = std::result::Result<T, OffloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OffloadError::Timeout.is_retryable());
        assert!(OffloadError::WorkerCrashed("eof".into()).is_retryable());
        assert!(!OffloadError::InvalidInput("bad".into()).is_retryable());
        assert!(!OffloadError::Cancelled.is_retryable());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(OffloadError::Timeout.kind(), "Timeout");
        assert_eq!(OffloadError::InvalidInput("x".into()).kind(), "InvalidInput");
        assert_eq!(OffloadError::WorkerUnavailable("x".into()).kind(), "WorkerUnavailable");
    }

    #[test]
    fn test_frame_too_large_message() {
        let err = OffloadError::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "Frame size 10 exceeds max 4");
    }
}
