//! Request and response envelopes.
//!
//! The envelope wraps a payload (already encoded with its payload codec) with
//! the protocol metadata needed to route it: request id, entry or status, and
//! the payload codec name. How an envelope becomes bytes is decided by the
//! wire format, see [`crate::codec::encode_envelope`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::PayloadCodec;

/// Numeric metrics attached to a response.
pub type Metrics = BTreeMap<String, f64>;

/// A request from the client to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Unique, strictly increasing per client.
    pub request_id: u64,
    /// Operation name on the worker.
    pub entry: String,
    /// Codec the payload is encoded with.
    pub codec: PayloadCodec,
    /// Encoded payload bytes.
    pub payload: Bytes,
}

impl RequestEnvelope {
    /// Create a new request envelope.
    pub fn new(
        request_id: u64,
        entry: impl Into<String>,
        codec: PayloadCodec,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            request_id,
            entry: entry.into(),
            codec,
            payload: payload.into(),
        }
    }
}

/// Status reported by the worker.
///
/// Unknown statuses are kept verbatim in `Other` so the client can report
/// them as protocol errors instead of failing to decode the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseStatus {
    Ok,
    InvalidInput,
    InternalError,
    Other(String),
}

impl ResponseStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &str {
        match self {
            ResponseStatus::Ok => "Ok",
            ResponseStatus::InvalidInput => "InvalidInput",
            ResponseStatus::InternalError => "InternalError",
            ResponseStatus::Other(s) => s,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }
}

impl From<String> for ResponseStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Ok" => ResponseStatus::Ok,
            "InvalidInput" => ResponseStatus::InvalidInput,
            "InternalError" => ResponseStatus::InternalError,
            _ => ResponseStatus::Other(value),
        }
    }
}

impl From<ResponseStatus> for String {
    fn from(value: ResponseStatus) -> Self {
        match value {
            ResponseStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response from the worker to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Id of the request this answers.
    pub request_id: u64,
    /// Outcome of the request.
    pub status: ResponseStatus,
    /// Codec name of the payload (kept as a string, validated on decode).
    pub codec: String,
    /// Encoded payload bytes (empty on error).
    pub payload: Bytes,
    /// Worker error detail for non-Ok statuses.
    pub error: Option<String>,
    /// Worker-side metrics.
    pub metrics: Option<Metrics>,
}

impl ResponseEnvelope {
    /// Create a successful response.
    pub fn ok(request_id: u64, codec: PayloadCodec, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Ok,
            codec: codec.as_str().to_string(),
            payload: payload.into(),
            error: None,
            metrics: None,
        }
    }

    /// Create an error response with a raw, empty payload.
    pub fn error(request_id: u64, status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            codec: PayloadCodec::Raw.as_str().to_string(),
            payload: Bytes::new(),
            error: Some(message.into()),
            metrics: None,
        }
    }

    /// Attach metrics to the response.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
