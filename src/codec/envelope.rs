//! Envelope wire formats.
//!
//! - `json`: UTF-8 JSON object, payload carried base64 in `payload_b64`.
//!   Fields are emitted in sorted order with no extra whitespace.
//! - `msgpack`: MessagePack map, payload carried as binary in `payload`.
//!
//! Decoders accept either payload field, so a peer that sends raw bytes in a
//! JSON-compatible encoder (or base64 over msgpack) is still understood.

use std::fmt;
use std::str::FromStr;

use base64::prelude::*;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::codec::PayloadCodec;
use crate::error::{OffloadError, Result};
use crate::protocol::{Metrics, RequestEnvelope, ResponseEnvelope, ResponseStatus};

/// How an envelope is encoded into frame bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Json,
    Msgpack,
}

impl WireFormat {
    pub const ALL: [WireFormat; 2] = [WireFormat::Msgpack, WireFormat::Json];

    pub const fn as_str(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Msgpack => "msgpack",
        }
    }

    /// Whether this build can encode and decode the wire format.
    pub const fn is_available(self) -> bool {
        match self {
            WireFormat::Json => true,
            WireFormat::Msgpack => cfg!(feature = "msgpack"),
        }
    }

    pub fn ensure_available(self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(OffloadError::CodecUnavailable(format!(
                "{} wire support is not compiled in",
                self.as_str()
            )))
        }
    }

    /// Wire formats usable in this build, most preferred first.
    pub fn available() -> impl Iterator<Item = WireFormat> {
        Self::ALL.into_iter().filter(|w| w.is_available())
    }

    /// Msgpack when available, else JSON.
    pub const fn preferred() -> Self {
        if cfg!(feature = "msgpack") {
            WireFormat::Msgpack
        } else {
            WireFormat::Json
        }
    }
}

impl Default for WireFormat {
    fn default() -> Self {
        Self::preferred()
    }
}

impl FromStr for WireFormat {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(WireFormat::Json),
            "msgpack" => Ok(WireFormat::Msgpack),
            other => Err(OffloadError::UnknownCodec(other.to_string())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::protocol::RequestEnvelope {}
    impl Sealed for crate::protocol::ResponseEnvelope {}
}

/// A record that can travel as an envelope.
///
/// Implemented for [`RequestEnvelope`] and [`ResponseEnvelope`] only.
pub trait Envelope: Sized + sealed::Sealed {
    #[doc(hidden)]
    fn to_wire_bytes(&self, wire: WireFormat) -> Result<Vec<u8>>;

    #[doc(hidden)]
    fn from_wire_bytes(bytes: &[u8], wire: WireFormat) -> Result<Self>;
}

/// Encode an envelope with the given wire format.
///
/// # Errors
///
/// `CodecUnavailable` if the wire format is not compiled in, `Encode` if
/// serialization fails.
pub fn encode_envelope<E: Envelope>(record: &E, wire: WireFormat) -> Result<Vec<u8>> {
    wire.ensure_available()?;
    record.to_wire_bytes(wire)
}

/// Decode an envelope with the given wire format.
///
/// # Errors
///
/// `Decode` on malformed bytes or missing fields, `UnknownCodec` if a request
/// names a payload codec outside the protocol.
pub fn decode_envelope<E: Envelope>(bytes: &[u8], wire: WireFormat) -> Result<E> {
    wire.ensure_available()?;
    E::from_wire_bytes(bytes, wire)
}

/// Decode a request, detecting its wire format (msgpack first, then JSON).
///
/// The worker answers in the wire format returned here.
pub fn detect_request(bytes: &[u8]) -> Result<(RequestEnvelope, WireFormat)> {
    let (_, wire) = peek_request_id(bytes).ok_or_else(|| {
        OffloadError::Decode("frame is not a request envelope in any known wire format".into())
    })?;
    let request = decode_envelope(bytes, wire)?;
    Ok((request, wire))
}

/// Extract just the request id and wire format from a frame.
///
/// Used to address an error response to a request whose other fields are
/// unusable.
pub fn peek_request_id(bytes: &[u8]) -> Option<(u64, WireFormat)> {
    #[derive(Deserialize)]
    struct IdOnly {
        request_id: u64,
    }

    WireFormat::available().find_map(|wire| {
        decode_record::<IdOnly>(bytes, wire)
            .ok()
            .map(|id| (id.request_id, wire))
    })
}

// Field order is alphabetical so JSON output has sorted keys.
#[derive(Serialize)]
struct RequestOut<'a> {
    codec: PayloadCodec,
    entry: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a serde_bytes::Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
    request_id: u64,
}

#[derive(Deserialize)]
struct RequestIn {
    codec: String,
    entry: String,
    #[serde(default)]
    payload: Option<ByteBuf>,
    #[serde(default)]
    payload_b64: Option<String>,
    request_id: u64,
}

#[derive(Serialize)]
struct ResponseOut<'a> {
    codec: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<&'a Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a serde_bytes::Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
    request_id: u64,
    status: &'a ResponseStatus,
}

#[derive(Deserialize)]
struct ResponseIn {
    codec: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metrics: Option<Metrics>,
    #[serde(default)]
    payload: Option<ByteBuf>,
    #[serde(default)]
    payload_b64: Option<String>,
    request_id: u64,
    status: ResponseStatus,
}

impl Envelope for RequestEnvelope {
    fn to_wire_bytes(&self, wire: WireFormat) -> Result<Vec<u8>> {
        let (payload, payload_b64) = split_payload(&self.payload, wire);
        encode_record(
            &RequestOut {
                codec: self.codec,
                entry: &self.entry,
                payload,
                payload_b64,
                request_id: self.request_id,
            },
            wire,
        )
    }

    fn from_wire_bytes(bytes: &[u8], wire: WireFormat) -> Result<Self> {
        let record: RequestIn = decode_record(bytes, wire)?;
        Ok(RequestEnvelope {
            request_id: record.request_id,
            codec: record.codec.parse()?,
            entry: record.entry,
            payload: join_payload(record.payload, record.payload_b64)?,
        })
    }
}

impl Envelope for ResponseEnvelope {
    fn to_wire_bytes(&self, wire: WireFormat) -> Result<Vec<u8>> {
        let (payload, payload_b64) = split_payload(&self.payload, wire);
        encode_record(
            &ResponseOut {
                codec: &self.codec,
                error: self.error.as_deref(),
                metrics: self.metrics.as_ref(),
                payload,
                payload_b64,
                request_id: self.request_id,
                status: &self.status,
            },
            wire,
        )
    }

    fn from_wire_bytes(bytes: &[u8], wire: WireFormat) -> Result<Self> {
        let record: ResponseIn = decode_record(bytes, wire)?;
        Ok(ResponseEnvelope {
            request_id: record.request_id,
            status: record.status,
            codec: record.codec,
            payload: join_payload(record.payload, record.payload_b64)?,
            error: record.error,
            metrics: record.metrics,
        })
    }
}

fn split_payload(payload: &[u8], wire: WireFormat) -> (Option<&serde_bytes::Bytes>, Option<String>) {
    match wire {
        WireFormat::Json => (None, Some(BASE64_STANDARD.encode(payload))),
        WireFormat::Msgpack => (Some(serde_bytes::Bytes::new(payload)), None),
    }
}

fn join_payload(payload: Option<ByteBuf>, payload_b64: Option<String>) -> Result<Bytes> {
    match (payload, payload_b64) {
        (Some(raw), _) => Ok(Bytes::from(raw.into_vec())),
        (None, Some(encoded)) => BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(|e| OffloadError::Decode(format!("invalid payload_b64: {e}"))),
        (None, None) => Ok(Bytes::new()),
    }
}

fn encode_record<T: Serialize>(record: &T, wire: WireFormat) -> Result<Vec<u8>> {
    match wire {
        WireFormat::Json => {
            serde_json::to_vec(record).map_err(|e| OffloadError::Encode(e.to_string()))
        }
        #[cfg(feature = "msgpack")]
        WireFormat::Msgpack => super::MsgPackCodec::encode(record)
            .map_err(|e| OffloadError::Encode(e.to_string())),
        #[cfg(not(feature = "msgpack"))]
        WireFormat::Msgpack => WireFormat::Msgpack.ensure_available().map(|()| Vec::new()),
    }
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8], wire: WireFormat) -> Result<T> {
    match wire {
        WireFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| OffloadError::Decode(e.to_string()))
        }
        #[cfg(feature = "msgpack")]
        WireFormat::Msgpack => super::MsgPackCodec::decode(bytes)
            .map_err(|e| OffloadError::Decode(e.to_string())),
        #[cfg(not(feature = "msgpack"))]
        WireFormat::Msgpack => Err(OffloadError::CodecUnavailable(
            "msgpack wire support is not compiled in".to_string(),
        )),
    }
}
