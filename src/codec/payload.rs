//! Payload codec - the business value carried inside an envelope.
//!
//! Independent of the wire format: a caller may ask for a compact binary
//! result (`arrow_ipc`) even when envelopes travel as JSON, and vice versa.
//!
//! - `raw` / `arrow_ipc`: byte identity
//! - `json`: compact JSON via `serde_json`
//! - `msgpack`: struct-as-map MessagePack (requires the `msgpack` feature)

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::value::BytesDeserializer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};

/// Codec applied to the payload bytes of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCodec {
    /// Bytes passed through unchanged.
    Raw,
    /// UTF-8 JSON.
    Json,
    /// MessagePack.
    Msgpack,
    /// Arrow IPC stream bytes, passed through unchanged.
    ArrowIpc,
}

impl PayloadCodec {
    /// Every codec the protocol knows about.
    pub const ALL: [PayloadCodec; 4] = [
        PayloadCodec::Raw,
        PayloadCodec::Json,
        PayloadCodec::Msgpack,
        PayloadCodec::ArrowIpc,
    ];

    /// Wire name of the codec.
    pub const fn as_str(self) -> &'static str {
        match self {
            PayloadCodec::Raw => "raw",
            PayloadCodec::Json => "json",
            PayloadCodec::Msgpack => "msgpack",
            PayloadCodec::ArrowIpc => "arrow_ipc",
        }
    }

    /// Whether this build can encode and decode the codec.
    pub const fn is_available(self) -> bool {
        match self {
            PayloadCodec::Msgpack => cfg!(feature = "msgpack"),
            _ => true,
        }
    }

    /// Fail with `CodecUnavailable` if the codec is not compiled in.
    pub fn ensure_available(self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(OffloadError::CodecUnavailable(format!(
                "{} support is not compiled in",
                self.as_str()
            )))
        }
    }

    /// Codecs usable in this build.
    pub fn available() -> Vec<PayloadCodec> {
        Self::ALL.into_iter().filter(|c| c.is_available()).collect()
    }

    /// Default codec for structured payloads: msgpack when available, else JSON.
    pub const fn preferred() -> Self {
        if cfg!(feature = "msgpack") {
            PayloadCodec::Msgpack
        } else {
            PayloadCodec::Json
        }
    }

    /// Whether payloads in this codec are opaque bytes.
    #[inline]
    pub const fn is_binary_passthrough(self) -> bool {
        matches!(self, PayloadCodec::Raw | PayloadCodec::ArrowIpc)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::preferred()
    }
}

impl FromStr for PayloadCodec {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(PayloadCodec::Raw),
            "json" => Ok(PayloadCodec::Json),
            "msgpack" => Ok(PayloadCodec::Msgpack),
            "arrow_ipc" => Ok(PayloadCodec::ArrowIpc),
            other => Err(OffloadError::UnknownCodec(other.to_string())),
        }
    }
}

impl fmt::Display for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a structured value with the given codec.
///
/// `raw` and `arrow_ipc` only carry bytes: the value must serialize as a
/// byte string (`serde_bytes::ByteBuf`, `serde_bytes::Bytes`), which is
/// passed through unchanged.
///
/// # Errors
///
/// `Encode` if the value cannot be represented, `CodecUnavailable` if the
/// codec is not compiled in.
pub fn encode_payload<T>(value: &T, codec: PayloadCodec) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    codec.ensure_available()?;
    match codec {
        PayloadCodec::Json => {
            serde_json::to_vec(value).map_err(|e| OffloadError::Encode(e.to_string()))
        }
        PayloadCodec::Msgpack => encode_msgpack(value),
        PayloadCodec::Raw | PayloadCodec::ArrowIpc => super::raw_bytes::to_bytes(value)
            .map_err(|e| OffloadError::Encode(format!("{codec}: {e}"))),
    }
}

/// Pass already-encoded payload bytes through unchanged.
///
/// Byte identity for every codec; only the codec's availability is checked.
pub fn encode_payload_bytes(bytes: impl Into<Bytes>, codec: PayloadCodec) -> Result<Bytes> {
    codec.ensure_available()?;
    Ok(bytes.into())
}

/// Decode payload bytes with the given codec.
///
/// For `raw` and `arrow_ipc` the target type is built from the bytes as-is
/// (e.g. `serde_bytes::ByteBuf` or `bytes::Bytes`).
pub fn decode_payload<T>(bytes: &[u8], codec: PayloadCodec) -> Result<T>
where
    T: DeserializeOwned,
{
    codec.ensure_available()?;
    match codec {
        PayloadCodec::Json => {
            serde_json::from_slice(bytes).map_err(|e| OffloadError::Decode(e.to_string()))
        }
        PayloadCodec::Msgpack => decode_msgpack(bytes),
        PayloadCodec::Raw | PayloadCodec::ArrowIpc => {
            let de = BytesDeserializer::<serde::de::value::Error>::new(bytes);
            T::deserialize(de).map_err(|e| OffloadError::Decode(e.to_string()))
        }
    }
}

/// Decode payload bytes whose codec arrived as a string on the wire.
pub fn decode_payload_named<T>(bytes: &[u8], codec: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    decode_payload(bytes, codec.parse()?)
}

#[cfg(feature = "msgpack")]
fn encode_msgpack<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    super::MsgPackCodec::encode(value).map_err(|e| OffloadError::Encode(e.to_string()))
}

#[cfg(feature = "msgpack")]
fn decode_msgpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    super::MsgPackCodec::decode(bytes).map_err(|e| OffloadError::Decode(e.to_string()))
}

#[cfg(not(feature = "msgpack"))]
fn encode_msgpack<T: Serialize + ?Sized>(_value: &T) -> Result<Vec<u8>> {
    PayloadCodec::Msgpack.ensure_available().map(|()| Vec::new())
}

#[cfg(not(feature = "msgpack"))]
fn decode_msgpack<T: DeserializeOwned>(_bytes: &[u8]) -> Result<T> {
    Err(OffloadError::CodecUnavailable(
        "msgpack support is not compiled in".to_string(),
    ))
}
