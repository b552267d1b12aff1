//! Codec module - envelope wire formats and payload codecs.
//!
//! Two independent layers:
//!
//! - [`WireFormat`] decides how a whole envelope becomes frame bytes
//!   (`json` with base64 payloads, or `msgpack` with binary payloads).
//! - [`PayloadCodec`] decides how the business value inside the envelope is
//!   encoded (`raw`, `json`, `msgpack`, `arrow_ipc`).
//!
//! # Example
//!
//! ```
//! use pipe_offload::codec::{decode_envelope, encode_envelope, encode_payload, PayloadCodec, WireFormat};
//! use pipe_offload::protocol::RequestEnvelope;
//!
//! let payload = encode_payload(&serde_json::json!({"a": 1}), PayloadCodec::Json).unwrap();
//! let request = RequestEnvelope::new(1, "echo", PayloadCodec::Json, payload);
//!
//! let bytes = encode_envelope(&request, WireFormat::Json).unwrap();
//! let decoded: RequestEnvelope = decode_envelope(&bytes, WireFormat::Json).unwrap();
//! assert_eq!(decoded, request);
//! ```

mod envelope;
#[cfg(feature = "msgpack")]
mod msgpack;
mod payload;
mod raw_bytes;

pub use envelope::{decode_envelope, detect_request, encode_envelope, peek_request_id, Envelope, WireFormat};
#[cfg(feature = "msgpack")]
pub use msgpack::MsgPackCodec;
pub use payload::{
    decode_payload, decode_payload_named, encode_payload, encode_payload_bytes, PayloadCodec,
};
