//! MsgPack codec using `rmp-serde`.
//!
//! Always encodes with `to_vec_named`: structs become maps keyed by field
//! name, which is what workers written against other msgpack libraries
//! expect. `to_vec` would produce positional arrays.
//!
//! # Example
//!
//! ```
//! use pipe_offload::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Item {
//!     id: u32,
//!     label: String,
//! }
//!
//! let item = Item { id: 42, label: "item-42".to_string() };
//! let encoded = MsgPackCodec::encode(&item).unwrap();
//! let decoded: Item = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, item);
//! ```

use crate::error::{OffloadError, Result};

/// MessagePack helpers shared by the payload codec and the msgpack wire.
#[derive(Debug, Clone, Copy)]
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Serialize `value`, structs as maps.
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(OffloadError::from)
    }

    /// Deserialize one value from `bytes`.
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(OffloadError::from)
    }
}
