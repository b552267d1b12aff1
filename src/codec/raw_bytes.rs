//! Serializer that only accepts byte strings.
//!
//! Backs `encode_payload` for the `raw` and `arrow_ipc` codecs: values that
//! serialize through `serialize_bytes` (`serde_bytes::ByteBuf`,
//! `serde_bytes::Bytes`) come out unchanged, anything else is rejected.

use serde::de::value::Error;
use serde::ser::{self, Impossible, Serialize};

const NOT_BYTES: &str = "payloads must be bytes (use serde_bytes or call_bytes)";

/// Extract the byte string `value` serializes to.
pub(crate) fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, Error> {
    value.serialize(BytesOnly)
}

struct BytesOnly;

fn reject<T>() -> Result<T, Error> {
    Err(ser::Error::custom(NOT_BYTES))
}

macro_rules! reject_scalars {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> Result<Vec<u8>, Error> {
                reject()
            }
        )*
    };
}

impl ser::Serializer for BytesOnly {
    type Ok = Vec<u8>;
    type Error = Error;
    type SerializeSeq = Impossible<Vec<u8>, Error>;
    type SerializeTuple = Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct = Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant = Impossible<Vec<u8>, Error>;
    type SerializeMap = Impossible<Vec<u8>, Error>;
    type SerializeStruct = Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = Impossible<Vec<u8>, Error>;

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(v.to_vec())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Vec<u8>, Error> {
        value.serialize(self)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, Error> {
        value.serialize(self)
    }

    reject_scalars! {
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_f32(f32),
        serialize_f64(f64),
        serialize_char(char),
        serialize_str(&str),
        serialize_unit_struct(&'static str),
    }

    fn serialize_none(self) -> Result<Vec<u8>, Error> {
        reject()
    }

    fn serialize_unit(self) -> Result<Vec<u8>, Error> {
        reject()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<Vec<u8>, Error> {
        reject()
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Vec<u8>, Error> {
        reject()
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Error> {
        reject()
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Error> {
        reject()
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, Error> {
        reject()
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        reject()
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Error> {
        reject()
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Error> {
        reject()
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        reject()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::{ByteBuf, Bytes as ByteSlice};

    #[test]
    fn test_byte_types_pass_through() {
        let data = [0x00u8, 0xFF, 0x7F];
        assert_eq!(to_bytes(&ByteBuf::from(data.to_vec())).unwrap(), data);
        assert_eq!(to_bytes(ByteSlice::new(&data)).unwrap(), data);
        assert_eq!(to_bytes(&Some(ByteBuf::from(vec![1u8]))).unwrap(), vec![1]);
    }

    #[test]
    fn test_non_bytes_rejected() {
        assert!(to_bytes("text").is_err());
        assert!(to_bytes(&42u32).is_err());
        assert!(to_bytes(&vec![1u8, 2]).is_err());
        assert!(to_bytes(&serde_json::json!({"a": 1})).is_err());
    }
}
