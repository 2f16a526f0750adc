use std::any::type_name;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Opaque task result or literal argument.
///
/// The payload is MessagePack-encoded. Schedulers and workers only ever look
/// at [`Blob::nbytes`]; decoding is left to the code that produced the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Rust type name of the encoded value, for diagnostics only.
    pub type_tag: String,

    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl Blob {
    /// Encode a value with MessagePack.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            type_tag: type_name::<T>().to_string(),
            bytes: rmp_serde::to_vec(value)?,
        })
    }

    /// Decode the payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.bytes)
    }

    /// Wrap already-encoded bytes.
    pub fn from_raw(type_tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            bytes,
        }
    }

    /// Size estimate used for placement and memory accounting.
    pub fn nbytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Serialize `Vec<u8>` as a MessagePack bin instead of an array of ints.
///
/// Deserialization accepts borrowed, owned and sequence forms, since tagged
/// message enums buffer their content before handing it to us.
mod serde_bytes {
    use std::fmt;

    use serde::de::{SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_bytes(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte array")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_records_type_and_size() {
        let blob = Blob::encode(&vec![1u8; 32]).unwrap();
        assert!(blob.type_tag.contains("Vec<u8>"));
        assert!(blob.nbytes() >= 32);
        assert_eq!(blob.decode::<Vec<u8>>().unwrap(), vec![1u8; 32]);
    }

    #[test]
    fn decode_wrong_type_fails() {
        let blob = Blob::encode("hello").unwrap();
        assert!(blob.decode::<u64>().is_err());
    }

    #[test]
    fn envelope_survives_messagepack() {
        let blob = Blob::encode(&(1i64, "two".to_string())).unwrap();
        let bytes = rmp_serde::to_vec(&blob).unwrap();
        let back: Blob = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, blob);
    }
}
