//! CBOR encoding for persisted records.
//!
//! Records are encoded with `ciborium` through their serde derives. JSON
//! payloads are stored as `serde_json::Value`, whose object maps are ordered
//! by key, so encoding the same value always yields the same bytes. That
//! property is what makes [`content_digest`] usable for equality checks.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Returns the SHA-256 digest of a value's CBOR encoding.
pub fn content_digest<T: Serialize + ?Sized>(value: &T) -> CodecResult<[u8; 32]> {
    let bytes = to_cbor(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_value_roundtrip() {
        let value = json!({"title": "Groceries", "tags": ["home", "weekly"], "pinned": true});
        let bytes = to_cbor(&value).unwrap();
        let decoded: serde_json::Value = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn digest_ignores_key_insertion_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(content_digest(&a).unwrap(), content_digest(&b).unwrap());
    }

    #[test]
    fn digest_differs_for_different_content() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(content_digest(&a).unwrap(), content_digest(&b).unwrap());
    }

    #[test]
    fn decode_garbage_fails() {
        let result: CodecResult<serde_json::Value> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
