mod sas;
pub use sas::*;

mod x25519;
pub use x25519::X25519PublicKey;
pub(crate) use x25519::random_bytes;

use crate::Error;
use base64::Engine;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Encodes bytes as unpadded standard base64, the encoding used on the wire.
pub fn encode_base64(bytes: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

/// Decodes standard base64, accepting input with or without padding.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, Error> {
    let engine = base64::engine::general_purpose::STANDARD_NO_PAD;
    Ok(engine.decode(input.trim_end_matches('='))?)
}

/// SHA-256 of a UTF-8 string, as unpadded base64.
pub fn sha256_base64(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    encode_base64(hasher.finalize())
}

/// Compares two strings without early exit on the first differing byte.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));

                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    out.serialize_entry(key, &Canonical(value))?;
                }
                out.end()
            }
            Value::Array(items) => serializer.collect_seq(items.iter().map(Canonical)),
            other => other.serialize(serializer),
        }
    }
}

/// Serializes a JSON value with lexicographically sorted keys and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> Result<String, Error> {
    Ok(serde_json::to_string(&Canonical(value))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({
            "b": 1,
            "a": {"z": [3, {"y": true, "x": null}], "c": "é"},
        });

        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"c":"é","z":[3,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn test_sha256_base64_is_unpadded() {
        // sha256("") is a well known vector.
        assert_eq!(
            sha256_base64(""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn test_base64_accepts_padding() {
        assert_eq!(decode_base64("AQI=").unwrap(), vec![1, 2]);
        assert_eq!(decode_base64("AQI").unwrap(), vec![1, 2]);
        assert_eq!(encode_base64([1u8, 2]), "AQI");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
