//! Canonical JSON output and checksums.
//!
//! Every byte the store hands to a backend comes through here. The format is
//! checksum-affecting and must not change: 4-space indent, sorted object
//! keys, UTF-8, LF, no BOM. `serde_json` is built without `preserve_order`,
//! so `Value` objects already iterate in sorted key order.

use serde_json::ser::{PrettyFormatter, Serializer};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

/// Serialize `value` to the canonical byte representation.
pub fn to_canonical_json(value: &Value) -> Vec<u8> {
    let normalized = with_sorted_keys(value);
    let mut buf = Vec::with_capacity(256);
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = Serializer::with_formatter(&mut buf, formatter);
    // Serializing a Value into a byte vector cannot fail.
    serde::Serialize::serialize(&normalized, &mut ser).unwrap_or_default();
    buf
}

/// Rebuild `value` with object keys in sorted order, recursively. The key
/// order must never depend on how the map type happens to iterate.
fn with_sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), with_sorted_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(with_sorted_keys).collect()),
        other => other.clone(),
    }
}

/// Canonical representation as a string.
pub fn to_canonical_string(value: &Value) -> String {
    String::from_utf8(to_canonical_json(value)).unwrap_or_default()
}

/// Current UTC time as an ISO-8601 string with microsecond precision,
/// e.g. `2021-05-01T12:00:00.000000Z`.
pub fn utc_now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Incremental SHA-256 yielding a lowercase hex digest.
#[derive(Default)]
pub struct Checksum {
    hasher: Sha256,
}

impl Checksum {
    /// Start a fresh checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish and return the hex digest.
    pub fn hexdigest(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// One-shot hex digest of a byte slice.
pub fn hexdigest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorted_keys_and_indent() {
        let value = json!({"zeta": 1, "alpha": {"b": 2, "a": 3}});
        let text = to_canonical_string(&value);
        assert_eq!(
            text,
            "{\n    \"alpha\": {\n        \"a\": 3,\n        \"b\": 2\n    },\n    \"zeta\": 1\n}"
        );
    }

    #[test]
    fn byte_stable_across_insertion_order() {
        let mut first = serde_json::Map::new();
        first.insert("b".into(), json!(1));
        first.insert("a".into(), json!(2));

        let mut second = serde_json::Map::new();
        second.insert("a".into(), json!(2));
        second.insert("b".into(), json!(1));

        assert_eq!(
            to_canonical_json(&Value::Object(first)),
            to_canonical_json(&Value::Object(second))
        );
    }

    #[test]
    fn checksum_matches_one_shot() {
        let mut cs = Checksum::new();
        cs.update(b"hello ");
        cs.update(b"world");
        assert_eq!(cs.hexdigest(), hexdigest(b"hello world"));
    }

    #[test]
    fn timestamp_shape() {
        let ts = utc_now_iso();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2021-05-01T12:00:00.000000Z".len());
    }
}
