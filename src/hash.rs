//! Canonical content hashing.
//!
//! Values are first converted to a `serde_json::Value` (object keys sorted),
//! then serialized compactly and hashed with blake3 under a domain tag. Every
//! content hash in the crate goes through here so rebuilds agree byte-for-byte.

use blake3::Hasher;
use serde::Serialize;

/// Serializes a value to its canonical JSON bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Hashes a value's canonical form under a domain tag.
pub fn canonical_hash<T: Serialize + ?Sized>(
    domain: &str,
    value: &T,
) -> Result<blake3::Hash, serde_json::Error> {
    let bytes = canonical_bytes(value)?;
    let mut h = Hasher::new();
    h.update(domain.as_bytes());
    h.update(&[0u8]);
    h.update(&bytes);
    Ok(h.finalize())
}

/// Hashes a short label string under a domain tag, returning 16 hex chars.
///
/// Used for compact structural labels where collisions only merge
/// equivalence classes.
#[must_use]
pub fn short_label(domain: &str, parts: &[&str]) -> String {
    let mut h = Hasher::new();
    h.update(domain.as_bytes());
    for part in parts {
        h.update(&[0u8]);
        h.update(part.as_bytes());
    }
    let hex = h.finalize().to_hex();
    hex.as_str()[..16].to_string()
}

/// Maps a string key to a uniform value in `[0, 1)`.
#[must_use]
pub fn unit_interval(key: &str) -> f64 {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    // 53 bits of mantissa.
    let bits = u64::from_le_bytes(bytes) >> 11;
    #[allow(clippy::cast_precision_loss)]
    let v = bits as f64 / (1u64 << 53) as f64;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_bytes_sort_object_keys() {
        let a = canonical_bytes(&json!({"b": 1, "a": 2})).unwrap();
        let b = canonical_bytes(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(String::from_utf8(a).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn domain_separates_hashes() {
        let a = canonical_hash("one", &json!([1, 2])).unwrap();
        let b = canonical_hash("two", &json!([1, 2])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_hash_matches_framed_blake3() {
        let expected = blake3::hash(b"d\0{\"k\":[true,null]}");
        let actual = canonical_hash("d", &json!({"k": [true, null]})).unwrap();
        assert_eq!(hex::encode(actual.as_bytes()), expected.to_hex().as_str());
    }

    #[test]
    fn short_label_is_stable_and_part_sensitive() {
        assert_eq!(short_label("x", &["a", "b"]), short_label("x", &["a", "b"]));
        assert_ne!(short_label("x", &["ab"]), short_label("x", &["a", "b"]));
        assert_eq!(short_label("x", &["a"]).len(), 16);
    }

    #[test]
    fn unit_interval_is_deterministic_and_bounded() {
        let v = unit_interval("t1:tool_called:3");
        assert_eq!(v.to_bits(), unit_interval("t1:tool_called:3").to_bits());
        assert!((0.0..1.0).contains(&v));
    }
}
