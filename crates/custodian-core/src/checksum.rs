//! Content checksums for registry entities and repository fingerprints.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a JSON value's canonical serialized form.
///
/// `serde_json::to_vec` on a `serde_json::Value` produces a stable byte
/// sequence for a given value shape: without the `preserve_order` feature,
/// `serde_json::Map` is a `BTreeMap`, so object keys always serialize in
/// sorted order regardless of how the value was constructed or parsed.
/// This is suitable as the content checksum the Registry Store's integrity
/// check (`verify`) recomputes and compares against the index.
#[must_use]
pub fn checksum_json(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    checksum_bytes(&bytes)
}

/// Hex-encoded SHA-256 digest of raw bytes, used directly by the
/// fingerprint algorithm's per-file content hash.
#[must_use]
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic_for_equal_values() {
        let a = serde_json::json!({"v": 1, "name": "x"});
        let b = serde_json::json!({"v": 1, "name": "x"});
        assert_eq!(checksum_json(&a), checksum_json(&b));
    }

    #[test]
    fn checksum_differs_for_different_values() {
        let a = serde_json::json!({"v": 1});
        let b = serde_json::json!({"v": 2});
        assert_ne!(checksum_json(&a), checksum_json(&b));
    }

    #[test]
    fn checksum_bytes_matches_known_sha256_of_empty_input() {
        assert_eq!(
            checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
