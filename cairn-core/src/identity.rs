//! Owner tokens and key hashing

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Opaque lease owner token.
pub type OwnerToken = String;

/// SHA-256 digest of a derived key.
pub type KeyHash = [u8; 32];

/// Generate a new owner token (UUIDv7, timestamp-sortable).
pub fn new_owner_token() -> OwnerToken {
    Uuid::now_v7().to_string()
}

/// Compute SHA-256 hash of a derived key.
pub fn compute_key_digest(content: &[u8]) -> KeyHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex form of [`compute_key_digest`], used as a backend storage key.
pub fn compute_key_hash(content: &str) -> String {
    hex::encode(compute_key_digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_tokens_are_unique() {
        let a = new_owner_token();
        let b = new_owner_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_key_hash_is_stable_hex() {
        let hash = compute_key_hash("path!root");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, compute_key_hash("path!root"));
        assert_ne!(hash, compute_key_hash("path!root!0!"));
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            compute_key_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
