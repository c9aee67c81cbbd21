use sha2::{Digest, Sha256};

/// Compute the content hash of a byte payload as a lowercase hex string.
///
/// The digest is SHA-256, so byte-identical uploads always map to the same
/// hash and distinct payloads are collision-resistant for dedup purposes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // SHA-256 test vector for "abc"
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_identical_bytes_identical_hash() {
        let payload = vec![0x5au8; 4096];
        assert_eq!(content_hash(&payload), content_hash(&payload.clone()));
    }

    #[test]
    fn test_distinct_bytes_distinct_hash() {
        let a = b"first recording".to_vec();
        let mut b = a.clone();
        b.push(0);
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
