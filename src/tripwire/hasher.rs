//! KN-014: BLAKE3 hashing for descriptor fingerprints and derived identifiers.

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple components.
/// Components are NUL-separated so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn composite_hash(components: &[&str]) -> String {
    format!("blake3:{}", composite_digest(components).to_hex())
}

/// Raw 32-byte composite digest, for callers that derive fixed-width ids.
pub fn composite_digest(components: &[&str]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    hasher.finalize()
}
