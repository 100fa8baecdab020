//! SF-014: BLAKE3 hashing for documents, payloads and deterministic names.

/// Hash a byte slice. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// GUID-formatted identifier derived from the given logical fields.
///
/// Identical inputs always produce the identical identifier, so the value can
/// be fixed at synthesis time instead of evaluated by the platform.
pub fn deterministic_guid(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    let hex = hasher.finalize().to_hex();
    let h = hex.as_str();
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Short (8 hex chars) digest, used to disambiguate generated names.
pub fn short_digest(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex()[..8].to_string()
}

/// Keyed MAC over a message, raw 32 bytes.
pub fn keyed_mac(key: &[u8; 32], message: &str) -> [u8; 32] {
    *blake3::keyed_hash(key, message.as_bytes()).as_bytes()
}
