//! Shared identifier types.

/// 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Content hash of a `DesiredState`.
pub type StateHash = Hash;

/// Monotonic generation identifier. The first committed generation is 1.
pub type GenerationId = u64;

/// Render a hash the way it is shown to operators (full lowercase hex).
pub fn hash_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Short form used in tables and log lines.
pub fn short_hash(hash: &Hash) -> String {
    let mut full = hex::encode(hash);
    full.truncate(12);
    full
}

/// Parse a full hex digest back into a hash.
pub fn parse_hash(value: &str) -> Option<Hash> {
    let bytes = hex::decode(value).ok()?;
    bytes.try_into().ok()
}

/// Serde adapter storing a hash as a hex string.
pub mod hex_hash {
    use super::Hash;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_hash(&text).ok_or_else(|| D::Error::custom(format!("invalid hash '{}'", text)))
    }
}
