//! 160-bit identifiers for partitions and records.

use sha2::{Digest, Sha256};
use std::fmt;

/// A 160-bit content hash.
///
/// Partition keys and record ids share this representation. Ordering is
/// lexicographic over the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash160([u8; Hash160::LEN]);

/// Identifier of a partition.
pub type PartitionKey = Hash160;

/// Identifier of a record, unique within a partition.
pub type RecordId = Hash160;

impl Hash160 {
    /// Length of the identifier in bytes.
    pub const LEN: usize = 20;

    /// Wraps raw bytes.
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Hashes `data` and keeps the leading 160 bits of its SHA-256 digest.
    pub fn digest(data: &[u8]) -> Self {
        Self::digest_parts(&[data])
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let full = hasher.finalize();
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&full[..Self::LEN]);
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Lower-case hex rendering, 40 characters.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != Self::LEN * 2 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; Self::LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash160({})", self.to_hex())
    }
}

impl From<[u8; Hash160::LEN]> for Hash160 {
    fn from(bytes: [u8; Hash160::LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(Hash160::digest(b"stream"), Hash160::digest(b"stream"));
        assert_ne!(Hash160::digest(b"stream"), Hash160::digest(b"stream2"));
    }

    #[test]
    fn test_digest_parts_matches_concatenation() {
        assert_eq!(
            Hash160::digest_parts(&[&b"ab"[..], &b"cd"[..]]),
            Hash160::digest(b"abcd")
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = Hash160::digest(b"partition");
        let hex = key.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(Hash160::from_hex(&hex), Some(key));
        assert_eq!(Hash160::from_hex("zz"), None);
        assert_eq!(Hash160::from_hex(&"g".repeat(40)), None);
    }
}
