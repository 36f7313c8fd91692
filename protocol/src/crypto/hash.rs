//! # Hashing Utilities
//!
//! Every content address in the chain (blocks, transactions, trie nodes,
//! chunk roots) is a BLAKE3 digest wrapped in [`Hash`]. SHA-256 is kept for
//! one job only: turning peer ids into Kademlia distance keys, where we want
//! a hash that has nothing to do with our own content addressing.
//!
//! ## Ordering
//!
//! `Hash` deliberately does **not** implement `Ord`. Hashes are compared for
//! equality almost everywhere; the single place that needs a total order is
//! fork choice, which uses [`Hash::less`] (FNV-32a of the bytes, falling back
//! to byte comparison). Keeping the order out of the type stops anyone from
//! accidentally using it for state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of every content hash, in bytes.
pub const HASH_LENGTH: usize = 32;

/// Error returned when a string or slice cannot be turned into a [`Hash`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("expected {HASH_LENGTH} bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash. Used as the parent of genesis and as the root of
    /// an empty trie.
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    pub const fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        let bytes: [u8; HASH_LENGTH] = slice
            .try_into()
            .map_err(|_| HashError::InvalidLength(slice.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LENGTH]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(s).map_err(|e| HashError::Hex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, HashError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| HashError::Base58(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// FNV-32a of the hash bytes.
    pub fn fnv32a(&self) -> u32 {
        fnv32a(&self.0)
    }

    /// Strict total order used for stable tie-breaks.
    ///
    /// Compares FNV-32a first and only falls back to the raw bytes when the
    /// 32-bit digests collide, so `less` is irreflexive, asymmetric and
    /// transitive over distinct hashes.
    pub fn less(&self, other: &Hash) -> bool {
        let (a, b) = (self.fnv32a(), other.fnv32a());
        if a != b {
            return a < b;
        }
        self.0 < other.0
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// BLAKE3 digest of `data` as a [`Hash`].
pub fn blake3_hash(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// BLAKE3 over several byte slices without concatenating them first.
pub fn blake3_hash_many(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(*hasher.finalize().as_bytes())
}

/// SHA-256 digest as a fixed-size array.
pub fn sha256_array(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// 32-bit FNV-1a.
pub fn fnv32a(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_is_deterministic() {
        assert_eq!(blake3_hash(b"pod"), blake3_hash(b"pod"));
        assert_ne!(blake3_hash(b"pod"), blake3_hash(b"dop"));
    }

    #[test]
    fn blake3_many_matches_concatenation() {
        let joined = blake3_hash(b"helloworld");
        let parts = blake3_hash_many(&[b"hello", b"world"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn hex_and_base58_are_lossless() {
        let h = blake3_hash(b"encode me");
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
        assert_eq!(Hash::from_base58(&h.to_base58()).unwrap(), h);
        assert_eq!(h.to_string().parse::<Hash>().unwrap(), h);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(
            Hash::from_slice(&[1, 2, 3]),
            Err(HashError::InvalidLength(3))
        );
        assert!(Hash::from_hex("zz").is_err());
    }

    #[test]
    fn fnv32a_known_vectors() {
        // Reference values from the FNV test suite.
        assert_eq!(fnv32a(b""), 0x811c_9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c_292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn less_is_a_strict_order() {
        let hashes: Vec<Hash> = (0u8..50).map(|i| blake3_hash(&[i])).collect();
        for a in &hashes {
            assert!(!a.less(a));
            for b in &hashes {
                if a != b {
                    assert_ne!(a.less(b), b.less(a));
                }
                for c in &hashes {
                    if a.less(b) && b.less(c) {
                        assert!(a.less(c));
                    }
                }
            }
        }
    }

    #[test]
    fn zero_hash() {
        assert!(Hash::ZERO.is_zero());
        assert!(!blake3_hash(b"x").is_zero());
    }
}
