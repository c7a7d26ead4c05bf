//! # Hashing and Checksums
//!
//! Content hashes for blocks and Merkle nodes, checksums for encoded fields
//! and query identity, and the 64-bit item hash used by cardinality sketches.
//!
//! ```text
//! block bytes ──BLAKE3──> leaf hash ──┐
//!                                     ├─ H(left || right) ──> ... ──> root
//! block bytes ──BLAKE3──> leaf hash ──┘
//! ```

use crc32fast::Hasher as Crc32Hasher;
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};

/// Content hash of a block or tree node.
pub type Hash = [u8; 32];

/// Hash reported for an empty tree or a block without content.
pub const EMPTY_HASH: Hash = [0u8; 32];

/// Content hash function injected into the block map and the Merkle tree.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> Hash;

    /// Hash of two concatenated child hashes.
    fn hash_pair(&self, left: &Hash, right: &Hash) -> Hash {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(left);
        buf[32..].copy_from_slice(right);
        self.hash(&buf)
    }
}

/// BLAKE3 content hasher (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash(&self, data: &[u8]) -> Hash {
        *blake3::hash(data).as_bytes()
    }
}

/// Incremental digest over a sequence of hashes.
pub struct RunningDigest {
    inner: blake3::Hasher,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(&self) -> Hash {
        *self.inner.finalize().as_bytes()
    }
}

impl Default for RunningDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Fast CRC32 checksum for data integrity
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify CRC32 checksum
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

/// 64-bit content hash used for cardinality items and schema identity.
pub fn hash64(data: &[u8]) -> u64 {
    xxh64(data, 0)
}

pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

pub fn from_hex(s: &str) -> Result<Hash> {
    let bytes = hex::decode(s).map_err(|e| Error::malformed("hash", e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::malformed("hash", format!("expected 32 bytes in {:?}", s)))
}
