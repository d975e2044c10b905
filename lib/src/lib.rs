// Shared ring types for chordkv nodes
pub mod dht_messages;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub use dht_messages::{DhtMessage, NodeId, NodeInfo};

/// Ring width used when nothing else is configured.
pub const DEFAULT_RING_BITS: u32 = 32;

/// Largest supported ring width. Identifiers are stored in a `u64`, and the
/// finger arithmetic needs one spare bit.
pub const MAX_RING_BITS: u32 = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierSpaceError {
    #[error("ring width must be between 1 and {max} bits, got {bits}")]
    InvalidBits { bits: u32, max: u32 },
}

/// Circular identifier space of size 2^m.
///
/// Node addresses and keys are both hashed into this space, so every
/// between-ness check in the protocol goes through one of these helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierSpace {
    bits: u32,
}

impl Default for IdentifierSpace {
    fn default() -> Self {
        Self {
            bits: DEFAULT_RING_BITS,
        }
    }
}

impl IdentifierSpace {
    pub fn new(bits: u32) -> Result<Self, IdentifierSpaceError> {
        if bits == 0 || bits > MAX_RING_BITS {
            return Err(IdentifierSpaceError::InvalidBits {
                bits,
                max: MAX_RING_BITS,
            });
        }
        Ok(Self { bits })
    }

    /// Number of bits `m`, which is also the number of finger table entries.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// 2^m
    pub fn size(&self) -> u64 {
        1u64 << self.bits
    }

    fn mask(&self) -> u64 {
        self.size() - 1
    }

    /// Hashes arbitrary bytes onto the ring: SHA-1, read as a big-endian
    /// integer, reduced mod 2^m.
    pub fn hash(&self, bytes: &[u8]) -> NodeId {
        let digest = Sha1::digest(bytes);
        let modulus = BigUint::one() << self.bits;
        let reduced = BigUint::from_bytes_be(&digest) % modulus;
        // The remainder is below 2^63, so the conversion cannot fail.
        reduced.to_u64().unwrap_or_default()
    }

    pub fn hash_key(&self, key: &str) -> NodeId {
        self.hash(key.as_bytes())
    }

    /// Start of finger `i`: (id + 2^i) mod 2^m.
    pub fn finger_start(&self, id: NodeId, i: u32) -> NodeId {
        let offset = 1u64 << (i % self.bits);
        (id.wrapping_add(offset)) & self.mask()
    }

    /// Clockwise distance walking from `from` to `to`.
    pub fn distance(&self, from: NodeId, to: NodeId) -> u64 {
        to.wrapping_sub(from) & self.mask()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id < self.size()
    }
}

// Checks if an ID is between two other IDs in a circular ID space.
// `id` is between `start` and `end` if `start < id <= end` in the circular space.
// When `start == end` the interval covers the whole ring.
pub fn is_between(id: NodeId, start: NodeId, end: NodeId) -> bool {
    if start == end {
        return true;
    }
    if start < end {
        start < id && id <= end
    } else {
        // Wraps around (start > end)
        start < id || id <= end
    }
}

// Open interval (start, end). When `start == end` this is every ID except `start`.
pub fn is_strictly_between(id: NodeId, start: NodeId, end: NodeId) -> bool {
    if start == end {
        return id != start;
    }
    if start < end {
        start < id && id < end
    } else {
        start < id || id < end
    }
}
