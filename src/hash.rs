//! Keyed block digests.

use core::ops::{BitXor, BitXorAssign};

use serde::{Deserialize, Serialize};

pub const DIGEST_LEN: usize = 32;

pub type Key = [u8; 32];

/// Fixed-size keyed digest, combined by XOR.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Identity of the XOR accumulator.
    pub const ZERO: Digest = Digest([0; DIGEST_LEN]);
}

impl BitXorAssign for Digest {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a ^= b;
        }
    }
}

impl BitXor for Digest {
    type Output = Digest;

    fn bitxor(mut self, rhs: Self) -> Digest {
        self ^= rhs;
        self
    }
}

/// Computes keyed BLAKE3 digests of block contents.
///
/// The block index is part of the hashed input, so identical contents at different indices
/// contribute different digests.
#[derive(Clone)]
pub struct BlockHasher {
    key: Key,
}

impl BlockHasher {
    pub const fn new(key: Key) -> Self {
        Self { key }
    }

    pub fn digest(&self, index: u16, contents: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(b"block");
        hasher.update(&index.to_le_bytes());
        hasher.update(contents);
        Digest(*hasher.finalize().as_bytes())
    }

    /// Seal over a persisted record, domain separated from block digests.
    pub fn seal(&self, record: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(b"seal");
        hasher.update(record);
        Digest(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = [0x5a; 32];

    #[test]
    fn deterministic_and_keyed() {
        let hasher = BlockHasher::new(KEY);
        let other = BlockHasher::new([0xa5; 32]);

        assert_eq!(hasher.digest(3, b"contents"), hasher.digest(3, b"contents"));
        assert_ne!(hasher.digest(3, b"contents"), other.digest(3, b"contents"));
    }

    #[test]
    fn index_is_bound() {
        let hasher = BlockHasher::new(KEY);
        assert_ne!(hasher.digest(0, b"contents"), hasher.digest(1, b"contents"));
    }

    #[test]
    fn seal_differs_from_block_digest() {
        let hasher = BlockHasher::new(KEY);
        assert_ne!(hasher.seal(b"contents"), hasher.digest(0, b"contents"));
    }

    #[test]
    fn xor_identity() {
        let hasher = BlockHasher::new(KEY);
        let d = hasher.digest(7, b"x");
        assert_eq!(d ^ Digest::ZERO, d);
        assert_eq!(d ^ d, Digest::ZERO);
    }
}
