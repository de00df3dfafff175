//! Parity over the original slot 0 blocks.
//!
//! The parity block is the byte-wise XOR of every swapped slot 0 block as it was before the swap.
//! Given all blocks but one, XORing them into the parity yields the missing one. It only ever
//! reconstructs original slot 0 contents, and only while at most one of them is unavailable.

use crate::{
    BlockBuf, Error, Flash, log,
    hash::{BlockHasher, Digest},
    media::{Media, View},
    skip::SkipBitmap,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Parity<const B: usize> {
    bytes: BlockBuf<B>,
}

impl<const B: usize> Default for Parity<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const B: usize> Parity<B> {
    pub const fn new() -> Self {
        Self { bytes: [0; B] }
    }

    pub const fn from_bytes(bytes: BlockBuf<B>) -> Self {
        Self { bytes }
    }

    pub const fn as_bytes(&self) -> &BlockBuf<B> {
        &self.bytes
    }

    pub fn absorb(&mut self, block: &[u8]) {
        for (p, b) in self.bytes.iter_mut().zip(block) {
            *p ^= b;
        }
    }

    /// Parity over the swapped blocks of slot 0, before any of them are touched.
    pub async fn build<F: Flash>(
        media: &mut Media<'_, F, B>,
        skip: &SkipBitmap,
        count: u16,
    ) -> Result<Self, Error> {
        let mut parity = Self::new();
        for index in skip.swapped(count) {
            let block = media.read_view(View::Slot(crate::SLOT0), index).await?;
            parity.absorb(&block);
        }
        Ok(parity)
    }

    /// Reconstruct the original slot 0 contents of block `missing` from all the others.
    ///
    /// Blocks below `missing` are taken as swapped, their originals read from slot 1, the ones
    /// above it from slot 0. The reconstruction is checked against `expected`, the persisted
    /// slot 0 rolling integrity, which fails whenever a second original block is missing or
    /// damaged.
    pub async fn recover<F: Flash>(
        &self,
        media: &mut Media<'_, F, B>,
        hasher: &BlockHasher,
        skip: &SkipBitmap,
        count: u16,
        missing: u16,
        expected: Digest,
    ) -> Result<BlockBuf<B>, Error> {
        let view = View::Originals {
            swapped_below: missing,
        };
        let mut rebuilt = self.clone();
        let mut acc = Digest::ZERO;

        for index in skip.swapped(count).filter(|i| *i != missing) {
            let block = media.read_view(view, index).await?;
            rebuilt.absorb(&block);
            acc ^= hasher.digest(index, &block);
        }
        acc ^= hasher.digest(missing, &rebuilt.bytes);

        if acc == expected {
            Ok(rebuilt.bytes)
        } else {
            log::debug!("parity: block {} not recoverable", missing);
            Err(Error::ParityRecoveryImpossible)
        }
    }
}
