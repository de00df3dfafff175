//! Blocks excluded from the swap because both images hold identical contents there.

use serde::{Deserialize, Serialize};

use crate::{Error, Flash, MAX_BLOCKS, MemoryLocation, SLOT0, SLOT1, log, media::Media};

const WORDS: usize = MAX_BLOCKS / 32;

/// One bit per block index, set when slot 0 and slot 1 are content-identical at that index.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SkipBitmap {
    words: [u32; WORDS],
}

impl Default for SkipBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipBitmap {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    pub fn set(&mut self, index: u16) {
        self.words[index as usize / 32] |= 1 << (index % 32);
    }

    pub fn is_skipped(&self, index: u16) -> bool {
        self.words
            .get(index as usize / 32)
            .is_some_and(|w| w & (1 << (index % 32)) != 0)
    }

    /// Indices taking part in the swap, ascending.
    pub fn swapped(&self, count: u16) -> impl DoubleEndedIterator<Item = u16> + '_ {
        (0..count).filter(move |i| !self.is_skipped(*i))
    }

    pub fn skipped_count(&self, count: u16) -> u16 {
        count - self.swapped(count).count() as u16
    }

    /// Compare both slots block by block.
    ///
    /// Only valid before the first destructive write of a swap.
    pub async fn build<F: Flash, const B: usize>(
        media: &mut Media<'_, F, B>,
        count: u16,
    ) -> Result<Self, Error> {
        let mut bitmap = Self::new();
        for index in 0..count {
            let a = media.read_block(MemoryLocation::new(SLOT0, index)).await?;
            let b = media.read_block(MemoryLocation::new(SLOT1, index)).await?;
            if a == b {
                log::trace!("skip: block {} identical", index);
                bitmap.set(index);
            }
        }
        Ok(bitmap)
    }
}
