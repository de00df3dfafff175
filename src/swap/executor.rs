//! Block exchange loop.
//!
//! Every swapped block goes through four operations, lowest index first:
//!
//! 1. erase slot 0
//! 2. write slot 0 with the incoming contents read from slot 1
//! 3. erase slot 1
//! 4. write slot 1 with the original contents of slot 0, held in RAM since before step 1
//!
//! Nothing is persisted between blocks. After the last block the two completion markers are
//! written, slot 1 first.

use crate::{
    BlockBuf, Error, Flash, MemoryLocation, SLOT0, SLOT1, log,
    hash::BlockHasher,
    media::Media,
    status::{Marker, StatusArea, StatusHeader},
    swap::{Position, Step},
};

/// Original slot 0 contents of the block being exchanged.
///
/// Lives in RAM only, so it is empty whenever a run starts in the middle of a block.
struct OriginalCache<const B: usize> {
    entry: Option<(u16, BlockBuf<B>)>,
}

impl<const B: usize> OriginalCache<B> {
    const fn empty() -> Self {
        Self { entry: None }
    }

    fn put(&mut self, index: u16, contents: BlockBuf<B>) {
        self.entry = Some((index, contents));
    }

    fn take(&mut self, index: u16) -> Option<BlockBuf<B>> {
        match self.entry.take() {
            Some((i, contents)) if i == index => Some(contents),
            _ => None,
        }
    }
}

pub struct Executor<'e, 'f, F: Flash, const B: usize> {
    media: &'e mut Media<'f, F, B>,
    hasher: &'e BlockHasher,
    status: &'e StatusArea,
    header: &'e StatusHeader,
}

impl<'e, 'f, F: Flash, const B: usize> Executor<'e, 'f, F, B> {
    pub fn new(
        media: &'e mut Media<'f, F, B>,
        hasher: &'e BlockHasher,
        status: &'e StatusArea,
        header: &'e StatusHeader,
    ) -> Self {
        Self {
            media,
            hasher,
            status,
            header,
        }
    }

    /// Exchange all swapped blocks from `from` onwards, or all of them if `None`.
    pub async fn run(&mut self, from: Option<Position>) -> Result<(), Error> {
        let header = self.header;
        let first = from.map_or(0, |p| p.block);
        let mut cache = OriginalCache::empty();

        for index in header.skip.swapped(header.block_count).filter(|i| *i >= first) {
            let step = match from {
                Some(position) if position.block == index => position.step,
                _ => {
                    // Untouched, slot 0 still holds the original.
                    let original = self.media.read_block(MemoryLocation::new(SLOT0, index)).await?;
                    cache.put(index, original);
                    Step::EraseSlot0
                }
            };

            self.swap_block(index, step, &mut cache).await?;
        }
        Ok(())
    }

    async fn swap_block(
        &mut self,
        index: u16,
        step: Step,
        cache: &mut OriginalCache<B>,
    ) -> Result<(), Error> {
        let original = match cache.take(index) {
            Some(original) => original,
            None => self.recover_original(index).await?,
        };
        let slot0 = MemoryLocation::new(SLOT0, index);
        let slot1 = MemoryLocation::new(SLOT1, index);

        log::debug!("swap: block {} from {}", index, step);

        if step <= Step::WriteSlot0 {
            let incoming = self.media.read_block(slot1).await?;
            if step == Step::EraseSlot0 {
                self.media.erase(slot0).await?;
            }
            self.media.write(slot0, 0, &incoming).await?;
        }
        if step <= Step::EraseSlot1 {
            self.media.erase(slot1).await?;
        }
        self.media.write(slot1, 0, &original).await
    }

    /// Rebuild the original contents of `index` from parity, all blocks below it being swapped.
    async fn recover_original(&mut self, index: u16) -> Result<BlockBuf<B>, Error> {
        log::info!("swap: recovering original of block {} from parity", index);
        let parity = self.status.read_parity(self.media).await?;
        parity
            .recover(
                self.media,
                self.hasher,
                &self.header.skip,
                self.header.block_count,
                index,
                self.header.slot0_integrity,
            )
            .await
    }
}

/// Write the completion markers, starting with `from`.
pub async fn complete<F: Flash, const B: usize>(
    media: &mut Media<'_, F, B>,
    status: &StatusArea,
    from: Marker,
) -> Result<(), Error> {
    if from == Marker::Slot1 {
        status.write_marker(media, Marker::Slot1).await?;
    }
    status.write_marker(media, Marker::Slot0).await?;
    log::info!("swap: done");
    Ok(())
}
