//! Locating the interruption point of a swap from flash contents.
//!
//! The status area records the rolling integrity of both images before the swap. While the
//! swap runs, the incoming ("B") image lives in slot 0 below some boundary and in slot 1 at and
//! above it. The boundary is found by B-zipping: starting from the assumption that every block
//! of slot 0 already holds B, the integrity is recomputed while moving the boundary down one
//! swapped block at a time, replacing that block's slot 0 digest by its slot 1 digest, until it
//! equals the recorded slot 1 integrity.
//!
//! At most one block around the boundary is in transition. Which one, and in which step, is
//! decided by checking where the original ("A") image is intact against the recorded slot 0
//! integrity, with parity standing in for the one block that may be missing.

use crate::{
    Error, Flash, MemoryLocation, SLOT0, SLOT1, integrity, is_erased, log,
    hash::BlockHasher,
    media::{Media, View},
    status::{Marker, StatusArea, StatusHeader},
    swap::{Position, Step, SwapState},
};

/// Classify the swap state.
///
/// Only reads flash. Fails with [`Error::UnrecoverableSwap`] if no interruption point is
/// consistent with what is found, in which case the swap must not be continued.
pub async fn classify<F: Flash, const B: usize>(
    media: &mut Media<'_, F, B>,
    hasher: &BlockHasher,
    status: &StatusArea,
) -> Result<SwapState, Error> {
    let header = match status.read_header(media, hasher).await {
        Ok(header) => header,
        Err(Error::CorruptStatusArea) => return Ok(SwapState::NotStarted),
        Err(e) => return Err(e),
    };
    if header.block_count != status.layout().count() || header.block_size as usize != B {
        log::error!("recovery: status area written for another geometry");
        return Err(Error::Geometry);
    }

    if status.marker_present(media, Marker::Slot1).await? {
        return Ok(if status.marker_present(media, Marker::Slot0).await? {
            SwapState::Done
        } else {
            SwapState::Completing(Marker::Slot0)
        });
    }

    Recovery {
        media,
        hasher,
        status,
        header: &header,
    }
    .locate()
    .await
}

struct Recovery<'r, 'f, F: Flash, const B: usize> {
    media: &'r mut Media<'f, F, B>,
    hasher: &'r BlockHasher,
    status: &'r StatusArea,
    header: &'r StatusHeader,
}

impl<F: Flash, const B: usize> Recovery<'_, '_, F, B> {
    /// Scan boundaries from the top down; the first one consistent with both integrities wins.
    async fn locate(&mut self) -> Result<SwapState, Error> {
        let header = self.header;
        let count = header.block_count;
        let target = header.slot1_integrity;

        let mut acc = integrity::build(
            self.media,
            self.hasher,
            &header.skip,
            count,
            View::Incoming {
                swapped_below: count,
            },
        )
        .await?;

        let mut boundaries = header.skip.swapped(count).rev();
        let mut boundary = count;
        loop {
            if acc == target {
                match self.classify_at(boundary).await {
                    Ok(state) => return Ok(state),
                    Err(Error::IntegrityMismatch) => {
                        log::warn!(
                            "recovery: boundary {} inconsistent, continuing full scan",
                            boundary
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(index) = boundaries.next() else {
                break;
            };
            let slot0 = self.media.read_block(MemoryLocation::new(SLOT0, index)).await?;
            let slot1 = self.media.read_block(MemoryLocation::new(SLOT1, index)).await?;
            acc = integrity::replace(self.hasher, acc, index, &slot0, &slot1);
            boundary = index;
        }

        log::error!("recovery: no consistent interruption point");
        Err(Error::UnrecoverableSwap)
    }

    /// Decide the state given that B is intact in slot 0 below `boundary` and in slot 1 above.
    ///
    /// Then the block at `boundary` holds anything but B in slot 0 and is either untouched or
    /// within steps 1 and 2, and the swapped block right below it is either done or within
    /// steps 3 and 4. Both cannot be in transition at once.
    async fn classify_at(&mut self, boundary: u16) -> Result<SwapState, Error> {
        let count = self.header.block_count;
        let expected = self.header.slot0_integrity;
        let below = self.header.skip.swapped(boundary).next_back();
        let at = (boundary < count).then_some(boundary);

        let originals = integrity::build(
            self.media,
            self.hasher,
            &self.header.skip,
            count,
            View::Originals {
                swapped_below: boundary,
            },
        )
        .await?;
        if originals == expected {
            return Ok(match (below, at) {
                (_, None) => SwapState::Completing(Marker::Slot1),
                (None, Some(_)) => SwapState::PreparedOnly,
                (Some(_), Some(block)) => {
                    SwapState::Resuming(Position::new(block, Step::EraseSlot0))
                }
            });
        }

        // Block below the boundary lost its original in slot 1.
        if let Some(block) = below {
            if self.original_recoverable(block).await? {
                let slot1 = self.media.read_block(MemoryLocation::new(SLOT1, block)).await?;
                let step = if is_erased(&slot1) {
                    Step::WriteSlot1
                } else {
                    Step::EraseSlot1
                };
                return Ok(SwapState::Resuming(Position::new(block, step)));
            }
        }

        // Block at the boundary lost its original in slot 0.
        if let Some(block) = at {
            if self.original_recoverable(block).await? {
                let slot0 = self.media.read_block(MemoryLocation::new(SLOT0, block)).await?;
                let step = if is_erased(&slot0) {
                    Step::WriteSlot0
                } else {
                    Step::EraseSlot0
                };
                return Ok(SwapState::Resuming(Position::new(block, step)));
            }
        }

        Err(Error::IntegrityMismatch)
    }

    /// Whether parity restores the original of `block`, blocks below it being swapped.
    async fn original_recoverable(&mut self, block: u16) -> Result<bool, Error> {
        let parity = self.status.read_parity(self.media).await?;
        match parity
            .recover(
                self.media,
                self.hasher,
                &self.header.skip,
                self.header.block_count,
                block,
                self.header.slot0_integrity,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::ParityRecoveryImpossible) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
