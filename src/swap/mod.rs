//! The swap engine: preparation, the per-block exchange loop and recovery after a reset.
//!
//! A swap goes through `NotStarted -> Prepared -> Swapping(block, step) -> Completing -> Done`.
//! Only the transition out of `NotStarted` (the status area commit) and the two completion
//! markers are persisted. Everything in between is reconstructed from the flash contents by
//! [`recovery::classify`] on every boot, so [`SwapEngine::perform_swap`] can be invoked again
//! after an interruption at any point.

use crate::{
    Config, Error, Flash, SLOT0, SLOT1, integrity, log,
    hash::BlockHasher,
    media::{Media, View},
    parity::Parity,
    skip::SkipBitmap,
    status::{Layout, StatusArea, StatusHeader},
};

pub use crate::status::Marker;

pub mod executor;
pub mod recovery;

/// One of the four physical operations exchanging a block, in execution order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    EraseSlot0,
    /// Program slot 0 with the incoming ("B") contents.
    WriteSlot0,
    EraseSlot1,
    /// Program slot 1 with the original ("A") contents.
    WriteSlot1,
}

/// Next operation to execute.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Position {
    pub block: u16,
    pub step: Step,
}

impl Position {
    pub const fn new(block: u16, step: Step) -> Self {
        Self { block, step }
    }
}

/// Progress of a swap as derived from flash contents.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapState {
    /// No valid status area; both slots hold their pre-swap images.
    NotStarted,
    /// Status area committed, no block touched yet.
    PreparedOnly,
    /// Interrupted within the block exchange loop.
    Resuming(Position),
    /// All blocks exchanged; this marker and the ones after it are still missing.
    Completing(Marker),
    Done,
}

pub struct SwapEngine<'f, F: Flash, const B: usize> {
    media: Media<'f, F, B>,
    hasher: BlockHasher,
    status: StatusArea,
}

impl<'f, F: Flash, const B: usize> SwapEngine<'f, F, B> {
    pub fn new(flash: &'f mut F, config: &Config) -> Result<Self, Error> {
        if flash.block_size() != B {
            return Err(Error::Geometry);
        }

        let count = flash.block_count().get();
        let layout = Layout::new(count, B, flash.write_size())?;
        if flash.slot_capacity(SLOT0) < layout.slot0_blocks()
            || flash.slot_capacity(SLOT1) < count
        {
            log::error!(
                "swap: slot 0 needs {} blocks, slot 1 needs {}",
                layout.slot0_blocks(),
                count
            );
            return Err(Error::Geometry);
        }

        Ok(Self {
            media: Media::new(flash, config.retries),
            hasher: BlockHasher::new(config.key),
            status: StatusArea::new(layout),
        })
    }

    /// Bring a pending swap to completion, wherever a previous boot left it.
    ///
    /// Returns `Ok(())` once the swap is done, which is immediate if it already was.
    /// An error aborts the swap for this boot; flash is left in a state the next call recovers
    /// from, or untouched if no consistent state could be established.
    pub async fn perform_swap(&mut self) -> Result<(), Error> {
        let state = self.classify().await?;
        log::info!("swap: {}", state);

        let result = self.resume(state).await;
        if let Err(e) = result {
            log::error!("swap: aborted ({})", e);
        }
        result
    }

    /// Determine how far the swap got, from the status area and the slot contents alone.
    pub async fn classify(&mut self) -> Result<SwapState, Error> {
        recovery::classify(&mut self.media, &self.hasher, &self.status).await
    }

    /// Continue the swap from `state` until it is done.
    pub async fn resume(&mut self, state: SwapState) -> Result<(), Error> {
        let (header, from) = match state {
            SwapState::Done => return Ok(()),
            SwapState::Completing(marker) => {
                return executor::complete(&mut self.media, &self.status, marker).await;
            }
            SwapState::NotStarted => (self.prepare().await?, None),
            SwapState::PreparedOnly => (self.read_header().await?, None),
            SwapState::Resuming(position) => (self.read_header().await?, Some(position)),
        };

        let mut executor =
            executor::Executor::new(&mut self.media, &self.hasher, &self.status, &header);
        executor.run(from).await?;
        executor::complete(&mut self.media, &self.status, Marker::Slot1).await
    }

    /// Invalidate the status area so the next [`Self::perform_swap`] starts a new swap.
    ///
    /// Swapping is its own inverse, so this is also how a swap is reverted.
    pub async fn request_swap(&mut self) -> Result<(), Error> {
        log::info!("swap: requested");
        self.status.invalidate(&mut self.media).await
    }

    /// Compute skip bitmap, integrities and parity of the untouched slots and commit them.
    async fn prepare(&mut self) -> Result<StatusHeader, Error> {
        let count = self.status.layout().count();
        let media = &mut self.media;

        let skip = SkipBitmap::build(media, count).await?;
        let slot0 = integrity::build(media, &self.hasher, &skip, count, View::Slot(SLOT0)).await?;
        let slot1 = integrity::build(media, &self.hasher, &skip, count, View::Slot(SLOT1)).await?;
        let parity = Parity::<B>::build(media, &skip, count).await?;

        log::info!(
            "swap: prepared {} blocks, {} skipped",
            count,
            skip.skipped_count(count)
        );

        let header = StatusHeader::new(B, count, slot0, slot1, skip);
        self.status
            .commit(media, &self.hasher, &header, &parity)
            .await?;
        Ok(header)
    }

    async fn read_header(&mut self) -> Result<StatusHeader, Error> {
        self.status.read_header(&mut self.media, &self.hasher).await
    }
}
