//! Crash-consistent swap of two firmware slots with a minimum of status writes.
//!
//! Instead of recording progress after every block, the swap persists a single status record
//! up front (keyed rolling integrities of both slots, a parity block and a skip bitmap) and two
//! completion markers at the very end. Any interruption in between is recovered by inspecting
//! the flash contents themselves, see [`swap::recovery`].
#![no_std]

use core::num::NonZeroU16;

pub mod config;
pub mod hash;
pub mod integrity;
pub mod media;
pub mod nor;
pub mod parity;
pub mod skip;
pub mod status;
pub mod swap;

pub use config::Config;
pub use swap::{Marker, Position, Step, SwapEngine, SwapState};

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(not(feature = "defmt"))]
pub(crate) mod log {
    macro_rules! trace {
        ( $( $x:expr ),* ) => { $( let _ = &$x; )* };
    }
    pub(crate) use trace;
    macro_rules! debug {
        ( $( $x:expr ),* ) => { $( let _ = &$x; )* };
    }
    pub(crate) use debug;
    macro_rules! info {
        ( $( $x:expr ),* ) => { $( let _ = &$x; )* };
    }
    pub(crate) use info;
    macro_rules! warner {
        ( $( $x:expr ),* ) => { $( let _ = &$x; )* };
    }
    pub(crate) use warner as warn;
    macro_rules! error {
        ( $( $x:expr ),* ) => { $( let _ = &$x; )* };
    }
    pub(crate) use error;
}

/// Value every byte of a block reads as after an erase.
pub const ERASED: u8 = 0xFF;

/// Largest number of data blocks an image may span.
pub const MAX_BLOCKS: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The driver failed an erase, write or read at this location, retries included.
    #[error("flash i/o failed at slot {} block {}", .0.slot.0, .0.block)]
    FlashIo(MemoryLocation),
    /// Recomputed rolling integrity did not converge to the persisted value.
    #[error("rolling integrity mismatch")]
    IntegrityMismatch,
    /// No interruption point is consistent with the flash contents; the swap is refused.
    #[error("swap cannot be recovered")]
    UnrecoverableSwap,
    /// More than one original slot 0 block is missing or damaged.
    #[error("parity cannot reconstruct block")]
    ParityRecoveryImpossible,
    /// Status area magic, version or seal does not match.
    #[error("corrupt status area")]
    CorruptStatusArea,
    /// Flash geometry does not fit the engine or the persisted status area.
    #[error("unsupported flash geometry")]
    Geometry,
}

/// Flash holding both slots, as seen by the swap engine.
///
/// All operations must be safe to retry after an interruption:
/// erasing an erased block or writing identical bytes again leaves the block unchanged.
#[allow(async_fn_in_trait)]
pub trait Flash {
    /// Erase a whole block.
    async fn erase(&mut self, location: MemoryLocation) -> Result<(), Error>;

    /// Program `bytes` at `offset` within a block.
    ///
    /// Offset and length are multiples of [`Flash::write_size`].
    async fn write(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), Error>;

    /// Read `bytes.len()` bytes at `offset` within a block, whatever state the block is in.
    async fn read(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &mut [u8],
    ) -> Result<(), Error>;

    /// Size in bytes of the erase unit that the engine swaps as a whole.
    fn block_size(&self) -> usize;

    /// Number of image blocks, which is also the size of slot 1.
    ///
    /// Slot 0 additionally needs room for the status area, see [`status::Layout`].
    fn block_count(&self) -> NonZeroU16;

    /// Write granularity in bytes.
    fn write_size(&self) -> usize;

    /// Number of blocks physically available in `slot`.
    fn slot_capacity(&self, slot: Slot) -> u16;
}

/// Image slot with regards to the swap.
///
/// Slot 0 holds the running image and the status area, slot 1 the candidate image.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot(pub u8);

pub const SLOT0: Slot = Slot(0);
pub const SLOT1: Slot = Slot(1);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryLocation {
    pub slot: Slot,
    pub block: u16,
}

impl MemoryLocation {
    pub const fn new(slot: Slot, block: u16) -> Self {
        Self { slot, block }
    }
}

/// Contents of one block.
pub type BlockBuf<const B: usize> = [u8; B];

pub(crate) fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == ERASED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn error_messages() {
        let error = Error::FlashIo(MemoryLocation::new(SLOT1, 7));
        assert_eq!(error.to_string(), "flash i/o failed at slot 1 block 7");
        assert_eq!(Error::Geometry.to_string(), "unsupported flash geometry");

        let source: &dyn core::error::Error = &Error::UnrecoverableSwap;
        assert_eq!(source.to_string(), "swap cannot be recovered");
    }
}
