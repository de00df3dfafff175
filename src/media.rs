//! Flash access with bounded retries, and views locating original or incoming image contents.

use crate::{BlockBuf, Error, Flash, MemoryLocation, SLOT0, SLOT1, Slot, log};

/// Where the contents of one image live while a swap is in progress.
///
/// Blocks below `swapped_below` have been exchanged, blocks at or above it not yet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum View {
    /// Physical contents of a slot.
    Slot(Slot),
    /// Pre-swap slot 0 contents ("A"): in slot 1 once swapped, in slot 0 otherwise.
    Originals { swapped_below: u16 },
    /// Pre-swap slot 1 contents ("B"): in slot 0 once swapped, in slot 1 otherwise.
    Incoming { swapped_below: u16 },
}

impl View {
    pub const fn locate(&self, index: u16) -> MemoryLocation {
        let slot = match *self {
            View::Slot(slot) => slot,
            View::Originals { swapped_below } => {
                if index < swapped_below {
                    SLOT1
                } else {
                    SLOT0
                }
            }
            View::Incoming { swapped_below } => {
                if index < swapped_below {
                    SLOT0
                } else {
                    SLOT1
                }
            }
        };
        MemoryLocation::new(slot, index)
    }
}

pub struct Media<'f, F: Flash, const B: usize> {
    flash: &'f mut F,
    retries: u8,
}

impl<'f, F: Flash, const B: usize> Media<'f, F, B> {
    pub fn new(flash: &'f mut F, retries: u8) -> Self {
        Self { flash, retries }
    }

    pub async fn erase(&mut self, location: MemoryLocation) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            match self.flash.erase(location).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!("erase {} failed ({}), retry {}", location, e, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            match self.flash.write(location, offset, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!("write {} failed ({}), retry {}", location, e, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn read(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &mut [u8],
    ) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            match self.flash.read(location, offset, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!("read {} failed ({}), retry {}", location, e, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn read_block(&mut self, location: MemoryLocation) -> Result<BlockBuf<B>, Error> {
        let mut buf = [0u8; B];
        self.read(location, 0, &mut buf).await?;
        Ok(buf)
    }

    pub async fn read_view(&mut self, view: View, index: u16) -> Result<BlockBuf<B>, Error> {
        self.read_block(view.locate(index)).await
    }

    /// Replace a whole block: erase, then program.
    pub async fn program_block(
        &mut self,
        location: MemoryLocation,
        contents: &BlockBuf<B>,
    ) -> Result<(), Error> {
        self.erase(location).await?;
        self.write(location, 0, contents).await
    }
}
