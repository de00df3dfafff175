//! [`Flash`] over two `embedded-storage-async` NOR flash partitions, one per slot.

use core::num::NonZeroU16;

use embedded_storage_async::nor_flash::NorFlash;

use crate::{Error, Flash, MemoryLocation, SLOT0, SLOT1, Slot, log};

pub struct NorSlots<S0: NorFlash, S1: NorFlash> {
    slot0: S0,
    slot1: S1,
    block_size: usize,
    block_count: NonZeroU16,
}

impl<S0: NorFlash, S1: NorFlash> NorSlots<S0, S1> {
    /// The image spans all of `slot1`; `slot0` must hold as many blocks plus the status area.
    ///
    /// `block_size` must be a multiple of the erase size of both partitions, and both must
    /// support byte-granular reads.
    pub fn new(slot0: S0, slot1: S1, block_size: usize) -> Result<Self, Error> {
        let aligned = |erase_size: usize, write_size: usize| {
            erase_size > 0 && block_size % erase_size == 0 && block_size % write_size == 0
        };
        if block_size == 0
            || !aligned(S0::ERASE_SIZE, S0::WRITE_SIZE)
            || !aligned(S1::ERASE_SIZE, S1::WRITE_SIZE)
            || S0::READ_SIZE != 1
            || S1::READ_SIZE != 1
        {
            log::error!("nor: block size {} does not fit partitions", block_size);
            return Err(Error::Geometry);
        }

        let blocks = u16::try_from(slot1.capacity() / block_size).map_err(|_| Error::Geometry)?;
        let block_count = NonZeroU16::new(blocks).ok_or(Error::Geometry)?;

        Ok(Self {
            slot0,
            slot1,
            block_size,
            block_count,
        })
    }

    pub fn release(self) -> (S0, S1) {
        (self.slot0, self.slot1)
    }

    fn address(&self, location: MemoryLocation, offset: usize) -> Result<u32, Error> {
        u32::try_from(location.block as usize * self.block_size + offset)
            .map_err(|_| Error::FlashIo(location))
    }
}

impl<S0: NorFlash, S1: NorFlash> Flash for NorSlots<S0, S1> {
    async fn erase(&mut self, location: MemoryLocation) -> Result<(), Error> {
        let from = self.address(location, 0)?;
        let to = u32::try_from(self.block_size)
            .ok()
            .and_then(|size| from.checked_add(size))
            .ok_or(Error::FlashIo(location))?;
        let result = match location.slot {
            SLOT0 => self.slot0.erase(from, to).await.map_err(|_| ()),
            SLOT1 => self.slot1.erase(from, to).await.map_err(|_| ()),
            _ => Err(()),
        };
        result.map_err(|_| Error::FlashIo(location))
    }

    async fn write(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let address = self.address(location, offset)?;
        let result = match location.slot {
            SLOT0 => self.slot0.write(address, bytes).await.map_err(|_| ()),
            SLOT1 => self.slot1.write(address, bytes).await.map_err(|_| ()),
            _ => Err(()),
        };
        result.map_err(|_| Error::FlashIo(location))
    }

    async fn read(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &mut [u8],
    ) -> Result<(), Error> {
        let address = self.address(location, offset)?;
        let result = match location.slot {
            SLOT0 => self.slot0.read(address, bytes).await.map_err(|_| ()),
            SLOT1 => self.slot1.read(address, bytes).await.map_err(|_| ()),
            _ => Err(()),
        };
        result.map_err(|_| Error::FlashIo(location))
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> NonZeroU16 {
        self.block_count
    }

    fn write_size(&self) -> usize {
        S0::WRITE_SIZE.max(S1::WRITE_SIZE)
    }

    fn slot_capacity(&self, slot: Slot) -> u16 {
        let bytes = match slot {
            SLOT0 => self.slot0.capacity(),
            SLOT1 => self.slot1.capacity(),
            _ => 0,
        };
        u16::try_from(bytes / self.block_size).unwrap_or(u16::MAX)
    }
}
