//! Simulated flash for tests.
//!
//! Programming ANDs bits into the block like NOR flash does, so writing identical bytes twice
//! is harmless. A power cut can be scheduled at any erase or write; the cut operation has either
//! no effect or is torn halfway, and every operation after it fails until [`MockFlash::power_on`].

use core::num::NonZeroU16;
use std::{collections::BTreeMap, vec, vec::Vec};

use crate::{ERASED, Error, Flash, MemoryLocation, SLOT0, SLOT1, Slot};

/// Spare slot 0 blocks beyond the image, enough for the status area of the test geometries.
const SPARE_BLOCKS: u16 = 16;

/// Contents standing for image block `id`.
///
/// Every byte depends on its offset, so no block is uniform or erased and blocks with different
/// ids differ in every byte.
pub fn pattern<const B: usize>(id: u8) -> [u8; B] {
    core::array::from_fn(|i| id ^ (i as u8).wrapping_mul(0x1d) ^ (i >> 8) as u8)
}

#[derive(Debug)]
pub struct WearTracker(BTreeMap<MemoryLocation, usize>);

impl WearTracker {
    pub const fn new() -> Self {
        WearTracker(BTreeMap::new())
    }

    pub fn increase(&mut self, addr: MemoryLocation) {
        if let Some(wear) = self.0.get_mut(&addr) {
            *wear += 1;
        } else {
            self.0.insert(addr, 1);
        }
    }

    pub fn count(&self, addr: MemoryLocation) -> usize {
        self.0.get(&addr).copied().unwrap_or(0)
    }

    /// Check wear on all blocks of slot below `below` for worst wear.
    pub fn check_slot(&self, slot: Slot, below: u16, wear_level: usize) -> bool {
        self.0
            .iter()
            .filter(|(addr, _)| addr.slot == slot && addr.block < below)
            .all(|(_, v)| *v <= wear_level)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    Erase(MemoryLocation),
    Write(MemoryLocation),
}

/// When to cut power.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cut {
    /// After this many erase/write operations have completed.
    After(usize),
    /// Right at this operation.
    At(Op),
}

/// How much of the cut operation reaches the flash.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tear {
    None,
    Half,
}

pub struct MockFlash<const B: usize> {
    slots: [Vec<[u8; B]>; 2],
    count: NonZeroU16,
    write_size: usize,
    pub wear: WearTracker,
    ops: usize,
    cut: Option<(Cut, Tear)>,
    powered: bool,
    failures: usize,
}

impl<const B: usize> MockFlash<B> {
    /// Every image block holds the [`pattern`] of the corresponding id.
    pub fn with_images(slot0: &[u8], slot1: &[u8]) -> Self {
        assert_eq!(slot0.len(), slot1.len());
        let count = slot1.len() as u16;

        let mut primary: Vec<[u8; B]> = slot0.iter().map(|id| pattern(*id)).collect();
        primary.extend(vec![[ERASED; B]; SPARE_BLOCKS as usize]);
        let secondary = slot1.iter().map(|id| pattern(*id)).collect();

        Self {
            slots: [primary, secondary],
            count: NonZeroU16::new(count).unwrap(),
            write_size: 8,
            wear: WearTracker::new(),
            ops: 0,
            cut: None,
            powered: true,
            failures: 0,
        }
    }

    pub fn set_write_size(&mut self, write_size: usize) {
        self.write_size = write_size;
    }

    pub fn set_slot0_capacity(&mut self, blocks: u16) {
        self.slots[0].resize(blocks as usize, [ERASED; B]);
    }

    pub fn block(&self, slot: Slot, index: u16) -> [u8; B] {
        self.slots[slot.0 as usize][index as usize]
    }

    pub fn set_block(&mut self, slot: Slot, index: u16, contents: [u8; B]) {
        self.slots[slot.0 as usize][index as usize] = contents;
    }

    /// Image blocks of a slot, without the status area.
    pub fn image(&self, slot: Slot) -> Vec<[u8; B]> {
        self.slots[slot.0 as usize][..self.count.get() as usize].to_vec()
    }

    /// Completed erase and write operations.
    pub fn ops(&self) -> usize {
        self.ops
    }

    pub fn cut(&mut self, cut: Cut, tear: Tear) {
        self.cut = Some((cut, tear));
    }

    /// Make the next `n` operations fail without effect, power stays on.
    pub fn fail_next(&mut self, n: usize) {
        self.failures = n;
    }

    pub fn power_on(&mut self) {
        self.powered = true;
        self.cut = None;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    fn check(&mut self, location: MemoryLocation) -> Result<(), Error> {
        if !self.powered {
            return Err(Error::FlashIo(location));
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(Error::FlashIo(location));
        }
        if (location.slot != SLOT0 && location.slot != SLOT1)
            || location.block as usize >= self.slots[location.slot.0 as usize].len()
        {
            return Err(Error::FlashIo(location));
        }
        Ok(())
    }

    /// Admit a mutating operation, returning the tear if power is cut right now.
    fn admit(&mut self, op: Op) -> Option<Tear> {
        let hit = match self.cut {
            Some((Cut::After(n), tear)) if n == self.ops => Some(tear),
            Some((Cut::At(at), tear)) if at == op => Some(tear),
            _ => None,
        };
        match hit {
            Some(tear) => {
                self.powered = false;
                Some(tear)
            }
            None => {
                self.ops += 1;
                None
            }
        }
    }

    fn block_mut(&mut self, location: MemoryLocation) -> &mut [u8; B] {
        &mut self.slots[location.slot.0 as usize][location.block as usize]
    }
}

impl<const B: usize> Flash for MockFlash<B> {
    async fn erase(&mut self, location: MemoryLocation) -> Result<(), Error> {
        self.check(location)?;
        let tear = self.admit(Op::Erase(location));
        if tear != Some(Tear::None) {
            self.wear.increase(location);
        }

        let block = self.block_mut(location);
        match tear {
            None => block.fill(ERASED),
            Some(Tear::Half) => block[..B / 2].fill(ERASED),
            Some(Tear::None) => {}
        }

        match tear {
            None => Ok(()),
            Some(_) => Err(Error::FlashIo(location)),
        }
    }

    async fn write(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), Error> {
        assert_eq!(offset % self.write_size, 0, "unaligned write offset");
        assert_eq!(bytes.len() % self.write_size, 0, "unaligned write length");
        assert!(offset + bytes.len() <= B, "write crosses block end");

        self.check(location)?;
        let tear = self.admit(Op::Write(location));
        let len = match tear {
            None => bytes.len(),
            Some(Tear::Half) => bytes.len() / 2,
            Some(Tear::None) => 0,
        };

        let block = self.block_mut(location);
        for (dst, src) in block[offset..offset + len].iter_mut().zip(bytes) {
            *dst &= *src;
        }

        match tear {
            None => Ok(()),
            Some(_) => Err(Error::FlashIo(location)),
        }
    }

    async fn read(
        &mut self,
        location: MemoryLocation,
        offset: usize,
        bytes: &mut [u8],
    ) -> Result<(), Error> {
        self.check(location)?;
        let block = &self.slots[location.slot.0 as usize][location.block as usize];
        bytes.copy_from_slice(&block[offset..offset + bytes.len()]);
        Ok(())
    }

    fn block_size(&self) -> usize {
        B
    }

    fn block_count(&self) -> NonZeroU16 {
        self.count
    }

    fn write_size(&self) -> usize {
        self.write_size
    }

    fn slot_capacity(&self, slot: Slot) -> u16 {
        self.slots
            .get(slot.0 as usize)
            .map_or(0, |blocks| blocks.len() as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_only_clear_bits() {
        let mut flash = MockFlash::<16>::with_images(&[0xf0], &[0x00]);
        let location = MemoryLocation::new(SLOT0, 0);
        let before = flash.block(SLOT0, 0);

        embassy_futures::block_on(async {
            flash.write(location, 0, &[0x0f; 8]).await.unwrap();
        });
        let after = flash.block(SLOT0, 0);
        for (a, b) in after[..8].iter().zip(&before[..8]) {
            assert_eq!(*a, b & 0x0f);
        }
        assert_eq!(after[8..], before[8..]);
    }

    #[test]
    fn pattern_varies_with_offset() {
        let block = pattern::<64>(0x02);
        assert!(block.windows(2).all(|w| w[0] != w[1]));
        assert!(pattern::<64>(0x02).iter().zip(&pattern::<64>(0x03)).all(|(a, b)| a != b));
    }

    #[test]
    fn torn_erase_then_dead() {
        let mut flash = MockFlash::<16>::with_images(&[0x12], &[0x34]);
        let location = MemoryLocation::new(SLOT1, 0);
        flash.cut(Cut::At(Op::Erase(location)), Tear::Half);

        embassy_futures::block_on(async {
            assert!(flash.erase(location).await.is_err());
            assert!(flash.read(location, 0, &mut [0; 4]).await.is_err());
        });

        let block = flash.block(SLOT1, 0);
        assert_eq!(block[..8], [ERASED; 8]);
        assert_eq!(block[8..], pattern::<16>(0x34)[8..]);
        assert_eq!(flash.ops(), 0);
        assert!(!flash.is_powered());

        flash.power_on();
        embassy_futures::block_on(async {
            flash.erase(location).await.unwrap();
        });
        assert_eq!(flash.block(SLOT1, 0), [ERASED; 16]);
        assert_eq!(flash.wear.count(location), 2);
    }
}
