//! Persisted status area in the trailing blocks of slot 0.
//!
//! Layout behind the `N` image blocks of slot 0:
//!
//! | block            | contents                                                   |
//! |------------------|------------------------------------------------------------|
//! | `N`              | parity block                                               |
//! | `N+1 ..`         | header: postcard encoded [`StatusHeader`] plus a keyed seal |
//! | (split only)     | slot 1 completion marker block, slot 0 completion marker block |
//!
//! With a small write granularity both completion markers are programmed incrementally into
//! the unused tail of the last header block (compact layout). Otherwise each marker gets a
//! block of its own, so either write can be retried independently (split layout).
//!
//! The header is the only record written before the swap starts; it is the commit point.

use serde::{Deserialize, Serialize};

use crate::{
    Error, Flash, MAX_BLOCKS, MemoryLocation, SLOT0, log,
    hash::{BlockHasher, DIGEST_LEN, Digest},
    media::Media,
    parity::Parity,
    skip::SkipBitmap,
};

pub const MAGIC: u32 = 0x7061_7273;
pub const VERSION: u8 = 1;

/// Bytes reserved for the header including its trailing seal.
pub const HEADER_LEN: usize = 160;

/// Unpadded length of a completion marker.
pub const MARKER_LEN: usize = 16;

const BODY_LEN: usize = HEADER_LEN - DIGEST_LEN;
const HEADER_BUF: usize = 512;

const MARKER_SLOT1: [u8; MARKER_LEN] = *b"copy-done:slot-1";
const MARKER_SLOT0: [u8; MARKER_LEN] = *b"copy-done:slot-0";

/// Completion marker, written slot 1 first, slot 0 second.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Marker {
    Slot1,
    Slot0,
}

impl Marker {
    const fn pattern(&self) -> &'static [u8; MARKER_LEN] {
        match self {
            Marker::Slot1 => &MARKER_SLOT1,
            Marker::Slot0 => &MARKER_SLOT0,
        }
    }
}

/// Where the status area lives for a given geometry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    count: u16,
    block_size: usize,
    marker_len: usize,
    header_len: usize,
    header_blocks: u16,
    compact: bool,
}

impl Layout {
    pub fn new(count: u16, block_size: usize, write_size: usize) -> Result<Self, Error> {
        if count as usize > MAX_BLOCKS || write_size == 0 || block_size % write_size != 0 {
            return Err(Error::Geometry);
        }

        let marker_len = MARKER_LEN.next_multiple_of(write_size);
        let header_len = HEADER_LEN.next_multiple_of(write_size);
        if marker_len > block_size || header_len > HEADER_BUF {
            return Err(Error::Geometry);
        }

        let header_blocks = header_len.div_ceil(block_size);
        let tail = header_blocks * block_size - header_len;
        let compact = 2 * marker_len <= block_size && tail >= 2 * marker_len;

        Ok(Self {
            count,
            block_size,
            marker_len,
            header_len,
            header_blocks: header_blocks as u16,
            compact,
        })
    }

    /// Number of image blocks.
    pub const fn count(&self) -> u16 {
        self.count
    }

    pub const fn is_compact(&self) -> bool {
        self.compact
    }

    pub const fn parity(&self) -> MemoryLocation {
        MemoryLocation::new(SLOT0, self.count)
    }

    pub const fn header_block(&self, n: u16) -> MemoryLocation {
        MemoryLocation::new(SLOT0, self.count + 1 + n)
    }

    /// Block and offset of a completion marker.
    pub const fn marker(&self, marker: Marker) -> (MemoryLocation, usize) {
        let first_free = self.count + 1 + self.header_blocks;
        if self.compact {
            let last = self.header_block(self.header_blocks - 1);
            let offset = match marker {
                Marker::Slot1 => self.block_size - 2 * self.marker_len,
                Marker::Slot0 => self.block_size - self.marker_len,
            };
            (last, offset)
        } else {
            let block = match marker {
                Marker::Slot1 => first_free,
                Marker::Slot0 => first_free + 1,
            };
            (MemoryLocation::new(SLOT0, block), 0)
        }
    }

    /// Blocks slot 0 must provide: image, parity, header and marker blocks.
    pub const fn slot0_blocks(&self) -> u16 {
        let markers = if self.compact { 0 } else { 2 };
        self.count + 1 + self.header_blocks + markers
    }
}

/// Persisted description of a prepared swap.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusHeader {
    magic: u32,
    version: u8,
    pub block_size: u32,
    pub block_count: u16,
    /// Rolling integrity of slot 0 before the swap ("A" contents).
    pub slot0_integrity: Digest,
    /// Rolling integrity of slot 1 before the swap ("B" contents).
    pub slot1_integrity: Digest,
    pub skip: SkipBitmap,
}

impl StatusHeader {
    pub fn new(
        block_size: usize,
        block_count: u16,
        slot0_integrity: Digest,
        slot1_integrity: Digest,
        skip: SkipBitmap,
    ) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            block_size: block_size as u32,
            block_count,
            slot0_integrity,
            slot1_integrity,
            skip,
        }
    }

    /// Encode into `buf`, `HEADER_LEN` bytes: body padded with erased bytes, then the seal.
    pub fn encode(&self, hasher: &BlockHasher, buf: &mut [u8; HEADER_LEN]) -> Result<(), Error> {
        buf.fill(crate::ERASED);
        let (body, seal) = buf.split_at_mut(BODY_LEN);
        postcard::to_slice(self, body).map_err(|_| Error::Geometry)?;
        seal.copy_from_slice(&hasher.seal(body).0);
        Ok(())
    }

    pub fn decode(hasher: &BlockHasher, buf: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        let (body, seal) = buf.split_at(BODY_LEN);
        if hasher.seal(body).0.as_slice() != seal {
            return Err(Error::CorruptStatusArea);
        }

        let (header, _) = postcard::take_from_bytes::<StatusHeader>(body)
            .map_err(|_| Error::CorruptStatusArea)?;
        if header.magic != MAGIC || header.version != VERSION {
            return Err(Error::CorruptStatusArea);
        }
        Ok(header)
    }
}

pub struct StatusArea {
    layout: Layout,
}

impl StatusArea {
    pub const fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    pub async fn read_header<F: Flash, const B: usize>(
        &self,
        media: &mut Media<'_, F, B>,
        hasher: &BlockHasher,
    ) -> Result<StatusHeader, Error> {
        let mut buf = [0u8; HEADER_LEN];
        for (n, chunk) in buf.chunks_mut(B).enumerate() {
            media
                .read(self.layout.header_block(n as u16), 0, chunk)
                .await?;
        }
        StatusHeader::decode(hasher, &buf)
    }

    pub async fn read_parity<F: Flash, const B: usize>(
        &self,
        media: &mut Media<'_, F, B>,
    ) -> Result<Parity<B>, Error> {
        Ok(Parity::from_bytes(
            media.read_block(self.layout.parity()).await?,
        ))
    }

    /// Persist a freshly prepared swap.
    ///
    /// Any earlier status is invalidated first; the header is written last.
    pub async fn commit<F: Flash, const B: usize>(
        &self,
        media: &mut Media<'_, F, B>,
        hasher: &BlockHasher,
        header: &StatusHeader,
        parity: &Parity<B>,
    ) -> Result<(), Error> {
        let mut encoded = [0u8; HEADER_LEN];
        header.encode(hasher, &mut encoded)?;

        self.invalidate(media).await?;
        if !self.layout.compact {
            for marker in [Marker::Slot1, Marker::Slot0] {
                media.erase(self.layout.marker(marker).0).await?;
            }
        }
        media
            .program_block(self.layout.parity(), parity.as_bytes())
            .await?;

        let mut buf = [crate::ERASED; HEADER_BUF];
        buf[..HEADER_LEN].copy_from_slice(&encoded);
        for (n, chunk) in buf[..self.layout.header_len].chunks(B).enumerate() {
            media
                .write(self.layout.header_block(n as u16), 0, chunk)
                .await?;
        }

        log::debug!("status: committed");
        Ok(())
    }

    /// Erase the header so the next boot sees no swap in progress.
    pub async fn invalidate<F: Flash, const B: usize>(
        &self,
        media: &mut Media<'_, F, B>,
    ) -> Result<(), Error> {
        for n in 0..self.layout.header_blocks {
            media.erase(self.layout.header_block(n)).await?;
        }
        Ok(())
    }

    pub async fn marker_present<F: Flash, const B: usize>(
        &self,
        media: &mut Media<'_, F, B>,
        marker: Marker,
    ) -> Result<bool, Error> {
        let (location, offset) = self.layout.marker(marker);
        let mut buf = [0u8; B];
        let buf = &mut buf[..self.layout.marker_len];
        media.read(location, offset, buf).await?;

        Ok(buf
            .iter()
            .zip(marker.pattern().iter().cycle())
            .all(|(a, b)| a == b))
    }

    pub async fn write_marker<F: Flash, const B: usize>(
        &self,
        media: &mut Media<'_, F, B>,
        marker: Marker,
    ) -> Result<(), Error> {
        let (location, offset) = self.layout.marker(marker);
        let mut buf = [0u8; B];
        let buf = &mut buf[..self.layout.marker_len];
        for (dst, src) in buf.iter_mut().zip(marker.pattern().iter().cycle()) {
            *dst = *src;
        }

        log::info!("status: writing {} marker", marker);
        media.write(location, offset, buf).await
    }
}
