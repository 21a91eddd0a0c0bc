//! NOR flash exposed as 512-byte blocks through a one-sector write-back cache.
//!
//! Flash can only be erased a whole sector at a time, so a 512-byte write
//! patches a RAM copy of its sector. The dirty sector is erased and
//! reprogrammed when another sector is written or on [`BlockDevice::sync_blocks`].

use embedded_storage::nor_flash::NorFlash;

use crate::block::{blocks_in, in_range, BlockDevice};
use crate::config::{BLOCK_SIZE, SECTOR_SIZE};

/// Error of the cached flash block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError<E> {
    /// The request reaches past the end of the flash.
    OutOfRange,
    /// The buffer is not a whole number of blocks.
    BadLength,
    /// The flash geometry cannot be cached with this sector size.
    Geometry,
    /// The flash driver failed.
    Device(E),
}

/// Block device over a [`NorFlash`], caching one erase sector of `SECTOR` bytes.
pub struct CachedFlash<F, const SECTOR: usize = SECTOR_SIZE> {
    flash: F,
    cache: [u8; SECTOR],
    /// Index of the sector held in `cache`.
    cached: Option<u32>,
    dirty: bool,
}

impl<F: NorFlash, const SECTOR: usize> CachedFlash<F, SECTOR> {
    pub fn new(flash: F) -> Result<Self, FlashError<F::Error>> {
        if F::ERASE_SIZE != SECTOR
            || SECTOR % BLOCK_SIZE != 0
            || BLOCK_SIZE % F::READ_SIZE != 0
            || BLOCK_SIZE % F::WRITE_SIZE != 0
        {
            return Err(FlashError::Geometry);
        }
        Ok(Self {
            flash,
            cache: [0xff; SECTOR],
            cached: None,
            dirty: false,
        })
    }

    /// Whether the cache holds writes not yet committed to flash.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    fn check(&self, lba: u32, len: usize) -> Result<(), FlashError<F::Error>> {
        let count = blocks_in(len).ok_or(FlashError::BadLength)?;
        if !in_range(lba, count, self.block_count()) {
            return Err(FlashError::OutOfRange);
        }
        Ok(())
    }

    /// Brings `sector` into the cache, committing the previous one first.
    fn load(&mut self, sector: u32) -> Result<(), FlashError<F::Error>> {
        if self.cached == Some(sector) {
            return Ok(());
        }
        self.commit()?;
        // Invalidate first so a failed read never leaves a half-loaded sector tagged as valid.
        self.cached = None;
        self.flash
            .read(sector * SECTOR as u32, &mut self.cache)
            .map_err(FlashError::Device)?;
        self.cached = Some(sector);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), FlashError<F::Error>> {
        let Some(sector) = self.cached else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let start = sector * SECTOR as u32;
        trace!("flash: committing sector {} at {:#x}", sector, start);
        self.flash
            .erase(start, start + SECTOR as u32)
            .map_err(FlashError::Device)?;
        self.flash.write(start, &self.cache).map_err(FlashError::Device)?;
        self.dirty = false;
        Ok(())
    }
}

impl<F: NorFlash, const SECTOR: usize> BlockDevice for CachedFlash<F, SECTOR> {
    type Error = FlashError<F::Error>;

    fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.check(lba, buf.len())?;
        for (i, block) in buf.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            let addr = (lba as usize + i) * BLOCK_SIZE;
            let sector = (addr / SECTOR) as u32;
            if self.cached == Some(sector) {
                let offset = addr % SECTOR;
                block.copy_from_slice(&self.cache[offset..offset + BLOCK_SIZE]);
            } else {
                self.flash
                    .read(addr as u32, block)
                    .map_err(FlashError::Device)?;
            }
        }
        Ok(())
    }

    fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<(), Self::Error> {
        self.check(lba, buf.len())?;
        for (i, block) in buf.chunks_exact(BLOCK_SIZE).enumerate() {
            let addr = (lba as usize + i) * BLOCK_SIZE;
            self.load((addr / SECTOR) as u32)?;
            let cached = &mut self.cache[addr % SECTOR..][..BLOCK_SIZE];
            if cached != block {
                cached.copy_from_slice(block);
                self.dirty = true;
            }
        }
        Ok(())
    }

    fn sync_blocks(&mut self) -> Result<(), Self::Error> {
        self.commit()
    }

    fn size(&self) -> u64 {
        self.flash.capacity() as u64
    }
}
