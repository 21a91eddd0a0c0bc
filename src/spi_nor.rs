//! `NorFlash` on top of the `spi-memory` driver for 25-series SPI flash chips.

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use spi_memory::series25::Flash;
use spi_memory::{BlockDevice as _, Read as _};

use crate::config::SECTOR_SIZE;
use crate::fmt::Debug2Format;

const PAGE_SIZE: usize = 256;

/// Used when the JEDEC ID does not encode a plausible capacity.
pub const FALLBACK_CAPACITY: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiNorError {
    OutOfBounds,
    NotAligned,
    /// The SPI bus or chip select failed, or the chip reported a bad status.
    Bus,
}

impl NorFlashError for SpiNorError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            SpiNorError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            SpiNorError::NotAligned => NorFlashErrorKind::NotAligned,
            SpiNorError::Bus => NorFlashErrorKind::Other,
        }
    }
}

/// A 25-series SPI NOR flash chip with 4 KiB sector erase.
pub struct SpiNor<SPI: Transfer<u8>, CS: OutputPin> {
    flash: Flash<SPI, CS>,
    capacity: usize,
}

impl<SPI, CS> SpiNor<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    SPI::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    /// Probes the chip and sizes it from its JEDEC ID.
    pub fn new(spi: SPI, cs: CS) -> Result<Self, SpiNorError> {
        let mut flash = Flash::init(spi, cs).map_err(|e| {
            error!("spi nor: init failed: {:?}", Debug2Format(&e));
            SpiNorError::Bus
        })?;
        let id = flash.read_jedec_id().map_err(|e| {
            error!("spi nor: JEDEC ID read failed: {:?}", Debug2Format(&e));
            SpiNorError::Bus
        })?;
        let capacity = match id.device_id() {
            [_, exp, ..] if (16..=28).contains(exp) => 1usize << *exp,
            _ => FALLBACK_CAPACITY,
        };
        info!(
            "spi nor: manufacturer {:02x}, {} bytes",
            id.mfr_code(),
            capacity
        );
        Ok(Self { flash, capacity })
    }

    fn bounds(&self, offset: u32, len: usize) -> Result<(), SpiNorError> {
        match (offset as usize).checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(SpiNorError::OutOfBounds),
        }
    }
}

impl<SPI: Transfer<u8>, CS: OutputPin> ErrorType for SpiNor<SPI, CS> {
    type Error = SpiNorError;
}

impl<SPI, CS> ReadNorFlash for SpiNor<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    SPI::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.bounds(offset, bytes.len())?;
        self.flash.read(offset, bytes).map_err(|e| {
            error!("spi nor: read at {:#x} failed: {:?}", offset, Debug2Format(&e));
            SpiNorError::Bus
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<SPI, CS> NorFlash for SpiNor<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    SPI::Error: core::fmt::Debug,
    CS::Error: core::fmt::Debug,
{
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % SECTOR_SIZE as u32 != 0 || to % SECTOR_SIZE as u32 != 0 || to < from {
            return Err(SpiNorError::NotAligned);
        }
        self.bounds(from, (to - from) as usize)?;
        let sectors = ((to - from) as usize) / SECTOR_SIZE;
        self.flash.erase_sectors(from, sectors).map_err(|e| {
            error!("spi nor: erase at {:#x} failed: {:?}", from, Debug2Format(&e));
            SpiNorError::Bus
        })
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.bounds(offset, bytes.len())?;
        // The driver takes a mutable buffer; program page by page from a stack copy.
        let mut page = [0u8; PAGE_SIZE];
        let mut addr = offset;
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = PAGE_SIZE - addr as usize % PAGE_SIZE;
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            let staged = &mut page[..chunk.len()];
            staged.copy_from_slice(chunk);
            self.flash.write_bytes(addr, staged).map_err(|e| {
                error!("spi nor: program at {:#x} failed: {:?}", addr, Debug2Format(&e));
                SpiNorError::Bus
            })?;
            addr += chunk.len() as u32;
            rest = tail;
        }
        Ok(())
    }
}
