//! In-memory fakes shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::vec::Vec;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::block::BlockDevice;
use crate::msc::{ActivityLed, CacheControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFlashError(pub NorFlashErrorKind);

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

/// NOR flash in RAM: erase sets bytes to 0xff, programming can only clear bits.
pub struct MemFlash {
    mem: Vec<u8>,
    erases: Cell<usize>,
    fail_erase: Cell<bool>,
}

impl MemFlash {
    pub fn new(capacity: usize) -> Self {
        Self {
            mem: vec![0xff; capacity],
            erases: Cell::new(0),
            fail_erase: Cell::new(false),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.mem
    }

    pub fn erase_count(&self) -> usize {
        self.erases.get()
    }

    pub fn fail_erase(&self, fail: bool) {
        self.fail_erase.set(fail);
    }

    fn bounds(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, MemFlashError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.mem.len() {
            return Err(MemFlashError(NorFlashErrorKind::OutOfBounds));
        }
        Ok(start..end)
    }
}

impl ErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.bounds(offset, bytes.len())?;
        bytes.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if self.fail_erase.get() {
            return Err(MemFlashError(NorFlashErrorKind::Other));
        }
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(MemFlashError(NorFlashErrorKind::NotAligned));
        }
        let range = self.bounds(from, (to - from) as usize)?;
        self.mem[range].fill(0xff);
        self.erases.set(self.erases.get() + 1);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.bounds(offset, bytes.len())?;
        for (cell, byte) in self.mem[range].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamDiskError {
    OutOfRange,
    Injected,
}

/// Uncached block device in RAM, recording how often it was synced.
pub struct RamDisk {
    pub data: Vec<u8>,
    pub syncs: usize,
    pub fail_read: bool,
    pub fail_write: bool,
    pub fail_sync: bool,
    pub events: Option<Events>,
}

impl RamDisk {
    pub fn new(blocks: usize) -> Self {
        Self {
            data: vec![0; blocks * 512],
            syncs: 0,
            fail_read: false,
            fail_write: false,
            fail_sync: false,
            events: None,
        }
    }

    fn range(&self, lba: u32, len: usize) -> Result<core::ops::Range<usize>, RamDiskError> {
        let start = lba as usize * 512;
        if start + len > self.data.len() {
            return Err(RamDiskError::OutOfRange);
        }
        Ok(start..start + len)
    }
}

impl BlockDevice for RamDisk {
    type Error = RamDiskError;

    fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        if self.fail_read {
            return Err(RamDiskError::Injected);
        }
        let range = self.range(lba, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<(), Self::Error> {
        if self.fail_write {
            return Err(RamDiskError::Injected);
        }
        let range = self.range(lba, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync_blocks(&mut self) -> Result<(), Self::Error> {
        if let Some(events) = &self.events {
            events.push("sync");
        }
        if self.fail_sync {
            return Err(RamDiskError::Injected);
        }
        self.syncs += 1;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Ordered record of side effects, shared between instrumented fakes.
#[derive(Clone, Default)]
pub struct Events(Rc<RefCell<Vec<&'static str>>>);

impl Events {
    pub fn push(&self, event: &'static str) {
        self.0.borrow_mut().push(event);
    }

    pub fn take(&self) -> Vec<&'static str> {
        core::mem::take(&mut *self.0.borrow_mut())
    }
}

/// Filesystem cache stand-in counting invalidations.
#[derive(Default)]
pub struct FakeView {
    pub clears: usize,
    pub events: Option<Events>,
}

impl CacheControl for FakeView {
    fn cache_clear(&mut self) {
        self.clears += 1;
        if let Some(events) = &self.events {
            events.push("cache_clear");
        }
    }
}

/// Activity indicator remembering its state.
#[derive(Default)]
pub struct FakeLed {
    pub on: bool,
    pub events: Option<Events>,
}

impl ActivityLed for FakeLed {
    fn set_active(&mut self, on: bool) {
        self.on = on;
        if let Some(events) = &self.events {
            events.push(if on { "led_on" } else { "led_off" });
        }
    }
}

impl RamDisk {
    pub fn from_image(data: Vec<u8>) -> Self {
        assert_eq!(data.len() % 512, 0);
        Self {
            data,
            ..Self::new(0)
        }
    }
}

/// First block of the FAT partition in images built by [`fat_image`].
pub const PARTITION_START: usize = 63;

/// A disk image of `blocks` blocks: MBR with one FAT16 partition holding `files`.
pub fn fat_image(blocks: usize, files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::{Cursor, Write};

    let part_blocks = blocks - PARTITION_START;
    let mut part = Cursor::new(vec![0u8; part_blocks * 512]);
    fatfs::format_volume(
        &mut part,
        fatfs::FormatVolumeOptions::new()
            .fat_type(fatfs::FatType::Fat16)
            .bytes_per_cluster(512),
    )
    .unwrap();
    {
        let fs = fatfs::FileSystem::new(&mut part, fatfs::FsOptions::new()).unwrap();
        let root = fs.root_dir();
        for (name, content) in files {
            let mut file = root.create_file(name).unwrap();
            file.write_all(content).unwrap();
        }
    }

    let mut image = vec![0u8; blocks * 512];
    let entry = &mut image[446..462];
    entry[4] = 0x06; // FAT16
    entry[8..12].copy_from_slice(&(PARTITION_START as u32).to_le_bytes());
    entry[12..16].copy_from_slice(&(part_blocks as u32).to_le_bytes());
    image[510] = 0x55;
    image[511] = 0xaa;
    image[PARTITION_START * 512..].copy_from_slice(part.get_ref());
    image
}
