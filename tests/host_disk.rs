//! The whole stack on the host: RAM NOR flash, sector cache, bridge, SCSI
//! disk and the firmware's FAT listing.

use std::cell::RefCell;
use std::io::{Cursor, Write};

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use flash_msc::config::IDENTITY;
use flash_msc::scsi::Step;
use flash_msc::{
    list_files, Bridge, BlockDevice, CachedFlash, FatView, FixedTime, MscError, MscHandler,
    ScsiDisk,
};

#[derive(Debug)]
struct RamNorError;

impl NorFlashError for RamNorError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::OutOfBounds
    }
}

struct RamNor(Vec<u8>);

impl ErrorType for RamNor {
    type Error = RamNorError;
}

impl ReadNorFlash for RamNor {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), RamNorError> {
        let start = offset as usize;
        let src = self.0.get(start..start + bytes.len()).ok_or(RamNorError)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.0.len()
    }
}

impl NorFlash for RamNor {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), RamNorError> {
        self.0
            .get_mut(from as usize..to as usize)
            .ok_or(RamNorError)?
            .fill(0xff);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), RamNorError> {
        let start = offset as usize;
        let dst = self.0.get_mut(start..start + bytes.len()).ok_or(RamNorError)?;
        for (cell, byte) in dst.iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

fn erased_flash(bytes: usize) -> CachedFlash<RamNor> {
    CachedFlash::new(RamNor(vec![0xff; bytes])).unwrap()
}

/// MBR + FAT16 partition image, as a host would lay it out.
fn fat_image(blocks: usize, files: &[(&str, &[u8])]) -> Vec<u8> {
    const START: usize = 63;
    let mut part = Cursor::new(vec![0u8; (blocks - START) * 512]);
    fatfs::format_volume(
        &mut part,
        fatfs::FormatVolumeOptions::new()
            .fat_type(fatfs::FatType::Fat16)
            .bytes_per_cluster(512),
    )
    .unwrap();
    {
        let fs = fatfs::FileSystem::new(&mut part, fatfs::FsOptions::new()).unwrap();
        for (name, content) in files {
            fs.root_dir()
                .create_file(name)
                .unwrap()
                .write_all(content)
                .unwrap();
        }
    }
    let mut image = vec![0u8; blocks * 512];
    image[446 + 4] = 0x06;
    image[446 + 8..446 + 12].copy_from_slice(&(START as u32).to_le_bytes());
    image[446 + 12..446 + 16].copy_from_slice(&((blocks - START) as u32).to_le_bytes());
    image[510] = 0x55;
    image[511] = 0xaa;
    image[START * 512..].copy_from_slice(part.get_ref());
    image
}

/// Writes `image` the way a host would: 4 KiB WRITE commands, then the flush.
fn host_copy<H: MscHandler>(bridge: &mut H, image: &[u8]) {
    for (i, chunk) in image.chunks(4096).enumerate() {
        assert_eq!(bridge.write((i * 8) as u32, chunk), Ok(chunk.len()));
    }
    bridge.flush().unwrap();
}

fn listing<D: BlockDevice>(view: &RefCell<FatView<'_, D>>) -> String {
    let mut out = String::new();
    list_files(&mut view.borrow_mut(), &mut out).unwrap();
    out
}

#[test]
fn one_mebibyte_disk_round_trip_and_ready_gate() {
    let device = RefCell::new(erased_flash(1024 * 1024));
    let view = RefCell::new(FatView::mount(&device, FixedTime));
    let mut bridge = Bridge::new(&device, &view, ());
    assert_eq!(bridge.block_count(), 2048);
    assert!(bridge.ready());

    assert_eq!(bridge.write(10, &[0xaa; 512]), Ok(512));
    let mut back = [0u8; 512];
    assert_eq!(bridge.read(10, &mut back), Ok(512));
    assert_eq!(back, [0xaa; 512]);

    assert!(!bridge.ready());
    assert!(bridge.ready());
}

#[test]
fn write_at_capacity_is_rejected_without_side_effects() {
    let device = RefCell::new(erased_flash(1024 * 1024));
    let view = RefCell::new(FatView::mount(&device, FixedTime));
    let mut bridge = Bridge::new(&device, &view, ());

    assert_eq!(bridge.write(2048, &[0; 512]), Err(MscError::OutOfRange));
    assert!(bridge.ready());
    bridge.flush().unwrap();

    let mut back = [0u8; 512];
    bridge.read(2047, &mut back).unwrap();
    assert_eq!(back, [0xff; 512]);
}

#[test]
fn unformatted_flash_still_serves_raw_blocks() {
    let device = RefCell::new(erased_flash(1024 * 1024));
    let view = RefCell::new(FatView::mount(&device, FixedTime));
    assert!(!view.borrow().formatted());

    let mut bridge = Bridge::new(&device, &view, ());
    let pattern: Vec<u8> = (0..1024).map(|i| i as u8).collect();
    bridge.write(100, &pattern).unwrap();
    bridge.flush().unwrap();
    let mut back = vec![0u8; 1024];
    bridge.read(100, &mut back).unwrap();
    assert_eq!(back, pattern);
}

#[test]
fn listing_follows_host_writes_after_flush() {
    const BYTES: usize = 4 * 1024 * 1024;
    let device = RefCell::new(erased_flash(BYTES));
    let view = RefCell::new(FatView::mount(&device, FixedTime));
    let mut bridge = Bridge::new(&device, &view, ());

    // The host formats the disk and drops a file on it.
    host_copy(
        &mut bridge,
        &fat_image(BYTES / 512, &[("HELLO.TXT", b"hello from the host")]),
    );
    assert!(!bridge.ready());
    assert_eq!(
        listing(&view),
        "Content for file 'HELLO.TXT':\nhello from the host\n\n"
    );

    // The host rewrites the volume with different content.
    host_copy(
        &mut bridge,
        &fat_image(
            BYTES / 512,
            &[("HELLO.TXT", b"changed"), ("NOTES.TXT", b"second file")],
        ),
    );
    assert_eq!(
        listing(&view),
        "Content for file 'HELLO.TXT':\nchanged\n\nContent for file 'NOTES.TXT':\nsecond file\n\n"
    );
}

#[test]
fn scsi_disk_over_cached_flash() {
    let device = RefCell::new(erased_flash(1024 * 1024));
    let view = RefCell::new(FatView::mount(&device, FixedTime));
    let mut disk = ScsiDisk::new(Bridge::new(&device, &view, ()), IDENTITY);

    let data: Vec<u8> = (0..3 * 512).map(|i| (i % 13) as u8).collect();
    let mut pos = 0;
    let step = disk.write_step(5, 3, |buf| {
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        pos += n;
        Some(n)
    });
    assert_eq!(step, Step::Done);
    disk.service();
    assert!(!device.borrow().is_dirty());

    let mut back = Vec::new();
    let step = disk.read_step(5, 3, |chunk| {
        back.extend_from_slice(chunk);
        Some(chunk.len())
    });
    assert_eq!(step, Step::Done);
    assert_eq!(back, data);

    assert!(!disk.test_unit_ready());
    assert!(disk.test_unit_ready());
}
