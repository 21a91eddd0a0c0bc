//! The firmware's own view of the FAT volume on the flash.

use core::cell::RefCell;

use embedded_sdmmc::{Block, BlockCount, BlockIdx, TimeSource, Timestamp, VolumeIdx, VolumeManager};

use crate::block::BlockDevice;
use crate::fmt::Debug2Format;
use crate::msc::CacheControl;

/// Lends a block device shared with the USB bridge to `embedded-sdmmc`.
pub struct SharedBlocks<'a, D>(&'a RefCell<D>);

impl<D: BlockDevice> embedded_sdmmc::BlockDevice for SharedBlocks<'_, D> {
    type Error = D::Error;

    fn read(
        &self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        let mut device = self.0.borrow_mut();
        for (lba, block) in (start_block_idx.0..).zip(blocks.iter_mut()) {
            device.read_blocks(lba, &mut block.contents)?;
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut device = self.0.borrow_mut();
        for (lba, block) in (start_block_idx.0..).zip(blocks.iter()) {
            device.write_blocks(lba, &block.contents)?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.0.borrow().block_count()))
    }
}

/// Timestamps for the FAT layer; the board has no RTC and the view never writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTime;

impl TimeSource for FixedTime {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 54,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

pub(crate) type Manager<'a, D, T> = VolumeManager<SharedBlocks<'a, D>, T>;

/// A FAT volume (MBR partition 0) mounted on the shared block device.
pub struct FatView<'a, D, T = FixedTime>
where
    D: BlockDevice,
    T: TimeSource,
{
    device: &'a RefCell<D>,
    time: T,
    manager: Manager<'a, D, T>,
    formatted: bool,
}

impl<'a, D, T> FatView<'a, D, T>
where
    D: BlockDevice,
    T: TimeSource + Clone,
{
    /// Mounts the volume. An unformatted device still mounts; see [`formatted`](Self::formatted).
    pub fn mount(device: &'a RefCell<D>, time: T) -> Self {
        let mut view = Self {
            device,
            manager: VolumeManager::new(SharedBlocks(device), time.clone()),
            time,
            formatted: false,
        };
        view.formatted = view.probe();
        if view.formatted {
            info!("fs: FAT volume mounted");
        } else {
            warn!("fs: no FAT volume found, flash may not be formatted");
        }
        view
    }

    /// Whether a FAT volume was found at mount time.
    pub fn formatted(&self) -> bool {
        self.formatted
    }

    /// Whether volume 0 currently opens.
    pub fn probe(&mut self) -> bool {
        match self.manager.open_raw_volume(VolumeIdx(0)) {
            Ok(volume) => {
                let _ = self.manager.close_volume(volume);
                true
            }
            Err(e) => {
                debug!("fs: volume 0 does not open: {:?}", Debug2Format(&e));
                false
            }
        }
    }

    pub(crate) fn manager(&mut self) -> &mut Manager<'a, D, T> {
        &mut self.manager
    }
}

impl<D, T> CacheControl for FatView<'_, D, T>
where
    D: BlockDevice,
    T: TimeSource + Clone,
{
    /// Drops every cached volume, directory and block by starting a fresh manager.
    fn cache_clear(&mut self) {
        self.manager = VolumeManager::new(SharedBlocks(self.device), self.time.clone());
        trace!("fs: cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fat_image, RamDisk};

    #[test]
    fn erased_flash_is_not_formatted() {
        let device = RefCell::new(RamDisk::new(2048));
        device.borrow_mut().data.fill(0xff);
        let view = FatView::mount(&device, FixedTime);
        assert!(!view.formatted());
    }

    #[test]
    fn fat16_image_is_formatted() {
        let device = RefCell::new(RamDisk::from_image(fat_image(8192, &[])));
        let mut view = FatView::mount(&device, FixedTime);
        assert!(view.formatted());
        view.cache_clear();
        assert!(view.probe());
    }

    #[test]
    fn shared_blocks_reach_the_device() {
        use embedded_sdmmc::BlockDevice as _;

        let device = RefCell::new(RamDisk::new(8));
        let shared = SharedBlocks(&device);
        let mut blocks = [Block::new(), Block::new()];
        blocks[0].contents.fill(1);
        blocks[1].contents.fill(2);
        shared.write(&blocks, BlockIdx(5)).unwrap();
        assert_eq!(device.borrow().data[5 * 512], 1);
        assert_eq!(device.borrow().data[6 * 512], 2);

        let mut back = [Block::new()];
        shared.read(&mut back, BlockIdx(6), "test").unwrap();
        assert_eq!(back[0].contents, [2; 512]);
        assert_eq!(shared.num_blocks().unwrap(), BlockCount(8));
        assert!(shared.read(&mut back, BlockIdx(8), "test").is_err());
    }
}
