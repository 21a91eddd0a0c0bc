//! Block-level access to the flash chip, in 512-byte units.

use crate::config::BLOCK_SIZE;

/// Block storage addressed by 512-byte logical blocks.
///
/// The number of blocks transferred is `buf.len() / 512`; buffers must be a
/// whole number of blocks. Implementations may cache internally, in which
/// case [`sync_blocks`](BlockDevice::sync_blocks) must make every earlier
/// write durable before it returns.
pub trait BlockDevice {
    type Error: core::fmt::Debug;

    fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    fn write_blocks(&mut self, lba: u32, buf: &[u8]) -> Result<(), Self::Error>;

    fn sync_blocks(&mut self) -> Result<(), Self::Error>;

    /// Device size in bytes.
    fn size(&self) -> u64;

    fn block_count(&self) -> u32 {
        u32::try_from(self.size() / BLOCK_SIZE as u64).unwrap_or(u32::MAX)
    }
}

/// Whether `count` blocks starting at `lba` lie inside a device of `capacity` blocks.
pub fn in_range(lba: u32, count: u32, capacity: u32) -> bool {
    lba.checked_add(count).is_some_and(|end| end <= capacity)
}

/// Number of whole blocks in `len` bytes, or `None` if `len` is not block aligned.
pub fn blocks_in(len: usize) -> Option<u32> {
    if len % BLOCK_SIZE == 0 {
        u32::try_from(len / BLOCK_SIZE).ok()
    } else {
        None
    }
}
