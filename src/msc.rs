//! The bridge between host block commands, the flash block device and the
//! firmware's own view of the FAT volume.

use core::cell::RefCell;

use crate::block::{blocks_in, in_range, BlockDevice};
use crate::fmt::Debug2Format;
use crate::scsi::Sense;

/// Answer to a host TEST UNIT READY poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Readiness {
    Ready,
    NotReady,
}

/// One-shot "medium changed" signal.
///
/// Any number of [`mark_changed`](ReadyGate::mark_changed) calls make exactly
/// one following [`poll`](ReadyGate::poll) answer [`Readiness::NotReady`],
/// which forces the host to drop its cached view of the disk.
#[derive(Debug, Default)]
pub struct ReadyGate {
    changed: bool,
}

impl ReadyGate {
    pub const fn new() -> Self {
        Self { changed: false }
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn poll(&mut self) -> Readiness {
        if core::mem::take(&mut self.changed) {
            Readiness::NotReady
        } else {
            Readiness::Ready
        }
    }
}

/// Failure of a single host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MscError {
    /// The blocks are not all inside `[0, capacity)`.
    OutOfRange,
    /// The buffer is not a whole number of 512-byte blocks.
    BadLength,
    ReadFailed,
    WriteFailed,
    /// Buffered writes could not be committed to flash.
    SyncFailed,
}

impl MscError {
    /// Sense data reported to the host for this failure.
    pub fn sense(self) -> Sense {
        match self {
            MscError::OutOfRange => Sense::LBA_OUT_OF_RANGE,
            MscError::BadLength => Sense::INVALID_FIELD_IN_CDB,
            MscError::ReadFailed => Sense::UNRECOVERED_READ_ERROR,
            MscError::WriteFailed | MscError::SyncFailed => Sense::WRITE_ERROR,
        }
    }
}

/// Operations the USB Mass Storage transport invokes on the disk.
///
/// `read` and `write` return the number of bytes transferred, always the
/// whole buffer on success.
pub trait MscHandler {
    fn read(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, MscError>;

    fn write(&mut self, lba: u32, buf: &[u8]) -> Result<usize, MscError>;

    /// Called once the host accepted the status of a write command.
    fn flush(&mut self) -> Result<(), MscError>;

    /// `false` makes the transport answer NOT READY.
    fn ready(&mut self) -> bool;

    /// Capacity in 512-byte blocks.
    fn block_count(&self) -> u32;
}

/// "Do not unplug" indicator, lit while written data is not yet durable.
pub trait ActivityLed {
    fn set_active(&mut self, on: bool);
}

/// No indicator on this board.
impl ActivityLed for () {
    fn set_active(&mut self, _on: bool) {}
}

/// A metadata cache that has to be dropped after the host rewrote the disk.
pub trait CacheControl {
    fn cache_clear(&mut self);
}

/// Makes the flash block device look like a 512-byte-block SCSI disk.
///
/// The device and the filesystem view are shared with the local file
/// listing, which runs between USB polls on the same thread.
pub struct Bridge<'a, D, V, L = ()> {
    device: &'a RefCell<D>,
    view: &'a RefCell<V>,
    led: L,
    gate: ReadyGate,
    capacity: u32,
    sync_failed: bool,
}

impl<'a, D, V, L> Bridge<'a, D, V, L>
where
    D: BlockDevice,
    V: CacheControl,
    L: ActivityLed,
{
    pub fn new(device: &'a RefCell<D>, view: &'a RefCell<V>, mut led: L) -> Self {
        let capacity = device.borrow().block_count();
        led.set_active(false);
        Self {
            device,
            view,
            led,
            gate: ReadyGate::new(),
            capacity,
            sync_failed: false,
        }
    }

    /// Whether the last flush failed and should be retried.
    pub fn sync_pending(&self) -> bool {
        self.sync_failed
    }

    pub fn led(&self) -> &L {
        &self.led
    }

    fn check(&self, lba: u32, len: usize) -> Result<u32, MscError> {
        let count = blocks_in(len).ok_or(MscError::BadLength)?;
        if !in_range(lba, count, self.capacity) {
            warn!(
                "msc: {} blocks at lba {} exceed capacity {}",
                count, lba, self.capacity
            );
            return Err(MscError::OutOfRange);
        }
        Ok(count)
    }
}

impl<D, V, L> MscHandler for Bridge<'_, D, V, L>
where
    D: BlockDevice,
    V: CacheControl,
    L: ActivityLed,
{
    fn read(&mut self, lba: u32, buf: &mut [u8]) -> Result<usize, MscError> {
        let count = self.check(lba, buf.len())?;
        // The block device caches a whole sector itself, so nothing is cached here.
        self.device
            .borrow_mut()
            .read_blocks(lba, buf)
            .map_err(|e| {
                error!(
                    "msc: read of {} blocks at lba {} failed: {:?}",
                    count,
                    lba,
                    Debug2Format(&e)
                );
                MscError::ReadFailed
            })?;
        Ok(buf.len())
    }

    fn write(&mut self, lba: u32, buf: &[u8]) -> Result<usize, MscError> {
        let count = self.check(lba, buf.len())?;
        self.led.set_active(true);
        let written = self.device.borrow_mut().write_blocks(lba, buf);
        // A failed multi-block write may still have patched its first blocks.
        self.gate.mark_changed();
        written.map_err(|e| {
            error!(
                "msc: write of {} blocks at lba {} failed: {:?}",
                count,
                lba,
                Debug2Format(&e)
            );
            MscError::WriteFailed
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), MscError> {
        // Invalidate only once the data is durable, else the view could re-cache stale blocks.
        if let Err(e) = self.device.borrow_mut().sync_blocks() {
            error!("msc: sync failed: {:?}", Debug2Format(&e));
            self.sync_failed = true;
            return Err(MscError::SyncFailed);
        }
        self.sync_failed = false;
        self.view.borrow_mut().cache_clear();
        self.led.set_active(false);
        debug!("msc: flushed");
        Ok(())
    }

    fn ready(&mut self) -> bool {
        match self.gate.poll() {
            Readiness::Ready => true,
            Readiness::NotReady => {
                debug!("msc: content changed, reporting not ready once");
                false
            }
        }
    }

    fn block_count(&self) -> u32 {
        self.capacity
    }
}
