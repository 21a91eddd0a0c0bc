//! SPI NOR flash as a USB Mass Storage disk, shared with the firmware's own
//! view of the FAT volume on it.
//!
//! The host sees a 512-byte-block SCSI disk ([`scsi::ScsiDisk`]) whose
//! commands reach the flash through [`msc::Bridge`]. The bridge keeps the
//! firmware's FAT view ([`fs::FatView`]) coherent with host writes and,
//! through a one-shot NOT READY answer, tells the host to drop its own
//! caches after the content changed.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod block;
pub mod config;
pub mod diag;
pub mod flash;
pub mod fs;
pub mod interval;
pub mod list;
pub mod msc;
pub mod scsi;
#[cfg(feature = "firmware")]
pub mod spi_nor;

#[cfg(test)]
mod testing;

pub use crate::block::BlockDevice;
pub use crate::flash::CachedFlash;
pub use crate::fs::{FatView, FixedTime};
pub use crate::list::list_files;
pub use crate::msc::{ActivityLed, Bridge, CacheControl, MscError, MscHandler, ReadyGate, Readiness};
pub use crate::scsi::ScsiDisk;
