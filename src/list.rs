//! Streams every file in the root directory to a diagnostic writer.

use core::fmt::Write;

use embedded_sdmmc::{Mode, RawDirectory, RawFile, ShortFileName, TimeSource, VolumeIdx};

use crate::block::BlockDevice;
use crate::config::LIST_CHUNK;
use crate::fmt::Debug2Format;
use crate::fs::{FatView, Manager};

/// Files and bytes printed by one [`list_files`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Listing {
    pub files: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ListError {
    /// Volume 0 does not open.
    NotFormatted,
    /// Reading the directory or a file failed.
    Filesystem,
    /// The diagnostic writer refused output.
    Output,
}

impl From<core::fmt::Error> for ListError {
    fn from(_: core::fmt::Error) -> Self {
        ListError::Output
    }
}

fn fs_error<E: core::fmt::Debug>(e: embedded_sdmmc::Error<E>) -> ListError {
    warn!("list: filesystem error: {:?}", Debug2Format(&e));
    ListError::Filesystem
}

/// Prints each regular file of the root directory, in directory order.
///
/// Every call opens the volume and the root afresh, so it sees whatever the
/// host wrote before the last cache clear. Each file is printed as a header
/// line, its content, and a blank line.
pub fn list_files<D, T, W>(view: &mut FatView<'_, D, T>, out: &mut W) -> Result<Listing, ListError>
where
    D: BlockDevice,
    T: TimeSource + Clone,
    W: Write,
{
    let manager = view.manager();
    let volume = manager.open_raw_volume(VolumeIdx(0)).map_err(|e| {
        debug!("list: volume 0 does not open: {:?}", Debug2Format(&e));
        ListError::NotFormatted
    })?;

    let result = match manager.open_root_dir(volume) {
        Ok(root) => {
            let listed = list_dir(manager, root, out);
            let _ = manager.close_dir(root);
            listed
        }
        Err(e) => Err(fs_error(e)),
    };
    let _ = manager.close_volume(volume);
    result
}

fn list_dir<D, T, W>(
    manager: &mut Manager<'_, D, T>,
    dir: RawDirectory,
    out: &mut W,
) -> Result<Listing, ListError>
where
    D: BlockDevice,
    T: TimeSource,
    W: Write,
{
    let mut listing = Listing::default();
    while let Some(name) = nth_file(manager, dir, listing.files)? {
        let file = manager
            .open_file_in_dir(dir, name.clone(), Mode::ReadOnly)
            .map_err(fs_error)?;
        let printed = print_file(manager, file, &name, out);
        let _ = manager.close_file(file);
        listing.bytes += printed?;
        listing.files += 1;
    }
    Ok(listing)
}

/// Name of the `n`th regular file in `dir`, skipping directories and labels.
fn nth_file<D, T>(
    manager: &mut Manager<'_, D, T>,
    dir: RawDirectory,
    n: usize,
) -> Result<Option<ShortFileName>, ListError>
where
    D: BlockDevice,
    T: TimeSource,
{
    let mut seen = 0;
    let mut found = None;
    manager
        .iterate_dir(dir, |entry| {
            if found.is_some() || entry.attributes.is_directory() || entry.attributes.is_volume() {
                return;
            }
            if seen == n {
                found = Some(entry.name.clone());
            }
            seen += 1;
        })
        .map_err(fs_error)?;
    Ok(found)
}

fn print_file<D, T, W>(
    manager: &mut Manager<'_, D, T>,
    file: RawFile,
    name: &ShortFileName,
    out: &mut W,
) -> Result<usize, ListError>
where
    D: BlockDevice,
    T: TimeSource,
    W: Write,
{
    writeln!(out, "Content for file '{}':", name)?;
    let mut buf = [0u8; LIST_CHUNK];
    let mut total = 0;
    loop {
        let read = manager.read(file, &mut buf).map_err(fs_error)?;
        if read == 0 {
            break;
        }
        write_lossy(out, &buf[..read])?;
        total += read;
    }
    writeln!(out)?;
    writeln!(out)?;
    Ok(total)
}

/// Writes `bytes` as text, replacing invalid UTF-8 with U+FFFD.
fn write_lossy<W: Write>(out: &mut W, bytes: &[u8]) -> core::fmt::Result {
    for chunk in bytes.utf8_chunks() {
        out.write_str(chunk.valid())?;
        if !chunk.invalid().is_empty() {
            out.write_char(char::REPLACEMENT_CHARACTER)?;
        }
    }
    Ok(())
}
