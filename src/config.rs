//! Compiled-in parameters of the disk.

/// Block size presented to the host, regardless of the flash page size.
pub const BLOCK_SIZE: usize = 512;

/// Erase granularity of the flash chip and size of the block device's write-back cache.
pub const SECTOR_SIZE: usize = 4096;

/// Blocks staged per USB transfer chunk (4 KiB, a common host request size).
pub const TRANSFER_BLOCKS: usize = 8;

/// Period of the local file listing, in milliseconds.
pub const LIST_INTERVAL_MS: u32 = 2000;

/// Bytes read from a file per diagnostic write.
pub const LIST_CHUNK: usize = 255;

/// Max packet size of the bulk endpoints (full speed).
pub const PACKET_SIZE: u16 = 64;

/// pid.codes test VID/PID.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x0001;

pub const USB_MANUFACTURER: &str = "Fri3d";
pub const USB_PRODUCT: &str = "Badge Flash";
pub const USB_SERIAL: &str = "00000001";

/// Identification strings reported by SCSI INQUIRY.
pub const IDENTITY: Identity = Identity {
    vendor: "Fri3d",
    product: "Badge Flash",
    revision: "2024",
};

const VENDOR_LEN: usize = 8;
const PRODUCT_LEN: usize = 16;
const REVISION_LEN: usize = 4;

/// Vendor, product and revision strings of the disk (up to 8, 16 and 4 characters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    vendor: &'static str,
    product: &'static str,
    revision: &'static str,
}

/// A string that does not fit its INQUIRY field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdentityError {
    /// Longer than the field.
    TooLong { field: &'static str, max: usize },
    /// Contains bytes outside printable ASCII.
    NotPrintable { field: &'static str },
}

impl Identity {
    pub fn new(
        vendor: &'static str,
        product: &'static str,
        revision: &'static str,
    ) -> Result<Self, IdentityError> {
        check("vendor", vendor, VENDOR_LEN)?;
        check("product", product, PRODUCT_LEN)?;
        check("revision", revision, REVISION_LEN)?;
        Ok(Self {
            vendor,
            product,
            revision,
        })
    }

    pub fn vendor(&self) -> &'static str {
        self.vendor
    }

    pub fn product(&self) -> &'static str {
        self.product
    }

    pub fn revision(&self) -> &'static str {
        self.revision
    }

    /// Vendor, product and revision as one space-padded 28-byte INQUIRY field.
    pub fn inquiry_fields(&self) -> [u8; VENDOR_LEN + PRODUCT_LEN + REVISION_LEN] {
        let mut out = [b' '; VENDOR_LEN + PRODUCT_LEN + REVISION_LEN];
        pad(&mut out[..VENDOR_LEN], self.vendor);
        pad(&mut out[VENDOR_LEN..VENDOR_LEN + PRODUCT_LEN], self.product);
        pad(&mut out[VENDOR_LEN + PRODUCT_LEN..], self.revision);
        out
    }
}

fn check(field: &'static str, value: &str, max: usize) -> Result<(), IdentityError> {
    if value.len() > max {
        return Err(IdentityError::TooLong { field, max });
    }
    if !value.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err(IdentityError::NotPrintable { field });
    }
    Ok(())
}

fn pad(field: &mut [u8], value: &str) {
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}
