//! SCSI transparent command set over Bulk-Only Transport, backed by an [`MscHandler`].

use core::borrow::BorrowMut;

use usb_device::bus::UsbBus;
use usbd_storage::subclass::scsi::{Scsi, ScsiCommand};
use usbd_storage::transport::bbb::BulkOnly;

use crate::block::in_range;
use crate::config::{Identity, BLOCK_SIZE, TRANSFER_BLOCKS};
use crate::msc::{MscError, MscHandler};

const TRANSFER_BYTES: usize = TRANSFER_BLOCKS * BLOCK_SIZE;

/// Sense key and additional sense code reported by REQUEST SENSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NO_SENSE: Sense = Sense::new(0x00, 0x00, 0x00);
    /// NOT READY, MEDIUM NOT PRESENT
    pub const MEDIUM_NOT_PRESENT: Sense = Sense::new(0x02, 0x3a, 0x00);
    /// MEDIUM ERROR, UNRECOVERED READ ERROR
    pub const UNRECOVERED_READ_ERROR: Sense = Sense::new(0x03, 0x11, 0x00);
    /// MEDIUM ERROR, WRITE ERROR
    pub const WRITE_ERROR: Sense = Sense::new(0x03, 0x0c, 0x00);
    /// ILLEGAL REQUEST, INVALID COMMAND OPERATION CODE
    pub const INVALID_COMMAND: Sense = Sense::new(0x05, 0x20, 0x00);
    /// ILLEGAL REQUEST, LOGICAL BLOCK ADDRESS OUT OF RANGE
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(0x05, 0x21, 0x00);
    /// ILLEGAL REQUEST, INVALID FIELD IN CDB
    pub const INVALID_FIELD_IN_CDB: Sense = Sense::new(0x05, 0x24, 0x00);

    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Fixed format sense data (18 bytes).
    pub fn to_bytes(self) -> [u8; 18] {
        [
            0x70, // Response code: current errors, fixed format
            0x00, // Obsolete
            self.key,
            0x00, 0x00, 0x00, 0x00, // Information
            0x0a, // Additional sense length (10 bytes follow)
            0x00, 0x00, 0x00, 0x00, // Command specific
            self.asc,
            self.ascq,
            0x00, 0x00, 0x00, 0x00, // FRU + SKSV
        ]
    }
}

/// Progress of a READ or WRITE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// The endpoint is busy; call again on the next poll.
    Pending,
    Done,
    Failed,
}

/// State of a multi-block transfer spread over several polls.
#[derive(Default)]
struct Transfer {
    active: bool,
    is_write: bool,
    /// LBA and length of the command this transfer serves.
    command: (u32, u32),
    /// Next block to hand to the handler.
    lba: u32,
    /// Blocks not yet handed to the handler.
    remaining: u32,
    /// Bytes of `buf` holding data (read) or received so far (write).
    filled: usize,
    /// Bytes of `buf` already sent to the host.
    offset: usize,
    /// Some blocks of this write already reached the handler.
    written: bool,
}

/// A single-LUN SCSI disk answering host commands through an [`MscHandler`].
pub struct ScsiDisk<H> {
    handler: H,
    identity: Identity,
    sense: Sense,
    transfer: Transfer,
    buf: [u8; TRANSFER_BYTES],
    flush_pending: bool,
}

impl<H: MscHandler> ScsiDisk<H> {
    pub fn new(handler: H, identity: Identity) -> Self {
        Self {
            handler,
            identity,
            sense: Sense::NO_SENSE,
            transfer: Transfer::default(),
            buf: [0; TRANSFER_BYTES],
            flush_pending: false,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Sense of the last failed command, not yet fetched by REQUEST SENSE.
    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// Processes pending SCSI commands.
    ///
    /// A completed WRITE is flushed on the following call, once its status
    /// has gone out to the host.
    pub fn poll<B, Buf>(&mut self, msc: &mut Scsi<BulkOnly<'_, B, Buf>>)
    where
        B: UsbBus,
        Buf: BorrowMut<[u8]>,
    {
        self.service();

        let polled = msc.poll(|mut cmd| match cmd.kind {
            ScsiCommand::TestUnitReady => {
                trace!("SCSI: TestUnitReady");
                if self.test_unit_ready() {
                    cmd.pass();
                } else {
                    cmd.fail();
                }
            }

            ScsiCommand::Inquiry { .. } => {
                debug!("SCSI: Inquiry");
                let _ = cmd.try_write_data_all(&self.inquiry());
                cmd.pass();
            }

            ScsiCommand::ReadCapacity10 => {
                debug!("SCSI: ReadCapacity10");
                let _ = cmd.try_write_data_all(&self.read_capacity10());
                cmd.pass();
            }

            ScsiCommand::ReadCapacity16 { .. } => {
                debug!("SCSI: ReadCapacity16");
                let _ = cmd.try_write_data_all(&self.read_capacity16());
                cmd.pass();
            }

            ScsiCommand::RequestSense { .. } => {
                debug!("SCSI: RequestSense");
                let _ = cmd.try_write_data_all(&self.request_sense());
                cmd.pass();
            }

            ScsiCommand::ModeSense6 { .. } => {
                debug!("SCSI: ModeSense6");
                let _ = cmd.try_write_data_all(&MODE_SENSE_6);
                cmd.pass();
            }

            ScsiCommand::ModeSense10 { .. } => {
                debug!("SCSI: ModeSense10");
                let _ = cmd.try_write_data_all(&MODE_SENSE_10);
                cmd.pass();
            }

            ScsiCommand::ReadFormatCapacities { .. } => {
                debug!("SCSI: ReadFormatCapacities");
                let _ = cmd.try_write_data_all(&self.read_format_capacities());
                cmd.pass();
            }

            ScsiCommand::Read { lba, len } => {
                let (Ok(lba), Ok(len)) = (u32::try_from(lba), u32::try_from(len)) else {
                    self.sense = Sense::LBA_OUT_OF_RANGE;
                    cmd.fail();
                    return;
                };
                match self.read_step(lba, len, |chunk| cmd.write_data(chunk).ok()) {
                    Step::Pending => {}
                    Step::Done => {
                        cmd.pass();
                    }
                    Step::Failed => {
                        cmd.fail();
                    }
                }
            }

            ScsiCommand::Write { lba, len } => {
                let (Ok(lba), Ok(len)) = (u32::try_from(lba), u32::try_from(len)) else {
                    self.sense = Sense::LBA_OUT_OF_RANGE;
                    cmd.fail();
                    return;
                };
                match self.write_step(lba, len, |buf| cmd.read_data(buf).ok()) {
                    Step::Pending => {}
                    Step::Done => {
                        cmd.pass();
                    }
                    Step::Failed => {
                        cmd.fail();
                    }
                }
            }

            ScsiCommand::Unknown => {
                warn!("SCSI: Unknown command");
                self.sense = Sense::INVALID_COMMAND;
                cmd.fail();
            }

            _ => {
                warn!("SCSI: Unhandled command");
                self.sense = Sense::INVALID_COMMAND;
                cmd.fail();
            }
        });
        if polled.is_err() {
            warn!("SCSI: transport error");
        }
    }

    /// Runs the flush owed to the last completed WRITE, if any.
    pub fn service(&mut self) {
        if core::mem::take(&mut self.flush_pending) {
            if let Err(e) = self.handler.flush() {
                error!("SCSI: flush after write failed: {:?}", e);
            }
        }
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    pub fn test_unit_ready(&mut self) -> bool {
        if self.handler.ready() {
            true
        } else {
            self.sense = Sense::MEDIUM_NOT_PRESENT;
            false
        }
    }

    /// Standard inquiry data (36 bytes).
    pub fn inquiry(&self) -> [u8; 36] {
        let mut data = [0u8; 36];
        data[..8].copy_from_slice(&[
            0x00, // Peripheral device type: SBC direct access
            0x80, // RMB: Removable
            0x04, // Version: SPC-2
            0x02, // Response format
            0x1f, // Additional length (31 bytes follow)
            0x00, 0x00, 0x00, // Flags
        ]);
        data[8..].copy_from_slice(&self.identity.inquiry_fields());
        data
    }

    pub fn read_capacity10(&self) -> [u8; 8] {
        let last_lba = self.handler.block_count().saturating_sub(1);
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&last_lba.to_be_bytes());
        data[4..8].copy_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
        data
    }

    pub fn read_capacity16(&self) -> [u8; 32] {
        let last_lba = u64::from(self.handler.block_count()).saturating_sub(1);
        let mut data = [0u8; 32];
        data[0..8].copy_from_slice(&last_lba.to_be_bytes());
        data[8..12].copy_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
        data
    }

    pub fn read_format_capacities(&self) -> [u8; 12] {
        let mut data = [0u8; 12];
        // Capacity list header: 8 bytes follow
        data[0..4].copy_from_slice(&[0, 0, 0, 8]);
        data[4..8].copy_from_slice(&self.handler.block_count().to_be_bytes());
        data[8] = 0x02; // Descriptor type: Formatted media
        data[9..12].copy_from_slice(&(BLOCK_SIZE as u32).to_be_bytes()[1..]);
        data
    }

    /// Sense data of the last failure; reading it clears it.
    pub fn request_sense(&mut self) -> [u8; 18] {
        core::mem::replace(&mut self.sense, Sense::NO_SENSE).to_bytes()
    }

    fn start(&mut self, lba: u32, len: u32, is_write: bool) -> bool {
        self.transfer = Transfer::default();
        if !in_range(lba, len, self.handler.block_count()) {
            warn!("SCSI: {} blocks at lba {} out of range", len, lba);
            self.sense = Sense::LBA_OUT_OF_RANGE;
            return false;
        }
        debug!(
            "SCSI: {} lba={} len={}",
            if is_write { "Write" } else { "Read" },
            lba,
            len
        );
        self.transfer = Transfer {
            active: true,
            is_write,
            command: (lba, len),
            lba,
            remaining: len,
            ..Transfer::default()
        };
        true
    }

    /// Whether `lba`/`len` continue the transfer in progress rather than start a new one.
    fn resumes(&self, lba: u32, len: u32, is_write: bool) -> bool {
        let t = &self.transfer;
        t.active && t.is_write == is_write && t.command == (lba, len)
    }

    fn abort(&mut self, err: MscError) -> Step {
        self.sense = err.sense();
        if self.transfer.written || err == MscError::WriteFailed {
            self.flush_pending = true;
        }
        self.transfer = Transfer::default();
        Step::Failed
    }

    /// Moves READ data to the host; `send` returns how many bytes the endpoint took.
    pub fn read_step<F>(&mut self, lba: u32, len: u32, mut send: F) -> Step
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        if !self.resumes(lba, len, false) && !self.start(lba, len, false) {
            return Step::Failed;
        }

        loop {
            if self.transfer.offset >= self.transfer.filled {
                if self.transfer.remaining == 0 {
                    self.transfer = Transfer::default();
                    return Step::Done;
                }
                let blocks = self.transfer.remaining.min(TRANSFER_BLOCKS as u32);
                let bytes = blocks as usize * BLOCK_SIZE;
                if let Err(e) = self.handler.read(self.transfer.lba, &mut self.buf[..bytes]) {
                    return self.abort(e);
                }
                self.transfer.lba += blocks;
                self.transfer.remaining -= blocks;
                self.transfer.filled = bytes;
                self.transfer.offset = 0;
            }

            match send(&self.buf[self.transfer.offset..self.transfer.filled]) {
                Some(sent) if sent > 0 => self.transfer.offset += sent,
                // USB buffer full, continue on the next poll
                _ => return Step::Pending,
            }
        }
    }

    /// Moves WRITE data from the host; `receive` returns how many bytes it copied in.
    pub fn write_step<F>(&mut self, lba: u32, len: u32, mut receive: F) -> Step
    where
        F: FnMut(&mut [u8]) -> Option<usize>,
    {
        if !self.resumes(lba, len, true) && !self.start(lba, len, true) {
            return Step::Failed;
        }

        while self.transfer.remaining > 0 {
            let blocks = self.transfer.remaining.min(TRANSFER_BLOCKS as u32);
            let bytes = blocks as usize * BLOCK_SIZE;
            match receive(&mut self.buf[self.transfer.filled..bytes]) {
                Some(received) if received > 0 => self.transfer.filled += received,
                // No more data available, continue on the next poll
                _ => return Step::Pending,
            }

            if self.transfer.filled >= bytes {
                if let Err(e) = self.handler.write(self.transfer.lba, &self.buf[..bytes]) {
                    return self.abort(e);
                }
                self.transfer.written = true;
                self.transfer.lba += blocks;
                self.transfer.remaining -= blocks;
                self.transfer.filled = 0;
            }
        }

        self.transfer = Transfer::default();
        self.flush_pending = true;
        Step::Done
    }
}

/// Mode parameter header: not write-protected, no block descriptors.
const MODE_SENSE_6: [u8; 4] = [
    0x03, // Mode data length (3 bytes follow)
    0x00, // Medium type: default
    0x00, // Device-specific: not write-protected, no cache
    0x00, // Block descriptor length: 0
];

const MODE_SENSE_10: [u8; 8] = [
    0x00, 0x06, // Mode data length (6 bytes follow)
    0x00, // Medium type: default
    0x00, // Device-specific: not write-protected
    0x00, 0x00, // Reserved
    0x00, 0x00, // Block descriptor length: 0
];
