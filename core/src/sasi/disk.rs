//! SASI hard disk unit (fixed-block target device)
//!
//! Implements the phase sequencing and command set of a single-LUN
//! fixed-disk controller. All command failures complete the transaction
//! through CHECK CONDITION plus a sense record; the bus never stalls.

use std::path::Path;

use anyhow::Result;
use arrayvec::ArrayVec;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::debuggable::{DebugProperties, DebugProperty, Debuggable};
use crate::sasi::store::{BlockMedia, BlockStore};
use crate::sasi::target::{SasiCtl, SasiPhase, SasiTarget, SenseData};
use crate::sasi::{
    CDB_LEN, ERR_ILLEGAL_ADDRESS, ERR_ILLEGAL_COMMAND, ERR_ILLEGAL_UNIT, ERR_UNCORRECTABLE,
    SASI_TRACE, STATUS_CHECK_CONDITION, STATUS_GOOD,
};

/// Default block size of a fixed-disk unit
pub const DISK_BLOCKSIZE: usize = 512;

/// Blocks covered by the track-granular FORMAT variants
const TRACK_BLOCKS: u32 = 17;

/// Fill byte written by FORMAT
const FORMAT_FILL: u8 = 0xE5;

/// ECC trailer bytes carried by READ LONG/WRITE LONG
const ECC_LEN: usize = 4;

/// Burst length reported by READ ECC BURST LENGTH (no correction modeled)
const ECC_BURST: u8 = 0;

/// Payload length of READ RETRY STATISTICS
const RETRY_STATS_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
/// Command set of a SASI fixed-disk controller
enum SasiCmd {
    TestUnitReady = 0x00,
    Recalibrate = 0x01,
    RequestSense = 0x03,
    FormatUnit = 0x04,
    ReadVerify = 0x05,
    FormatTrack = 0x06,
    FormatBadTrack = 0x07,
    Read = 0x08,
    Write = 0x0A,
    Seek = 0x0B,
    InitCharacteristics = 0x0C,
    ReadEccBurstLen = 0x0D,
    ReadSectorBuffer = 0x0E,
    WriteSectorBuffer = 0x0F,
    ReadRetryStats = 0x92,
    RamDiagnostic = 0xE0,
    DriveDiagnostic = 0xE3,
    ControllerDiagnostic = 0xE4,
    ReadLong = 0xE5,
    WriteLong = 0xE6,
}

pub struct SasiTargetDisk {
    store: BlockStore,

    /// Claiming the bus (driving BSY)
    selected: bool,

    phase: SasiPhase,

    /// Accumulating command descriptor block
    cmd: ArrayVec<u8, CDB_LEN>,

    /// Block data in flight during a data phase
    databuf: Vec<u8>,
    xfer_pos: usize,

    /// Status byte plus null filler returned in the STATUS phase
    statusbuf: [u8; 2],
    status_pos: usize,

    sense: SenseData,

    /// Command continuing across data phases
    active: Option<SasiCmd>,

    /// Next block address of a multi-block READ/WRITE
    cursor_lba: u32,

    /// Blocks left in a multi-block READ/WRITE
    remaining: u32,

    /// Controller-local scratch buffer (READ/WRITE SECTOR BUFFER)
    sector_buf: Vec<u8>,
}

impl SasiTargetDisk {
    /// Creates a disk unit on any seekable media
    pub fn new(media: Box<dyn BlockMedia>, block_size: usize) -> Result<Self> {
        Ok(Self::from_store(BlockStore::new(media, block_size)?))
    }

    /// Creates a disk unit backed by an image file
    pub fn open(filename: &Path, block_size: usize) -> Result<Self> {
        Ok(Self::from_store(BlockStore::open(filename, block_size)?))
    }

    fn from_store(store: BlockStore) -> Self {
        let block_size = store.block_size();
        Self {
            store,
            selected: false,
            phase: SasiPhase::Idle,
            cmd: ArrayVec::new(),
            databuf: vec![],
            xfer_pos: 0,
            statusbuf: [0; 2],
            status_pos: 0,
            sense: SenseData::default(),
            active: None,
            cursor_lba: 0,
            remaining: 0,
            sector_buf: vec![0; block_size],
        }
    }

    /// 21-bit block address folded into CDB bytes 1..=3
    fn cmd_lba(&self) -> u32 {
        (u32::from(self.cmd[1] & 0x1F) << 16) | (u32::from(self.cmd[2]) << 8) | u32::from(self.cmd[3])
    }

    /// Unit number in the top bits of CDB byte 1
    fn cmd_lun(&self) -> u8 {
        self.cmd[1] >> 5
    }

    /// Block count in CDB byte 4, 0 meaning 256
    fn cmd_blocks(&self) -> u32 {
        if self.cmd[4] == 0 {
            256
        } else {
            u32::from(self.cmd[4])
        }
    }

    fn enter_status(&mut self, status: u8) {
        self.statusbuf = [status, 0];
        self.status_pos = 0;
        self.active = None;
        self.phase = SasiPhase::Status;
    }

    /// Records sense and completes the transaction with CHECK CONDITION
    fn fail(&mut self, code: u8, lba: Option<u32>) {
        self.sense.set(code, lba);
        self.enter_status(STATUS_CHECK_CONDITION);
    }

    fn start_data_in(&mut self, data: Vec<u8>) {
        self.databuf = data;
        self.xfer_pos = 0;
        self.phase = SasiPhase::DataIn;
    }

    fn start_data_out(&mut self, len: usize) {
        self.databuf = vec![0; len];
        self.xfer_pos = 0;
        self.phase = SasiPhase::DataOut;
    }

    /// Loads the block at the cursor and arms the next DATA IN phase
    fn next_read_block(&mut self) {
        let long = self.active == Some(SasiCmd::ReadLong);
        let mut buf = vec![0; self.store.block_size()];
        match self.store.read_block(self.cursor_lba, &mut buf) {
            Ok(()) => {
                if long {
                    buf.extend_from_slice(&[0; ECC_LEN]);
                }
                self.start_data_in(buf);
            }
            Err(e) => {
                log::error!("Block {} read failed: {:#}", self.cursor_lba, e);
                self.fail(ERR_UNCORRECTABLE, Some(self.cursor_lba));
            }
        }
    }

    /// Fill-writes the addressed range with the format pattern
    fn format_range(&mut self, lba: u32, count: u32) {
        let fill = vec![FORMAT_FILL; self.store.block_size()];
        for blk in lba..lba + count {
            if let Err(e) = self.store.write_block(blk, &fill) {
                log::error!("Block {} format write failed: {:#}", blk, e);
                self.fail(ERR_UNCORRECTABLE, Some(blk));
                return;
            }
        }
        self.enter_status(STATUS_GOOD);
    }

    fn dispatch_command(&mut self) {
        if SASI_TRACE {
            log::debug!("Command: {:02X?}", self.cmd);
        }

        if self.cmd_lun() != 0 {
            // Single-unit target; a nonzero unit field always fails
            self.fail(ERR_ILLEGAL_UNIT, None);
            return;
        }

        let op = SasiCmd::from_u8(self.cmd[0]);
        if op != Some(SasiCmd::RequestSense) {
            self.sense.clear();
        }
        let Some(op) = op else {
            log::warn!("Unrecognized command {:02X}", self.cmd[0]);
            self.fail(ERR_ILLEGAL_COMMAND, None);
            return;
        };

        let lba = self.cmd_lba();
        let count = self.cmd_blocks();
        let blocks = self.store.blocks() as u32;

        match op {
            SasiCmd::TestUnitReady
            | SasiCmd::Recalibrate
            | SasiCmd::RamDiagnostic
            | SasiCmd::DriveDiagnostic
            | SasiCmd::ControllerDiagnostic => self.enter_status(STATUS_GOOD),
            SasiCmd::RequestSense => {
                let payload = self.sense.encode().to_vec();
                self.sense.clear();
                self.start_data_in(payload);
            }
            SasiCmd::Seek => {
                // No head movement modeled, address check only
                if lba >= blocks {
                    self.fail(ERR_ILLEGAL_ADDRESS, Some(lba));
                } else {
                    self.enter_status(STATUS_GOOD);
                }
            }
            SasiCmd::ReadVerify => {
                if lba + count > blocks {
                    self.fail(ERR_ILLEGAL_ADDRESS, Some(lba));
                } else {
                    self.enter_status(STATUS_GOOD);
                }
            }
            SasiCmd::Read | SasiCmd::ReadLong => {
                if lba + count > blocks {
                    self.fail(ERR_ILLEGAL_ADDRESS, Some(lba));
                } else {
                    self.active = Some(op);
                    self.cursor_lba = lba;
                    self.remaining = count;
                    self.next_read_block();
                }
            }
            SasiCmd::Write | SasiCmd::WriteLong => {
                if lba + count > blocks {
                    self.fail(ERR_ILLEGAL_ADDRESS, Some(lba));
                } else {
                    self.active = Some(op);
                    self.cursor_lba = lba;
                    self.remaining = count;
                    let ecc = if op == SasiCmd::WriteLong { ECC_LEN } else { 0 };
                    self.start_data_out(self.store.block_size() + ecc);
                }
            }
            SasiCmd::FormatUnit => {
                if lba >= blocks {
                    self.fail(ERR_ILLEGAL_ADDRESS, Some(lba));
                } else {
                    self.format_range(lba, blocks - lba);
                }
            }
            SasiCmd::FormatTrack | SasiCmd::FormatBadTrack => {
                if lba >= blocks {
                    self.fail(ERR_ILLEGAL_ADDRESS, Some(lba));
                } else {
                    self.format_range(lba, TRACK_BLOCKS.min(blocks - lba));
                }
            }
            SasiCmd::InitCharacteristics => {
                self.active = Some(op);
                self.start_data_out(8);
            }
            SasiCmd::ReadEccBurstLen => self.start_data_in(vec![ECC_BURST]),
            SasiCmd::ReadRetryStats => self.start_data_in(vec![0; RETRY_STATS_LEN]),
            SasiCmd::ReadSectorBuffer => {
                let buf = self.sector_buf.clone();
                self.start_data_in(buf);
            }
            SasiCmd::WriteSectorBuffer => {
                self.active = Some(op);
                self.start_data_out(self.store.block_size());
            }
        }
    }

    /// DATA IN phase fully acknowledged
    fn datain_done(&mut self) {
        match self.active {
            Some(SasiCmd::Read | SasiCmd::ReadLong) => {
                self.cursor_lba += 1;
                self.remaining -= 1;
                if self.remaining > 0 {
                    self.next_read_block();
                } else {
                    self.enter_status(STATUS_GOOD);
                }
            }
            _ => self.enter_status(STATUS_GOOD),
        }
    }

    /// DATA OUT phase fully received
    fn dataout_done(&mut self) {
        match self.active {
            Some(SasiCmd::Write | SasiCmd::WriteLong) => {
                // The ECC trailer of WRITE LONG is carried but not checked
                let bs = self.store.block_size();
                if let Err(e) = self.store.write_block(self.cursor_lba, &self.databuf[..bs]) {
                    log::error!("Block {} write failed: {:#}", self.cursor_lba, e);
                    self.fail(ERR_UNCORRECTABLE, Some(self.cursor_lba));
                    return;
                }
                self.cursor_lba += 1;
                self.remaining -= 1;
                if self.remaining > 0 {
                    self.xfer_pos = 0;
                } else {
                    self.enter_status(STATUS_GOOD);
                }
            }
            Some(SasiCmd::WriteSectorBuffer) => {
                self.sector_buf.copy_from_slice(&self.databuf);
                self.enter_status(STATUS_GOOD);
            }
            _ => {
                // INIT DRIVE CHARACTERISTICS parameters are accepted and discarded
                self.enter_status(STATUS_GOOD);
            }
        }
    }
}

impl SasiTarget for SasiTargetDisk {
    fn reset(&mut self) {
        self.selected = false;
        self.phase = SasiPhase::Idle;
        self.cmd.clear();
        self.databuf.clear();
        self.xfer_pos = 0;
        self.statusbuf = [0; 2];
        self.status_pos = 0;
        self.sense.clear();
        self.active = None;
        self.cursor_lba = 0;
        self.remaining = 0;
    }

    fn select(&mut self) {
        self.selected = true;
        // Per-transaction state re-initializes at selection
        self.cmd.clear();
        self.databuf.clear();
        self.xfer_pos = 0;
        self.status_pos = 0;
        self.active = None;
    }

    fn begin_command(&mut self) {
        self.phase = SasiPhase::Command;
    }

    fn offer_byte(&mut self, val: u8) {
        match self.phase {
            SasiPhase::Command => {
                self.cmd.push(val);
                if self.cmd.len() == CDB_LEN {
                    self.dispatch_command();
                }
            }
            SasiPhase::DataOut => {
                self.databuf[self.xfer_pos] = val;
                self.xfer_pos += 1;
                if self.xfer_pos == self.databuf.len() {
                    self.dataout_done();
                }
            }
            _ => log::warn!("Byte {:02X} offered in phase {:?}", val, self.phase),
        }
    }

    fn current_byte(&self) -> u8 {
        match self.phase {
            SasiPhase::DataIn => self.databuf.get(self.xfer_pos).copied().unwrap_or(0),
            SasiPhase::Status => self.statusbuf[self.status_pos.min(1)],
            // COMMAND COMPLETE
            SasiPhase::Message => 0,
            _ => 0,
        }
    }

    fn take_ack(&mut self) {
        match self.phase {
            SasiPhase::DataIn => {
                self.xfer_pos += 1;
                if self.xfer_pos == self.databuf.len() {
                    self.datain_done();
                }
            }
            SasiPhase::Status => {
                self.status_pos += 1;
                if self.status_pos == self.statusbuf.len() {
                    self.phase = SasiPhase::Message;
                }
            }
            SasiPhase::Message => {
                // Transaction complete, release the bus
                self.selected = false;
                self.phase = SasiPhase::Idle;
            }
            _ => log::warn!("ACK in phase {:?}", self.phase),
        }
    }

    fn phase(&self) -> SasiPhase {
        self.phase
    }

    fn control_lines(&self) -> SasiCtl {
        let mut lines = SasiCtl(0);
        lines.set_bsy(self.selected);
        match self.phase {
            SasiPhase::Command => lines.set_cd(true),
            SasiPhase::DataIn => lines.set_io(true),
            SasiPhase::Status => {
                lines.set_cd(true);
                lines.set_io(true);
            }
            SasiPhase::Message => {
                lines.set_cd(true);
                lines.set_io(true);
                lines.set_msg(true);
            }
            SasiPhase::Idle | SasiPhase::DataOut => (),
        }
        lines
    }

    fn block_size(&self) -> Option<usize> {
        Some(self.store.block_size())
    }

    fn blocks(&self) -> Option<usize> {
        Some(self.store.blocks())
    }
}

impl Debuggable for SasiTargetDisk {
    fn debug_properties(&self) -> DebugProperties {
        vec![
            DebugProperty::tag("Phase", self.phase.into()),
            DebugProperty::flag("Claiming bus", self.selected),
            DebugProperty::text("Command", format!("{:02X?}", self.cmd)),
            DebugProperty::byte("Status", self.statusbuf[0]),
            DebugProperty::byte("Sense code", self.sense.code()),
            DebugProperty::count("Transfer position", self.xfer_pos as u64),
            DebugProperty::count("Transfer length", self.databuf.len() as u64),
            DebugProperty::count("Cursor block", self.cursor_lba.into()),
            DebugProperty::count("Blocks remaining", self.remaining.into()),
            DebugProperty::count("Capacity (blocks)", self.store.blocks() as u64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn disk(blocks: usize) -> SasiTargetDisk {
        SasiTargetDisk::new(
            Box::new(Cursor::new(vec![0u8; blocks * DISK_BLOCKSIZE])),
            DISK_BLOCKSIZE,
        )
        .unwrap()
    }

    fn run_cdb(d: &mut SasiTargetDisk, cdb: &[u8; CDB_LEN]) {
        d.select();
        d.begin_command();
        for &b in cdb {
            d.offer_byte(b);
        }
    }

    #[test]
    fn cdb_field_folding() {
        let mut d = disk(4);
        d.cmd.try_extend_from_slice(&[0x08, 0xFA, 0xBC, 0xDE, 0x02, 0x00])
            .unwrap();
        assert_eq!(d.cmd_lba(), 0x1A_BCDE);
        assert_eq!(d.cmd_lun(), 7);
        assert_eq!(d.cmd_blocks(), 2);
    }

    #[test]
    fn zero_block_count_means_256() {
        let mut d = disk(4);
        d.cmd.try_extend_from_slice(&[0x08, 0x00, 0x00, 0x00, 0x00, 0x00])
            .unwrap();
        assert_eq!(d.cmd_blocks(), 256);
    }

    #[test]
    fn test_unit_ready_goes_to_status() {
        let mut d = disk(4);
        run_cdb(&mut d, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(d.phase(), SasiPhase::Status);
        assert_eq!(d.current_byte(), STATUS_GOOD);
    }

    #[test]
    fn status_message_sequence() {
        let mut d = disk(4);
        run_cdb(&mut d, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

        assert_eq!(d.current_byte(), STATUS_GOOD);
        d.take_ack();
        assert_eq!(d.current_byte(), 0);
        d.take_ack();
        assert_eq!(d.phase(), SasiPhase::Message);
        assert_eq!(d.current_byte(), 0);
        d.take_ack();
        assert_eq!(d.phase(), SasiPhase::Idle);
        assert!(!d.control_lines().bsy());
    }

    #[test]
    fn nonzero_lun_field_fails() {
        let mut d = disk(4);
        run_cdb(&mut d, &[0x00, 0x20, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(d.current_byte(), STATUS_CHECK_CONDITION);
        assert_eq!(d.sense.code(), crate::sasi::ERR_ILLEGAL_UNIT);
    }

    #[test]
    fn phase_lines_follow_transaction() {
        let mut d = disk(4);
        d.select();
        assert!(d.control_lines().bsy());
        assert!(!d.control_lines().cd());

        d.begin_command();
        assert!(d.control_lines().cd());
        assert!(!d.control_lines().io());

        for b in [0x08u8, 0x00, 0x00, 0x00, 0x01, 0x00] {
            d.offer_byte(b);
        }
        // DATA IN for one block
        assert!(d.control_lines().io());
        assert!(!d.control_lines().cd());
        for _ in 0..DISK_BLOCKSIZE {
            d.take_ack();
        }
        // STATUS, then MESSAGE
        assert!(d.control_lines().cd() && d.control_lines().io());
        d.take_ack();
        d.take_ack();
        assert!(d.control_lines().msg());
    }
}
