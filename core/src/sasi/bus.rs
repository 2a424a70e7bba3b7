//! SASI bus controller
//!
//! Owns the shared control-line and data-line state and relays selection
//! and byte handshakes to the claiming target. The controller itself
//! carries no error policy: targets report failures through STATUS and
//! sense, and the bus only ever reflects line state.

use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::debuggable::{DebugProperties, DebugProperty, Debuggable};
use crate::sasi::SASI_TRACE;
use crate::sasi::disk::SasiTargetDisk;
use crate::sasi::target::{SasiCtl, SasiTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
enum SasiBusState {
    Idle,
    Reset,
    /// A target has claimed the bus; waiting for the initiator to drop SEL
    EndSelection,
    /// Target-driven phase sequence in progress
    Transfer,
}

pub struct SasiBus {
    state: SasiBusState,

    /// Lines as last driven by the initiator (SEL/RST/ATN)
    initiator: SasiCtl,

    /// Last byte driven onto the shared data lines (last-writer-wins)
    data: u8,

    /// LUN of the target currently claiming the bus
    selected: Option<usize>,

    /// Attached targets, indexed by LUN
    targets: [Option<Box<dyn SasiTarget>>; Self::MAX_LUNS],
}

impl SasiBus {
    pub const MAX_LUNS: usize = 8;

    pub fn new() -> Self {
        Self {
            state: SasiBusState::Idle,
            initiator: SasiCtl(0),
            data: 0,
            selected: None,
            targets: Default::default(),
        }
    }

    /// Registers a target at the given LUN
    pub fn attach_target_at(&mut self, target: Box<dyn SasiTarget>, lun: usize) -> Result<()> {
        if lun >= Self::MAX_LUNS {
            bail!("LUN out of range: {}", lun);
        }
        if self.targets[lun].is_some() {
            bail!("LUN {} already populated", lun);
        }
        self.targets[lun] = Some(target);
        Ok(())
    }

    /// Loads a disk image (filename) and attaches a hard disk unit at the given LUN
    pub fn attach_disk_at(&mut self, filename: &Path, block_size: usize, lun: usize) -> Result<()> {
        let disk = SasiTargetDisk::open(filename, block_size)?;
        self.attach_target_at(Box::new(disk), lun)
    }

    /// Detaches the target at the given LUN, dropping its backing store
    pub fn detach_target(&mut self, lun: usize) {
        if self.selected == Some(lun) {
            self.selected = None;
            self.state = SasiBusState::Idle;
        }
        self.targets[lun] = None;
    }

    /// Returns the block count of a target or None if detached
    pub fn target_blocks(&self, lun: usize) -> Option<usize> {
        self.targets[lun].as_ref().and_then(|t| t.blocks())
    }

    /// Returns the capacity in bytes of a target or None if detached
    pub fn target_capacity(&self, lun: usize) -> Option<usize> {
        self.targets[lun].as_ref().and_then(|t| t.capacity())
    }

    /// LUN of the target currently claiming the bus
    pub fn selected_lun(&self) -> Option<usize> {
        self.selected
    }

    /// Full RST pulse: assert, then release
    pub fn reset(&mut self) {
        self.set_control(SasiCtl(0).with_rst(true));
        self.set_control(SasiCtl(0));
    }

    /// Initiator drives SEL/RST/ATN. Target-driven lines in the mask are ignored.
    pub fn set_control(&mut self, lines: SasiCtl) {
        let masked = SasiCtl(0)
            .with_sel(lines.sel())
            .with_rst(lines.rst())
            .with_atn(lines.atn());
        let set = SasiCtl(masked.0 & !self.initiator.0);
        let clr = SasiCtl(!masked.0 & self.initiator.0);
        self.initiator = masked;

        if set.rst() {
            if SASI_TRACE {
                log::debug!("Bus reset asserted");
            }
            self.state = SasiBusState::Reset;
            self.selected = None;
            for t in self.targets.iter_mut().flatten() {
                t.reset();
            }
            return;
        }
        if self.state == SasiBusState::Reset {
            if clr.rst() {
                self.state = SasiBusState::Idle;
            }
            return;
        }

        if clr.sel() && self.state == SasiBusState::EndSelection {
            if let Some(t) = self.selected_target_mut() {
                t.begin_command();
            }
            self.state = SasiBusState::Transfer;
        }
        if set.sel() && self.state == SasiBusState::Idle {
            self.try_select();
        }
    }

    /// Initiator drives the data bus, with handshake side effects
    pub fn write_data(&mut self, val: u8) {
        self.data = val;
        match self.state {
            SasiBusState::Idle if self.initiator.sel() => self.try_select(),
            SasiBusState::Transfer => {
                let Some(t) = self.selected_target_mut() else {
                    return;
                };
                if !t.control_lines().io() {
                    t.offer_byte(val);
                    self.settle();
                }
            }
            _ => (),
        }
    }

    /// Loads the data register without handshake side effects
    pub fn set_data(&mut self, val: u8) {
        self.data = val;
    }

    /// Reads the visible data byte and acknowledges it
    pub fn read_data(&mut self) -> u8 {
        let val = self.read_bus_only();
        self.ack();
        val
    }

    /// Reads the visible data byte without acknowledging
    pub fn read_bus_only(&self) -> u8 {
        match self.state {
            SasiBusState::Transfer => self
                .selected_target()
                .map_or(self.data, |t| t.current_byte()),
            _ => self.data,
        }
    }

    /// Acknowledge step of the REQ/ACK handshake, for adapters that clock
    /// data and strobe separately
    pub fn ack(&mut self) {
        if self.state != SasiBusState::Transfer {
            return;
        }
        let data = self.data;
        let Some(t) = self.selected_target_mut() else {
            return;
        };
        if t.control_lines().io() {
            t.take_ack();
        } else {
            t.offer_byte(data);
        }
        self.settle();
    }

    /// Composed control line state. REQ is synthesized from bus activity
    /// rather than stored.
    pub fn line_state(&self) -> SasiCtl {
        let mut lines = self.initiator;
        if let Some(t) = self.selected_target() {
            lines.0 |= t.control_lines().0;
        }
        lines.set_req(matches!(
            self.state,
            SasiBusState::EndSelection | SasiBusState::Transfer
        ));
        lines
    }

    /// Selection: the data lines carry a one-hot LUN mask. The first
    /// populated matching slot claims the bus; an unpopulated address
    /// never responds and the bus stays idle.
    fn try_select(&mut self) {
        for lun in 0..Self::MAX_LUNS {
            if self.data & (1 << lun) == 0 {
                continue;
            }
            let Some(t) = self.targets[lun].as_mut() else {
                continue;
            };
            if SASI_TRACE {
                log::debug!("LUN {} claims the bus", lun);
            }
            t.select();
            self.selected = Some(lun);
            self.state = SasiBusState::EndSelection;
            return;
        }
    }

    /// Returns the bus to idle once the claiming target releases BSY
    fn settle(&mut self) {
        let released = self
            .selected_target()
            .is_none_or(|t| !t.control_lines().bsy());
        if released {
            self.selected = None;
            self.state = SasiBusState::Idle;
        }
    }

    fn selected_target(&self) -> Option<&dyn SasiTarget> {
        self.targets[self.selected?].as_deref()
    }

    fn selected_target_mut(&mut self) -> Option<&mut Box<dyn SasiTarget>> {
        self.targets[self.selected?].as_mut()
    }
}

impl Debuggable for SasiBus {
    fn debug_properties(&self) -> DebugProperties {
        let mut targets = vec![];
        for (lun, slot) in self.targets.iter().enumerate() {
            match slot {
                Some(t) => targets.push(DebugProperty::nested(
                    format!("LUN #{}", lun),
                    t.debug_properties(),
                )),
                None => targets.push(DebugProperty::tag(format!("LUN #{}", lun), "(no device)")),
            }
        }

        vec![
            DebugProperty::nested("Targets", targets),
            DebugProperty::tag("Bus state", self.state.into()),
            DebugProperty::byte("Data lines", self.data),
            DebugProperty::text("Control lines", format!("{:?}", self.line_state())),
            DebugProperty::text("Selected LUN", format!("{:?}", self.selected)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasi::disk::DISK_BLOCKSIZE;
    use std::io::Cursor;

    fn disk(blocks: usize) -> Box<SasiTargetDisk> {
        Box::new(
            SasiTargetDisk::new(
                Box::new(Cursor::new(vec![0u8; blocks * DISK_BLOCKSIZE])),
                DISK_BLOCKSIZE,
            )
            .unwrap(),
        )
    }

    #[test]
    fn attach_rejects_duplicate_lun() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 0).unwrap();
        assert!(bus.attach_target_at(disk(4), 0).is_err());
        assert!(bus.attach_target_at(disk(4), 8).is_err());
    }

    #[test]
    fn capacity_queries() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 2).unwrap();
        assert_eq!(bus.target_blocks(2), Some(4));
        assert_eq!(bus.target_capacity(2), Some(4 * DISK_BLOCKSIZE));
        assert_eq!(bus.target_capacity(0), None);
    }

    #[test]
    fn selection_on_sel_with_data_latched() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 1).unwrap();

        bus.set_data(1 << 1);
        bus.set_control(SasiCtl(0).with_sel(true));
        assert_eq!(bus.selected_lun(), Some(1));
        assert!(bus.line_state().bsy());
        assert!(bus.line_state().req());
    }

    #[test]
    fn selection_on_data_write_with_sel_held() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 3).unwrap();

        bus.set_control(SasiCtl(0).with_sel(true));
        assert_eq!(bus.selected_lun(), None);
        bus.write_data(1 << 3);
        assert_eq!(bus.selected_lun(), Some(3));
    }

    #[test]
    fn unpopulated_lun_never_responds() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 0).unwrap();

        bus.set_data(1 << 5);
        bus.set_control(SasiCtl(0).with_sel(true));
        assert_eq!(bus.selected_lun(), None);
        assert!(!bus.line_state().bsy());
        assert!(!bus.line_state().req());
    }

    #[test]
    fn selection_does_not_preempt_busy_bus() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 0).unwrap();
        bus.attach_target_at(disk(4), 1).unwrap();

        bus.set_data(1);
        bus.set_control(SasiCtl(0).with_sel(true));
        bus.set_control(SasiCtl(0));
        assert_eq!(bus.selected_lun(), Some(0));

        // A second selection attempt while LUN 0 holds BSY changes nothing
        bus.set_data(1 << 1);
        bus.set_control(SasiCtl(0).with_sel(true));
        assert_eq!(bus.selected_lun(), Some(0));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 0).unwrap();

        bus.set_data(1);
        bus.set_control(SasiCtl(0).with_sel(true));
        assert_eq!(bus.selected_lun(), Some(0));

        bus.set_control(SasiCtl(0).with_rst(true));
        bus.set_control(SasiCtl(0).with_rst(true));
        bus.set_control(SasiCtl(0));
        assert_eq!(bus.selected_lun(), None);
        assert!(!bus.line_state().bsy());
        assert!(!bus.line_state().req());

        // Bus is selectable again after the pulse
        bus.set_data(1);
        bus.set_control(SasiCtl(0).with_sel(true));
        assert_eq!(bus.selected_lun(), Some(0));
    }

    #[test]
    fn atn_passes_through() {
        let mut bus = SasiBus::new();
        bus.set_control(SasiCtl(0).with_atn(true));
        assert!(bus.line_state().atn());
        bus.set_control(SasiCtl(0));
        assert!(!bus.line_state().atn());
    }

    #[test]
    fn detach_while_selected_idles_the_bus() {
        let mut bus = SasiBus::new();
        bus.attach_target_at(disk(4), 0).unwrap();

        bus.set_data(1);
        bus.set_control(SasiCtl(0).with_sel(true));
        assert_eq!(bus.selected_lun(), Some(0));

        bus.detach_target(0);
        assert_eq!(bus.selected_lun(), None);
        assert!(!bus.line_state().bsy());
        assert_eq!(bus.target_blocks(0), None);
    }
}
