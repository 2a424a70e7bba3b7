//! SASI target generic/shared code

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::debuggable::Debuggable;
use crate::sasi::{ERR_ADDR_VALID, ERR_NONE, SENSE_LEN};

bitfield! {
    /// SASI control lines as driven onto the bus
    ///
    /// BSY/CD/IO/MSG are target-driven, SEL/RST/ATN/ACK initiator-driven.
    /// REQ is synthesized by the bus controller and never stored.
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SasiCtl(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        pub bsy: bool @ 0,
        pub sel: bool @ 1,
        pub cd: bool @ 2,
        pub io: bool @ 3,
        pub msg: bool @ 4,
        pub req: bool @ 5,
        pub ack: bool @ 6,
        pub rst: bool @ 7,
        pub atn: bool @ 8,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
/// Phases of a target-driven SASI transaction
pub enum SasiPhase {
    /// Not selected, nothing in progress
    Idle,
    /// Accumulating command descriptor bytes
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    /// Status byte plus null filler
    Status,
    /// Single COMMAND COMPLETE byte
    Message,
}

/// Last error record, retrieved through REQUEST SENSE
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenseData {
    code: u8,
    lba: Option<u32>,
}

impl SenseData {
    pub fn set(&mut self, code: u8, lba: Option<u32>) {
        self.code = code;
        self.lba = lba;
    }

    pub fn clear(&mut self) {
        self.code = ERR_NONE;
        self.lba = None;
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    /// Encodes the record into the wire format: error code with an
    /// address-valid flag, then the 21-bit block address in CDB layout.
    pub fn encode(&self) -> [u8; SENSE_LEN] {
        let lba = self.lba.unwrap_or(0);
        [
            self.code | if self.lba.is_some() { ERR_ADDR_VALID } else { 0 },
            (lba >> 16) as u8 & 0x1F,
            (lba >> 8) as u8,
            lba as u8,
        ]
    }
}

/// An abstraction of a generic SASI target
///
/// The bus controller relays selection and byte handshakes to the target;
/// the target owns its phase sequencing and drives BSY/CD/IO/MSG back.
pub trait SasiTarget: Debuggable + Send {
    /// Bus reset notification (RST asserted)
    fn reset(&mut self);

    /// Selection won; the target claims the bus and asserts BSY
    fn select(&mut self);

    /// SEL released by the initiator; the COMMAND phase begins
    fn begin_command(&mut self);

    /// A byte driven by the initiator (COMMAND or DATA OUT, per current phase)
    fn offer_byte(&mut self, val: u8);

    /// The byte the target currently drives (DATA IN, STATUS or MESSAGE)
    fn current_byte(&self) -> u8;

    /// Initiator acknowledge of the current target-driven byte
    fn take_ack(&mut self);

    fn phase(&self) -> SasiPhase;

    /// BSY/CD/IO/MSG as currently driven by this target
    fn control_lines(&self) -> SasiCtl;

    // For block devices
    fn block_size(&self) -> Option<usize>;
    fn blocks(&self) -> Option<usize>;

    /// Returns the device's total capacity in bytes
    fn capacity(&self) -> Option<usize> {
        Some(self.block_size()? * self.blocks()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasi::ERR_ILLEGAL_ADDRESS;

    #[test]
    fn sense_encode_no_error() {
        let sense = SenseData::default();
        assert_eq!(sense.encode(), [0, 0, 0, 0]);
    }

    #[test]
    fn sense_encode_with_address() {
        let mut sense = SenseData::default();
        sense.set(ERR_ILLEGAL_ADDRESS, Some(0x1A_BCDE));
        assert_eq!(
            sense.encode(),
            [ERR_ILLEGAL_ADDRESS | ERR_ADDR_VALID, 0x1A, 0xBC, 0xDE]
        );
    }

    #[test]
    fn sense_clear_drops_address() {
        let mut sense = SenseData::default();
        sense.set(ERR_ILLEGAL_ADDRESS, Some(5));
        sense.clear();
        assert_eq!(sense.encode(), [0, 0, 0, 0]);
    }
}
