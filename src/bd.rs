//! Buffer descriptors (BD)
//!
//! Each endpoint register set carries two buffer descriptors. A BD is a
//! `{csr, ptr}` pair: `csr` holds the packet life-cycle state, the packet
//! length, and (EP0 OUT only) a SETUP marker; `ptr` is the byte offset of
//! the packet in shared packet memory.
//!
//! Software moves a BD from `NONE` to one of the `RDY_*` states. The core
//! moves it from `RDY_*` to `DONE_OK` or `DONE_ERR` after bus activity.
//! Software returns it to `NONE` once the packet is harvested.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::ral;
use crate::vcell::VCell;

/// Slot is free
pub const STATE_NONE: u32 = 0x0000;
/// Slot is armed for a data packet
pub const STATE_RDY_DATA: u32 = 0x4000;
/// Slot is armed to answer with a STALL handshake
pub const STATE_RDY_STALL: u32 = 0x6000;
/// Packet transferred
pub const STATE_DONE_OK: u32 = 0x8000;
/// Packet failed; only expected for OUT packets
pub const STATE_DONE_ERR: u32 = 0xa000;

/// A decoded BD state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum State {
    None,
    RdyData,
    RdyStall,
    DoneOk,
    DoneErr,
    /// An encoding the core never produces
    Reserved(u32),
}

impl State {
    /// Decode the state from a full `csr` value
    pub const fn from_csr(csr: u32) -> Self {
        match csr & CSR::STATE::mask {
            STATE_NONE => State::None,
            STATE_RDY_DATA => State::RdyData,
            STATE_RDY_STALL => State::RdyStall,
            STATE_DONE_OK => State::DoneOk,
            STATE_DONE_ERR => State::DoneErr,
            other => State::Reserved(other),
        }
    }

    /// The `csr` bits for this state
    pub const fn bits(self) -> u32 {
        match self {
            State::None => STATE_NONE,
            State::RdyData => STATE_RDY_DATA,
            State::RdyStall => STATE_RDY_STALL,
            State::DoneOk => STATE_DONE_OK,
            State::DoneErr => STATE_DONE_ERR,
            State::Reserved(bits) => bits & CSR::STATE::mask,
        }
    }
}

/// Length of the CRC16 that the core stores with every received packet
const CRC_LEN: usize = 2;

#[repr(C)]
pub struct Bd {
    pub CSR: VCell<u32>,
    pub PTR: VCell<u32>,
}

impl Bd {
    pub const fn new() -> Self {
        Bd {
            CSR: VCell::new(0),
            PTR: VCell::new(0),
        }
    }

    /// Returns the slot's life-cycle state
    pub fn state(&self) -> State {
        State::from_csr(self.CSR.read())
    }

    /// Returns the raw length field
    pub fn len(&self) -> usize {
        ral::read_reg!(crate::bd, self, CSR, LEN) as usize
    }

    /// Returns the payload length of a received packet
    ///
    /// The core counts the trailing CRC into the length field.
    pub fn received_len(&self) -> usize {
        self.len().saturating_sub(CRC_LEN)
    }

    /// Arm the slot for a data packet of `len` bytes
    ///
    /// For IN, the bytes must already be staged at [`ptr`](Bd::ptr). For
    /// OUT, `len` is the most the slot accepts.
    pub fn arm(&self, len: usize) {
        ral::write_reg!(crate::bd, self, CSR, STATE: RDY_DATA, LEN: len as u32);
    }

    /// Arm the slot to STALL the next token
    pub fn arm_stall(&self) {
        ral::write_reg!(crate::bd, self, CSR, STATE: RDY_STALL);
    }

    /// Return the slot to `NONE`
    pub fn clear(&self) {
        self.CSR.write(STATE_NONE);
    }

    /// Returns the packet memory offset of this slot
    pub fn ptr(&self) -> usize {
        self.PTR.read() as usize
    }

    /// Set the packet memory offset of this slot
    pub fn set_ptr(&self, ptr: usize) {
        self.PTR.write(ptr as u32);
    }

    /// Zero both words
    pub fn reset(&self) {
        self.CSR.write(0);
        self.PTR.write(0);
    }
}

pub mod CSR {
    pub mod STATE {
        pub const offset: u32 = 13;
        pub const mask: u32 = 0x7 << offset;
        pub mod RW {
            pub const NONE: u32 = 0;
            pub const RDY_DATA: u32 = 2;
            pub const RDY_STALL: u32 = 3;
            pub const DONE_OK: u32 = 4;
            pub const DONE_ERR: u32 = 5;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod IS_SETUP {
        pub const offset: u32 = 12;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod LEN {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x3ff << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Bd>() == 8) as usize];
