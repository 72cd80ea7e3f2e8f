//! Endpoint register sets
//!
//! Every endpoint number has an OUT and an IN register set. Each set is a
//! status register, followed by two buffer descriptors.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::bd::Bd;
use crate::vcell::VCell;

bitflags::bitflags! {
    /// Flags of the endpoint status register
    ///
    /// The endpoint type occupies the low three bits; see [`EpType`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status : u32 {
        /// Endpoint answers with STALL. Only valid for bulk, control and
        /// interrupt types; it aliases the isochronous type bit.
        const HALTED = 1 << 0;
        /// Alternate between both BDs
        const BD_DUAL = 1 << 4;
        /// EP0 OUT: BD1 is reserved for SETUP packets
        const BD_CTRL = 1 << 5;
        /// Index of the next BD the core will use
        const BD_IDX = 1 << 6;
        /// Data toggle
        const DT = 1 << 7;
    }
}

/// The endpoint type, as programmed into the status register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum EpType {
    None,
    Isochronous,
    Interrupt,
    Bulk,
    Control,
}

impl EpType {
    const MASK: u32 = 0x7;
    /// Type bits excluding the HALTED bit
    const BCI_MASK: u32 = 0x6;

    pub const fn bits(self) -> u32 {
        match self {
            EpType::None => 0,
            EpType::Isochronous => 1,
            EpType::Interrupt => 2,
            EpType::Bulk => 4,
            EpType::Control => 6,
        }
    }

    /// Decode the type from a status register value
    pub const fn from_status(status: u32) -> Self {
        match status & Self::BCI_MASK {
            2 => EpType::Interrupt,
            4 => EpType::Bulk,
            6 => EpType::Control,
            _ if status & Self::MASK == 1 => EpType::Isochronous,
            _ => EpType::None,
        }
    }

    /// Bulk, control and interrupt endpoints support the HALTED bit
    pub const fn can_halt(self) -> bool {
        matches!(self, EpType::Interrupt | EpType::Bulk | EpType::Control)
    }
}

/// One direction of one endpoint
#[repr(C)]
pub struct EpRegs {
    pub STATUS: VCell<u32>,
    _reserved: [u32; 3],
    pub BD: [Bd; 2],
}

impl EpRegs {
    pub const fn new() -> Self {
        EpRegs {
            STATUS: VCell::new(0),
            _reserved: [0; 3],
            BD: [Bd::new(), Bd::new()],
        }
    }

    /// Zero the status register and both BDs, including their pointers
    pub fn reset(&self) {
        self.STATUS.write(0);
        for bd in &self.BD {
            bd.reset();
        }
    }

    /// Write the type and flags, replacing everything in the register
    pub fn configure(&self, ep_type: EpType, flags: Status) {
        self.STATUS.write(ep_type.bits() | flags.bits());
    }

    pub fn ep_type(&self) -> EpType {
        EpType::from_status(self.STATUS.read())
    }

    pub fn flags(&self) -> Status {
        let status = self.STATUS.read();
        let mut flags = Status::from_bits_truncate(status);
        if !self.ep_type().can_halt() {
            flags.remove(Status::HALTED);
        }
        flags
    }

    pub fn is_halted(&self) -> bool {
        self.flags().contains(Status::HALTED)
    }

    /// Set or clear the HALTED bit
    ///
    /// Returns `false`, without touching the register, if the endpoint type
    /// cannot be halted.
    pub fn set_halted(&self, halted: bool) -> bool {
        if !self.ep_type().can_halt() {
            return false;
        }
        let mut status = self.STATUS.read();
        if halted {
            status |= Status::HALTED.bits();
        } else {
            status &= !Status::HALTED.bits();
        }
        self.STATUS.write(status);
        true
    }

    /// Reset the data toggle to DATA0
    pub fn clear_toggle(&self) {
        let status = self.STATUS.read();
        self.STATUS.write(status & !Status::DT.bits());
    }
}

/// The register sets of one endpoint number
#[repr(C)]
pub struct EpPair {
    pub OUT: EpRegs,
    pub IN: EpRegs,
}

impl EpPair {
    pub const fn new() -> Self {
        EpPair {
            OUT: EpRegs::new(),
            IN: EpRegs::new(),
        }
    }

    /// Select a register set by direction
    pub fn regs(&self, direction: usb_device::UsbDirection) -> &EpRegs {
        match direction {
            usb_device::UsbDirection::Out => &self.OUT,
            usb_device::UsbDirection::In => &self.IN,
        }
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<EpRegs>() == 32) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<EpPair>() == 64) as usize];
