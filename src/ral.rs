//! Register access layer for the no2usb core
//!
//! The no2usb core exposes a small block of global registers, followed
//! (at `core + 0x2000`) by sixteen pairs of endpoint register sets. Field
//! definitions follow the RAL convention (`offset`, `mask`, and `R` / `W` /
//! `RW` value modules), so that they work with the `ral-registers` macros.
//!
//! Packet data lives in two separate memories, one for data received from
//! the host (RX), and one for data sent to the host (TX).

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg};

use crate::{epr::EpPair, pktmem::PacketMemory, state::ENDPOINT_COUNT};

/// Byte offset from the core registers to the endpoint registers
pub const EP_REGS_OFFSET: usize = 1 << 13;

/// Defines a RAL field module
macro_rules! field {
    ($name:ident, $offset:expr, $width:expr) => {
        // The map is complete; not every field has a user
        #[allow(dead_code)]
        pub mod $name {
            pub const offset: u32 = $offset;
            pub const mask: u32 = $width << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    };
}

pub(crate) use field;

/// Global control registers
pub mod usb {
    use crate::vcell::VCell;

    #[repr(C)]
    pub struct RegisterBlock {
        pub CSR: VCell<u32>,
        pub AR: VCell<u32>,
        pub EVT: VCell<u32>,
        pub IR: VCell<u32>,
    }

    impl RegisterBlock {
        pub const fn new() -> Self {
            RegisterBlock {
                CSR: VCell::new(0),
                AR: VCell::new(0),
                EVT: VCell::new(0),
                IR: VCell::new(0),
            }
        }
    }

    /// Control and status
    pub mod CSR {
        field!(PU_ENA, 15, 1);
        field!(EVT_PENDING, 14, 1);
        field!(CEL_ACTIVE, 13, 1);
        field!(CEL_ENA, 12, 1);
        field!(BUS_SUSPEND, 11, 1);
        field!(BUS_RST, 10, 1);
        field!(BUS_RST_PENDING, 9, 1);
        field!(SOF_PENDING, 8, 1);
        field!(ADDR_MATCH, 7, 1);
        field!(ADDR, 0, 0x7f);
    }

    /// Action register; write-only strobes
    pub mod AR {
        field!(CEL_RELEASE, 13, 1);
        field!(BUS_RST_CLEAR, 9, 1);
        field!(SOF_CLEAR, 8, 1);
    }

    /// Event register; each read pops one event
    pub mod EVT {
        // FIFO mode only
        field!(VALID, 15, 1);
        // FIFO mode only
        field!(OVERFLOW, 14, 1);
        // Count mode only
        field!(CNT, 12, 0xf);
        field!(CODE, 8, 0xf);
        field!(EP, 4, 0xf);
        field!(DIR_IN, 3, 1);
        field!(IS_SETUP, 2, 1);
        field!(BD_IDX, 1, 1);
    }

    /// Interrupt enable
    pub mod IR {
        field!(SOF_PENDING, 5, 1);
        field!(EVT_PENDING, 4, 1);
        field!(BUS_SUSPEND, 3, 1);
        field!(BUS_RST_RELEASE, 2, 1);
        field!(BUS_RST, 1, 1);
        field!(BUS_RST_PENDING, 0, 1);
    }

}

/// The register blocks and memories of one no2usb core
pub struct Instances {
    pub usb: &'static usb::RegisterBlock,
    pub eps: &'static [EpPair; ENDPOINT_COUNT],
    pub mem: PacketMemory,
}

/// Converts the user's peripherals into register references
pub fn instances<P: crate::Peripherals>(peripherals: P) -> Instances {
    let core = peripherals.core();
    // Safety: the Peripherals implementation guarantees that these addresses
    // are valid, and that they are exclusively owned by this driver.
    unsafe {
        Instances {
            usb: &*core.cast(),
            eps: &*core.cast::<u8>().add(EP_REGS_OFFSET).cast(),
            mem: PacketMemory::new(peripherals.rx_data(), peripherals.tx_data()),
        }
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<usb::RegisterBlock>() == 16) as usize];
