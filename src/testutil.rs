//! Fake no2usb hardware for unit tests
//!
//! Registers and packet memories live in leaked host memory. Tests play the
//! role of the core and the host by writing BD states and packet bytes.

use core::ptr::NonNull;

use crate::{
    bd::{State, STATE_DONE_OK},
    buffer::{Allocator, Buffer},
    epr::{EpPair, EpRegs},
    ral::{self, EP_REGS_OFFSET},
    state::ENDPOINT_COUNT,
    vcell::VCell,
};
use usb_device::UsbDirection;

/// Words of each packet memory
const PACKET_MEMORY_WORDS: usize = 1024;

#[repr(C)]
struct FakeCore {
    usb: ral::usb::RegisterBlock,
    _gap: [u8; EP_REGS_OFFSET - core::mem::size_of::<ral::usb::RegisterBlock>()],
    eps: [EpPair; ENDPOINT_COUNT],
}

#[derive(Clone, Copy)]
pub struct FakeHw {
    core: &'static FakeCore,
    rx: &'static [VCell<u32>],
    tx: &'static [VCell<u32>],
}

unsafe impl crate::Peripherals for FakeHw {
    fn core(&self) -> *const () {
        (self.core as *const FakeCore).cast()
    }
    fn rx_data(&self) -> *const () {
        self.rx.as_ptr().cast()
    }
    fn tx_data(&self) -> *const () {
        self.tx.as_ptr().cast()
    }
}

fn memory() -> &'static [VCell<u32>] {
    Box::leak(
        (0..PACKET_MEMORY_WORDS)
            .map(|_| VCell::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    )
}

impl FakeHw {
    pub fn new() -> Self {
        let core = Box::leak(Box::new(FakeCore {
            usb: ral::usb::RegisterBlock::new(),
            _gap: [0; EP_REGS_OFFSET - core::mem::size_of::<ral::usb::RegisterBlock>()],
            eps: core::array::from_fn(|_| EpPair::new()),
        }));
        FakeHw {
            core,
            rx: memory(),
            tx: memory(),
        }
    }

    pub fn usb(&self) -> &'static ral::usb::RegisterBlock {
        &self.core.usb
    }

    pub fn ep(&self, epnum: usize, direction: UsbDirection) -> &'static EpRegs {
        self.core.eps[epnum].regs(direction)
    }

    /// Set bits in the CSR
    pub fn set_csr(&self, bits: u32) {
        let csr = self.core.usb.CSR.read();
        self.core.usb.CSR.write(csr | bits);
    }

    /// Clear bits in the CSR
    pub fn clear_csr(&self, bits: u32) {
        let csr = self.core.usb.CSR.read();
        self.core.usb.CSR.write(csr & !bits);
    }

    fn write_rx(&self, ofs: usize, data: &[u8]) {
        for (idx, chunk) in data.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.rx[ofs / 4 + idx].write(u32::from_ne_bytes(word));
        }
    }

    /// The host sends an OUT packet, received into BD `idx`
    pub fn receive(&self, epnum: usize, idx: usize, data: &[u8]) {
        let bd = &self.ep(epnum, UsbDirection::Out).BD[idx];
        assert_eq!(bd.state(), State::RdyData, "EP{epnum} OUT BD{idx} not armed");
        self.write_rx(bd.ptr(), data);
        bd.CSR.write(STATE_DONE_OK | (data.len() as u32 + 2));
    }

    /// The host sends a SETUP packet
    pub fn setup(&self, setup: [u8; 8]) {
        let bd = &self.ep(0, UsbDirection::Out).BD[1];
        assert_eq!(bd.state(), State::RdyData, "SETUP BD not armed");
        self.write_rx(bd.ptr(), &setup);
        bd.CSR.write(STATE_DONE_OK | 0x1000 | 10);
    }

    /// The host reads the IN packet staged in BD `idx`
    pub fn transmit(&self, epnum: usize, idx: usize) -> Vec<u8> {
        let bd = &self.ep(epnum, UsbDirection::In).BD[idx];
        assert_eq!(bd.state(), State::RdyData, "EP{epnum} IN BD{idx} not armed");
        let len = bd.len();
        let data = (0..(len + 3) / 4)
            .flat_map(|idx| self.tx[bd.ptr() / 4 + idx].read().to_ne_bytes())
            .take(len)
            .collect();
        bd.CSR.write(STATE_DONE_OK | len as u32);
        data
    }
}

/// Allocate a transfer buffer from leaked memory
pub fn buffer(size: usize) -> Buffer {
    let memory: &'static mut [u8] = Box::leak(vec![0u8; size].into_boxed_slice());
    let mut alloc = unsafe { Allocator::new(NonNull::from(memory).cast(), size) };
    alloc.allocate(size).unwrap()
}

#[cfg(test)]
mod tests {
    use super::FakeHw;

    #[test]
    fn endpoint_registers_offset() {
        let hw = FakeHw::new();
        let core = hw.usb() as *const _ as usize;
        let ep0 = hw.ep(0, usb_device::UsbDirection::Out) as *const _ as usize;
        let ep1_in = hw.ep(1, usb_device::UsbDirection::In) as *const _ as usize;
        assert_eq!(ep0 - core, 0x2000);
        assert_eq!(ep1_in - core, 0x2000 + 64 + 32);
    }
}
