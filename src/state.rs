//! Endpoint state and packet memory allocation

use crate::endpoint::Endpoint;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Sixteen endpoint numbers, each with an OUT and an IN direction
pub const ENDPOINT_COUNT: usize = 16;

/// Packet memory offset of the EP0 OUT data BD
pub const EP0_OUT_DATA: usize = 0x00;
/// Packet memory offset of the EP0 SETUP BD
pub const EP0_SETUP: usize = 0x40;
/// Packet memory offset of the EP0 IN data BD
pub const EP0_IN_DATA: usize = 0x00;

/// Produces an index into the direction arrays; `0` is OUT, `1` is IN
pub fn dir_index(direction: UsbDirection) -> usize {
    (UsbDirection::In == direction) as usize
}

/// Software state for all endpoints
pub struct EndpointTable([[Endpoint; 2]; ENDPOINT_COUNT]);

impl EndpointTable {
    pub const fn new() -> Self {
        const PAIR: [Endpoint; 2] = [Endpoint::new(), Endpoint::new()];
        EndpointTable([PAIR; ENDPOINT_COUNT])
    }

    /// Forget everything, including memory assignments
    pub fn reset(&mut self) {
        *self = EndpointTable::new();
    }

    pub fn get(&self, epnum: usize, direction: UsbDirection) -> &Endpoint {
        &self.0[epnum][dir_index(direction)]
    }

    pub fn get_mut(&mut self, epnum: usize, direction: UsbDirection) -> &mut Endpoint {
        &mut self.0[epnum][dir_index(direction)]
    }

    pub fn endpoint(&self, addr: EndpointAddress) -> &Endpoint {
        self.get(addr.index(), addr.direction())
    }

    pub fn endpoint_mut(&mut self, addr: EndpointAddress) -> &mut Endpoint {
        self.get_mut(addr.index(), addr.direction())
    }
}

/// Hands out packet memory to endpoints
///
/// Each direction has its own memory, and its own bump pointer. Nothing is
/// ever freed; a bus reset starts over. The first bytes of each memory
/// belong to EP0.
pub struct PacketAllocator {
    next: [usize; 2],
}

impl PacketAllocator {
    /// EP0 OUT data and SETUP
    pub const OUT_BASE: usize = 0x48;
    /// EP0 IN data
    pub const IN_BASE: usize = 0x40;

    pub const fn new() -> Self {
        PacketAllocator {
            next: [Self::OUT_BASE, Self::IN_BASE],
        }
    }

    pub fn reset(&mut self) {
        *self = PacketAllocator::new();
    }

    /// Allocate `size` bytes, rounded up to a whole number of words
    pub fn allocate(&mut self, direction: UsbDirection, size: usize) -> usize {
        let next = &mut self.next[dir_index(direction)];
        let offset = *next;
        *next += (size + 3) & !3;
        offset
    }

    /// Returns the next offset for the direction
    pub fn next(&self, direction: UsbDirection) -> usize {
        self.next[dir_index(direction)]
    }
}
