//! Hardware events, and the events the driver reports upward

use crate::ral;
use ral::usb::EVT;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// One word popped from the EVT register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwEvent(u32);

impl HwEvent {
    pub const fn from_bits(bits: u32) -> Self {
        HwEvent(bits)
    }

    /// An event for one endpoint
    pub const fn endpoint_event(epnum: usize, direction: UsbDirection, setup: bool) -> Self {
        let dir = match direction {
            UsbDirection::In => EVT::DIR_IN::mask,
            UsbDirection::Out => 0,
        };
        let setup = if setup { EVT::IS_SETUP::mask } else { 0 };
        HwEvent(EVT::VALID::mask | ((epnum as u32) << EVT::EP::offset) & EVT::EP::mask | dir | setup)
    }

    /// The event FIFO lost events
    pub const fn overflow() -> Self {
        HwEvent(EVT::VALID::mask | EVT::OVERFLOW::mask)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    const fn field(self, offset: u32, mask: u32) -> u32 {
        (self.0 & mask) >> offset
    }

    pub const fn is_valid(self) -> bool {
        self.field(EVT::VALID::offset, EVT::VALID::mask) != 0
    }

    pub const fn is_overflow(self) -> bool {
        self.field(EVT::OVERFLOW::offset, EVT::OVERFLOW::mask) != 0
    }

    pub const fn endpoint(self) -> usize {
        self.field(EVT::EP::offset, EVT::EP::mask) as usize
    }

    pub const fn direction(self) -> UsbDirection {
        if self.field(EVT::DIR_IN::offset, EVT::DIR_IN::mask) != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub const fn is_setup(self) -> bool {
        self.field(EVT::IS_SETUP::offset, EVT::IS_SETUP::mask) != 0
    }
}

/// Drains the EVT register while the core signals pending events
pub struct EventFifo<'a> {
    usb: &'a ral::usb::RegisterBlock,
}

impl<'a> EventFifo<'a> {
    pub fn new(usb: &'a ral::usb::RegisterBlock) -> Self {
        EventFifo { usb }
    }
}

impl Iterator for EventFifo<'_> {
    type Item = HwEvent;
    fn next(&mut self) -> Option<HwEvent> {
        if ral::read_reg!(ral::usb, self.usb, CSR, EVT_PENDING == 1) {
            Some(HwEvent(ral::read_reg!(ral::usb, self.usb, EVT)))
        } else {
            None
        }
    }
}

/// Result of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum XferResult {
    Success,
    /// The endpoint closed before the transfer finished
    Failed,
}

/// Bus-level conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum BusEvent {
    /// The host reset the bus; all endpoint state is gone
    Reset,
    /// Start of frame
    Sof,
    Suspend,
    Resume,
}

/// Something the device stack needs to handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A transfer started with `xfer` is done
    XferComplete {
        ep: EndpointAddress,
        len: usize,
        result: XferResult,
    },
    /// EP0 received a SETUP packet
    Setup([u8; 8]),
    Bus(BusEvent),
}

const QUEUE_DEPTH: usize = 48;

/// A fixed-size FIFO of [`Event`]s
pub struct EventQueue {
    events: [Option<Event>; QUEUE_DEPTH],
    head: usize,
    len: usize,
}

impl EventQueue {
    pub const fn new() -> Self {
        EventQueue {
            events: [None; QUEUE_DEPTH],
            head: 0,
            len: 0,
        }
    }

    /// Append an event
    ///
    /// Returns `false`, dropping the event, if the queue is full.
    pub fn push(&mut self, event: Event) -> bool {
        if self.len == QUEUE_DEPTH {
            return false;
        }
        self.events[(self.head + self.len) % QUEUE_DEPTH] = Some(event);
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<Event> {
        if self.len == 0 {
            return None;
        }
        let event = self.events[self.head].take();
        self.head = (self.head + 1) % QUEUE_DEPTH;
        self.len -= 1;
        event
    }

    /// Drop the events that `keep` rejects, preserving order
    pub fn retain(&mut self, mut keep: impl FnMut(&Event) -> bool) {
        let mut kept = 0;
        for i in 0..self.len {
            if let Some(event) = self.events[(self.head + i) % QUEUE_DEPTH].take() {
                if keep(&event) {
                    self.events[(self.head + kept) % QUEUE_DEPTH] = Some(event);
                    kept += 1;
                }
            }
        }
        self.len = kept;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        *self = EventQueue::new();
    }
}
