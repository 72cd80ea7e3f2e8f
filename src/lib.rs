//! A USB device stack for the no2usb full-speed core
//!
//! `no2usb` drives the no2usb USB device core: a small register block, two
//! packet memories, and a pair of buffer descriptors per endpoint. The crate
//! has two layers.
//!
//! - [`Driver`] owns the hardware. It configures EP0 on bus reset, receives
//!   SETUP packets, splits transfers into packets, and reports [`Event`]s.
//! - [`Stack`] owns a `Driver`. It runs control transfers, answers the
//!   standard requests from a set of [`Descriptors`], tracks the
//!   [`DeviceState`], and dispatches everything else to your
//!   [`FunctionDriver`]s.
//!
//! Wrap the stack in a [`BusAdapter`] to share it with the USB interrupt
//! handler.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`]. Transfer buffers come from a static [`TransferMemory`].

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod bd;
mod buffer;
mod bus;
mod control;
mod desc;
mod driver;
mod endpoint;
mod epr;
mod event;
mod function;
mod pktmem;
mod ral;
mod stack;
mod state;
mod vcell;

#[cfg(test)]
mod testutil;

pub use buffer::{Allocator, Buffer, TransferMemory};
pub use bus::BusAdapter;
pub use control::{ControlState, ControlXfer, SetupPacket, CTRL_BUF_LEN};
pub use desc::{find, ConfigDesc, DescriptorIter, Descriptors, EndpointDesc, InterfaceDesc};
pub use driver::{Config, Driver};
pub use event::{BusEvent, Event, XferResult};
pub use function::{DriverChain, DriverId, FunctionDriver, Response};
pub use stack::{DeviceState, Stack};

/// A type that owns a no2usb core
///
/// An implementation of `Peripherals` is expected to own
///
/// - the core registers, with the endpoint registers 0x2000 bytes above
///   them
/// - the RX packet memory, where the core writes OUT and SETUP data
/// - the TX packet memory, where the core reads IN data
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// register block and both packet memories. The pointers returned by the
/// methods are assumed to be valid, and will be cast to the register and
/// memory definitions.
///
/// # Example
///
/// ```
/// use no2usb::Peripherals;
///
/// struct Usb;
///
/// unsafe impl Peripherals for Usb {
///     fn core(&self) -> *const () {
///         0x8400_0000 as *const ()
///     }
///     fn rx_data(&self) -> *const () {
///         0x8401_0000 as *const ()
///     }
///     fn tx_data(&self) -> *const () {
///         0x8402_0000 as *const ()
///     }
/// }
///
/// assert_eq!(Usb.core(), 0x8400_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the core registers
    fn core(&self) -> *const ();
    /// Returns the address of the RX packet memory
    fn rx_data(&self) -> *const ();
    /// Returns the address of the TX packet memory
    fn tx_data(&self) -> *const ();
}
