//! Function drivers
//!
//! A function driver implements one USB function (a class, or a vendor
//! interface) on top of the device stack. The stack calls drivers in
//! registration order, and handles standard requests after all of them.

use crate::{
    control::{ControlXfer, SetupPacket},
    desc::{ConfigDesc, InterfaceDesc},
    driver::Driver,
    event::XferResult,
    stack::DeviceState,
};
use usb_device::{endpoint::EndpointAddress, UsbError};

/// A function driver's answer to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Response {
    /// Not mine; ask the next driver
    Continue,
    /// Handled
    Success,
    /// Mine, but refused
    Error,
}

/// Hooks that the device stack calls
///
/// Every hook has a default that ignores the call. Hooks receive the
/// [`Driver`] so that they can open endpoints and start transfers.
pub trait FunctionDriver: Send {
    /// Start of frame
    fn sof(&mut self, _usb: &mut Driver) {}

    /// The host reset the bus; endpoints and transfers are gone
    fn bus_reset(&mut self, _usb: &mut Driver) {}

    fn state_changed(&mut self, _usb: &mut Driver, _state: DeviceState) {}

    /// A control request
    ///
    /// `xfer` starts out with the length that the host requested. For IN
    /// requests, supply the data. For OUT requests, the data arrives in
    /// [`ctrl_done`](FunctionDriver::ctrl_done).
    fn ctrl_req(
        &mut self,
        _usb: &mut Driver,
        _req: &SetupPacket,
        _xfer: &mut ControlXfer,
    ) -> Response {
        Response::Continue
    }

    /// The request accepted by this driver is complete
    ///
    /// Called once the OUT data stage arrived, or once the status stage of
    /// an IN or no-data request is underway. Returning `false` after an
    /// OUT data stage answers the status stage with STALL.
    fn ctrl_done(&mut self, _usb: &mut Driver, _req: &SetupPacket, _xfer: &ControlXfer) -> bool {
        true
    }

    /// The host selected a configuration, or none
    fn set_conf(&mut self, _usb: &mut Driver, _conf: Option<ConfigDesc<'static>>) -> Response {
        Response::Continue
    }

    /// The host selected alternate setting `sel` of interface `base`
    fn set_intf(
        &mut self,
        _usb: &mut Driver,
        _base: InterfaceDesc<'static>,
        _sel: InterfaceDesc<'static>,
    ) -> Response {
        Response::Continue
    }

    /// Report the alternate setting of interface `base` in `alt`
    fn get_intf(&mut self, _usb: &mut Driver, _base: InterfaceDesc<'static>, _alt: &mut u8) -> Response {
        Response::Continue
    }

    /// A transfer on a non-zero endpoint finished
    fn xfer_complete(
        &mut self,
        _usb: &mut Driver,
        _ep: EndpointAddress,
        _len: usize,
        _result: XferResult,
    ) -> Response {
        Response::Continue
    }
}

/// Names a registered driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DriverId(u32);

type Entry<'a> = (DriverId, &'a mut dyn FunctionDriver);

/// An ordered set of up to `N` function drivers
pub struct DriverChain<'a, const N: usize> {
    drivers: [Option<Entry<'a>>; N],
    len: usize,
    next_id: u32,
}

impl<'a, const N: usize> DriverChain<'a, N> {
    pub fn new() -> Self {
        DriverChain {
            drivers: core::array::from_fn(|_| None),
            len: 0,
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a driver
    ///
    /// Returns `BufferOverflow` if the chain is full.
    pub fn register(&mut self, driver: &'a mut dyn FunctionDriver) -> Result<DriverId, UsbError> {
        if self.len == N {
            return Err(UsbError::BufferOverflow);
        }
        let id = DriverId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.drivers[self.len] = Some((id, driver));
        self.len += 1;
        Ok(id)
    }

    /// Remove a driver, keeping the order of the others
    pub fn unregister(&mut self, id: DriverId) -> Option<&'a mut dyn FunctionDriver> {
        let idx = self.drivers[..self.len]
            .iter()
            .position(|entry| matches!(entry, Some((entry_id, _)) if *entry_id == id))?;
        let (_, driver) = self.drivers[idx].take()?;
        self.drivers[idx..self.len].rotate_left(1);
        self.len -= 1;
        Some(driver)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry<'a>> {
        self.drivers[..self.len].iter_mut().flatten()
    }

    pub fn sof(&mut self, usb: &mut Driver) {
        for (_, driver) in self.iter_mut() {
            driver.sof(usb);
        }
    }

    pub fn bus_reset(&mut self, usb: &mut Driver) {
        for (_, driver) in self.iter_mut() {
            driver.bus_reset(usb);
        }
    }

    pub fn state_changed(&mut self, usb: &mut Driver, state: DeviceState) {
        for (_, driver) in self.iter_mut() {
            driver.state_changed(usb, state);
        }
    }

    /// Offer a control request to each driver, until one answers
    ///
    /// Returns the answer, and the driver that gave it.
    pub fn ctrl_req(
        &mut self,
        usb: &mut Driver,
        req: &SetupPacket,
        xfer: &mut ControlXfer,
    ) -> (Response, Option<DriverId>) {
        for (id, driver) in self.iter_mut() {
            match driver.ctrl_req(usb, req, xfer) {
                Response::Continue => {}
                rsp => return (rsp, Some(*id)),
            }
        }
        (Response::Continue, None)
    }

    /// Tell the driver that accepted a request that it's complete
    ///
    /// A driver that's gone accepts anything.
    pub fn ctrl_done(
        &mut self,
        id: DriverId,
        usb: &mut Driver,
        req: &SetupPacket,
        xfer: &ControlXfer,
    ) -> bool {
        self.iter_mut()
            .find(|(entry_id, _)| *entry_id == id)
            .map_or(true, |(_, driver)| driver.ctrl_done(usb, req, xfer))
    }

    /// Every driver sees the configuration; any error fails it
    pub fn set_conf(&mut self, usb: &mut Driver, conf: Option<ConfigDesc<'static>>) -> Response {
        let mut rsp = Response::Success;
        for (_, driver) in self.iter_mut() {
            if driver.set_conf(usb, conf) == Response::Error {
                rsp = Response::Error;
            }
        }
        rsp
    }

    pub fn set_intf(
        &mut self,
        usb: &mut Driver,
        base: InterfaceDesc<'static>,
        sel: InterfaceDesc<'static>,
    ) -> Response {
        for (_, driver) in self.iter_mut() {
            match driver.set_intf(usb, base, sel) {
                Response::Continue => {}
                rsp => return rsp,
            }
        }
        Response::Continue
    }

    pub fn get_intf(&mut self, usb: &mut Driver, base: InterfaceDesc<'static>, alt: &mut u8) -> Response {
        for (_, driver) in self.iter_mut() {
            match driver.get_intf(usb, base, alt) {
                Response::Continue => {}
                rsp => return rsp,
            }
        }
        Response::Continue
    }

    pub fn xfer_complete(
        &mut self,
        usb: &mut Driver,
        ep: EndpointAddress,
        len: usize,
        result: XferResult,
    ) -> Response {
        for (_, driver) in self.iter_mut() {
            match driver.xfer_complete(usb, ep, len, result) {
                Response::Continue => {}
                rsp => return rsp,
            }
        }
        Response::Continue
    }
}

impl<const N: usize> Default for DriverChain<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}
