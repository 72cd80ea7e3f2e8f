//! The USB device stack
//!
//! The [`Stack`] drives a [`Driver`]: it tracks the device state, runs
//! control transfers on EP0, answers the standard requests, and hands
//! everything else to the registered [`FunctionDriver`]s.

use crate::{
    buffer::Buffer,
    control::{ControlState, ControlXfer, SetupPacket, CTRL_BUF_LEN},
    desc::{ConfigDesc, Descriptors, InterfaceDesc},
    driver::Driver,
    event::{BusEvent, Event},
    function::{DriverChain, DriverId, FunctionDriver, Response},
};
use usb_device::{
    control::{Recipient, Request, RequestType},
    descriptor::descriptor_type,
    endpoint::EndpointAddress,
    UsbDirection, UsbError,
};

/// Interfaces with a tracked alternate setting
const MAX_INTERFACES: usize = 16;

/// USB device state
///
/// The states are ordered; a device that's `Configured` is also addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DeviceState {
    /// Pull-up disabled
    Disconnected,
    /// Pull-up enabled, waiting for a bus reset
    Connected,
    Default,
    Addressed,
    Configured,
    /// The bus is idle. The device resumes into its prior state.
    Suspended,
}

/// Who handles the current control request
#[derive(Clone, Copy)]
enum Owner {
    Standard,
    Function(DriverId),
}

struct Control {
    state: ControlState,
    req: SetupPacket,
    xfer: ControlXfer,
    owner: Owner,
    /// The IN data stage ends with a ZLP
    zlp: bool,
    /// SET_ADDRESS value, applied with the status stage
    address: Option<u8>,
}

impl Control {
    const fn new(req: SetupPacket) -> Self {
        Control {
            state: ControlState::Idle,
            req,
            xfer: ControlXfer::new(req.length as usize),
            owner: Owner::Standard,
            zlp: false,
            address: None,
        }
    }
}

fn ep0(direction: UsbDirection) -> EndpointAddress {
    EndpointAddress::from_parts(0, direction)
}

/// A USB device
///
/// Supports up to `N` function drivers.
///
/// `Stack` needs a transfer buffer of at least 64 bytes, which stages the
/// data of control transfers. Interrupt-driven firmware typically wraps
/// the stack in a [`BusAdapter`](crate::BusAdapter).
pub struct Stack<'a, const N: usize = 4> {
    usb: Driver,
    desc: &'static Descriptors,
    drivers: DriverChain<'a, N>,
    state: DeviceState,
    suspended: bool,
    conf: Option<ConfigDesc<'static>>,
    alts: [u8; MAX_INTERFACES],
    tick: u32,
    ctrl: Control,
    staging: Buffer,
}

impl<'a, const N: usize> Stack<'a, N> {
    pub fn new(usb: Driver, desc: &'static Descriptors, staging: Buffer) -> Self {
        Stack {
            usb,
            desc,
            drivers: DriverChain::new(),
            state: DeviceState::Disconnected,
            suspended: false,
            conf: None,
            alts: [0; MAX_INTERFACES],
            tick: 0,
            ctrl: Control::new(SetupPacket::parse(&[0; 8])),
            staging,
        }
    }

    /// Reset the core, and the stack, to the disconnected state
    pub fn initialize(&mut self) {
        self.usb.initialize();
        self.state = DeviceState::Disconnected;
        self.suspended = false;
        self.conf = None;
        self.alts = [0; MAX_INTERFACES];
        self.tick = 0;
        self.ctrl = Control::new(SetupPacket::parse(&[0; 8]));
    }

    /// Add a function driver, behind the ones already registered
    pub fn register(&mut self, driver: &'a mut dyn FunctionDriver) -> Result<DriverId, UsbError> {
        self.drivers.register(driver)
    }

    pub fn unregister(&mut self, id: DriverId) -> Option<&'a mut dyn FunctionDriver> {
        self.drivers.unregister(id)
    }

    pub fn driver(&self) -> &Driver {
        &self.usb
    }

    pub fn driver_mut(&mut self) -> &mut Driver {
        &mut self.usb
    }

    pub fn state(&self) -> DeviceState {
        if self.suspended {
            DeviceState::Suspended
        } else {
            self.state
        }
    }

    /// Start-of-frame count
    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// The active configuration, if any
    pub fn configuration(&self) -> Option<ConfigDesc<'static>> {
        self.conf
    }

    /// The alternate setting of an interface
    pub fn alt_setting(&self, interface: u8) -> u8 {
        self.alts.get(usize::from(interface)).copied().unwrap_or(0)
    }

    pub fn control_state(&self) -> ControlState {
        self.ctrl.state
    }

    /// Enable the pull-up; the host will reset the bus
    pub fn connect(&mut self) {
        if self.state != DeviceState::Disconnected {
            return;
        }
        self.usb.attach();
        self.set_state(DeviceState::Connected);
    }

    pub fn disconnect(&mut self) {
        if self.state < DeviceState::Connected {
            return;
        }
        self.usb.detach();
        self.set_state(DeviceState::Disconnected);
    }

    /// Service the device
    ///
    /// Call this from the USB interrupt handler, or periodically. Does
    /// nothing until connected.
    pub fn poll(&mut self) {
        if self.state < DeviceState::Connected {
            return;
        }
        self.usb.poll();
        self.process_events();
    }

    fn process_events(&mut self) {
        while let Some(event) = self.usb.next_event() {
            self.handle_event(event);
        }
    }

    fn notify_state(&mut self, prior: DeviceState) {
        let state = self.state();
        if state != prior {
            debug!("STATE {:?} -> {:?}", prior, state);
            self.drivers.state_changed(&mut self.usb, state);
        }
    }

    fn set_state(&mut self, state: DeviceState) {
        let prior = self.state();
        self.state = state;
        self.suspended = false;
        self.notify_state(prior);
    }

    fn suspend(&mut self) {
        let prior = self.state();
        self.suspended = true;
        self.notify_state(prior);
    }

    fn resume(&mut self) {
        let prior = self.state();
        self.suspended = false;
        self.notify_state(prior);
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Bus(BusEvent::Reset) => self.bus_reset(),
            // Until the first reset, nothing else matters
            _ if self.state < DeviceState::Default => {}
            Event::Bus(BusEvent::Suspend) => self.suspend(),
            Event::Bus(BusEvent::Resume) => self.resume(),
            Event::Bus(BusEvent::Sof) => {
                self.tick = self.tick.wrapping_add(1);
                self.drivers.sof(&mut self.usb);
            }
            Event::Setup(raw) => self.ctrl_setup(&raw),
            Event::XferComplete { ep, len, .. } if ep.index() == 0 => {
                self.ctrl_complete(ep.direction(), len)
            }
            Event::XferComplete { ep, len, result } => {
                if self.drivers.xfer_complete(&mut self.usb, ep, len, result) == Response::Continue {
                    trace!("EP{} {:?}: nobody took {}", ep.index(), ep.direction(), len);
                }
            }
        }
    }

    fn bus_reset(&mut self) {
        self.conf = None;
        self.alts = [0; MAX_INTERFACES];
        self.ctrl = Control::new(SetupPacket::parse(&[0; 8]));
        self.drivers.bus_reset(&mut self.usb);
        self.set_state(DeviceState::Default);
    }

    fn ctrl_setup(&mut self, raw: &[u8; 8]) {
        let req = SetupPacket::parse(raw);
        self.ctrl = Control::new(req);

        let (rsp, owner) = self.drivers.ctrl_req(&mut self.usb, &req, &mut self.ctrl.xfer);
        let rsp = match owner {
            Some(id) => {
                self.ctrl.owner = Owner::Function(id);
                rsp
            }
            None => self.standard_request(&req),
        };

        if rsp == Response::Success {
            self.ctrl_start();
        } else {
            self.ctrl_stall();
        }
    }

    /// Begin the data stage, or the status stage of a no-data request
    fn ctrl_start(&mut self) {
        let req = self.ctrl.req;
        if !req.has_data() {
            if let Some(address) = self.ctrl.address.take() {
                // Sends the status stage itself
                self.usb.set_address(address);
                self.ctrl.state = ControlState::Idle;
                self.set_state(if address == 0 {
                    DeviceState::Default
                } else {
                    DeviceState::Addressed
                });
            } else {
                self.ctrl_status_in();
            }
            return;
        }

        let result = match req.direction() {
            UsbDirection::In => {
                self.ctrl.xfer.limit(usize::from(req.length));
                let len = self.ctrl.xfer.len();
                self.ctrl.zlp = len > 0
                    && len < usize::from(req.length)
                    && len % self.usb.ep0_max_packet_size() == 0;
                self.ctrl.state = ControlState::DataIn;
                match self.ctrl.xfer.static_data() {
                    Some(data) => self.usb.xfer_static(ep0(UsbDirection::In), data),
                    None => {
                        self.staging.volatile_write(self.ctrl.xfer.data());
                        self.usb.xfer(ep0(UsbDirection::In), &self.staging, len)
                    }
                }
            }
            UsbDirection::Out => {
                let len = usize::from(req.length);
                self.ctrl.state = ControlState::DataOut;
                if len > CTRL_BUF_LEN {
                    Err(UsbError::BufferOverflow)
                } else {
                    self.usb.xfer(ep0(UsbDirection::Out), &self.staging, len)
                }
            }
        };

        if result.is_err() {
            self.ctrl_stall();
        }
    }

    fn ctrl_status_in(&mut self) {
        self.ctrl.state = ControlState::StatusDoneIn;
        if self.usb.xfer_zlp(ep0(UsbDirection::In)).is_err() {
            self.ctrl_stall();
        }
    }

    fn ctrl_stall(&mut self) {
        debug!(
            "STALL {:X} {:X} {:X} {:X} {:X}",
            self.ctrl.req.request_type,
            self.ctrl.req.request,
            self.ctrl.req.value,
            self.ctrl.req.index,
            self.ctrl.req.length
        );
        self.usb.ep_stall(true, ep0(UsbDirection::In));
        self.ctrl.state = ControlState::Stall;
    }

    /// Tell the request's owner that it's complete
    fn ctrl_done(&mut self) -> bool {
        match self.ctrl.owner {
            Owner::Standard => true,
            Owner::Function(id) => {
                self.drivers
                    .ctrl_done(id, &mut self.usb, &self.ctrl.req, &self.ctrl.xfer)
            }
        }
    }

    #[cfg_attr(not(feature = "defmt-03"), allow(unused_variables))]
    fn ctrl_complete(&mut self, direction: UsbDirection, len: usize) {
        match (self.ctrl.state, direction) {
            (ControlState::DataIn, UsbDirection::In) => {
                let result = if self.ctrl.zlp {
                    self.ctrl.zlp = false;
                    self.usb.xfer_zlp(ep0(UsbDirection::In))
                } else {
                    self.ctrl.state = ControlState::StatusDoneOut;
                    self.usb.xfer_zlp(ep0(UsbDirection::Out))
                };
                if result.is_err() {
                    self.ctrl_stall();
                }
            }
            (ControlState::DataOut, UsbDirection::Out) => {
                let len = len.min(CTRL_BUF_LEN);
                self.staging.volatile_read(&mut self.ctrl.xfer.buf_mut()[..len]);
                self.ctrl.xfer.set_len(len);
                if self.ctrl_done() {
                    self.ctrl_status_in();
                } else {
                    self.ctrl_stall();
                }
            }
            (ControlState::StatusDoneOut, UsbDirection::Out) => {
                self.ctrl.state = ControlState::Idle;
                self.ctrl_done();
            }
            (ControlState::StatusDoneIn, UsbDirection::In) => {
                self.ctrl.state = ControlState::Idle;
                // OUT data stages were already reported
                if !self.ctrl.req.has_data() {
                    self.ctrl_done();
                }
            }
            (state, direction) => {
                warn!("EP0 {:?} completion in {:?}", direction, state);
            }
        }
    }

    fn standard_request(&mut self, req: &SetupPacket) -> Response {
        if req.kind() != RequestType::Standard {
            return Response::Error;
        }
        match (req.recipient(), req.request) {
            (Recipient::Device, Request::GET_STATUS) => {
                let self_powered = self.conf.is_some_and(|conf| conf.is_self_powered());
                self.ctrl.xfer.reply(&[self_powered as u8, 0]);
                Response::Success
            }
            (Recipient::Interface, Request::GET_STATUS) => {
                match self.conf.and_then(|conf| conf.find_interface(req.index as u8, 0)) {
                    Some(_) => {
                        self.ctrl.xfer.reply(&[0, 0]);
                        Response::Success
                    }
                    None => Response::Error,
                }
            }
            (Recipient::Endpoint, Request::GET_STATUS) => {
                let ep = EndpointAddress::from(req.index as u8);
                if !self.usb.is_ep_configured(ep) {
                    return Response::Error;
                }
                let halted = ep.index() != 0 && self.usb.is_ep_stalled(ep);
                self.ctrl.xfer.reply(&[halted as u8, 0]);
                Response::Success
            }
            (Recipient::Endpoint, Request::CLEAR_FEATURE | Request::SET_FEATURE)
                if req.value == Request::FEATURE_ENDPOINT_HALT =>
            {
                let ep = EndpointAddress::from(req.index as u8);
                self.endpoint_halt(ep, req.request == Request::SET_FEATURE)
            }
            (Recipient::Device, Request::SET_ADDRESS) => {
                if self.state == DeviceState::Configured {
                    return Response::Error;
                }
                self.ctrl.address = Some((req.value & 0x7f) as u8);
                Response::Success
            }
            (Recipient::Device, Request::GET_DESCRIPTOR) => self.get_descriptor(req),
            (Recipient::Device, Request::GET_CONFIGURATION) => {
                self.ctrl.xfer.reply(&[self.conf.map_or(0, |conf| conf.value())]);
                Response::Success
            }
            (Recipient::Device, Request::SET_CONFIGURATION) => {
                self.set_configuration(req.value as u8)
            }
            (Recipient::Interface, Request::GET_INTERFACE) => self.get_interface(req.index as u8),
            (Recipient::Interface, Request::SET_INTERFACE) => {
                self.set_interface(req.index as u8, req.value as u8)
            }
            _ => Response::Error,
        }
    }

    fn endpoint_halt(&mut self, ep: EndpointAddress, halt: bool) -> Response {
        if ep.index() == 0 {
            return Response::Success;
        }
        if !self.usb.is_ep_configured(ep) {
            return Response::Error;
        }
        self.usb.ep_stall(halt, ep);
        if !halt {
            self.usb.ep_reset_toggle(ep);
        }
        Response::Success
    }

    fn get_descriptor(&mut self, req: &SetupPacket) -> Response {
        let (dt, index) = req.descriptor_type_index();
        let index = usize::from(index);
        let data = match dt {
            descriptor_type::DEVICE => Some(self.desc.device),
            descriptor_type::CONFIGURATION => self.desc.config(index).map(|conf| conf.as_bytes()),
            descriptor_type::STRING => self.desc.string(index),
            descriptor_type::BOS => self.desc.bos,
            _ => None,
        };
        match data {
            Some(data) => {
                self.ctrl.xfer.reply_static(data);
                Response::Success
            }
            None => Response::Error,
        }
    }

    /// Close every non-zero endpoint
    fn close_endpoints(&mut self) {
        for epnum in 1..crate::state::ENDPOINT_COUNT {
            for direction in [UsbDirection::Out, UsbDirection::In] {
                let ep = EndpointAddress::from_parts(epnum, direction);
                if self.usb.is_ep_configured(ep) {
                    self.usb.ep_close(ep).ok();
                }
            }
        }
    }

    fn open_interface(&mut self, intf: InterfaceDesc<'static>) -> Response {
        for ep in intf.endpoints() {
            if self
                .usb
                .ep_open(ep.address(), ep.ep_type(), ep.max_packet_size())
                .is_err()
            {
                error!("Can't open EP{} {:?}", ep.address().index(), ep.address().direction());
                return Response::Error;
            }
        }
        Response::Success
    }

    fn close_interface(&mut self, intf: InterfaceDesc<'static>) {
        for ep in intf.endpoints() {
            self.usb.ep_close(ep.address()).ok();
        }
    }

    fn set_configuration(&mut self, value: u8) -> Response {
        if self.state < DeviceState::Addressed {
            return Response::Error;
        }
        let conf = match value {
            0 => None,
            value => match self.desc.find_config(value) {
                Some(conf) => Some(conf),
                None => return Response::Error,
            },
        };

        self.close_endpoints();
        self.alts = [0; MAX_INTERFACES];
        self.conf = conf;

        let mut rsp = Response::Success;
        if let Some(conf) = conf {
            for intf in conf.interfaces().filter(|intf| intf.alt_setting() == 0) {
                if self.open_interface(intf) == Response::Error {
                    rsp = Response::Error;
                }
            }
        }
        if rsp == Response::Success {
            rsp = self.drivers.set_conf(&mut self.usb, conf);
        }

        if rsp == Response::Success && conf.is_some() {
            self.set_state(DeviceState::Configured);
        } else {
            if conf.is_some() {
                self.close_endpoints();
                self.conf = None;
            }
            self.set_state(DeviceState::Addressed);
        }
        rsp
    }

    fn get_interface(&mut self, number: u8) -> Response {
        let Some(base) = self.conf.and_then(|conf| conf.find_interface(number, 0)) else {
            return Response::Error;
        };
        let mut alt = self.alt_setting(number);
        match self.drivers.get_intf(&mut self.usb, base, &mut alt) {
            Response::Error => Response::Error,
            _ => {
                self.ctrl.xfer.reply(&[alt]);
                Response::Success
            }
        }
    }

    fn set_interface(&mut self, number: u8, alt: u8) -> Response {
        let Some(conf) = self.conf else {
            return Response::Error;
        };
        let (Some(base), Some(sel)) = (conf.find_interface(number, 0), conf.find_interface(number, alt)) else {
            return Response::Error;
        };
        if usize::from(number) >= MAX_INTERFACES {
            return Response::Error;
        }
        let current = conf.find_interface(number, self.alt_setting(number));

        if let Some(current) = current {
            self.close_interface(current);
        }
        let mut rsp = self.open_interface(sel);
        if rsp == Response::Success {
            rsp = match self.drivers.set_intf(&mut self.usb, base, sel) {
                // Nobody cares; only the default setting is acceptable
                Response::Continue if alt == 0 => Response::Success,
                Response::Continue => Response::Error,
                rsp => rsp,
            };
        }

        if rsp == Response::Success {
            self.alts[usize::from(number)] = alt;
        } else {
            self.close_interface(sel);
            if let Some(current) = current {
                self.open_interface(current);
            }
        }
        rsp
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceState, Stack};
    use crate::{
        bd::State,
        control::{ControlState, ControlXfer, SetupPacket},
        desc::{ConfigDesc, Descriptors, InterfaceDesc},
        driver::{Config, Driver},
        event::{HwEvent, XferResult},
        function::{FunctionDriver, Response},
        testutil::{self, FakeHw},
    };
    use std::sync::{Arc, Mutex};
    use usb_device::{endpoint::EndpointAddress, UsbDirection};

    const CSR_BUS_SUSPEND: u32 = 1 << 11;
    const CSR_BUS_RST_PENDING: u32 = 1 << 9;
    const CSR_SOF_PENDING: u32 = 1 << 8;

    #[rustfmt::skip]
    static CONFIG: [u8; 57] = [
        9, 2, 57, 0, 2, 1, 0, 0xc0, 50,
        // Interface 0: bulk pair
        9, 4, 0, 0, 2, 0xff, 0, 0, 0,
        7, 5, 0x81, 0x02, 64, 0, 0,
        7, 5, 0x01, 0x02, 64, 0, 0,
        // Interface 1, alt 0 and 1
        9, 4, 1, 0, 0, 0xff, 0, 0, 0,
        9, 4, 1, 1, 1, 0xff, 0, 0, 0,
        7, 5, 0x82, 0x03, 8, 0, 1,
    ];

    static STRING_64: [u8; 64] = {
        let mut string = [0u8; 64];
        string[0] = 64;
        string[1] = 3;
        string
    };

    static DESCRIPTORS: Descriptors = Descriptors {
        device: &[18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x09, 0x12, 0x01, 0x00, 0, 1, 0, 0, 0, 1],
        configs: &[&CONFIG],
        strings: &[&[4, 3, 0x09, 0x04], &STRING_64],
        bos: None,
    };

    #[derive(Debug, PartialEq)]
    enum Call {
        State(DeviceState),
        Reset,
        Sof,
        Conf(Option<u8>),
        Intf(u8, u8),
        Done(Vec<u8>),
        Xfer(EndpointAddress, usize, XferResult),
    }

    /// Owns vendor request 0x42 (IN) and 0x43 (OUT), records everything
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        accept_out: bool,
        alt_switch: bool,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Vec<Call>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let recorder = Recorder {
                calls: Arc::clone(&calls),
                accept_out: true,
                alt_switch: true,
            };
            (recorder, calls)
        }
        fn log(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl FunctionDriver for Recorder {
        fn sof(&mut self, _: &mut Driver) {
            self.log(Call::Sof);
        }
        fn bus_reset(&mut self, _: &mut Driver) {
            self.log(Call::Reset);
        }
        fn state_changed(&mut self, _: &mut Driver, state: DeviceState) {
            self.log(Call::State(state));
        }
        fn ctrl_req(&mut self, _: &mut Driver, req: &SetupPacket, xfer: &mut ControlXfer) -> Response {
            match req.request_and_type() {
                0xc042 => {
                    xfer.reply(b"hello");
                    Response::Success
                }
                0x4043 => Response::Success,
                _ => Response::Continue,
            }
        }
        fn ctrl_done(&mut self, _: &mut Driver, _: &SetupPacket, xfer: &ControlXfer) -> bool {
            self.log(Call::Done(xfer.data().to_vec()));
            self.accept_out
        }
        fn set_conf(&mut self, _: &mut Driver, conf: Option<ConfigDesc<'static>>) -> Response {
            self.log(Call::Conf(conf.map(|conf| conf.value())));
            Response::Success
        }
        fn set_intf(
            &mut self,
            _: &mut Driver,
            _: InterfaceDesc<'static>,
            sel: InterfaceDesc<'static>,
        ) -> Response {
            if !self.alt_switch {
                return Response::Continue;
            }
            self.log(Call::Intf(sel.number(), sel.alt_setting()));
            Response::Success
        }
        fn xfer_complete(
            &mut self,
            _: &mut Driver,
            ep: EndpointAddress,
            len: usize,
            result: XferResult,
        ) -> Response {
            self.log(Call::Xfer(ep, len, result));
            Response::Success
        }
    }

    fn fifo() -> Config {
        Config {
            event_fifo: true,
            sof: true,
            ep0_max_packet_size: 64,
        }
    }

    fn stack<'a>(hw: FakeHw) -> Stack<'a> {
        stack_with(hw, fifo())
    }

    fn stack_with<'a>(hw: FakeHw, config: Config) -> Stack<'a> {
        let mut stack = Stack::new(Driver::new(hw, config), &DESCRIPTORS, testutil::buffer(64));
        stack.initialize();
        stack
    }

    /// Connect, and let the host reset the bus
    fn reset(hw: FakeHw, stack: &mut Stack) {
        stack.connect();
        hw.set_csr(CSR_BUS_RST_PENDING);
        stack.poll();
        assert_eq!(stack.state(), DeviceState::Default);
    }

    fn in_(epnum: usize) -> EndpointAddress {
        EndpointAddress::from_parts(epnum, UsbDirection::In)
    }

    fn out(epnum: usize) -> EndpointAddress {
        EndpointAddress::from_parts(epnum, UsbDirection::Out)
    }

    fn setup(hw: FakeHw, stack: &mut Stack, raw: [u8; 8]) {
        hw.setup(raw);
        stack.usb.dispatch([HwEvent::endpoint_event(0, UsbDirection::Out, true)]);
        stack.process_events();
    }

    /// The host reads the EP0 IN packet
    fn host_in(hw: FakeHw, stack: &mut Stack) -> Vec<u8> {
        let data = hw.transmit(0, 0);
        stack.usb.dispatch([HwEvent::endpoint_event(0, UsbDirection::In, false)]);
        stack.process_events();
        data
    }

    /// The host sends an EP0 OUT packet
    fn host_out(hw: FakeHw, stack: &mut Stack, data: &[u8]) {
        hw.receive(0, 0, data);
        stack.usb.dispatch([HwEvent::endpoint_event(0, UsbDirection::Out, false)]);
        stack.process_events();
    }

    /// Jump past SET_ADDRESS, which busy-waits on the host
    fn addressed(stack: &mut Stack) {
        stack.state = DeviceState::Addressed;
    }

    fn configured(hw: FakeHw, stack: &mut Stack) {
        addressed(stack);
        setup(hw, stack, [0x00, 9, 1, 0, 0, 0, 0, 0]);
        assert_eq!(stack.state(), DeviceState::Configured);
        assert!(host_in(hw, stack).is_empty());
    }

    #[test]
    fn inactive_until_connected() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        hw.set_csr(CSR_BUS_RST_PENDING);
        stack.poll();
        assert_eq!(stack.state(), DeviceState::Disconnected);
        assert!(!stack.driver().is_ep_configured(out(0)));

        stack.connect();
        assert!(stack.driver().is_attached());
        assert_eq!(stack.state(), DeviceState::Connected);
        stack.poll();
        assert_eq!(stack.state(), DeviceState::Default);
        assert!(stack.driver().is_ep_configured(out(0)));
    }

    #[test]
    fn connect_disconnect() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();

        stack.disconnect();
        reset(hw, &mut stack);
        stack.connect();
        assert_eq!(stack.state(), DeviceState::Default);
        stack.disconnect();
        assert_eq!(stack.state(), DeviceState::Disconnected);
        assert!(!stack.driver().is_attached());

        assert_eq!(
            *calls.lock().unwrap(),
            [
                Call::State(DeviceState::Connected),
                Call::Reset,
                Call::State(DeviceState::Default),
                Call::State(DeviceState::Disconnected),
            ]
        );
    }

    #[test]
    fn get_device_descriptor() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        reset(hw, &mut stack);

        setup(hw, &mut stack, [0x80, 6, 0, 1, 0, 0, 64, 0]);
        assert_eq!(stack.control_state(), ControlState::StatusDoneOut);
        assert_eq!(host_in(hw, &mut stack), DESCRIPTORS.device);
        assert_eq!(hw.ep(0, UsbDirection::Out).BD[0].CSR.read(), 0x4000 | 64);

        host_out(hw, &mut stack, &[]);
        assert_eq!(stack.control_state(), ControlState::Idle);
    }

    #[test]
    fn in_data_is_truncated() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        reset(hw, &mut stack);

        setup(hw, &mut stack, [0x80, 6, 0, 2, 0, 0, 9, 0]);
        assert_eq!(host_in(hw, &mut stack), CONFIG[..9]);
        assert_eq!(stack.control_state(), ControlState::StatusDoneOut);
    }

    #[test]
    fn long_in_is_packetized() {
        let hw = FakeHw::new();
        let config = Config {
            ep0_max_packet_size: 8,
            ..fifo()
        };
        let mut stack = stack_with(hw, config);
        reset(hw, &mut stack);

        setup(hw, &mut stack, [0x80, 6, 0, 2, 0, 0, 0xff, 0]);
        let mut data = Vec::new();
        let mut packets = 0;
        while stack.control_state() == ControlState::DataIn {
            let packet = host_in(hw, &mut stack);
            assert_eq!(packet.len(), 8);
            data.extend(packet);
            packets += 1;
        }
        // The last packet is staged once the transfer completes
        assert_eq!(stack.control_state(), ControlState::StatusDoneOut);
        data.extend(host_in(hw, &mut stack));
        assert_eq!(packets, 7);
        assert_eq!(data, CONFIG);
    }

    #[test]
    fn setup_supersedes_unfinished_control_transfer() {
        let hw = FakeHw::new();
        let config = Config {
            ep0_max_packet_size: 8,
            ..fifo()
        };
        let mut stack = stack_with(hw, config);
        reset(hw, &mut stack);

        // 18 bytes, three packets
        setup(hw, &mut stack, [0x80, 6, 0, 1, 0, 0, 64, 0]);
        assert_eq!(host_in(hw, &mut stack), DESCRIPTORS.device[..8]);

        // The host takes the second packet, then gives up on the request.
        // Both events reach one interrupt.
        assert_eq!(hw.transmit(0, 0), DESCRIPTORS.device[8..16]);
        hw.setup([0x80, 6, 0, 2, 0, 0, 9, 0]);
        stack.usb.dispatch([
            HwEvent::endpoint_event(0, UsbDirection::In, false),
            HwEvent::endpoint_event(0, UsbDirection::Out, true),
        ]);
        stack.process_events();
        assert_eq!(stack.control_state(), ControlState::DataIn);
        assert_eq!(hw.ep(0, UsbDirection::In).BD[0].state(), State::RdyData);

        assert_eq!(host_in(hw, &mut stack), CONFIG[..8]);
        assert_eq!(stack.control_state(), ControlState::StatusDoneOut);
        assert_eq!(host_in(hw, &mut stack), CONFIG[8..9]);
        host_out(hw, &mut stack, &[]);
        assert_eq!(stack.control_state(), ControlState::Idle);
    }

    #[test]
    fn short_multiple_of_mps_ends_with_zlp() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        reset(hw, &mut stack);

        setup(hw, &mut stack, [0x80, 6, 1, 3, 0x09, 0x04, 0xff, 0]);
        assert_eq!(stack.control_state(), ControlState::DataIn);
        assert_eq!(host_in(hw, &mut stack), STRING_64);
        assert_eq!(stack.control_state(), ControlState::StatusDoneOut);
        assert!(host_in(hw, &mut stack).is_empty());

        // Exactly what the host asked for: no ZLP
        setup(hw, &mut stack, [0x80, 6, 1, 3, 0x09, 0x04, 64, 0]);
        assert_eq!(stack.control_state(), ControlState::StatusDoneOut);
    }

    #[test]
    fn unknown_request_stalls_until_setup() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        reset(hw, &mut stack);

        setup(hw, &mut stack, [0xc0, 0x99, 0, 0, 0, 0, 4, 0]);
        assert_eq!(stack.control_state(), ControlState::Stall);
        assert_eq!(hw.ep(0, UsbDirection::In).BD[0].state(), State::RdyStall);
        assert_eq!(hw.ep(0, UsbDirection::Out).BD[0].state(), State::RdyStall);

        setup(hw, &mut stack, [0x80, 0, 0, 0, 0, 0, 2, 0]);
        assert_eq!(stack.control_state(), ControlState::StatusDoneOut);
        assert_eq!(host_in(hw, &mut stack), [0, 0]);
    }

    #[test]
    fn function_in_request() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        calls.lock().unwrap().clear();

        setup(hw, &mut stack, [0xc0, 0x42, 0, 0, 0, 0, 16, 0]);
        assert_eq!(host_in(hw, &mut stack), b"hello");
        assert!(calls.lock().unwrap().is_empty());
        host_out(hw, &mut stack, &[]);
        assert_eq!(stack.control_state(), ControlState::Idle);
        assert_eq!(*calls.lock().unwrap(), [Call::Done(b"hello".to_vec())]);
    }

    #[test]
    fn function_out_request() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        calls.lock().unwrap().clear();

        setup(hw, &mut stack, [0x40, 0x43, 0, 0, 0, 0, 4, 0]);
        assert_eq!(stack.control_state(), ControlState::DataOut);
        assert_eq!(hw.ep(0, UsbDirection::Out).BD[0].CSR.read(), 0x4000 | 64);

        host_out(hw, &mut stack, &[1, 2, 3, 4]);
        assert_eq!(*calls.lock().unwrap(), [Call::Done(vec![1, 2, 3, 4])]);
        // Status stage
        assert_eq!(hw.ep(0, UsbDirection::In).BD[0].CSR.read(), 0x4000);
        assert_eq!(stack.control_state(), ControlState::Idle);
    }

    #[test]
    fn refused_out_data_stalls() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, _calls) = Recorder::new();
        rec.accept_out = false;
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);

        setup(hw, &mut stack, [0x40, 0x43, 0, 0, 0, 0, 2, 0]);
        host_out(hw, &mut stack, &[9, 9]);
        assert_eq!(stack.control_state(), ControlState::Stall);
        assert_eq!(hw.ep(0, UsbDirection::In).BD[0].state(), State::RdyStall);
    }

    #[test]
    fn long_out_request_stalls() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, _calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);

        setup(hw, &mut stack, [0x40, 0x43, 0, 0, 0, 0, 65, 0]);
        assert_eq!(stack.control_state(), ControlState::Stall);
    }

    #[test]
    fn set_address_waits_for_status() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        reset(hw, &mut stack);

        let req = SetupPacket::parse(&[0x00, 5, 0x85, 0, 0, 0, 0, 0]);
        assert_eq!(stack.standard_request(&req), Response::Success);
        assert_eq!(stack.ctrl.address, Some(5));
        // Nothing applies before the status stage
        assert_eq!(stack.driver().address(), 0);
        assert_eq!(stack.state(), DeviceState::Default);
    }

    #[test]
    fn set_configuration() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);

        // Not before an address
        setup(hw, &mut stack, [0x00, 9, 1, 0, 0, 0, 0, 0]);
        assert_eq!(stack.control_state(), ControlState::Stall);

        calls.lock().unwrap().clear();
        configured(hw, &mut stack);
        assert_eq!(
            *calls.lock().unwrap(),
            [Call::Conf(Some(1)), Call::State(DeviceState::Configured)]
        );
        assert_eq!(stack.configuration().map(|conf| conf.value()), Some(1));
        assert!(stack.driver().is_ep_configured(in_(1)));
        assert!(stack.driver().is_ep_configured(out(1)));
        assert!(!stack.driver().is_ep_configured(in_(2)));
        assert_eq!(hw.ep(1, UsbDirection::Out).STATUS.read(), 0x0004 | 0x0010);

        setup(hw, &mut stack, [0x80, 8, 0, 0, 0, 0, 1, 0]);
        assert_eq!(host_in(hw, &mut stack), [1]);
        setup(hw, &mut stack, [0x80, 0, 0, 0, 0, 0, 2, 0]);
        assert_eq!(host_in(hw, &mut stack), [1, 0]);

        // Unknown configuration
        setup(hw, &mut stack, [0x00, 9, 7, 0, 0, 0, 0, 0]);
        assert_eq!(stack.control_state(), ControlState::Stall);
        assert_eq!(stack.state(), DeviceState::Configured);

        calls.lock().unwrap().clear();
        setup(hw, &mut stack, [0x00, 9, 0, 0, 0, 0, 0, 0]);
        assert_eq!(stack.state(), DeviceState::Addressed);
        assert!(!stack.driver().is_ep_configured(in_(1)));
        assert_eq!(
            *calls.lock().unwrap(),
            [Call::Conf(None), Call::State(DeviceState::Addressed)]
        );
    }

    #[test]
    fn endpoint_halt() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        reset(hw, &mut stack);
        configured(hw, &mut stack);

        setup(hw, &mut stack, [0x02, 3, 0, 0, 0x81, 0, 0, 0]);
        assert!(stack.driver().is_ep_stalled(in_(1)));
        setup(hw, &mut stack, [0x82, 0, 0, 0, 0x81, 0, 2, 0]);
        assert_eq!(host_in(hw, &mut stack), [1, 0]);

        hw.ep(1, UsbDirection::In).STATUS.write(hw.ep(1, UsbDirection::In).STATUS.read() | 0x80);
        setup(hw, &mut stack, [0x02, 1, 0, 0, 0x81, 0, 0, 0]);
        assert!(!stack.driver().is_ep_stalled(in_(1)));
        assert_eq!(hw.ep(1, UsbDirection::In).STATUS.read(), 0x0004 | 0x0010);

        // Unconfigured endpoint
        setup(hw, &mut stack, [0x02, 3, 0, 0, 0x05, 0, 0, 0]);
        assert_eq!(stack.control_state(), ControlState::Stall);
    }

    #[test]
    fn set_interface() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        configured(hw, &mut stack);
        calls.lock().unwrap().clear();

        setup(hw, &mut stack, [0x01, 11, 1, 0, 1, 0, 0, 0]);
        assert_eq!(stack.control_state(), ControlState::Idle);
        assert_eq!(stack.alt_setting(1), 1);
        assert!(stack.driver().is_ep_configured(in_(2)));
        assert_eq!(*calls.lock().unwrap(), [Call::Intf(1, 1)]);

        setup(hw, &mut stack, [0x81, 10, 0, 0, 1, 0, 1, 0]);
        assert_eq!(host_in(hw, &mut stack), [1]);

        setup(hw, &mut stack, [0x01, 11, 0, 0, 1, 0, 0, 0]);
        assert_eq!(stack.alt_setting(1), 0);
        assert!(!stack.driver().is_ep_configured(in_(2)));

        // No such setting
        setup(hw, &mut stack, [0x01, 11, 2, 0, 1, 0, 0, 0]);
        assert_eq!(stack.control_state(), ControlState::Stall);
    }

    #[test]
    fn unclaimed_alternate_setting_is_refused() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, _calls) = Recorder::new();
        rec.alt_switch = false;
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        configured(hw, &mut stack);

        setup(hw, &mut stack, [0x01, 11, 1, 0, 1, 0, 0, 0]);
        assert_eq!(stack.control_state(), ControlState::Stall);
        assert_eq!(stack.alt_setting(1), 0);
        assert!(!stack.driver().is_ep_configured(in_(2)));

        setup(hw, &mut stack, [0x01, 11, 0, 0, 1, 0, 0, 0]);
        assert_eq!(stack.control_state(), ControlState::Idle);
    }

    #[test]
    fn transfers_reach_drivers() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        configured(hw, &mut stack);
        calls.lock().unwrap().clear();

        let buffer = testutil::buffer(64);
        stack.driver_mut().xfer(out(1), &buffer, 64).unwrap();
        hw.receive(1, 0, &[5; 10]);
        stack.usb.dispatch([HwEvent::endpoint_event(1, UsbDirection::Out, false)]);
        stack.process_events();
        assert_eq!(
            *calls.lock().unwrap(),
            [Call::Xfer(out(1), 10, XferResult::Success)]
        );
    }

    #[test]
    fn deconfigure_fails_pending_transfers() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        configured(hw, &mut stack);

        let buffer = testutil::buffer(64);
        stack.driver_mut().xfer(out(1), &buffer, 64).unwrap();
        calls.lock().unwrap().clear();

        setup(hw, &mut stack, [0x00, 9, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            *calls.lock().unwrap(),
            [
                Call::Conf(None),
                Call::State(DeviceState::Addressed),
                Call::Xfer(out(1), 0, XferResult::Failed),
            ]
        );
        assert!(!stack.driver().is_ep_busy(out(1)));
    }

    #[test]
    fn suspend_resume() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        calls.lock().unwrap().clear();

        hw.set_csr(CSR_BUS_SUSPEND);
        stack.poll();
        assert_eq!(stack.state(), DeviceState::Suspended);
        hw.clear_csr(CSR_BUS_SUSPEND);
        stack.poll();
        assert_eq!(stack.state(), DeviceState::Default);
        assert_eq!(
            *calls.lock().unwrap(),
            [
                Call::State(DeviceState::Suspended),
                Call::State(DeviceState::Default)
            ]
        );
    }

    #[test]
    fn sof_ticks() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        let (mut rec, calls) = Recorder::new();
        stack.register(&mut rec).unwrap();
        reset(hw, &mut stack);
        calls.lock().unwrap().clear();

        for _ in 0..3 {
            hw.set_csr(CSR_SOF_PENDING);
            stack.poll();
        }
        assert_eq!(stack.tick(), 3);
        assert_eq!(*calls.lock().unwrap(), [Call::Sof, Call::Sof, Call::Sof]);
    }

    #[test]
    fn bus_reset_unconfigures() {
        let hw = FakeHw::new();
        let mut stack = stack(hw);
        reset(hw, &mut stack);
        configured(hw, &mut stack);

        hw.set_csr(CSR_BUS_RST_PENDING);
        stack.poll();
        assert_eq!(stack.state(), DeviceState::Default);
        assert!(stack.configuration().is_none());
        assert!(!stack.driver().is_ep_configured(in_(1)));
        assert_eq!(stack.control_state(), ControlState::Idle);
    }
}
