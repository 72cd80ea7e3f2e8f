//! no2usb device controller driver
//!
//! The driver owns the core's registers, the endpoint transfer engine, and
//! the packet memory allocator. It turns interrupts into [`Event`]s, and
//! it starts transfers on behalf of the device stack.
//!
//! It's usable without the [`Stack`](crate::Stack): call
//! [`poll()`](Driver::poll) from the interrupt handler, then drain
//! [`next_event()`](Driver::next_event).

use core::ptr::NonNull;

use crate::{
    bd::State,
    buffer::Buffer,
    epr::{EpPair, EpType, Status},
    event::{BusEvent, Event, EventFifo, EventQueue, HwEvent, XferResult},
    pktmem::PacketMemory,
    ral,
    endpoint::EpMemory,
    state::{EndpointTable, PacketAllocator, ENDPOINT_COUNT, EP0_IN_DATA, EP0_OUT_DATA, EP0_SETUP},
};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// EP0 OUT BD that only receives SETUP packets
const SETUP_BD: usize = 1;
/// SETUP packet length
const SETUP_LEN: usize = 8;
/// Largest value of a BD length field
const MAX_PACKET_LEN: usize = 0x3ff;

/// Driver configuration
///
/// The defaults follow the `event-fifo` and `sof` crate features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The core was built with an event FIFO, so that events name their
    /// endpoint. Otherwise, every event triggers a poll of all endpoints.
    pub event_fifo: bool,
    /// Enable the start-of-frame interrupt, and report [`BusEvent::Sof`]
    pub sof: bool,
    /// EP0 max packet size; between 8 and 64
    pub ep0_max_packet_size: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            event_fifo: cfg!(feature = "event-fifo"),
            sof: cfg!(feature = "sof"),
            ep0_max_packet_size: 64,
        }
    }
}

/// A no2usb driver
///
/// After you allocate a `Driver` with [`new()`](Driver::new), you must
/// call [`initialize()`](Driver::initialize) once. The host then resets the
/// bus, which configures EP0.
pub struct Driver {
    usb: &'static ral::usb::RegisterBlock,
    eps: &'static [EpPair; ENDPOINT_COUNT],
    mem: PacketMemory,
    config: Config,
    endpoints: EndpointTable,
    alloc: PacketAllocator,
    /// EP0 answers everything but SETUP with STALL
    ep0_stall: bool,
    suspended: bool,
    events: EventQueue,
}

// Safety: the driver exclusively owns the registers and memories it points to.
unsafe impl Send for Driver {}

impl Driver {
    /// Create a new `Driver`
    ///
    /// Creation does nothing except for taking the registers. After creating
    /// the driver, call [`initialize()`](Driver::initialize).
    pub fn new<P: crate::Peripherals>(peripherals: P, config: Config) -> Self {
        let ral::Instances { usb, eps, mem } = ral::instances(peripherals);
        Driver {
            usb,
            eps,
            mem,
            config,
            endpoints: EndpointTable::new(),
            alloc: PacketAllocator::new(),
            ep0_stall: false,
            suspended: false,
            events: EventQueue::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// EP0 max packet size, limited to what full-speed allows
    pub fn ep0_max_packet_size(&self) -> usize {
        usize::from(self.config.ep0_max_packet_size).clamp(8, 64)
    }

    /// Reset the core, with the pull-up off and interrupts disabled
    pub fn initialize(&mut self) {
        self.reset_state();
        self.hw_reset(false);
        ral::write_reg!(ral::usb, self.usb, IR, 0);
    }

    fn reset_state(&mut self) {
        self.endpoints.reset();
        self.alloc.reset();
        self.ep0_stall = false;
        self.suspended = false;
        self.events.clear();
    }

    fn hw_reset(&self, pull_up: bool) {
        for pair in self.eps {
            pair.OUT.reset();
            pair.IN.reset();
        }
        ral::write_reg!(ral::usb, self.usb, CSR, PU_ENA: pull_up as u32, CEL_ENA: 1, ADDR_MATCH: 1, ADDR: 0);
        ral::write_reg!(ral::usb, self.usb, AR, BUS_RST_CLEAR: 1, SOF_CLEAR: 1, CEL_RELEASE: 1);
    }

    /// Enable (`true`) or disable (`false`) USB interrupts
    pub fn set_interrupts(&mut self, interrupts: bool) {
        if interrupts {
            // Keep this in sync with the poll() behaviors
            ral::write_reg!(ral::usb, self.usb, IR, SOF_PENDING: self.config.sof as u32, EVT_PENDING: 1, BUS_RST_RELEASE: 1);
        } else {
            ral::write_reg!(ral::usb, self.usb, IR, 0);
        }
    }

    /// Disable interrupts, returning the prior enables
    fn mask_interrupts(&self) -> u32 {
        let ir = ral::read_reg!(ral::usb, self.usb, IR);
        ral::write_reg!(ral::usb, self.usb, IR, 0);
        ir
    }

    fn restore_interrupts(&self, ir: u32) {
        ral::write_reg!(ral::usb, self.usb, IR, ir);
    }

    /// Enable the pull-up, signaling the host that a device is present
    pub fn attach(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, CSR, PU_ENA: 1);
    }

    /// Disable the pull-up
    pub fn detach(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, CSR, PU_ENA: 0);
    }

    pub fn is_attached(&self) -> bool {
        ral::read_reg!(ral::usb, self.usb, CSR, PU_ENA == 1)
    }

    /// Finish a SET_ADDRESS request, then apply the address
    ///
    /// Sends the status ZLP, and waits for the host to acknowledge it with
    /// interrupts disabled. The new address must not apply before that.
    pub fn set_address(&mut self, address: u8) {
        let ir = self.mask_interrupts();
        let bd = &self.eps[0].IN.BD[0];
        bd.arm(0);
        while bd.state() != State::DoneOk {}
        bd.clear();
        self.restore_interrupts(ir);

        ral::write_reg!(ral::usb, self.usb, CSR, PU_ENA: 1, CEL_ENA: 1, ADDR_MATCH: 1, ADDR: address as u32);
        debug!("ADDRESS {}", address);
    }

    /// Returns the device address
    pub fn address(&self) -> u8 {
        ral::read_reg!(ral::usb, self.usb, CSR, ADDR) as u8
    }

    fn push(&mut self, event: Event) {
        if !self.events.push(event) {
            error!("Event queue full");
        }
    }

    /// Returns the next event, if any
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    /// Reset all endpoint state, and configure EP0
    ///
    /// Invoked by [`poll()`](Driver::poll) when the host resets the bus.
    pub fn bus_reset(&mut self) {
        debug!("RESET");
        self.hw_reset(true);
        self.reset_state();
        self.ep0_configure();
        self.push(Event::Bus(BusEvent::Reset));
    }

    fn ep0_configure(&mut self) {
        let ep0 = &self.eps[0];
        ep0.OUT.configure(EpType::Control, Status::BD_CTRL);
        ep0.IN.configure(EpType::Control, Status::DT);

        ep0.IN.BD[0].set_ptr(EP0_IN_DATA);
        ep0.OUT.BD[0].set_ptr(EP0_OUT_DATA);
        ep0.OUT.BD[SETUP_BD].set_ptr(EP0_SETUP);

        ep0.IN.BD[0].clear();
        ep0.OUT.BD[0].clear();
        ep0.OUT.BD[SETUP_BD].arm(SETUP_LEN);

        let mps = self.ep0_max_packet_size();
        self.endpoints.get_mut(0, UsbDirection::Out).open(mps, false);
        self.endpoints.get_mut(0, UsbDirection::In).open(mps, false);
    }

    /// Handle a SETUP packet, if one arrived
    fn ep0_handle_setup(&mut self) {
        let eps = self.eps;
        let ep0 = &eps[0];
        let setup_bd = &ep0.OUT.BD[SETUP_BD];
        match setup_bd.state() {
            State::DoneOk => {
                // Finish what's left of the previous control transfer
                if self.endpoints.get(0, UsbDirection::In).is_busy() {
                    self.advance_in(0);
                }
                if self.endpoints.get(0, UsbDirection::Out).is_busy() {
                    self.advance_out(0);
                }
                for direction in [UsbDirection::In, UsbDirection::Out] {
                    let ep = self.endpoints.get_mut(0, direction);
                    if ep.is_busy() {
                        debug!("EP0 {:?} superseded by SETUP", direction);
                        ep.abandon();
                    }
                }

                let mut setup = [0u8; SETUP_LEN];
                self.mem.read(&mut setup, setup_bd.ptr());
                trace!("SETUP {:X}", setup);

                ep0.IN.BD[0].clear();
                ep0.OUT.BD[0].clear();
                self.ep0_stall = false;

                // Control data and status IN stages start with DATA1
                ep0.IN.configure(EpType::Control, Status::DT);

                setup_bd.arm(SETUP_LEN);
                ral::write_reg!(ral::usb, self.usb, AR, CEL_RELEASE: 1);

                // Completions of the superseded control transfer
                self.events
                    .retain(|event| !matches!(event, Event::XferComplete { ep, .. } if ep.index() == 0));
                self.push(Event::Setup(setup));
            }
            State::DoneErr => setup_bd.arm(SETUP_LEN),
            _ => {}
        }
    }

    fn ep0_arm_stall(&self) {
        self.eps[0].OUT.BD[0].arm_stall();
        self.eps[0].IN.BD[0].arm_stall();
    }

    fn advance_in(&mut self, epnum: usize) {
        let epr = &self.eps[epnum].IN;
        if let Some(len) = self
            .endpoints
            .get_mut(epnum, UsbDirection::In)
            .advance_in(epnum, epr, &self.mem)
        {
            self.push(Event::XferComplete {
                ep: EndpointAddress::from_parts(epnum, UsbDirection::In),
                len,
                result: XferResult::Success,
            });
        }
    }

    fn advance_out(&mut self, epnum: usize) {
        let epr = &self.eps[epnum].OUT;
        if let Some(len) = self
            .endpoints
            .get_mut(epnum, UsbDirection::Out)
            .advance_out(epnum, epr, &self.mem)
        {
            self.push(Event::XferComplete {
                ep: EndpointAddress::from_parts(epnum, UsbDirection::Out),
                len,
                result: XferResult::Success,
            });
        }
    }

    fn advance(&mut self, addr: EndpointAddress) {
        match addr.direction() {
            UsbDirection::In => self.advance_in(addr.index()),
            UsbDirection::Out => self.advance_out(addr.index()),
        }
    }

    /// Advance every busy endpoint, then look for a SETUP
    fn poll_all(&mut self) {
        if self.ep0_stall {
            self.ep0_arm_stall();
        }
        for epnum in 0..ENDPOINT_COUNT {
            if self.endpoints.get(epnum, UsbDirection::In).is_busy() {
                self.advance_in(epnum);
            }
            if self.endpoints.get(epnum, UsbDirection::Out).is_busy() {
                self.advance_out(epnum);
            }
        }
        self.ep0_handle_setup();
    }

    /// Route hardware events to the endpoints they name
    ///
    /// Without an event FIFO, or once the FIFO overflowed, the remaining
    /// events are only drained, and every endpoint is polled afterwards.
    pub(crate) fn dispatch(&mut self, events: impl IntoIterator<Item = HwEvent>) {
        let mut poll_all = false;
        for evt in events {
            trace!("EVT {:X}", evt.bits());
            if !self.config.event_fifo {
                poll_all = true;
                continue;
            }
            if !evt.is_valid() {
                warn!("Invalid event {:X}", evt.bits());
            }
            if poll_all {
                continue;
            }
            if evt.is_overflow() {
                warn!("Event FIFO overflow");
                poll_all = true;
                continue;
            }

            let epnum = evt.endpoint();
            if evt.is_setup() {
                self.ep0_handle_setup();
            } else if epnum == 0 && self.ep0_stall {
                self.ep0_arm_stall();
            } else {
                match evt.direction() {
                    UsbDirection::In => self.advance_in(epnum),
                    UsbDirection::Out => self.advance_out(epnum),
                }
            }
        }

        if poll_all {
            self.poll_all();
        }
    }

    /// Service the core
    ///
    /// Call this from the USB interrupt handler, or periodically. Results
    /// are available from [`next_event()`](Driver::next_event).
    pub fn poll(&mut self) {
        use ral::usb::CSR;
        let csr = ral::read_reg!(ral::usb, self.usb, CSR);

        if csr & CSR::BUS_RST_PENDING::mask != 0 {
            // Wait for the end of the reset
            if csr & CSR::BUS_RST::mask != 0 {
                return;
            }
            self.bus_reset();
        }

        if csr & CSR::BUS_SUSPEND::mask != 0 {
            if !self.suspended {
                debug!("SUSPEND");
                self.suspended = true;
                self.push(Event::Bus(BusEvent::Suspend));
            }
            return;
        } else if self.suspended {
            debug!("RESUME");
            self.suspended = false;
            self.push(Event::Bus(BusEvent::Resume));
        }

        if self.config.sof && csr & CSR::SOF_PENDING::mask != 0 {
            ral::write_reg!(ral::usb, self.usb, AR, SOF_CLEAR: 1);
            self.push(Event::Bus(BusEvent::Sof));
        }

        if csr & CSR::EVT_PENDING::mask == 0 {
            return;
        }

        let usb = self.usb;
        self.dispatch(EventFifo::new(usb));
    }

    /// Open a non-zero endpoint
    ///
    /// Bulk endpoints are dual-buffered. OUT endpoints start receiving
    /// right away. Re-opening an endpoint reuses its packet memory when
    /// it's large enough.
    pub fn ep_open(
        &mut self,
        addr: EndpointAddress,
        kind: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), UsbError> {
        let epnum = addr.index();
        if epnum == 0 || epnum >= ENDPOINT_COUNT {
            return Err(UsbError::InvalidEndpoint);
        }
        let ep_type = match kind {
            EndpointType::Isochronous { .. } => EpType::Isochronous,
            EndpointType::Bulk => EpType::Bulk,
            EndpointType::Interrupt => EpType::Interrupt,
            EndpointType::Control => {
                error!("Unsupported type for EP{}: {:?}", epnum, kind);
                return Err(UsbError::Unsupported);
            }
        };
        let mps = usize::from(max_packet_size);
        if mps == 0 || mps > MAX_PACKET_LEN {
            return Err(UsbError::Unsupported);
        }
        let dual = ep_type == EpType::Bulk;
        let direction = addr.direction();
        debug!("OPEN EP{} {:?} {:?} mps={} dual={}", epnum, direction, ep_type, mps, dual);

        let epr = self.eps[epnum].regs(direction);
        let ep = self.endpoints.endpoint_mut(addr);
        if !ep.memory().is_some_and(|memory| memory.fits(mps, dual)) {
            epr.BD[0].set_ptr(self.alloc.allocate(direction, mps));
            epr.BD[1].set_ptr(if dual { self.alloc.allocate(direction, mps) } else { 0 });
            ep.set_memory(EpMemory { size: mps, dual });
        }
        ep.open(mps, dual);

        epr.BD[0].clear();
        epr.BD[1].clear();
        if direction == UsbDirection::Out {
            epr.BD[0].arm(mps);
            epr.BD[1].arm(mps);
        }
        epr.configure(ep_type, if dual { Status::BD_DUAL } else { Status::empty() });
        Ok(())
    }

    /// Disable a non-zero endpoint
    ///
    /// A transfer in flight completes with [`XferResult::Failed`] and the
    /// bytes moved so far. The endpoint keeps its packet memory for a later
    /// open.
    pub fn ep_close(&mut self, addr: EndpointAddress) -> Result<(), UsbError> {
        let epnum = addr.index();
        if epnum == 0 || epnum >= ENDPOINT_COUNT {
            return Err(UsbError::InvalidEndpoint);
        }
        let epr = self.eps[epnum].regs(addr.direction());
        epr.configure(EpType::None, Status::empty());
        epr.BD[0].clear();
        epr.BD[1].clear();
        let ep = self.endpoints.endpoint_mut(addr);
        let pending = ep.is_busy().then(|| ep.progress().1);
        ep.close();
        if let Some(len) = pending {
            debug!("EP{} {:?} closed with {} bytes moved", epnum, addr.direction(), len);
            self.push(Event::XferComplete {
                ep: addr,
                len,
                result: XferResult::Failed,
            });
        }
        Ok(())
    }

    /// Check if the endpoint is configured in hardware
    pub fn is_ep_configured(&self, addr: EndpointAddress) -> bool {
        addr.index() < ENDPOINT_COUNT
            && self.eps[addr.index()].regs(addr.direction()).ep_type() != EpType::None
    }

    /// Check if the endpoint has a transfer in flight
    pub fn is_ep_busy(&self, addr: EndpointAddress) -> bool {
        addr.index() < ENDPOINT_COUNT && self.endpoints.endpoint(addr).is_busy()
    }

    /// Start a transfer on an endpoint
    ///
    /// `None` sends or expects a zero length packet, and requires a `len`
    /// of zero. A completion event follows once an IN transfer is handed to
    /// the core, or once an OUT transfer received `len` bytes or a short
    /// packet.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads (IN) or writes (OUT) of `len` bytes
    /// until the transfer completes, or until the next bus reset.
    pub unsafe fn xfer_raw(
        &mut self,
        addr: EndpointAddress,
        data: Option<NonNull<u8>>,
        len: usize,
    ) -> Result<(), UsbError> {
        if !self.is_ep_configured(addr) {
            return Err(UsbError::InvalidEndpoint);
        }
        if data.is_none() && len != 0 {
            return Err(UsbError::BufferOverflow);
        }
        if self.endpoints.endpoint(addr).is_busy() {
            return Err(UsbError::InvalidState);
        }
        trace!("XFER EP{} {:?} {}", addr.index(), addr.direction(), len);

        let ir = self.mask_interrupts();
        self.endpoints.endpoint_mut(addr).start(data, len);
        self.advance(addr);
        self.restore_interrupts(ir);
        Ok(())
    }

    /// Start a transfer of `len` bytes, using a transfer buffer
    ///
    /// Don't touch the buffer until the transfer completes.
    pub fn xfer(&mut self, addr: EndpointAddress, buffer: &Buffer, len: usize) -> Result<(), UsbError> {
        if len > buffer.len() {
            return Err(UsbError::BufferOverflow);
        }
        // Safety: transfer memory is static, and the caller leaves it alone.
        unsafe { self.xfer_raw(addr, Some(buffer.as_ptr()), len) }
    }

    /// Send static data from an IN endpoint
    pub fn xfer_static(&mut self, addr: EndpointAddress, data: &'static [u8]) -> Result<(), UsbError> {
        if addr.direction() != UsbDirection::In {
            return Err(UsbError::InvalidEndpoint);
        }
        // Safety: the data is static, and IN transfers only read it.
        unsafe { self.xfer_raw(addr, NonNull::new(data.as_ptr().cast_mut()), data.len()) }
    }

    /// Send, or expect, a zero length packet
    pub fn xfer_zlp(&mut self, addr: EndpointAddress) -> Result<(), UsbError> {
        // Safety: nothing to access.
        unsafe { self.xfer_raw(addr, None, 0) }
    }

    /// Stall (`true`) or resume (`false`) an endpoint
    ///
    /// EP0 must keep receiving SETUP packets, so it can't be halted. A
    /// stall on either EP0 direction instead answers both directions with
    /// STALL until the next SETUP packet. Resuming EP0 does nothing.
    pub fn ep_stall(&mut self, stall: bool, addr: EndpointAddress) {
        let epnum = addr.index();
        if epnum >= ENDPOINT_COUNT {
            return;
        }
        trace!("STALL EP{} {:?} {}", epnum, addr.direction(), stall);
        if epnum == 0 {
            if stall {
                let ir = self.mask_interrupts();
                self.ep0_stall = true;
                self.ep0_arm_stall();
                self.restore_interrupts(ir);
            }
        } else if !self.eps[epnum].regs(addr.direction()).set_halted(stall) {
            warn!("EP{} can't halt", epnum);
        }
    }

    /// Checks if an endpoint is stalled
    pub fn is_ep_stalled(&self, addr: EndpointAddress) -> bool {
        match addr.index() {
            0 => self.ep0_stall,
            epnum if epnum < ENDPOINT_COUNT => self.eps[epnum].regs(addr.direction()).is_halted(),
            _ => false,
        }
    }

    /// Reset the data toggle of a non-zero endpoint to DATA0
    pub fn ep_reset_toggle(&mut self, addr: EndpointAddress) {
        let epnum = addr.index();
        if epnum != 0 && epnum < ENDPOINT_COUNT {
            self.eps[epnum].regs(addr.direction()).clear_toggle();
        }
    }

    /// Log the hardware and software state of an endpoint
    #[cfg_attr(not(feature = "defmt-03"), allow(unused_variables))]
    pub fn ep_debug(&self, addr: EndpointAddress) {
        let epnum = addr.index();
        if epnum >= ENDPOINT_COUNT {
            return;
        }
        let epr = self.eps[epnum].regs(addr.direction());
        let ep = self.endpoints.endpoint(addr);
        debug!(
            "EP{} {:?}: status={:X} bd[0].csr={:X} bd[1].csr={:X}",
            epnum,
            addr.direction(),
            epr.STATUS.read(),
            epr.BD[0].CSR.read(),
            epr.BD[1].CSR.read()
        );
        debug!(
            "EP{} {:?}: busy={} dual={} indices={} progress={}",
            epnum,
            addr.direction(),
            ep.is_busy(),
            ep.is_dual(),
            ep.indices(),
            ep.progress()
        );
    }
}
