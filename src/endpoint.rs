//! Endpoint transfer engine
//!
//! An [`Endpoint`] turns one flat transfer into a sequence of packets no
//! larger than the endpoint's max packet size. IN transfers are copied into
//! TX packet memory one packet at a time; OUT transfers are assembled from
//! packets in RX packet memory.
//!
//! Dual-buffered endpoints alternate between both BDs. `bdi_fill` is the
//! next BD to hand to the core, and `bdi_retire` is the next BD we expect
//! the core to finish. Single-buffered endpoints only ever use BD 0.

use core::ptr::NonNull;

use crate::{bd::State, epr::EpRegs, pktmem::PacketMemory};

/// The active transfer of an endpoint
#[derive(Clone, Copy)]
struct Xfer {
    /// `None` for a zero length packet
    buf: Option<NonNull<u8>>,
    /// Total transfer length
    len: usize,
    /// Bytes handled so far
    ofs: usize,
    /// Length of the most recently queued packet
    plen: usize,
}

impl Xfer {
    const IDLE: Xfer = Xfer {
        buf: None,
        len: 0,
        ofs: 0,
        plen: 0,
    };
}

/// Packet memory assigned to an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpMemory {
    /// Bytes behind each BD
    pub size: usize,
    /// Both BDs have memory
    pub dual: bool,
}

impl EpMemory {
    /// The assignment can serve an endpoint with this configuration
    pub fn fits(&self, mps: usize, dual: bool) -> bool {
        self.size >= mps && (self.dual || !dual)
    }
}

/// Software state of one endpoint direction
pub struct Endpoint {
    mps: usize,
    busy: bool,
    dual: bool,
    bdi_fill: usize,
    bdi_retire: usize,
    /// Kept across opens, so that reconfiguring reuses the memory
    memory: Option<EpMemory>,
    xfer: Xfer,
}

impl Endpoint {
    pub const fn new() -> Self {
        Endpoint {
            mps: 0,
            busy: false,
            dual: false,
            bdi_fill: 0,
            bdi_retire: 0,
            memory: None,
            xfer: Xfer::IDLE,
        }
    }

    /// Configure the endpoint, dropping any transfer
    pub fn open(&mut self, mps: usize, dual: bool) {
        *self = Endpoint {
            mps,
            dual,
            memory: self.memory,
            ..Endpoint::new()
        };
    }

    /// Forget the configuration and any transfer, keeping the memory
    /// assignment
    pub fn close(&mut self) {
        self.open(0, false);
    }

    pub fn max_packet_len(&self) -> usize {
        self.mps
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_dual(&self) -> bool {
        self.dual
    }

    /// Returns the `(fill, retire)` BD indices
    pub fn indices(&self) -> (usize, usize) {
        (self.bdi_fill, self.bdi_retire)
    }

    pub fn memory(&self) -> Option<EpMemory> {
        self.memory
    }

    pub fn set_memory(&mut self, memory: EpMemory) {
        self.memory = Some(memory);
    }

    /// Returns `(len, ofs, plen)` of the active transfer
    pub fn progress(&self) -> (usize, usize, usize) {
        (self.xfer.len, self.xfer.ofs, self.xfer.plen)
    }

    /// Begin a new transfer
    ///
    /// The caller advances the endpoint right after.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads (IN) or writes (OUT) of `len` bytes
    /// until the transfer completes, or until the endpoint is reset.
    pub unsafe fn start(&mut self, buf: Option<NonNull<u8>>, len: usize) {
        self.busy = true;
        self.xfer = Xfer {
            buf,
            len,
            ofs: 0,
            plen: 0,
        };
    }

    /// Drop the active transfer without signaling completion
    pub fn abandon(&mut self) {
        self.busy = false;
        self.xfer = Xfer::IDLE;
    }

    fn finish(&mut self) -> usize {
        let len = self.xfer.ofs;
        self.abandon();
        len
    }

    /// Advance an IN transfer
    ///
    /// Retires every BD the core has finished, then stages packets into
    /// every free BD. Returns the transfer length once the last packet is
    /// handed to the core.
    #[cfg_attr(not(feature = "defmt-03"), allow(unused_variables))]
    pub fn advance_in(&mut self, epnum: usize, epr: &EpRegs, mem: &PacketMemory) -> Option<usize> {
        loop {
            let bd = &epr.BD[self.bdi_retire];
            match bd.state() {
                State::DoneOk => bd.clear(),
                State::DoneErr => {
                    // The core retries IN packets on its own; this is unexpected.
                    bd.clear();
                    error!("EP{} IN DONE_ERR", epnum);
                }
                _ => break,
            }
            self.bdi_retire ^= self.dual as usize;
        }

        let mut complete = None;
        while self.busy {
            let bd = &epr.BD[self.bdi_fill];
            if bd.state() != State::None {
                break;
            }

            if let Some(buf) = self.xfer.buf {
                self.xfer.plen = (self.xfer.len - self.xfer.ofs).min(self.mps);
                // Safety: start() contract. ofs + plen <= len.
                let src = unsafe {
                    core::slice::from_raw_parts(buf.as_ptr().add(self.xfer.ofs), self.xfer.plen)
                };
                mem.write(bd.ptr(), src);
            }
            bd.arm(self.xfer.plen);
            self.xfer.ofs += self.xfer.plen;

            if self.xfer.ofs == self.xfer.len {
                let len = self.finish();
                trace!("EP{} IN complete {}", epnum, len);
                complete = Some(len);
            }

            self.bdi_fill ^= self.dual as usize;
        }
        complete
    }

    /// Advance an OUT transfer
    ///
    /// Harvests every packet the core has received, then arms every free
    /// BD. Returns the received length once the transfer is satisfied, or
    /// the host sends a short packet.
    ///
    /// EP0 OUT is only armed while a transfer is active, so that it never
    /// competes with SETUP reception.
    pub fn advance_out(&mut self, epnum: usize, epr: &EpRegs, mem: &PacketMemory) -> Option<usize> {
        let mut complete = None;
        loop {
            let bd = &epr.BD[self.bdi_retire];
            match bd.state() {
                State::DoneOk => {
                    // Data, and nowhere to put it. Leave it for the next transfer.
                    if !self.busy {
                        break;
                    }

                    self.xfer.plen = bd.received_len().min(self.xfer.len - self.xfer.ofs);
                    bd.clear();

                    if self.xfer.plen > 0 {
                        if let Some(buf) = self.xfer.buf {
                            // Safety: start() contract. ofs + plen <= len.
                            let dst = unsafe {
                                core::slice::from_raw_parts_mut(
                                    buf.as_ptr().add(self.xfer.ofs),
                                    self.xfer.plen,
                                )
                            };
                            mem.read(dst, bd.ptr());
                        }
                        self.xfer.ofs += self.xfer.plen;
                    }

                    if self.xfer.plen < self.mps || self.xfer.ofs == self.xfer.len {
                        let len = self.finish();
                        trace!("EP{} OUT complete {}", epnum, len);
                        complete = Some(len);
                    }
                }
                State::DoneErr => {
                    // Retry, always on BD 0
                    epr.BD[0].arm(self.mps);
                }
                _ => break,
            }
            self.bdi_retire ^= self.dual as usize;
        }

        loop {
            let bd = &epr.BD[self.bdi_fill];
            if bd.state() == State::None && (self.busy || epnum != 0) {
                bd.arm(self.mps);
            } else {
                break;
            }
            self.bdi_fill ^= self.dual as usize;
        }
        complete
    }
}
