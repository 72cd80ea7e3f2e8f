//! Control transfers on EP0
//!
//! A control transfer starts with an 8 byte SETUP packet, then moves
//! through an optional data stage and a status stage. [`ControlState`]
//! tracks where the stack is; [`ControlXfer`] carries the data stage
//! between the stack and the function driver that accepted the request.

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

/// Largest data stage carried in the control buffer
pub const CTRL_BUF_LEN: usize = 64;

/// A parsed SETUP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    pub const fn parse(raw: &[u8; 8]) -> Self {
        SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Direction of the data stage
    pub const fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub const fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x3 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub const fn recipient(&self) -> Recipient {
        match self.request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// `bmRequestType` and `bRequest` as one word, for matching
    ///
    /// ```
    /// # use no2usb::SetupPacket;
    /// let req = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x01, 0, 0, 18, 0]);
    /// assert_eq!(req.request_and_type(), 0x8006);
    /// ```
    pub const fn request_and_type(&self) -> u16 {
        ((self.request_type as u16) << 8) | self.request as u16
    }

    /// The request has a data stage
    pub const fn has_data(&self) -> bool {
        self.length != 0
    }

    /// `(type, index)` of a GET_DESCRIPTOR request
    pub const fn descriptor_type_index(&self) -> (u8, u8) {
        ((self.value >> 8) as u8, self.value as u8)
    }
}

/// Where the stack is within a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ControlState {
    /// Waiting for a SETUP packet
    Idle,
    /// Sending the data stage
    DataIn,
    /// Receiving the data stage
    DataOut,
    /// Waiting for the host's status ZLP
    StatusDoneOut,
    /// Sending our status ZLP
    StatusDoneIn,
    /// The request was refused; waiting for the next SETUP
    Stall,
}

/// The data stage of a control transfer
///
/// For IN requests, the function driver fills the buffer, or points at
/// static data, and sets the length. The stack never sends more than the
/// host asked for. For OUT requests, the buffer holds the received data
/// when the driver's [`ctrl_done`](crate::FunctionDriver::ctrl_done) runs.
pub struct ControlXfer {
    buf: [u8; CTRL_BUF_LEN],
    data: Option<&'static [u8]>,
    len: usize,
}

impl ControlXfer {
    /// A transfer of `len` bytes, backed by the internal buffer
    ///
    /// The length is capped to the buffer size.
    pub const fn new(len: usize) -> Self {
        ControlXfer {
            buf: [0; CTRL_BUF_LEN],
            data: None,
            len: if len < CTRL_BUF_LEN { len } else { CTRL_BUF_LEN },
        }
    }

    /// Data stage length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the data stage length
    ///
    /// Without static data, the length can't exceed the internal buffer.
    pub fn set_len(&mut self, len: usize) {
        self.len = match self.data {
            Some(data) => len.min(data.len()),
            None => len.min(CTRL_BUF_LEN),
        };
    }

    /// The internal buffer
    pub fn buf(&self) -> &[u8; CTRL_BUF_LEN] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8; CTRL_BUF_LEN] {
        &mut self.buf
    }

    /// Answer an IN request with a copy of `data`
    pub fn reply(&mut self, data: &[u8]) {
        let len = data.len().min(CTRL_BUF_LEN);
        self.buf[..len].copy_from_slice(&data[..len]);
        self.data = None;
        self.len = len;
    }

    /// Answer an IN request with static data, like a descriptor
    pub fn reply_static(&mut self, data: &'static [u8]) {
        self.data = Some(data);
        self.len = data.len();
    }

    /// The static data, if any
    pub fn static_data(&self) -> Option<&'static [u8]> {
        self.data.map(|data| &data[..self.len])
    }

    /// The data stage bytes
    pub fn data(&self) -> &[u8] {
        match self.data {
            Some(data) => &data[..self.len],
            None => &self.buf[..self.len],
        }
    }

    /// Truncate to at most `len` bytes
    pub(crate) fn limit(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}
