//! Descriptor lookup
//!
//! Descriptors are kept as raw, little-endian blobs, exactly as the host
//! reads them. These helpers walk a blob to find the pieces the stack
//! needs. A malformed length ends the walk instead of looping or reading
//! out of bounds.

use usb_device::{
    descriptor::descriptor_type,
    endpoint::{
        EndpointAddress, EndpointType, IsochronousSynchronizationType, IsochronousUsageType,
    },
};

/// The device's descriptor set
///
/// Every configuration blob starts with its configuration descriptor, and
/// includes all the interface, endpoint and class descriptors that
/// `wTotalLength` covers.
pub struct Descriptors {
    pub device: &'static [u8],
    pub configs: &'static [&'static [u8]],
    pub strings: &'static [&'static [u8]],
    pub bos: Option<&'static [u8]>,
}

impl Descriptors {
    /// Configuration by index, as GET_DESCRIPTOR names it
    pub fn config(&self, index: usize) -> Option<ConfigDesc<'static>> {
        self.configs.get(index).copied().and_then(ConfigDesc::new)
    }

    /// Configuration by its `bConfigurationValue`
    pub fn find_config(&self, value: u8) -> Option<ConfigDesc<'static>> {
        self.configs
            .iter()
            .copied()
            .filter_map(ConfigDesc::new)
            .find(|conf| conf.value() == value)
    }

    pub fn string(&self, index: usize) -> Option<&'static [u8]> {
        self.strings.get(index).copied()
    }
}

/// Iterates over the descriptors of a blob
#[derive(Clone)]
pub struct DescriptorIter<'a> {
    rest: &'a [u8],
}

impl<'a> DescriptorIter<'a> {
    pub fn new(blob: &'a [u8]) -> Self {
        DescriptorIter { rest: blob }
    }

    /// The bytes that haven't been visited
    pub fn rest(&self) -> &'a [u8] {
        self.rest
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = &'a [u8];
    fn next(&mut self) -> Option<&'a [u8]> {
        let len = usize::from(*self.rest.first()?);
        if len < 2 || len > self.rest.len() {
            self.rest = &[];
            return None;
        }
        let (desc, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(desc)
    }
}

/// Find the first descriptor of type `dt`
///
/// Returns the blob from that descriptor on.
pub fn find(blob: &[u8], dt: u8) -> Option<&[u8]> {
    let mut iter = DescriptorIter::new(blob);
    loop {
        let rest = iter.rest();
        let desc = iter.next()?;
        if desc[1] == dt {
            return Some(rest);
        }
    }
}

/// A configuration descriptor, and everything after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDesc<'a> {
    blob: &'a [u8],
}

impl<'a> ConfigDesc<'a> {
    const LEN: usize = 9;

    /// Checks the header, and bounds the blob to `wTotalLength`
    pub fn new(blob: &'a [u8]) -> Option<Self> {
        if blob.len() < Self::LEN || blob[1] != descriptor_type::CONFIGURATION {
            return None;
        }
        let total = usize::from(u16::from_le_bytes([blob[2], blob[3]]));
        Some(ConfigDesc {
            blob: &blob[..total.clamp(Self::LEN, blob.len())],
        })
    }

    /// The full configuration, as sent to the host
    pub fn as_bytes(&self) -> &'a [u8] {
        self.blob
    }

    pub fn num_interfaces(&self) -> u8 {
        self.blob[4]
    }

    /// `bConfigurationValue`
    pub fn value(&self) -> u8 {
        self.blob[5]
    }

    /// `bmAttributes`
    pub fn attributes(&self) -> u8 {
        self.blob[7]
    }

    pub fn is_self_powered(&self) -> bool {
        self.attributes() & 0x40 != 0
    }

    /// Every interface descriptor, alternate settings included
    pub fn interfaces(&self) -> impl Iterator<Item = InterfaceDesc<'a>> {
        let mut iter = DescriptorIter::new(self.blob);
        core::iter::from_fn(move || loop {
            let desc = iter.next()?;
            if desc[1] == descriptor_type::INTERFACE {
                if let Some(intf) = InterfaceDesc::new(desc, iter.rest()) {
                    return Some(intf);
                }
            }
        })
    }

    /// Interface `number`, alternate setting `alt`
    pub fn find_interface(&self, number: u8, alt: u8) -> Option<InterfaceDesc<'a>> {
        self.interfaces()
            .find(|intf| intf.number() == number && intf.alt_setting() == alt)
    }
}

/// An interface descriptor, and the descriptors after it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDesc<'a> {
    desc: &'a [u8],
    rest: &'a [u8],
}

impl<'a> InterfaceDesc<'a> {
    const LEN: usize = 9;

    fn new(desc: &'a [u8], rest: &'a [u8]) -> Option<Self> {
        (desc.len() >= Self::LEN).then_some(InterfaceDesc { desc, rest })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.desc
    }

    /// `bInterfaceNumber`
    pub fn number(&self) -> u8 {
        self.desc[2]
    }

    /// `bAlternateSetting`
    pub fn alt_setting(&self) -> u8 {
        self.desc[3]
    }

    pub fn num_endpoints(&self) -> u8 {
        self.desc[4]
    }

    /// `(class, subclass, protocol)`
    pub fn class(&self) -> (u8, u8, u8) {
        (self.desc[5], self.desc[6], self.desc[7])
    }

    /// The endpoints of this alternate setting
    ///
    /// Stops at the next interface descriptor.
    pub fn endpoints(&self) -> impl Iterator<Item = EndpointDesc<'a>> {
        DescriptorIter::new(self.rest)
            .take_while(|desc| desc[1] != descriptor_type::INTERFACE)
            .filter(|desc| desc[1] == descriptor_type::ENDPOINT)
            .filter_map(EndpointDesc::new)
            .take(usize::from(self.num_endpoints()))
    }

    /// Class-specific descriptors that follow the interface descriptor
    pub fn extra(&self) -> impl Iterator<Item = &'a [u8]> {
        DescriptorIter::new(self.rest).take_while(|desc| {
            desc[1] != descriptor_type::INTERFACE && desc[1] != descriptor_type::ENDPOINT
        })
    }
}

/// An endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDesc<'a> {
    desc: &'a [u8],
}

impl<'a> EndpointDesc<'a> {
    const LEN: usize = 7;

    pub fn new(desc: &'a [u8]) -> Option<Self> {
        (desc.len() >= Self::LEN && desc[1] == descriptor_type::ENDPOINT)
            .then_some(EndpointDesc { desc })
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::from(self.desc[2])
    }

    pub fn ep_type(&self) -> EndpointType {
        let attributes = self.desc[3];
        match attributes & 0x3 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous {
                synchronization: match (attributes >> 2) & 0x3 {
                    0 => IsochronousSynchronizationType::NoSynchronization,
                    1 => IsochronousSynchronizationType::Asynchronous,
                    2 => IsochronousSynchronizationType::Adaptive,
                    _ => IsochronousSynchronizationType::Synchronous,
                },
                usage: match (attributes >> 4) & 0x3 {
                    1 => IsochronousUsageType::Feedback,
                    2 => IsochronousUsageType::ImplicitFeedbackData,
                    _ => IsochronousUsageType::Data,
                },
            },
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    /// `wMaxPacketSize`, without the high-speed transaction bits
    pub fn max_packet_size(&self) -> u16 {
        u16::from_le_bytes([self.desc[4], self.desc[5]]) & 0x7ff
    }

    pub fn interval(&self) -> u8 {
        self.desc[6]
    }
}
