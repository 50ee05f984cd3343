//! USB type definitions shared by the bus codec and the USB/IP codec
//!
//! Enumerations for transfer direction, device speed and the fields of a
//! standard control request.

use crate::error::{ProtocolError, Result};

/// Transfer direction
///
/// USB/IP encodes this as a u32 (0 = OUT, 1 = IN); bmRequestType carries it
/// in bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Decode the USB/IP wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }

    /// USB/IP wire value
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }

    /// The other direction (used to pick the status stage direction)
    pub fn opposite(self) -> Self {
        match self {
            Self::Out => Self::In,
            Self::In => Self::Out,
        }
    }
}

/// USB device speed as reported in the USB/IP device descriptor
///
/// Values follow the kernel's `enum usb_device_speed`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Unknown = 0,
    /// 1.5 Mbps
    Low = 1,
    /// 12 Mbps
    Full = 2,
    /// 480 Mbps
    High = 3,
    Wireless = 4,
    /// 5 Gbps
    Super = 5,
    /// 10 Gbps
    SuperPlus = 6,
}

impl DeviceSpeed {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Low),
            2 => Some(Self::Full),
            3 => Some(Self::High),
            4 => Some(Self::Wireless),
            5 => Some(Self::Super),
            6 => Some(Self::SuperPlus),
            _ => None,
        }
    }
}

/// Recipient field of bmRequestType (bits 0..4)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Type field of bmRequestType (bits 5..6)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// Standard device requests (USB 2.0 table 9-4)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// The 8-byte SETUP stage payload of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    /// Build a standard request
    pub fn standard(
        recipient: Recipient,
        direction: Direction,
        request: StandardRequest,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let dir_bit = match direction {
            Direction::Out => 0,
            Direction::In => 0x80,
        };
        Self {
            request_type: dir_bit | ((RequestKind::Standard as u8) << 5) | recipient as u8,
            request: request as u8,
            value,
            index,
            length,
        }
    }

    /// SET_ADDRESS(address), as sent to the default address during bootstrap
    pub fn set_address(address: u8) -> Self {
        Self::standard(
            Recipient::Device,
            Direction::Out,
            StandardRequest::SetAddress,
            address as u16,
            0,
            0,
        )
    }

    /// Parse the raw setup bytes carried in a USB/IP CMD_SUBMIT
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Data stage direction from bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}
