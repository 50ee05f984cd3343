//! USB/IP wire protocol
//!
//! Implements the messages a USB/IP client (e.g. `usbip attach` / vhci_hcd)
//! exchanges with an exporting host. The protocol is documented in the Linux
//! kernel: Documentation/usb/usbip_protocol.rst
//!
//! # Protocol Overview
//!
//! All integers are big-endian. Two message families share one TCP stream:
//!
//! ```text
//! operation:  [version u16 = 0x0111][code u16][status u32] + body
//! urb:        [command u32][seqnum u32][devid u32][direction u32][ep u32]
//!             + 28-byte body + optional transfer buffer / iso descriptors
//! ```
//!
//! An operation message is recognized by the version in its first two bytes;
//! URB commands start with a small command tag (1..=4) so their first two
//! bytes are always zero.
//!
//! Message length depends on fields inside the message (transfer buffer
//! length, device count, interface count), so readers work in phases: read
//! what is known to be present, ask [`ClientMessage::frame_len`] how long the
//! message must be given what has been seen, read the rest, repeat.

use crate::error::{ProtocolError, Result};
use crate::framing::read_until_eof;
use crate::types::Direction;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

#[cfg(feature = "async")]
use crate::framing::read_until_eof_async;
#[cfg(feature = "async")]
use tokio::io::AsyncReadExt;

/// USB/IP protocol version
pub const USBIP_VERSION: u16 = 0x0111;

/// Size of the sysfs path field of a device descriptor
pub const SYSFS_PATH_MAX: usize = 256;

/// Size of the bus id field
pub const SYSFS_BUS_ID_SIZE: usize = 32;

/// Operation header: version, code, status
pub const OP_HEADER_SIZE: usize = 8;

/// URB header: command, seqnum, devid, direction, ep
pub const URB_HEADER_SIZE: usize = 20;

/// Fixed part of every URB message (header + command-specific body)
pub const URB_FIXED_SIZE: usize = 48;

/// One isochronous packet descriptor
pub const ISO_DESCRIPTOR_SIZE: usize = 16;

/// Upper bound on a transfer buffer accepted from the wire
pub const MAX_TRANSFER_BUFFER: usize = 16 * 1024 * 1024;

/// Upper bound on any single message
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

pub const CMD_SUBMIT: u32 = 0x0001;
pub const CMD_UNLINK: u32 = 0x0002;
pub const RET_SUBMIT: u32 = 0x0003;
pub const RET_UNLINK: u32 = 0x0004;

const OP_REQUEST: u16 = 0x8000;

/// Operation codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    ReqDevInfo = OP_REQUEST | 0x02,
    RepDevInfo = 0x02,
    ReqImport = OP_REQUEST | 0x03,
    RepImport = 0x03,
    ReqDevList = OP_REQUEST | 0x05,
    RepDevList = 0x05,
    ReqExport = OP_REQUEST | 0x06,
    RepExport = 0x06,
    ReqUnexport = OP_REQUEST | 0x07,
    RepUnexport = 0x07,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0x8002 => Ok(Self::ReqDevInfo),
            0x0002 => Ok(Self::RepDevInfo),
            0x8003 => Ok(Self::ReqImport),
            0x0003 => Ok(Self::RepImport),
            0x8005 => Ok(Self::ReqDevList),
            0x0005 => Ok(Self::RepDevList),
            0x8006 => Ok(Self::ReqExport),
            0x0006 => Ok(Self::RepExport),
            0x8007 => Ok(Self::ReqUnexport),
            0x0007 => Ok(Self::RepUnexport),
            _ => Err(ProtocolError::UnknownOpCode(value)),
        }
    }

    pub fn is_request(self) -> bool {
        self as u16 & OP_REQUEST != 0
    }
}

fn read_padded_string<R: Read>(reader: &mut R, size: usize) -> Result<String> {
    let mut raw = vec![0u8; size];
    reader.read_exact(&mut raw)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(size);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

fn write_padded_string<W: Write>(writer: &mut W, value: &str, size: usize) -> Result<()> {
    let mut raw = vec![0u8; size];
    let bytes = value.as_bytes();
    let len = bytes.len().min(size);
    raw[..len].copy_from_slice(&bytes[..len]);
    writer.write_all(&raw)?;
    Ok(())
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Count of iso descriptors implied by `number_of_packets`
///
/// Non-iso URBs carry 0 or 0xFFFFFFFF here.
fn iso_count(number_of_packets: i32) -> usize {
    if number_of_packets > 0 {
        number_of_packets as usize
    } else {
        0
    }
}

/// Exported device as described on the wire (312 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbIpDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbIpDevice {
    pub const SIZE: usize = SYSFS_PATH_MAX + SYSFS_BUS_ID_SIZE + 12 + 6 + 6;

    /// Device id used in URB headers: busnum in the high half, devnum low
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | (self.devnum & 0xFFFF)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            path: read_padded_string(reader, SYSFS_PATH_MAX)?,
            busid: read_padded_string(reader, SYSFS_BUS_ID_SIZE)?,
            busnum: reader.read_u32::<BigEndian>()?,
            devnum: reader.read_u32::<BigEndian>()?,
            speed: reader.read_u32::<BigEndian>()?,
            id_vendor: reader.read_u16::<BigEndian>()?,
            id_product: reader.read_u16::<BigEndian>()?,
            bcd_device: reader.read_u16::<BigEndian>()?,
            device_class: reader.read_u8()?,
            device_subclass: reader.read_u8()?,
            device_protocol: reader.read_u8()?,
            configuration_value: reader.read_u8()?,
            num_configurations: reader.read_u8()?,
            num_interfaces: reader.read_u8()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.write_record(writer, self.num_interfaces)
    }

    /// Write the record with `num_interfaces` in place of the stored count
    fn write_record<W: Write>(&self, writer: &mut W, num_interfaces: u8) -> Result<()> {
        write_padded_string(writer, &self.path, SYSFS_PATH_MAX)?;
        write_padded_string(writer, &self.busid, SYSFS_BUS_ID_SIZE)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed)?;
        writer.write_u16::<BigEndian>(self.id_vendor)?;
        writer.write_u16::<BigEndian>(self.id_product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.device_class)?;
        writer.write_u8(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(num_interfaces)?;
        Ok(())
    }
}

/// Interface descriptor following a device in DEVINFO/DEVLIST replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIpInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl UsbIpInterface {
    pub const SIZE: usize = 4;

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let class = reader.read_u8()?;
        let subclass = reader.read_u8()?;
        let protocol = reader.read_u8()?;
        let _padding = reader.read_u8()?;
        Ok(Self {
            class,
            subclass,
            protocol,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.class, self.subclass, self.protocol, 0])?;
        Ok(())
    }
}

/// A device together with its interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub device: UsbIpDevice,
    pub interfaces: Vec<UsbIpInterface>,
}

impl ExportedDevice {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let device = UsbIpDevice::read_from(reader)?;
        let interfaces = (0..device.num_interfaces)
            .map(|_| UsbIpInterface::read_from(reader))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { device, interfaces })
    }

    /// The interface count on the wire is the number of records that follow,
    /// whatever `device.num_interfaces` says
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let count = u8::try_from(self.interfaces.len()).unwrap_or(u8::MAX);
        self.device.write_record(writer, count)?;
        for interface in self.interfaces.iter().take(count as usize) {
            interface.write_to(writer)?;
        }
        Ok(())
    }

    /// Length of the device record starting at `offset`, if its interface
    /// count is already in `buf`; otherwise the length needed to see it
    fn record_len(buf: &[u8], offset: usize) -> (usize, bool) {
        let device_end = offset + UsbIpDevice::SIZE;
        if buf.len() < device_end {
            return (UsbIpDevice::SIZE, false);
        }
        let num_interfaces = buf[device_end - 1] as usize;
        (UsbIpDevice::SIZE + num_interfaces * UsbIpInterface::SIZE, true)
    }
}

/// Operation request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequestBody {
    DevInfo { busid: String },
    Import { busid: String },
    Export { device: UsbIpDevice },
    Unexport { device: UsbIpDevice },
    DevList,
}

/// Operation request (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRequest {
    pub status: u32,
    pub body: OpRequestBody,
}

impl OpRequest {
    pub fn import(busid: impl Into<String>) -> Self {
        Self {
            status: 0,
            body: OpRequestBody::Import {
                busid: busid.into(),
            },
        }
    }

    pub fn code(&self) -> OpCode {
        match self.body {
            OpRequestBody::DevInfo { .. } => OpCode::ReqDevInfo,
            OpRequestBody::Import { .. } => OpCode::ReqImport,
            OpRequestBody::Export { .. } => OpCode::ReqExport,
            OpRequestBody::Unexport { .. } => OpCode::ReqUnexport,
            OpRequestBody::DevList => OpCode::ReqDevList,
        }
    }

    fn body_len(code: OpCode) -> Result<usize> {
        match code {
            OpCode::ReqDevInfo | OpCode::ReqImport => Ok(SYSFS_BUS_ID_SIZE),
            OpCode::ReqExport | OpCode::ReqUnexport => Ok(UsbIpDevice::SIZE),
            OpCode::ReqDevList => Ok(0),
            reply => Err(ProtocolError::UnknownOpCode(reply as u16)),
        }
    }

    fn read_body<R: Read>(code: OpCode, status: u32, reader: &mut R) -> Result<Self> {
        let body = match code {
            OpCode::ReqDevInfo => OpRequestBody::DevInfo {
                busid: read_padded_string(reader, SYSFS_BUS_ID_SIZE)?,
            },
            OpCode::ReqImport => OpRequestBody::Import {
                busid: read_padded_string(reader, SYSFS_BUS_ID_SIZE)?,
            },
            OpCode::ReqExport => OpRequestBody::Export {
                device: UsbIpDevice::read_from(reader)?,
            },
            OpCode::ReqUnexport => OpRequestBody::Unexport {
                device: UsbIpDevice::read_from(reader)?,
            },
            OpCode::ReqDevList => OpRequestBody::DevList,
            reply => return Err(ProtocolError::UnknownOpCode(reply as u16)),
        };
        Ok(Self { status, body })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_op_header(writer, self.code(), self.status)?;
        match &self.body {
            OpRequestBody::DevInfo { busid } | OpRequestBody::Import { busid } => {
                write_padded_string(writer, busid, SYSFS_BUS_ID_SIZE)
            }
            OpRequestBody::Export { device } | OpRequestBody::Unexport { device } => {
                device.write_to(writer)
            }
            OpRequestBody::DevList => Ok(()),
        }
    }
}

/// Operation reply body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpReplyBody {
    /// Device and interfaces; absent when status is non-zero
    DevInfo { device: Option<ExportedDevice> },
    /// Imported device; absent when status is non-zero
    Import { device: Option<UsbIpDevice> },
    Export { returncode: u32 },
    Unexport { returncode: u32 },
    DevList { devices: Vec<ExportedDevice> },
}

/// Operation reply (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReply {
    pub status: u32,
    pub body: OpReplyBody,
}

impl OpReply {
    /// Successful import of `device`
    pub fn import(device: UsbIpDevice) -> Self {
        Self {
            status: 0,
            body: OpReplyBody::Import {
                device: Some(device),
            },
        }
    }

    /// Import refused with `status`
    pub fn import_failed(status: u32) -> Self {
        Self {
            status,
            body: OpReplyBody::Import { device: None },
        }
    }

    pub fn code(&self) -> OpCode {
        match self.body {
            OpReplyBody::DevInfo { .. } => OpCode::RepDevInfo,
            OpReplyBody::Import { .. } => OpCode::RepImport,
            OpReplyBody::Export { .. } => OpCode::RepExport,
            OpReplyBody::Unexport { .. } => OpCode::RepUnexport,
            OpReplyBody::DevList { .. } => OpCode::RepDevList,
        }
    }

    /// Total length of the reply whose first bytes are in `buf`
    fn frame_len(code: OpCode, status: u32, buf: &[u8]) -> Result<usize> {
        let len = match code {
            OpCode::RepImport if status == 0 => OP_HEADER_SIZE + UsbIpDevice::SIZE,
            OpCode::RepImport => OP_HEADER_SIZE,
            OpCode::RepDevInfo if status == 0 => {
                let (record, _) = ExportedDevice::record_len(buf, OP_HEADER_SIZE);
                OP_HEADER_SIZE + record
            }
            OpCode::RepDevInfo => OP_HEADER_SIZE,
            OpCode::RepExport | OpCode::RepUnexport => OP_HEADER_SIZE + 4,
            OpCode::RepDevList => {
                let count_end = OP_HEADER_SIZE + 4;
                if buf.len() < count_end {
                    return Ok(count_end);
                }
                let ndev = be_u32(buf, OP_HEADER_SIZE) as usize;
                if ndev.saturating_mul(UsbIpDevice::SIZE) > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: ndev.saturating_mul(UsbIpDevice::SIZE),
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                let mut offset = count_end;
                for _ in 0..ndev {
                    let (record, complete) = ExportedDevice::record_len(buf, offset);
                    offset += record;
                    if !complete {
                        break;
                    }
                }
                offset
            }
            request => return Err(ProtocolError::UnknownOpCode(request as u16)),
        };
        Ok(len)
    }

    fn read_body<R: Read>(code: OpCode, status: u32, reader: &mut R) -> Result<Self> {
        let body = match code {
            OpCode::RepDevInfo => OpReplyBody::DevInfo {
                device: if status == 0 {
                    Some(ExportedDevice::read_from(reader)?)
                } else {
                    None
                },
            },
            OpCode::RepImport => OpReplyBody::Import {
                device: if status == 0 {
                    Some(UsbIpDevice::read_from(reader)?)
                } else {
                    None
                },
            },
            OpCode::RepExport => OpReplyBody::Export {
                returncode: reader.read_u32::<BigEndian>()?,
            },
            OpCode::RepUnexport => OpReplyBody::Unexport {
                returncode: reader.read_u32::<BigEndian>()?,
            },
            OpCode::RepDevList => {
                let ndev = reader.read_u32::<BigEndian>()?;
                let devices = (0..ndev)
                    .map(|_| ExportedDevice::read_from(reader))
                    .collect::<Result<Vec<_>>>()?;
                OpReplyBody::DevList { devices }
            }
            request => return Err(ProtocolError::UnknownOpCode(request as u16)),
        };
        Ok(Self { status, body })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_op_header(writer, self.code(), self.status)?;
        match &self.body {
            OpReplyBody::DevInfo { device } => {
                if let Some(device) = device {
                    device.write_to(writer)?;
                }
            }
            OpReplyBody::Import { device } => {
                if let Some(device) = device {
                    device.write_to(writer)?;
                }
            }
            OpReplyBody::Export { returncode } | OpReplyBody::Unexport { returncode } => {
                writer.write_u32::<BigEndian>(*returncode)?;
            }
            OpReplyBody::DevList { devices } => {
                writer.write_u32::<BigEndian>(devices.len() as u32)?;
                for device in devices {
                    device.write_to(writer)?;
                }
            }
        }
        Ok(())
    }
}

fn write_op_header<W: Write>(writer: &mut W, code: OpCode, status: u32) -> Result<()> {
    writer.write_u16::<BigEndian>(USBIP_VERSION)?;
    writer.write_u16::<BigEndian>(code as u16)?;
    writer.write_u32::<BigEndian>(status)?;
    Ok(())
}

fn read_op_header<R: Read>(reader: &mut R) -> Result<(OpCode, u32)> {
    let version = reader.read_u16::<BigEndian>()?;
    if version != USBIP_VERSION {
        return Err(ProtocolError::InvalidVersion(version));
    }
    let code = OpCode::from_u16(reader.read_u16::<BigEndian>()?)?;
    let status = reader.read_u32::<BigEndian>()?;
    Ok((code, status))
}

fn is_op_message(buf: &[u8]) -> bool {
    u16::from_be_bytes([buf[0], buf[1]]) == USBIP_VERSION
}

/// URB header fields following the command tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbHeader {
    /// Sequence number for matching requests/responses
    pub seqnum: u32,
    /// Device ID (busnum << 16 | devnum)
    pub devid: u32,
    pub direction: Direction,
    /// Endpoint number
    pub ep: u32,
}

impl UrbHeader {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let seqnum = reader.read_u32::<BigEndian>()?;
        let devid = reader.read_u32::<BigEndian>()?;
        let direction = Direction::from_u32(reader.read_u32::<BigEndian>()?)?;
        let ep = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            seqnum,
            devid,
            direction,
            ep,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W, command: u32) -> Result<()> {
        writer.write_u32::<BigEndian>(command)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction.as_u32())?;
        writer.write_u32::<BigEndian>(self.ep)?;
        Ok(())
    }
}

/// Isochronous packet descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            offset: reader.read_u32::<BigEndian>()?,
            length: reader.read_u32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            status: reader.read_i32::<BigEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)?;
        Ok(())
    }
}

fn read_iso_descriptors<R: Read>(
    reader: &mut R,
    number_of_packets: i32,
) -> Result<Vec<IsoPacketDescriptor>> {
    (0..iso_count(number_of_packets))
        .map(|_| IsoPacketDescriptor::read_from(reader))
        .collect()
}

/// CMD_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: UrbHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    /// Setup packet for control transfers
    pub setup: [u8; 8],
    /// OUT data; empty for IN transfers
    pub transfer_buffer: Vec<u8>,
    pub iso_packet_descriptors: Vec<IsoPacketDescriptor>,
}

impl CmdSubmit {
    /// True when the URB carries isochronous packets
    pub fn is_isochronous(&self) -> bool {
        !self.iso_packet_descriptors.is_empty() || iso_count(self.number_of_packets) > 0
    }

    fn read_body<R: Read>(header: UrbHeader, reader: &mut R) -> Result<Self> {
        let transfer_flags = reader.read_u32::<BigEndian>()?;
        let transfer_buffer_length = reader.read_u32::<BigEndian>()?;
        let start_frame = reader.read_i32::<BigEndian>()?;
        let number_of_packets = reader.read_i32::<BigEndian>()?;
        let interval = reader.read_i32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        reader.read_exact(&mut setup)?;

        let mut transfer_buffer = Vec::new();
        if header.direction == Direction::Out {
            transfer_buffer.resize(transfer_buffer_length as usize, 0);
            reader.read_exact(&mut transfer_buffer)?;
        }
        let iso_packet_descriptors = read_iso_descriptors(reader, number_of_packets)?;

        Ok(Self {
            header,
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
            transfer_buffer,
            iso_packet_descriptors,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer, CMD_SUBMIT)?;
        writer.write_u32::<BigEndian>(self.transfer_flags)?;
        writer.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        writer.write_i32::<BigEndian>(self.start_frame)?;
        writer.write_i32::<BigEndian>(self.number_of_packets)?;
        writer.write_i32::<BigEndian>(self.interval)?;
        writer.write_all(&self.setup)?;
        if self.header.direction == Direction::Out {
            writer.write_all(&self.transfer_buffer)?;
        }
        for descriptor in &self.iso_packet_descriptors {
            descriptor.write_to(writer)?;
        }
        Ok(())
    }
}

/// CMD_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: UrbHeader,
    /// Sequence number of the URB to cancel
    pub unlink_seqnum: u32,
}

/// URB command (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbCommand {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

impl UrbCommand {
    pub fn header(&self) -> &UrbHeader {
        match self {
            Self::Submit(cmd) => &cmd.header,
            Self::Unlink(cmd) => &cmd.header,
        }
    }

    fn frame_len(buf: &[u8]) -> Result<usize> {
        let command = be_u32(buf, 0);
        if !matches!(command, CMD_SUBMIT | CMD_UNLINK) {
            return Err(ProtocolError::UnknownCommand(command));
        }
        if buf.len() < URB_FIXED_SIZE {
            return Ok(URB_FIXED_SIZE);
        }
        match command {
            CMD_SUBMIT => {
                let direction = Direction::from_u32(be_u32(buf, 12))?;
                let buffer_len = be_u32(buf, 24) as usize;
                if buffer_len > MAX_TRANSFER_BUFFER {
                    return Err(ProtocolError::FrameTooLarge {
                        size: buffer_len,
                        max: MAX_TRANSFER_BUFFER,
                    });
                }
                let data = if direction == Direction::Out { buffer_len } else { 0 };
                let iso = iso_count(be_u32(buf, 32) as i32) * ISO_DESCRIPTOR_SIZE;
                Ok(URB_FIXED_SIZE + data + iso)
            }
            CMD_UNLINK => Ok(URB_FIXED_SIZE),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        match reader.read_u32::<BigEndian>()? {
            CMD_SUBMIT => {
                let header = UrbHeader::read_from(reader)?;
                Ok(Self::Submit(CmdSubmit::read_body(header, reader)?))
            }
            CMD_UNLINK => {
                let header = UrbHeader::read_from(reader)?;
                let unlink_seqnum = reader.read_u32::<BigEndian>()?;
                let mut padding = [0u8; 24];
                reader.read_exact(&mut padding)?;
                Ok(Self::Unlink(CmdUnlink {
                    header,
                    unlink_seqnum,
                }))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::Submit(cmd) => cmd.write_to(writer),
            Self::Unlink(cmd) => {
                cmd.header.write_to(writer, CMD_UNLINK)?;
                writer.write_u32::<BigEndian>(cmd.unlink_seqnum)?;
                writer.write_all(&[0u8; 24])?;
                Ok(())
            }
        }
    }
}

/// RET_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: UrbHeader,
    /// 0 = success, non-zero = failure
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    /// IN data (`actual_length` bytes); empty for OUT transfers
    pub transfer_buffer: Vec<u8>,
    pub iso_packet_descriptors: Vec<IsoPacketDescriptor>,
}

impl RetSubmit {
    /// Successful completion
    ///
    /// For IN transfers `data` is the received buffer; for OUT transfers pass
    /// an empty buffer and the number of bytes sent as `actual_length`.
    pub fn success(header: UrbHeader, data: Vec<u8>, actual_length: u32) -> Self {
        Self {
            header,
            status: 0,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            transfer_buffer: data,
            iso_packet_descriptors: Vec::new(),
        }
    }

    /// Device-level failure: no data, one error
    pub fn failure(header: UrbHeader) -> Self {
        Self {
            header,
            status: 1,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 1,
            transfer_buffer: Vec::new(),
            iso_packet_descriptors: Vec::new(),
        }
    }

    fn read_body<R: Read>(header: UrbHeader, reader: &mut R) -> Result<Self> {
        let status = reader.read_i32::<BigEndian>()?;
        let actual_length = reader.read_u32::<BigEndian>()?;
        let start_frame = reader.read_i32::<BigEndian>()?;
        let number_of_packets = reader.read_i32::<BigEndian>()?;
        let error_count = reader.read_i32::<BigEndian>()?;
        let mut padding = [0u8; 8];
        reader.read_exact(&mut padding)?;

        let mut transfer_buffer = Vec::new();
        if header.direction == Direction::In {
            transfer_buffer.resize(actual_length as usize, 0);
            reader.read_exact(&mut transfer_buffer)?;
        }
        let iso_packet_descriptors = read_iso_descriptors(reader, number_of_packets)?;

        Ok(Self {
            header,
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
            transfer_buffer,
            iso_packet_descriptors,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer, RET_SUBMIT)?;
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.start_frame)?;
        writer.write_i32::<BigEndian>(self.number_of_packets)?;
        writer.write_i32::<BigEndian>(self.error_count)?;
        writer.write_all(&[0u8; 8])?;
        if self.header.direction == Direction::In {
            debug_assert_eq!(self.transfer_buffer.len(), self.actual_length as usize);
            writer.write_all(&self.transfer_buffer)?;
        }
        for descriptor in &self.iso_packet_descriptors {
            descriptor.write_to(writer)?;
        }
        Ok(())
    }
}

/// RET_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: UrbHeader,
    pub status: i32,
}

/// URB reply (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbReply {
    Submit(RetSubmit),
    Unlink(RetUnlink),
}

impl UrbReply {
    pub fn header(&self) -> &UrbHeader {
        match self {
            Self::Submit(ret) => &ret.header,
            Self::Unlink(ret) => &ret.header,
        }
    }

    fn frame_len(buf: &[u8]) -> Result<usize> {
        let command = be_u32(buf, 0);
        if !matches!(command, RET_SUBMIT | RET_UNLINK) {
            return Err(ProtocolError::UnknownCommand(command));
        }
        if buf.len() < URB_FIXED_SIZE {
            return Ok(URB_FIXED_SIZE);
        }
        match command {
            RET_SUBMIT => {
                let direction = Direction::from_u32(be_u32(buf, 12))?;
                let actual_len = be_u32(buf, 24) as usize;
                if actual_len > MAX_TRANSFER_BUFFER {
                    return Err(ProtocolError::FrameTooLarge {
                        size: actual_len,
                        max: MAX_TRANSFER_BUFFER,
                    });
                }
                let data = if direction == Direction::In { actual_len } else { 0 };
                let iso = iso_count(be_u32(buf, 32) as i32) * ISO_DESCRIPTOR_SIZE;
                Ok(URB_FIXED_SIZE + data + iso)
            }
            RET_UNLINK => Ok(URB_FIXED_SIZE),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        match reader.read_u32::<BigEndian>()? {
            RET_SUBMIT => {
                let header = UrbHeader::read_from(reader)?;
                Ok(Self::Submit(RetSubmit::read_body(header, reader)?))
            }
            RET_UNLINK => {
                let header = UrbHeader::read_from(reader)?;
                let status = reader.read_i32::<BigEndian>()?;
                let mut padding = [0u8; 24];
                reader.read_exact(&mut padding)?;
                Ok(Self::Unlink(RetUnlink { header, status }))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::Submit(ret) => ret.write_to(writer),
            Self::Unlink(ret) => {
                ret.header.write_to(writer, RET_UNLINK)?;
                writer.write_i32::<BigEndian>(ret.status)?;
                writer.write_all(&[0u8; 24])?;
                Ok(())
            }
        }
    }
}

/// Anything a USB/IP client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Op(OpRequest),
    Urb(UrbCommand),
}

/// Anything a USB/IP server sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Op(OpReply),
    Urb(UrbReply),
}

impl ClientMessage {
    /// Total length of the message whose first bytes are in `buf`
    ///
    /// `buf` must hold at least [`OP_HEADER_SIZE`] bytes. The result is never
    /// smaller than what has to be present to learn the rest; call again
    /// after reading up to it until it equals `buf.len()`.
    pub fn frame_len(buf: &[u8]) -> Result<usize> {
        if is_op_message(buf) {
            let (code, _) = read_op_header(&mut Cursor::new(buf))?;
            Ok(OP_HEADER_SIZE + OpRequest::body_len(code)?)
        } else {
            UrbCommand::frame_len(buf)
        }
    }

    /// Decode the message at the start of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let needed = complete_len(buf, Self::frame_len)?;
        let mut cursor = Cursor::new(&buf[..needed]);
        if is_op_message(buf) {
            let (code, status) = read_op_header(&mut cursor)?;
            Ok(Self::Op(OpRequest::read_body(code, status, &mut cursor)?))
        } else {
            Ok(Self::Urb(UrbCommand::read_from(&mut cursor)?))
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::Op(request) => request.write_to(writer),
            Self::Urb(command) => command.write_to(writer),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    /// Read one message; `Ok(None)` on a clean EOF between messages
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        read_message(reader, Self::frame_len)?
            .map(|buf| Self::decode(&buf))
            .transpose()
    }

    /// Async: read one message; `Ok(None)` on a clean EOF between messages
    #[cfg(feature = "async")]
    pub async fn read_from_async<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        read_message_async(reader, Self::frame_len)
            .await?
            .map(|buf| Self::decode(&buf))
            .transpose()
    }
}

impl ServerMessage {
    /// Total length of the message whose first bytes are in `buf`
    ///
    /// See [`ClientMessage::frame_len`].
    pub fn frame_len(buf: &[u8]) -> Result<usize> {
        if is_op_message(buf) {
            let (code, status) = read_op_header(&mut Cursor::new(buf))?;
            OpReply::frame_len(code, status, buf)
        } else {
            UrbReply::frame_len(buf)
        }
    }

    /// Decode the message at the start of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let needed = complete_len(buf, Self::frame_len)?;
        let mut cursor = Cursor::new(&buf[..needed]);
        if is_op_message(buf) {
            let (code, status) = read_op_header(&mut cursor)?;
            Ok(Self::Op(OpReply::read_body(code, status, &mut cursor)?))
        } else {
            Ok(Self::Urb(UrbReply::read_from(&mut cursor)?))
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::Op(reply) => reply.write_to(writer),
            Self::Urb(reply) => reply.write_to(writer),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    /// Read one message; `Ok(None)` on a clean EOF between messages
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        read_message(reader, Self::frame_len)?
            .map(|buf| Self::decode(&buf))
            .transpose()
    }

    /// Async: read one message; `Ok(None)` on a clean EOF between messages
    #[cfg(feature = "async")]
    pub async fn read_from_async<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        read_message_async(reader, Self::frame_len)
            .await?
            .map(|buf| Self::decode(&buf))
            .transpose()
    }
}

type FrameLenFn = fn(&[u8]) -> Result<usize>;

/// Length of the complete message at the start of `buf`, or
/// `IncompleteFrame` if `buf` ends early
fn complete_len(buf: &[u8], frame_len: FrameLenFn) -> Result<usize> {
    if buf.len() < OP_HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: OP_HEADER_SIZE,
            actual: buf.len(),
        });
    }
    let mut seen = OP_HEADER_SIZE;
    loop {
        let needed = frame_len(&buf[..seen.min(buf.len())])?;
        if needed > buf.len() {
            return Err(ProtocolError::IncompleteFrame {
                expected: needed,
                actual: buf.len(),
            });
        }
        if needed == seen {
            return Ok(needed);
        }
        seen = needed;
    }
}

fn check_message_len(needed: usize) -> Result<()> {
    if needed > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: needed,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

fn read_message<R: Read>(reader: &mut R, frame_len: FrameLenFn) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; OP_HEADER_SIZE];
    let got = read_until_eof(reader, &mut buf)?;
    if got == 0 {
        return Ok(None);
    }
    if got < OP_HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: OP_HEADER_SIZE,
            actual: got,
        });
    }

    loop {
        let needed = frame_len(&buf)?;
        if needed <= buf.len() {
            return Ok(Some(buf));
        }
        check_message_len(needed)?;
        let have = buf.len();
        buf.resize(needed, 0);
        let got = read_until_eof(reader, &mut buf[have..])?;
        if have + got < needed {
            return Err(ProtocolError::IncompleteFrame {
                expected: needed,
                actual: have + got,
            });
        }
    }
}

#[cfg(feature = "async")]
async fn read_message_async<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    frame_len: FrameLenFn,
) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; OP_HEADER_SIZE];
    let got = read_until_eof_async(reader, &mut buf).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < OP_HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: OP_HEADER_SIZE,
            actual: got,
        });
    }

    loop {
        let needed = frame_len(&buf)?;
        if needed <= buf.len() {
            return Ok(Some(buf));
        }
        check_message_len(needed)?;
        let have = buf.len();
        buf.resize(needed, 0);
        let got = read_until_eof_async(reader, &mut buf[have..]).await?;
        if have + got < needed {
            return Err(ProtocolError::IncompleteFrame {
                expected: needed,
                actual: have + got,
            });
        }
    }
}
