//! Raw USB 2.0 bus packets
//!
//! Builders and a validating parser for the packets exchanged with the
//! simulated device: tokens (OUT/IN/SETUP/PING), start-of-frame, data
//! (DATA0/DATA1) and handshakes (ACK/NAK/STALL/NYET).
//!
//! # Packet layout
//!
//! ```text
//! token:     [PID][ep0:addr(7)][crc5(5):ep3..1]      3 bytes
//! sof:       [PID][frame 7..0][crc5(5):frame 10..8]  3 bytes
//! data:      [PID][payload 0..1024][crc16 LE]        3..=1027 bytes
//! handshake: [PID]                                   1 byte
//! ```
//!
//! The PID byte carries the 4-bit PID in its low nibble and the one's
//! complement in the high nibble.

use crate::bits::{bit_reverse, crc5, crc16};
use crate::error::{ProtocolError, Result};
use crate::types::{Direction, Recipient, SetupPacket, StandardRequest};
use std::fmt;

/// Largest payload of a USB 2.0 data packet (high-speed isochronous)
pub const MAX_DATA_PAYLOAD: usize = 1024;

/// Largest legal bus packet: PID + payload + CRC16
pub const MAX_PACKET_SIZE: usize = 1 + MAX_DATA_PAYLOAD + 2;

/// 4-bit packet identifier
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pid {
    Ext = 0x0,
    Out = 0x1,
    Ack = 0x2,
    Data0 = 0x3,
    Ping = 0x4,
    Sof = 0x5,
    Nyet = 0x6,
    Data2 = 0x7,
    Split = 0x8,
    In = 0x9,
    Nak = 0xA,
    Data1 = 0xB,
    Pre = 0xC,
    Setup = 0xD,
    Stall = 0xE,
    MData = 0xF,
}

/// Wire byte for a 4-bit PID value: complement in the high nibble
#[inline]
pub fn pid_byte(pid: u8) -> u8 {
    let pid = pid & 0x0F;
    ((pid ^ 0x0F) << 4) | pid
}

impl Pid {
    const ALL: [Pid; 16] = [
        Pid::Ext,
        Pid::Out,
        Pid::Ack,
        Pid::Data0,
        Pid::Ping,
        Pid::Sof,
        Pid::Nyet,
        Pid::Data2,
        Pid::Split,
        Pid::In,
        Pid::Nak,
        Pid::Data1,
        Pid::Pre,
        Pid::Setup,
        Pid::Stall,
        Pid::MData,
    ];

    /// Wire byte for this PID
    #[inline]
    pub fn byte(self) -> u8 {
        pid_byte(self as u8)
    }

    /// Decode a wire byte, rejecting a high nibble that is not the complement
    pub fn from_byte(byte: u8) -> Result<Self> {
        let pid = byte & 0x0F;
        if byte >> 4 != pid ^ 0x0F {
            return Err(ProtocolError::invalid_packet(format!(
                "PID check bits mismatch in {byte:#04x}"
            )));
        }
        Ok(Self::ALL[pid as usize])
    }

    /// DATA0 or DATA1 for a toggle bit
    #[inline]
    pub fn data(toggle: bool) -> Self {
        if toggle { Pid::Data1 } else { Pid::Data0 }
    }

    pub fn is_token(self) -> bool {
        matches!(self, Pid::Out | Pid::In | Pid::Setup | Pid::Ping)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Pid::Data0 | Pid::Data1 | Pid::Data2 | Pid::MData)
    }

    pub fn is_handshake(self) -> bool {
        matches!(self, Pid::Ack | Pid::Nak | Pid::Stall | Pid::Nyet)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Handshake packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
    Nyet,
}

impl From<Handshake> for Pid {
    fn from(kind: Handshake) -> Self {
        match kind {
            Handshake::Ack => Pid::Ack,
            Handshake::Nak => Pid::Nak,
            Handshake::Stall => Pid::Stall,
            Handshake::Nyet => Pid::Nyet,
        }
    }
}

/// CRC5 field of a token/SOF packet for an 11-bit LSB-first field
fn token_crc(field: u16) -> u8 {
    let reversed = bit_reverse(field as u32 & 0x7FF, 11);
    bit_reverse(crc5(reversed, 11) as u32, 5) as u8
}

/// Build a token packet
///
/// `address` is 0..=127 and `endpoint` 0..=15; out-of-range bits are masked.
pub fn token_packet(pid: Pid, address: u8, endpoint: u8) -> [u8; 3] {
    debug_assert!(pid.is_token(), "{pid} is not a token PID");
    debug_assert!(address < 128, "address {address} out of range");
    debug_assert!(endpoint < 16, "endpoint {endpoint} out of range");

    let address = address & 0x7F;
    let endpoint = endpoint & 0x0F;
    let crc = token_crc(((endpoint as u16) << 7) | address as u16);

    [
        pid.byte(),
        ((endpoint & 1) << 7) | address,
        (crc << 3) | (endpoint >> 1),
    ]
}

pub fn in_token(address: u8, endpoint: u8) -> [u8; 3] {
    token_packet(Pid::In, address, endpoint)
}

pub fn out_token(address: u8, endpoint: u8) -> [u8; 3] {
    token_packet(Pid::Out, address, endpoint)
}

pub fn setup_token(address: u8, endpoint: u8) -> [u8; 3] {
    token_packet(Pid::Setup, address, endpoint)
}

/// Build a start-of-frame packet for an 11-bit frame number
pub fn sof_packet(frame_number: u16) -> [u8; 3] {
    debug_assert!(frame_number < 2048, "frame number {frame_number} out of range");

    let frame = frame_number & 0x7FF;
    let crc = token_crc(frame);

    [
        Pid::Sof.byte(),
        (frame & 0xFF) as u8,
        (crc << 3) | (frame >> 8) as u8,
    ]
}

/// Build a DATA0 (`toggle == false`) or DATA1 packet around `payload`
pub fn data_packet(payload: &[u8], toggle: bool) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 3);
    packet.push(Pid::data(toggle).byte());
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&crc16(payload));
    packet
}

/// Build a single-byte handshake packet
pub fn handshake_packet(kind: Handshake) -> [u8; 1] {
    [Pid::from(kind).byte()]
}

/// Build the DATA0 packet of a SETUP stage carrying a standard request
pub fn setup_data_packet(
    recipient: Recipient,
    direction: Direction,
    request: StandardRequest,
    value: u16,
    index: u16,
    length: u16,
) -> Vec<u8> {
    let setup = SetupPacket::standard(recipient, direction, request, value, index, length);
    data_packet(&setup.to_bytes(), false)
}

/// A validated bus packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusPacket {
    Token { pid: Pid, address: u8, endpoint: u8 },
    Sof { frame_number: u16 },
    Data { pid: Pid, payload: Vec<u8> },
    Handshake(Handshake),
}

impl BusPacket {
    /// Validate and classify raw packet bytes
    ///
    /// Tokens and SOF must be 3 bytes with a matching CRC5, data packets
    /// 3..=1027 bytes with a matching CRC16, handshakes exactly 1 byte.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let Some(&first) = bytes.first() else {
            return Err(ProtocolError::invalid_packet("empty packet"));
        };
        let pid = Pid::from_byte(first)?;
        let len = bytes.len();

        match pid {
            Pid::Out | Pid::In | Pid::Setup | Pid::Ping if len == 3 => {
                let address = bytes[1] & 0x7F;
                let endpoint = ((bytes[2] & 0x07) << 1) | (bytes[1] >> 7);
                if token_packet(pid, address, endpoint) != bytes {
                    return Err(ProtocolError::invalid_packet(format!(
                        "{pid} token CRC5 mismatch"
                    )));
                }
                Ok(BusPacket::Token {
                    pid,
                    address,
                    endpoint,
                })
            }
            Pid::Sof if len == 3 => {
                let frame_number = bytes[1] as u16 | ((bytes[2] as u16 & 0x07) << 8);
                if sof_packet(frame_number) != bytes {
                    return Err(ProtocolError::invalid_packet("SOF CRC5 mismatch"));
                }
                Ok(BusPacket::Sof { frame_number })
            }
            pid if pid.is_data() && (3..=MAX_PACKET_SIZE).contains(&len) => {
                let payload = &bytes[1..len - 2];
                if crc16(payload) != bytes[len - 2..] {
                    return Err(ProtocolError::invalid_packet(format!(
                        "{pid} CRC16 mismatch"
                    )));
                }
                Ok(BusPacket::Data {
                    pid,
                    payload: payload.to_vec(),
                })
            }
            Pid::Ack if len == 1 => Ok(BusPacket::Handshake(Handshake::Ack)),
            Pid::Nak if len == 1 => Ok(BusPacket::Handshake(Handshake::Nak)),
            Pid::Stall if len == 1 => Ok(BusPacket::Handshake(Handshake::Stall)),
            Pid::Nyet if len == 1 => Ok(BusPacket::Handshake(Handshake::Nyet)),
            pid => Err(ProtocolError::invalid_packet(format!(
                "{pid} packet with invalid length {len}"
            ))),
        }
    }
}

/// Hex rendering for packet traces
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
