//! Wire formats for the USB/IP simulator bridge
//!
//! This crate holds everything that turns bytes into meaning, with no I/O
//! policy of its own:
//!
//! - [`bits`]: bit reversal and the USB CRC5/CRC16 checks
//! - [`bus`]: USB 2.0 packet construction and validation (tokens, SOF,
//!   DATA0/DATA1, handshakes)
//! - [`framing`]: the length-prefixed framing used on the simulator socket
//! - [`usbip`]: the USB/IP operation and URB messages
//!
//! # Example
//!
//! ```
//! use protocol::bus::{BusPacket, Pid, in_token};
//!
//! let token = in_token(2, 1);
//! assert_eq!(token, [0x69, 0x82, 0x18]);
//!
//! let parsed = BusPacket::parse(&token).unwrap();
//! assert_eq!(
//!     parsed,
//!     BusPacket::Token { pid: Pid::In, address: 2, endpoint: 1 }
//! );
//! ```
//!
//! # USB/IP messages
//!
//! ```
//! use protocol::usbip::{ClientMessage, OpRequest};
//!
//! let request = ClientMessage::Op(OpRequest::import("47-6.0"));
//! let bytes = request.encode();
//! assert_eq!(ClientMessage::decode(&bytes).unwrap(), request);
//! ```

pub mod bits;
pub mod bus;
pub mod error;
pub mod framing;
pub mod types;
pub mod usbip;

pub use bus::{BusPacket, Handshake, Hex, MAX_DATA_PAYLOAD, MAX_PACKET_SIZE, Pid};
pub use error::{ProtocolError, Result};
pub use framing::{MAX_FRAME_SIZE, encode_frame, encode_frames, read_frame, write_frame};

#[cfg(feature = "async")]
pub use framing::{read_frame_async, write_frames_async};
pub use types::{DeviceSpeed, Direction, Recipient, RequestKind, SetupPacket, StandardRequest};
pub use usbip::{
    ClientMessage, CmdSubmit, CmdUnlink, ExportedDevice, IsoPacketDescriptor, OpCode, OpReply,
    OpReplyBody, OpRequest, OpRequestBody, RetSubmit, RetUnlink, ServerMessage, USBIP_VERSION,
    UrbCommand, UrbHeader, UrbReply, UsbIpDevice, UsbIpInterface,
};
