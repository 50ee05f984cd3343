//! URB execution on the simulated bus
//!
//! The engine turns one USB/IP `CMD_SUBMIT` into the token, data and
//! handshake transactions a host controller would run, over a [`BusLink`].
//! Every transaction is synchronous: send a batch, then block for exactly
//! one device packet (except the host's trailing ACK, which gets no answer).
//!
//! Data toggles follow one rule: the SETUP packet is always DATA0 and leaves
//! the toggle alone, data and status stages continue from the current
//! toggle, and a control transfer resets its toggle once the status stage
//! completes.

mod session;

pub use session::{BridgeSession, CONTROL_SLOT, EndpointToggles};

use common::{BusLink, LinkError};
use protocol::bus::{
    BusPacket, Handshake, Pid, data_packet, handshake_packet, in_token, out_token, setup_data_packet,
    setup_token,
};
use protocol::{CmdSubmit, Direction, Recipient, RetSubmit, SetupPacket, StandardRequest};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Device misbehaviour that fails one URB
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Device answered {0:?}")]
    UnexpectedHandshake(Handshake),

    #[error("Expected {expected}, device sent {got}")]
    UnexpectedPacket { expected: &'static str, got: String },

    #[error("Invalid packet from device: {0}")]
    InvalidPacket(String),

    #[error("Expected {expected}, device sent {got}")]
    WrongToggle { expected: Pid, got: Pid },

    #[error("Device sent {len} bytes where at most {limit} fit")]
    Babble { len: usize, limit: usize },

    #[error("No response from simulator")]
    Timeout,
}

/// Errors from [`TransferEngine::submit`]
///
/// Device errors never reach the caller; they become a failed `RET_SUBMIT`.
/// Everything here ends the session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Unsupported transfer: {0}")]
    Unsupported(String),

    #[error("Address assignment failed: {0}")]
    AddressAssignment(DeviceError),

    #[error("Simulator link closed")]
    LinkClosed,
}

impl From<LinkError> for TransferError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Closed => TransferError::LinkClosed,
            LinkError::Timeout => TransferError::Device(DeviceError::Timeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Control,
    Bulk,
}

/// Completed URB payload: IN data, or the number of bytes sent
struct Completion {
    data: Vec<u8>,
    actual_length: usize,
}

impl Completion {
    fn received(data: Vec<u8>) -> Self {
        let actual_length = data.len();
        Self {
            data,
            actual_length,
        }
    }

    fn sent(actual_length: usize) -> Self {
        Self {
            data: Vec::new(),
            actual_length,
        }
    }
}

/// Runs URBs for one session against a [`BusLink`]
pub struct TransferEngine<L: BusLink> {
    link: L,
    session: BridgeSession,
    max_packet_size: usize,
}

impl<L: BusLink> TransferEngine<L> {
    /// Engine for a device that will be given `address` on first use
    pub fn new(link: L, address: u8, max_packet_size: usize) -> Self {
        Self::with_session(link, BridgeSession::new(address), max_packet_size)
    }

    pub fn with_session(link: L, session: BridgeSession, max_packet_size: usize) -> Self {
        Self {
            link,
            session,
            max_packet_size: max_packet_size.max(1),
        }
    }

    pub fn session(&self) -> &BridgeSession {
        &self.session
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Run one URB to completion
    ///
    /// The device gets its address before the first URB of a session.
    pub fn submit(&mut self, cmd: &CmdSubmit) -> Result<RetSubmit, TransferError> {
        let kind = classify(cmd)?;

        if !self.session.is_address_assigned() {
            self.assign_address()?;
        }

        let result = match kind {
            TransferKind::Control => self.control_transfer(cmd),
            TransferKind::Bulk => self.bulk_transfer(cmd),
        };

        match result {
            Ok(done) => {
                debug!(
                    "URB {} completed: {} bytes",
                    cmd.header.seqnum, done.actual_length
                );
                Ok(RetSubmit::success(
                    cmd.header,
                    done.data,
                    done.actual_length as u32,
                ))
            }
            Err(TransferError::Device(e)) => {
                warn!("URB {} failed: {}", cmd.header.seqnum, e);
                Ok(RetSubmit::failure(cmd.header))
            }
            Err(e) => Err(e),
        }
    }

    /// SET_ADDRESS on the default address, then the zero-length status stage
    fn assign_address(&mut self) -> Result<(), TransferError> {
        let address = self.session.address();
        info!("Assigning bus address {} to the simulated device", address);

        self.run_address_assignment(address).map_err(|e| match e {
            TransferError::Device(e) => TransferError::AddressAssignment(e),
            other => other,
        })?;

        self.session.mark_address_assigned();
        Ok(())
    }

    fn run_address_assignment(&mut self, address: u8) -> Result<(), TransferError> {
        self.session.toggles_mut().reset(CONTROL_SLOT);

        let batch = vec![
            self.session.next_sof().to_vec(),
            self.session.next_sof().to_vec(),
            setup_token(0, 0).to_vec(),
            setup_data_packet(
                Recipient::Device,
                Direction::Out,
                StandardRequest::SetAddress,
                address as u16,
                0,
                0,
            ),
        ];
        let response = self.transact(batch)?;
        expect_ack(&response)?;

        let batch = vec![self.session.next_sof().to_vec(), in_token(0, 0).to_vec()];
        let response = self.transact(batch)?;
        let payload = self.expect_data(&response, CONTROL_SLOT)?;
        if !payload.is_empty() {
            return Err(DeviceError::Babble {
                len: payload.len(),
                limit: 0,
            }
            .into());
        }
        self.link.send(vec![handshake_packet(Handshake::Ack).to_vec()])?;

        self.session.toggles_mut().reset(CONTROL_SLOT);
        Ok(())
    }

    fn control_transfer(&mut self, cmd: &CmdSubmit) -> Result<Completion, TransferError> {
        let setup = SetupPacket::from_bytes(&cmd.setup);
        let length = cmd.transfer_buffer_length as usize;
        let direction = cmd.header.direction;
        debug!(
            "Control transfer: request_type={:#04x}, request={:#04x}, value={:#06x}, index={:#06x}, length={}",
            setup.request_type, setup.request, setup.value, setup.index, length
        );

        // Setup stage
        self.session.toggles_mut().reset(CONTROL_SLOT);
        let batch = vec![
            self.session.next_sof().to_vec(),
            setup_token(self.session.address(), 0).to_vec(),
            data_packet(&cmd.setup, false),
        ];
        let response = self.transact(batch)?;
        expect_ack(&response)?;

        // Data stage
        let completion = if length == 0 {
            Completion::sent(0)
        } else {
            match direction {
                Direction::In => Completion::received(self.read_in(0, CONTROL_SLOT, length)?),
                Direction::Out => {
                    Completion::sent(self.write_out(0, CONTROL_SLOT, &cmd.transfer_buffer)?)
                }
            }
        };

        // Status stage
        let status_direction = if length == 0 {
            Direction::In
        } else {
            direction.opposite()
        };
        match status_direction {
            Direction::In => {
                let payload = self.in_transaction(0, CONTROL_SLOT, 0)?;
                debug_assert!(payload.is_empty());
            }
            Direction::Out => self.out_transaction(0, CONTROL_SLOT, &[])?,
        }
        self.session.toggles_mut().reset(CONTROL_SLOT);

        Ok(completion)
    }

    fn bulk_transfer(&mut self, cmd: &CmdSubmit) -> Result<Completion, TransferError> {
        let endpoint = (cmd.header.ep & 0x0F) as u8;
        let direction = cmd.header.direction;
        let slot = EndpointToggles::slot(direction, endpoint);
        debug!(
            "Bulk transfer: endpoint={}, direction={:?}, length={}",
            endpoint, direction, cmd.transfer_buffer_length
        );

        match direction {
            Direction::In => {
                let data = self.read_in(endpoint, slot, cmd.transfer_buffer_length as usize)?;
                Ok(Completion::received(data))
            }
            Direction::Out => {
                let sent = self.write_out(endpoint, slot, &cmd.transfer_buffer)?;
                Ok(Completion::sent(sent))
            }
        }
    }

    /// IN transactions until `length` bytes arrived or a short packet ends
    /// the transfer
    fn read_in(&mut self, endpoint: u8, slot: usize, length: usize) -> Result<Vec<u8>, TransferError> {
        let mut data = Vec::with_capacity(length);
        loop {
            let payload = self.in_transaction(endpoint, slot, length - data.len())?;
            let short = payload.len() < self.max_packet_size;
            data.extend_from_slice(&payload);
            if short || data.len() >= length {
                return Ok(data);
            }
        }
    }

    /// OUT transactions of at most one max packet each; an empty buffer is
    /// sent as one zero-length packet
    fn write_out(&mut self, endpoint: u8, slot: usize, buffer: &[u8]) -> Result<usize, TransferError> {
        if buffer.is_empty() {
            self.out_transaction(endpoint, slot, &[])?;
            return Ok(0);
        }
        for chunk in buffer.chunks(self.max_packet_size) {
            self.out_transaction(endpoint, slot, chunk)?;
        }
        Ok(buffer.len())
    }

    /// `[SOF, IN]` -> DATA, then `[ACK]`; flips the toggle
    fn in_transaction(
        &mut self,
        endpoint: u8,
        slot: usize,
        remaining: usize,
    ) -> Result<Vec<u8>, TransferError> {
        let batch = vec![
            self.session.next_sof().to_vec(),
            in_token(self.session.address(), endpoint).to_vec(),
        ];
        let response = self.transact(batch)?;
        let payload = self.expect_data(&response, slot)?;

        let limit = remaining.min(self.max_packet_size);
        if payload.len() > limit {
            return Err(DeviceError::Babble {
                len: payload.len(),
                limit,
            }
            .into());
        }

        self.link.send(vec![handshake_packet(Handshake::Ack).to_vec()])?;
        self.session.toggles_mut().flip(slot);
        Ok(payload)
    }

    /// `[SOF, OUT, DATA]` -> ACK; flips the toggle
    fn out_transaction(
        &mut self,
        endpoint: u8,
        slot: usize,
        payload: &[u8],
    ) -> Result<(), TransferError> {
        let toggle = self.session.toggles().get(slot);
        let batch = vec![
            self.session.next_sof().to_vec(),
            out_token(self.session.address(), endpoint).to_vec(),
            data_packet(payload, toggle),
        ];
        let response = self.transact(batch)?;
        expect_ack(&response)?;

        self.session.toggles_mut().flip(slot);
        Ok(())
    }

    fn transact(&mut self, batch: Vec<Vec<u8>>) -> Result<Vec<u8>, TransferError> {
        self.link.send(batch)?;
        Ok(self.link.recv()?)
    }

    /// Payload of a DATA packet carrying the expected toggle
    fn expect_data(&self, response: &[u8], slot: usize) -> Result<Vec<u8>, DeviceError> {
        let expected = Pid::data(self.session.toggles().get(slot));
        match parse(response)? {
            BusPacket::Data { pid, payload } if pid == expected => Ok(payload),
            BusPacket::Data { pid, .. } => Err(DeviceError::WrongToggle { expected, got: pid }),
            BusPacket::Handshake(kind) => Err(DeviceError::UnexpectedHandshake(kind)),
            other => Err(DeviceError::UnexpectedPacket {
                expected: "a data packet",
                got: describe(&other),
            }),
        }
    }
}

fn classify(cmd: &CmdSubmit) -> Result<TransferKind, TransferError> {
    let ep = cmd.header.ep;
    if cmd.is_isochronous() {
        return Err(TransferError::Unsupported(format!(
            "isochronous URB {} on endpoint {}",
            cmd.header.seqnum, ep
        )));
    }
    if ep == 0 {
        return Ok(TransferKind::Control);
    }
    if cmd.interval > 0 {
        return Err(TransferError::Unsupported(format!(
            "interrupt URB {} on endpoint {}",
            cmd.header.seqnum, ep
        )));
    }
    if ep > 15 {
        return Err(TransferError::Unsupported(format!(
            "URB {} for endpoint {} beyond 15",
            cmd.header.seqnum, ep
        )));
    }
    Ok(TransferKind::Bulk)
}

fn parse(response: &[u8]) -> Result<BusPacket, DeviceError> {
    BusPacket::parse(response).map_err(|e| DeviceError::InvalidPacket(e.to_string()))
}

fn expect_ack(response: &[u8]) -> Result<(), DeviceError> {
    match parse(response)? {
        BusPacket::Handshake(Handshake::Ack) => Ok(()),
        BusPacket::Handshake(kind) => Err(DeviceError::UnexpectedHandshake(kind)),
        other => Err(DeviceError::UnexpectedPacket {
            expected: "ACK",
            got: describe(&other),
        }),
    }
}

fn describe(packet: &BusPacket) -> String {
    match packet {
        BusPacket::Token { pid, .. } => format!("{pid} token"),
        BusPacket::Sof { frame_number } => format!("SOF {frame_number}"),
        BusPacket::Data { pid, payload } => format!("{pid} ({} bytes)", payload.len()),
        BusPacket::Handshake(kind) => format!("{kind:?}"),
    }
}
