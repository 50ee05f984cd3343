//! Session coordinator thread
//!
//! One blocking loop per session pulls [`SessionEvent`]s in arrival order,
//! answers imports, runs each Submit through the [`TransferEngine`] and
//! queues the reply. It owns the [`BridgeSession`](crate::engine::BridgeSession)
//! state, so URBs never interleave on the bus.

use crate::device::SimulatedDevice;
use crate::engine::{TransferEngine, TransferError};
use common::{BusLink, Mailbox, SessionEvent};
use protocol::{ClientMessage, OpCode, OpRequest, OpRequestBody, ServerMessage, UrbCommand, UrbReply};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end a session abnormally
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unsupported USB/IP operation {0:?}")]
    Unsupported(OpCode),

    #[error(transparent)]
    Transfer(TransferError),

    #[error(transparent)]
    Queue(#[from] common::Error),
}

/// How a session ended normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent CMD_UNLINK
    Unlinked,
    /// The USB/IP connection closed or stopped framing
    ClientClosed,
    /// The simulator connection closed or stopped framing
    SimulatorClosed,
}

pub struct Coordinator<L: BusLink> {
    mailbox: Mailbox,
    engine: TransferEngine<L>,
    device: SimulatedDevice,
}

impl<L: BusLink> Coordinator<L> {
    pub fn new(mailbox: Mailbox, link: L, device: SimulatedDevice, max_packet_size: usize) -> Self {
        let engine = TransferEngine::new(link, device.address(), max_packet_size);
        Self {
            mailbox,
            engine,
            device,
        }
    }

    /// Process events until the session ends
    pub fn run(mut self) -> Result<SessionEnd, SessionError> {
        info!("Coordinator started for device {}", self.device.busid());

        loop {
            let event = self.mailbox.recv_event()?;
            if let Some(end) = self.handle_event(event)? {
                info!("Session ended: {:?}", end);
                return Ok(end);
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<Option<SessionEnd>, SessionError> {
        match event {
            SessionEvent::Client(ClientMessage::Op(request)) => self.handle_op(request),
            SessionEvent::Client(ClientMessage::Urb(UrbCommand::Submit(cmd))) => {
                debug!(
                    "Submit seqnum={} ep={} dir={:?} len={}",
                    cmd.header.seqnum,
                    cmd.header.ep,
                    cmd.header.direction,
                    cmd.transfer_buffer_length
                );
                match self.engine.submit(&cmd) {
                    Ok(reply) => Ok(self.reply(ServerMessage::Urb(UrbReply::Submit(reply)))),
                    Err(TransferError::LinkClosed) => {
                        info!("Simulator went away during URB {}", cmd.header.seqnum);
                        Ok(Some(SessionEnd::SimulatorClosed))
                    }
                    Err(e) => Err(SessionError::Transfer(e)),
                }
            }
            SessionEvent::Client(ClientMessage::Urb(UrbCommand::Unlink(cmd))) => {
                info!(
                    "Unlink of seqnum {} (seqnum {})",
                    cmd.unlink_seqnum, cmd.header.seqnum
                );
                Ok(Some(SessionEnd::Unlinked))
            }
            SessionEvent::ClientClosed { reason } => {
                match reason {
                    Some(reason) => warn!("USB/IP connection failed: {}", reason),
                    None => info!("USB/IP client disconnected"),
                }
                Ok(Some(SessionEnd::ClientClosed))
            }
            SessionEvent::SimulatorClosed { reason } => {
                match reason {
                    Some(reason) => warn!("Simulator connection failed: {}", reason),
                    None => info!("Simulator disconnected"),
                }
                Ok(Some(SessionEnd::SimulatorClosed))
            }
        }
    }

    fn handle_op(&mut self, request: OpRequest) -> Result<Option<SessionEnd>, SessionError> {
        let code = request.code();
        match request.body {
            OpRequestBody::Import { busid } => {
                let reply = self.device.import_reply(&busid);
                Ok(self.reply(ServerMessage::Op(reply)))
            }
            _ => Err(SessionError::Unsupported(code)),
        }
    }

    /// Queue a reply; a gone writer means the client is gone
    fn reply(&self, message: ServerMessage) -> Option<SessionEnd> {
        match self.mailbox.send_reply(message) {
            Ok(()) => None,
            Err(e) => {
                debug!("Reply dropped: {}", e);
                Some(SessionEnd::ClientClosed)
            }
        }
    }
}

/// Run a coordinator on its own named thread
pub fn spawn_coordinator<L>(
    coordinator: Coordinator<L>,
) -> std::io::Result<std::thread::JoinHandle<Result<SessionEnd, SessionError>>>
where
    L: BusLink + Send + 'static,
{
    std::thread::Builder::new()
        .name("bridge-coordinator".to_string())
        .spawn(move || coordinator.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use common::test_utils::{ScriptedLink, sim_ack, sim_data};
    use common::{IoQueues, create_session_queues};
    use protocol::{CmdSubmit, CmdUnlink, Direction, OpReply, UrbHeader};

    fn device() -> SimulatedDevice {
        SimulatedDevice::from_settings(&DeviceSettings::default())
    }

    fn header(seqnum: u32, ep: u32) -> UrbHeader {
        UrbHeader {
            seqnum,
            devid: device().usbip_device().devid(),
            direction: Direction::In,
            ep,
        }
    }

    fn bulk_in(seqnum: u32, length: u32) -> SessionEvent {
        SessionEvent::Client(ClientMessage::Urb(UrbCommand::Submit(CmdSubmit {
            header: header(seqnum, 1),
            transfer_flags: 0,
            transfer_buffer_length: length,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
            transfer_buffer: Vec::new(),
            iso_packet_descriptors: Vec::new(),
        })))
    }

    fn unlink(seqnum: u32) -> SessionEvent {
        SessionEvent::Client(ClientMessage::Urb(UrbCommand::Unlink(CmdUnlink {
            header: header(seqnum, 0),
            unlink_seqnum: seqnum - 1,
        })))
    }

    fn import(busid: &str) -> SessionEvent {
        SessionEvent::Client(ClientMessage::Op(OpRequest::import(busid)))
    }

    /// Queue `events`, then run a coordinator over `link` to completion
    fn run_with(
        events: Vec<SessionEvent>,
        link: ScriptedLink,
    ) -> (Result<SessionEnd, SessionError>, IoQueues) {
        let (io, queues) = create_session_queues();
        for event in events {
            io.events_tx.send_blocking(event).unwrap();
        }
        let coordinator = Coordinator::new(queues.mailbox, link, device(), 512);
        (coordinator.run(), io)
    }

    fn replies(io: &IoQueues) -> Vec<ServerMessage> {
        std::iter::from_fn(|| io.replies_rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_import_then_unlink() {
        let (result, io) = run_with(vec![import("47-6.0"), unlink(2)], ScriptedLink::new());
        assert_eq!(result.unwrap(), SessionEnd::Unlinked);
        assert_eq!(
            replies(&io),
            vec![ServerMessage::Op(OpReply::import(device().usbip_device().clone()))]
        );
    }

    #[test]
    fn test_import_unknown_busid_continues() {
        let (result, io) = run_with(vec![import("1-1"), unlink(2)], ScriptedLink::new());
        assert_eq!(result.unwrap(), SessionEnd::Unlinked);
        assert_eq!(replies(&io), vec![ServerMessage::Op(OpReply::import_failed(1))]);
    }

    #[test]
    fn test_other_operations_are_fatal() {
        let devlist = SessionEvent::Client(ClientMessage::Op(OpRequest {
            status: 0,
            body: OpRequestBody::DevList,
        }));
        let (result, _io) = run_with(vec![devlist], ScriptedLink::new());
        assert!(matches!(
            result,
            Err(SessionError::Unsupported(OpCode::ReqDevList))
        ));
    }

    #[test]
    fn test_submit_gets_reply() {
        let link = ScriptedLink::new().respond_all([
            sim_ack(),
            sim_data(&[], false),
            sim_data(&[1, 2, 3, 4], false),
        ]);
        let (result, io) = run_with(vec![bulk_in(1, 64), unlink(2)], link);
        assert_eq!(result.unwrap(), SessionEnd::Unlinked);

        let replies = replies(&io);
        assert_eq!(replies.len(), 1);
        let ServerMessage::Urb(UrbReply::Submit(reply)) = &replies[0] else {
            panic!("Expected RET_SUBMIT, got {:?}", replies[0]);
        };
        assert_eq!(reply.header.seqnum, 1);
        assert_eq!(reply.status, 0);
        assert_eq!(reply.transfer_buffer, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unsupported_transfer_is_fatal() {
        let SessionEvent::Client(ClientMessage::Urb(UrbCommand::Submit(mut cmd))) = bulk_in(1, 8)
        else {
            unreachable!()
        };
        cmd.interval = 4;
        let event = SessionEvent::Client(ClientMessage::Urb(UrbCommand::Submit(cmd)));

        let (result, io) = run_with(vec![event], ScriptedLink::new());
        assert!(matches!(
            result,
            Err(SessionError::Transfer(TransferError::Unsupported(_)))
        ));
        assert!(replies(&io).is_empty());
    }

    #[test]
    fn test_simulator_gone_mid_urb_ends_session() {
        let (result, io) = run_with(vec![bulk_in(1, 64)], ScriptedLink::new());
        assert_eq!(result.unwrap(), SessionEnd::SimulatorClosed);
        assert!(replies(&io).is_empty());
    }

    #[test]
    fn test_closed_events_end_session() {
        let (result, _io) = run_with(
            vec![SessionEvent::ClientClosed { reason: None }],
            ScriptedLink::new(),
        );
        assert_eq!(result.unwrap(), SessionEnd::ClientClosed);

        let (result, _io) = run_with(
            vec![SessionEvent::SimulatorClosed {
                reason: Some("invalid frame length".to_string()),
            }],
            ScriptedLink::new(),
        );
        assert_eq!(result.unwrap(), SessionEnd::SimulatorClosed);
    }

    #[test]
    fn test_writer_gone_ends_session() {
        let (io, queues) = create_session_queues();
        io.events_tx.send_blocking(import("47-6.0")).unwrap();
        drop(io);

        let coordinator = Coordinator::new(queues.mailbox, ScriptedLink::new(), device(), 512);
        assert_eq!(coordinator.run().unwrap(), SessionEnd::ClientClosed);
    }

    #[test]
    fn test_spawned_coordinator() {
        let (io, queues) = create_session_queues();
        let coordinator = Coordinator::new(queues.mailbox, ScriptedLink::new(), device(), 512);
        let handle = spawn_coordinator(coordinator).unwrap();

        io.events_tx.send_blocking(import("47-6.0")).unwrap();
        assert!(matches!(
            io.replies_rx.recv_blocking().unwrap(),
            ServerMessage::Op(_)
        ));
        io.events_tx.send_blocking(unlink(2)).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), SessionEnd::Unlinked);
    }
}
