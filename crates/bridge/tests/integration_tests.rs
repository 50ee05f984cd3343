//! Bridge Integration Tests
//!
//! End-to-end sessions over real TCP sockets: a USB/IP client on one side,
//! a small scripted device on the simulator side.
//!
//! # Test Scenarios
//! - Import, bulk IN Submit, then Unlink
//! - Import of an unknown bus id, then client disconnect
//! - Simulator disconnect during a session
//! - Unsupported operations ending the session with an error
//! - Simulator response timeout failing a URB
//!
//! Run with: `cargo test -p bridge --test integration_tests`

use bridge::config::BridgeConfig;
use bridge::coordinator::SessionEnd;
use bridge::network::BridgeServer;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, sim_ack, sim_data, with_timeout};
use protocol::{
    BusPacket, ClientMessage, CmdSubmit, CmdUnlink, Direction, OpReplyBody, OpRequest,
    OpRequestBody, Pid, ServerMessage, UrbCommand, UrbHeader, UrbReply, read_frame_async,
    write_frames_async,
};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const BUSID: &str = "47-6.0";
const DEVID: u32 = (47 << 16) | 6;
const BULK_PAYLOAD: [u8; 4] = [0xca, 0xfe, 0xba, 0xbe];

// ============================================================================
// Helpers
// ============================================================================

fn loopback_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.bridge.usbip_bind = "127.0.0.1:0".to_string();
    config.bridge.sim_bind = "127.0.0.1:0".to_string();
    config
}

/// Start one session in the background
async fn start_session(
    config: BridgeConfig,
) -> (JoinHandle<anyhow::Result<SessionEnd>>, SocketAddr, SocketAddr) {
    let server = BridgeServer::bind(config).await.unwrap();
    let (usbip_addr, sim_addr) = server.local_addrs().unwrap();
    let session = tokio::spawn(async move { server.run_session().await });
    (session, usbip_addr, sim_addr)
}

/// A device that ACKs every SETUP/OUT data packet, answers the address
/// assignment status stage and, when `answer_bulk` is set, sends
/// [`BULK_PAYLOAD`] for every IN on endpoint 1
async fn fake_simulator(addr: SocketAddr, answer_bulk: bool) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut bulk_toggle = false;
    let mut awaiting_data = false;

    while let Ok(Some(frame)) = read_frame_async(&mut stream).await {
        let response = match BusPacket::parse(&frame).unwrap() {
            BusPacket::Token {
                pid: Pid::Setup | Pid::Out,
                ..
            } => {
                awaiting_data = true;
                None
            }
            BusPacket::Data { .. } if awaiting_data => {
                awaiting_data = false;
                Some(sim_ack())
            }
            BusPacket::Token {
                pid: Pid::In,
                endpoint: 0,
                ..
            } => Some(sim_data(&[], false)),
            BusPacket::Token {
                pid: Pid::In,
                endpoint: 1,
                ..
            } if answer_bulk => {
                let packet = sim_data(&BULK_PAYLOAD, bulk_toggle);
                bulk_toggle = !bulk_toggle;
                Some(packet)
            }
            _ => None,
        };

        if let Some(response) = response
            && write_frames_async(&mut stream, &[response]).await.is_err()
        {
            return;
        }
    }
}

fn bulk_in(seqnum: u32, length: u32) -> ClientMessage {
    ClientMessage::Urb(UrbCommand::Submit(CmdSubmit {
        header: UrbHeader {
            seqnum,
            devid: DEVID,
            direction: Direction::In,
            ep: 1,
        },
        transfer_flags: 0,
        transfer_buffer_length: length,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0; 8],
        transfer_buffer: Vec::new(),
        iso_packet_descriptors: Vec::new(),
    }))
}

fn unlink(seqnum: u32, victim: u32) -> ClientMessage {
    ClientMessage::Urb(UrbCommand::Unlink(CmdUnlink {
        header: UrbHeader {
            seqnum,
            devid: DEVID,
            direction: Direction::Out,
            ep: 0,
        },
        unlink_seqnum: victim,
    }))
}

async fn send(stream: &mut TcpStream, message: ClientMessage) {
    stream.write_all(&message.encode()).await.unwrap();
}

async fn receive(stream: &mut TcpStream) -> Option<ServerMessage> {
    with_timeout(DEFAULT_TEST_TIMEOUT, ServerMessage::read_from_async(stream))
        .await
        .expect("timed out waiting for the bridge")
        .unwrap()
}

async fn finish(session: JoinHandle<anyhow::Result<SessionEnd>>) -> anyhow::Result<SessionEnd> {
    with_timeout(DEFAULT_TEST_TIMEOUT, session)
        .await
        .expect("session did not end")
        .unwrap()
}

// ============================================================================
// Sessions
// ============================================================================

mod sessions {
    use super::*;

    #[tokio::test]
    async fn test_import_submit_unlink() {
        let (session, usbip_addr, sim_addr) = start_session(loopback_config()).await;
        let simulator = tokio::spawn(fake_simulator(sim_addr, true));
        let mut client = TcpStream::connect(usbip_addr).await.unwrap();

        send(&mut client, ClientMessage::Op(OpRequest::import(BUSID))).await;
        let Some(ServerMessage::Op(reply)) = receive(&mut client).await else {
            panic!("Expected an import reply");
        };
        assert_eq!(reply.status, 0);
        let OpReplyBody::Import {
            device: Some(device),
        } = reply.body
        else {
            panic!("Expected an imported device");
        };
        assert_eq!(device.busid, BUSID);
        assert_eq!(device.devid(), DEVID);

        send(&mut client, bulk_in(1, 64)).await;
        let Some(ServerMessage::Urb(UrbReply::Submit(ret))) = receive(&mut client).await else {
            panic!("Expected RET_SUBMIT");
        };
        assert_eq!(ret.header.seqnum, 1);
        assert_eq!(ret.status, 0);
        assert_eq!(ret.actual_length, 4);
        assert_eq!(ret.transfer_buffer, BULK_PAYLOAD);

        // Second URB continues the toggle sequence on the device side
        send(&mut client, bulk_in(2, 64)).await;
        let Some(ServerMessage::Urb(UrbReply::Submit(ret))) = receive(&mut client).await else {
            panic!("Expected RET_SUBMIT");
        };
        assert_eq!(ret.status, 0);

        send(&mut client, unlink(3, 2)).await;
        assert_eq!(finish(session).await.unwrap(), SessionEnd::Unlinked);

        // No RET_UNLINK; the connection just closes
        assert_eq!(receive(&mut client).await, None);
        simulator.abort();
    }

    #[tokio::test]
    async fn test_unknown_busid_then_disconnect() {
        let (session, usbip_addr, sim_addr) = start_session(loopback_config()).await;
        let simulator = tokio::spawn(fake_simulator(sim_addr, true));
        let mut client = TcpStream::connect(usbip_addr).await.unwrap();

        send(&mut client, ClientMessage::Op(OpRequest::import("1-1"))).await;
        let Some(ServerMessage::Op(reply)) = receive(&mut client).await else {
            panic!("Expected an import reply");
        };
        assert_eq!(reply.status, 1);
        assert!(matches!(reply.body, OpReplyBody::Import { device: None }));

        drop(client);
        assert_eq!(finish(session).await.unwrap(), SessionEnd::ClientClosed);
        simulator.abort();
    }

    #[tokio::test]
    async fn test_simulator_disconnect_ends_session() {
        let (session, usbip_addr, sim_addr) = start_session(loopback_config()).await;
        let simulator = TcpStream::connect(sim_addr).await.unwrap();
        let mut client = TcpStream::connect(usbip_addr).await.unwrap();

        send(&mut client, ClientMessage::Op(OpRequest::import(BUSID))).await;
        assert!(receive(&mut client).await.is_some());

        drop(simulator);
        assert_eq!(finish(session).await.unwrap(), SessionEnd::SimulatorClosed);
    }

    #[tokio::test]
    async fn test_unsupported_operation_fails_session() {
        let (session, usbip_addr, sim_addr) = start_session(loopback_config()).await;
        let _simulator = TcpStream::connect(sim_addr).await.unwrap();
        let mut client = TcpStream::connect(usbip_addr).await.unwrap();

        send(
            &mut client,
            ClientMessage::Op(OpRequest {
                status: 0,
                body: OpRequestBody::DevList,
            }),
        )
        .await;

        assert!(finish(session).await.is_err());
    }

    #[tokio::test]
    async fn test_response_timeout_fails_urb() {
        let mut config = loopback_config();
        config.bridge.sim_response_timeout_ms = Some(100);
        let (session, usbip_addr, sim_addr) = start_session(config).await;
        let simulator = tokio::spawn(fake_simulator(sim_addr, false));
        let mut client = TcpStream::connect(usbip_addr).await.unwrap();

        send(&mut client, bulk_in(7, 64)).await;
        let Some(ServerMessage::Urb(UrbReply::Submit(ret))) = receive(&mut client).await else {
            panic!("Expected RET_SUBMIT");
        };
        assert_eq!(ret.header.seqnum, 7);
        assert_eq!(ret.status, 1);
        assert_eq!(ret.error_count, 1);
        assert!(ret.transfer_buffer.is_empty());

        send(&mut client, unlink(8, 7)).await;
        assert_eq!(finish(session).await.unwrap(), SessionEnd::Unlinked);
        simulator.abort();
    }
}

// ============================================================================
// Configuration
// ============================================================================

mod configuration {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.toml");

        let mut config = BridgeConfig::default();
        config.bridge.sim_response_timeout_ms = Some(500);
        config.transfer.max_packet_size = 64;
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.bridge.sim_response_timeout_ms, Some(500));
        assert_eq!(loaded.transfer.max_packet_size, 64);
        assert_eq!(loaded.device.busid(), BUSID);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(BridgeConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
