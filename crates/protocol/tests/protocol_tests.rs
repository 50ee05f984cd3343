//! Integration tests for the bus and USB/IP codecs
//!
//! Exercises the public API the bridge relies on: packet construction and
//! validation, simulator framing, and USB/IP message streaming.

use protocol::bus::{
    BusPacket, Handshake, Pid, data_packet, handshake_packet, in_token, out_token, setup_token,
    sof_packet,
};
use protocol::usbip::{OP_HEADER_SIZE, URB_FIXED_SIZE};
use protocol::{
    ClientMessage, CmdSubmit, CmdUnlink, Direction, ExportedDevice, OpReply, OpReplyBody,
    OpRequest, OpRequestBody, ProtocolError, RetSubmit, ServerMessage, UrbCommand, UrbHeader,
    UrbReply, UsbIpDevice, UsbIpInterface, read_frame, write_frame,
};
use std::io::Cursor;

fn make_test_device(num_interfaces: u8) -> UsbIpDevice {
    UsbIpDevice {
        path: "/sys/devices/sim/usb47/47-6".to_string(),
        busid: "47-6.0".to_string(),
        busnum: 47,
        devnum: 6,
        speed: 3,
        id_vendor: 0x16D0,
        id_product: 0x0F3B,
        bcd_device: 0x0100,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces,
    }
}

fn make_header(seqnum: u32, direction: Direction, ep: u32) -> UrbHeader {
    UrbHeader {
        seqnum,
        devid: (47 << 16) | 6,
        direction,
        ep,
    }
}

fn make_submit(seqnum: u32, direction: Direction, ep: u32, data: Vec<u8>) -> CmdSubmit {
    CmdSubmit {
        header: make_header(seqnum, direction, ep),
        transfer_flags: 0,
        transfer_buffer_length: if direction == Direction::Out {
            data.len() as u32
        } else {
            1324
        },
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0; 8],
        transfer_buffer: data,
        iso_packet_descriptors: Vec::new(),
    }
}

// ============================================================================
// USB/IP operations
// ============================================================================

mod usbip_operations {
    use super::*;

    #[test]
    fn test_import_request_roundtrip() {
        let msg = ClientMessage::Op(OpRequest::import("47-6.0"));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), OP_HEADER_SIZE + 32);
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_import_reply_roundtrip() {
        let msg = ServerMessage::Op(OpReply::import(make_test_device(1)));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), OP_HEADER_SIZE + UsbIpDevice::SIZE);
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_import_failure_roundtrip() {
        let msg = ServerMessage::Op(OpReply::import_failed(1));
        let decoded = ServerMessage::decode(&msg.encode()).unwrap();
        let ServerMessage::Op(OpReply {
            status,
            body: OpReplyBody::Import { device },
        }) = decoded
        else {
            panic!("Expected import reply, got {:?}", decoded);
        };
        assert_eq!(status, 1);
        assert!(device.is_none());
    }

    #[test]
    fn test_devlist_roundtrip() {
        let devices = vec![
            ExportedDevice {
                device: make_test_device(1),
                interfaces: vec![UsbIpInterface {
                    class: 0xFF,
                    subclass: 0,
                    protocol: 0,
                }],
            },
            ExportedDevice {
                device: UsbIpDevice {
                    busid: "47-7.0".to_string(),
                    devnum: 7,
                    num_interfaces: 0,
                    ..make_test_device(0)
                },
                interfaces: Vec::new(),
            },
        ];
        let msg = ServerMessage::Op(OpReply {
            status: 0,
            body: OpReplyBody::DevList { devices },
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len(), OP_HEADER_SIZE + 4 + 2 * UsbIpDevice::SIZE + 4);
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_empty_devlist_roundtrip() {
        let msg = ServerMessage::Op(OpReply {
            status: 0,
            body: OpReplyBody::DevList {
                devices: Vec::new(),
            },
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len(), OP_HEADER_SIZE + 4);
        assert_eq!(&bytes[OP_HEADER_SIZE..], &[0, 0, 0, 0]);
        assert_eq!(ServerMessage::frame_len(&bytes).unwrap(), 12);
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);

        // Trailing bytes belong to the next message
        let mut stream = bytes.clone();
        stream.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(ServerMessage::frame_len(&stream).unwrap(), 12);
    }

    #[test]
    fn test_devinfo_and_export_roundtrip() {
        let requests = vec![
            ClientMessage::Op(OpRequest {
                status: 0,
                body: OpRequestBody::DevInfo {
                    busid: "47-6.0".to_string(),
                },
            }),
            ClientMessage::Op(OpRequest {
                status: 0,
                body: OpRequestBody::Export {
                    device: make_test_device(1),
                },
            }),
            ClientMessage::Op(OpRequest {
                status: 0,
                body: OpRequestBody::Unexport {
                    device: make_test_device(1),
                },
            }),
            ClientMessage::Op(OpRequest {
                status: 0,
                body: OpRequestBody::DevList,
            }),
        ];
        for msg in requests {
            assert_eq!(ClientMessage::decode(&msg.encode()).unwrap(), msg);
        }

        let replies = vec![
            ServerMessage::Op(OpReply {
                status: 0,
                body: OpReplyBody::DevInfo {
                    device: Some(ExportedDevice {
                        device: make_test_device(1),
                        interfaces: vec![UsbIpInterface {
                            class: 0x08,
                            subclass: 0x06,
                            protocol: 0x50,
                        }],
                    }),
                },
            }),
            ServerMessage::Op(OpReply {
                status: 0,
                body: OpReplyBody::Export { returncode: 0 },
            }),
            ServerMessage::Op(OpReply {
                status: 0,
                body: OpReplyBody::Unexport { returncode: 2 },
            }),
        ];
        for msg in replies {
            assert_eq!(ServerMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut bytes = ClientMessage::Op(OpRequest::import("47-6.0")).encode();
        bytes[0] = 0x01;
        bytes[1] = 0x06;
        // 0x0106 is not the USB/IP version, so this parses as a URB and the
        // command tag 0x01068003 is unknown
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::UnknownCommand(0x0106_8003))
        ));
    }
}

// ============================================================================
// USB/IP URBs
// ============================================================================

mod usbip_urbs {
    use super::*;

    #[test]
    fn test_submit_in_roundtrip() {
        let msg = ClientMessage::Urb(UrbCommand::Submit(make_submit(
            3,
            Direction::In,
            1,
            Vec::new(),
        )));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), URB_FIXED_SIZE);
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_submit_out_roundtrip() {
        let msg = ClientMessage::Urb(UrbCommand::Submit(make_submit(
            4,
            Direction::Out,
            2,
            (0..=255).collect(),
        )));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), URB_FIXED_SIZE + 256);
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_ret_submit_roundtrip() {
        let data = vec![0x5A; 1324];
        let msg = ServerMessage::Urb(UrbReply::Submit(RetSubmit::success(
            make_header(3, Direction::In, 1),
            data,
            1324,
        )));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), URB_FIXED_SIZE + 1324);
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);

        // OUT completion reports the length but carries no buffer
        let msg = ServerMessage::Urb(UrbReply::Submit(RetSubmit::success(
            make_header(4, Direction::Out, 2),
            Vec::new(),
            1024,
        )));
        let bytes = msg.encode();
        assert_eq!(bytes.len(), URB_FIXED_SIZE);
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unlink_roundtrip() {
        let msg = ClientMessage::Urb(UrbCommand::Unlink(CmdUnlink {
            header: make_header(9, Direction::Out, 0),
            unlink_seqnum: 3,
        }));
        assert_eq!(ClientMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_invalid_direction_rejected() {
        let mut bytes = ClientMessage::Urb(UrbCommand::Submit(make_submit(
            1,
            Direction::In,
            1,
            Vec::new(),
        )))
        .encode();
        bytes[15] = 7;
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::InvalidDirection(7))
        ));
    }
}

// ============================================================================
// Streaming reads
// ============================================================================

mod streaming {
    use super::*;

    #[test]
    fn test_back_to_back_messages() {
        let first = ClientMessage::Op(OpRequest::import("47-6.0"));
        let second = ClientMessage::Urb(UrbCommand::Submit(make_submit(
            1,
            Direction::Out,
            2,
            vec![1, 2, 3],
        )));
        let third = ClientMessage::Urb(UrbCommand::Unlink(CmdUnlink {
            header: make_header(2, Direction::Out, 0),
            unlink_seqnum: 1,
        }));

        let mut stream = Vec::new();
        for msg in [&first, &second, &third] {
            msg.write_to(&mut stream).unwrap();
        }

        let mut cursor = Cursor::new(stream);
        assert_eq!(ClientMessage::read_from(&mut cursor).unwrap(), Some(first));
        assert_eq!(ClientMessage::read_from(&mut cursor).unwrap(), Some(second));
        assert_eq!(ClientMessage::read_from(&mut cursor).unwrap(), Some(third));
        assert_eq!(ClientMessage::read_from(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_eof_inside_transfer_buffer() {
        let msg = ClientMessage::Urb(UrbCommand::Submit(make_submit(
            1,
            Direction::Out,
            2,
            vec![0xAA; 64],
        )));
        let bytes = msg.encode();
        let mut cursor = Cursor::new(bytes[..URB_FIXED_SIZE + 10].to_vec());

        let result = ClientMessage::read_from(&mut cursor);
        let Err(ProtocolError::IncompleteFrame { expected, actual }) = result else {
            panic!("Expected IncompleteFrame error, got {:?}", result);
        };
        assert_eq!(expected, URB_FIXED_SIZE + 64);
        assert_eq!(actual, URB_FIXED_SIZE + 10);
    }

    #[test]
    fn test_server_stream_with_devlist() {
        let devlist = ServerMessage::Op(OpReply {
            status: 0,
            body: OpReplyBody::DevList {
                devices: vec![ExportedDevice {
                    device: make_test_device(2),
                    interfaces: vec![
                        UsbIpInterface {
                            class: 0xFF,
                            subclass: 0,
                            protocol: 0,
                        },
                        UsbIpInterface {
                            class: 0x0A,
                            subclass: 0,
                            protocol: 0,
                        },
                    ],
                }],
            },
        });
        let reply = ServerMessage::Urb(UrbReply::Submit(RetSubmit::failure(make_header(
            5,
            Direction::In,
            0,
        ))));

        let mut stream = Vec::new();
        devlist.write_to(&mut stream).unwrap();
        reply.write_to(&mut stream).unwrap();

        let mut cursor = Cursor::new(stream);
        assert_eq!(ServerMessage::read_from(&mut cursor).unwrap(), Some(devlist));
        assert_eq!(ServerMessage::read_from(&mut cursor).unwrap(), Some(reply));
        assert_eq!(ServerMessage::read_from(&mut cursor).unwrap(), None);
    }

    #[tokio::test]
    async fn test_async_read_over_duplex() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(64);
        let msg = ClientMessage::Urb(UrbCommand::Submit(make_submit(
            8,
            Direction::Out,
            2,
            vec![0x11; 200],
        )));
        let bytes = msg.encode();

        let writer = tokio::spawn(async move {
            // Small writes force the reader through several phases
            for chunk in bytes.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let decoded = ClientMessage::read_from_async(&mut server).await.unwrap();
        assert_eq!(decoded, Some(msg));
        writer.await.unwrap();
        assert_eq!(ClientMessage::read_from_async(&mut server).await.unwrap(), None);
    }
}

// ============================================================================
// Bus packets and framing
// ============================================================================

mod bus_packets {
    use super::*;

    #[test]
    fn test_transaction_sequence_parses() {
        let packets: Vec<Vec<u8>> = vec![
            sof_packet(1758).to_vec(),
            setup_token(0, 0).to_vec(),
            data_packet(&[0x00, 0x05, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00], false),
            handshake_packet(Handshake::Ack).to_vec(),
            in_token(6, 0).to_vec(),
            out_token(6, 2).to_vec(),
        ];

        let parsed: Vec<BusPacket> = packets
            .iter()
            .map(|p| BusPacket::parse(p).unwrap())
            .collect();

        assert_eq!(parsed[0], BusPacket::Sof { frame_number: 1758 });
        assert_eq!(
            parsed[1],
            BusPacket::Token {
                pid: Pid::Setup,
                address: 0,
                endpoint: 0
            }
        );
        assert!(matches!(&parsed[2], BusPacket::Data { pid: Pid::Data0, payload } if payload.len() == 8));
        assert_eq!(parsed[3], BusPacket::Handshake(Handshake::Ack));
        assert_eq!(
            parsed[5],
            BusPacket::Token {
                pid: Pid::Out,
                address: 6,
                endpoint: 2
            }
        );
    }

    #[test]
    fn test_framed_transaction() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &sof_packet(0)).unwrap();
        write_frame(&mut wire, &in_token(6, 1)).unwrap();

        let mut cursor = Cursor::new(wire);
        let sof = read_frame(&mut cursor).unwrap().unwrap();
        let token = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(sof, vec![0xa5, 0x00, 0x10]);
        assert_eq!(token, in_token(6, 1).to_vec());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }
}

// ============================================================================
// Property tests
// ============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Every token built for a legal address/endpoint parses back to itself
        #[test]
        fn prop_token_parse_inverts_build(address in 0u8..128, endpoint in 0u8..16) {
            for (pid, packet) in [
                (Pid::In, in_token(address, endpoint)),
                (Pid::Out, out_token(address, endpoint)),
                (Pid::Setup, setup_token(address, endpoint)),
            ] {
                prop_assert_eq!(
                    BusPacket::parse(&packet).unwrap(),
                    BusPacket::Token { pid, address, endpoint }
                );
            }
        }

        /// Any single-bit flip in a data packet payload is caught by CRC16
        #[test]
        fn prop_data_crc_detects_bit_flip(
            payload in proptest::collection::vec(any::<u8>(), 1..=64),
            bit in 0usize..512,
            toggle in any::<bool>(),
        ) {
            prop_assume!(bit / 8 < payload.len());
            let mut packet = data_packet(&payload, toggle);
            packet[1 + bit / 8] ^= 1 << (bit % 8);
            prop_assert!(BusPacket::parse(&packet).is_err());
        }

        /// OUT submits survive encode/decode for any buffer
        #[test]
        fn prop_out_submit_roundtrip(
            seqnum in any::<u32>(),
            ep in 0u32..16,
            data in proptest::collection::vec(any::<u8>(), 0..=2048),
        ) {
            let msg = ClientMessage::Urb(UrbCommand::Submit(make_submit(seqnum, Direction::Out, ep, data)));
            prop_assert_eq!(ClientMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }
}
