//! Test utilities for the simulator bridge
//!
//! Provides a scripted [`BusLink`] and helpers for building device-side
//! packets, shared by the unit and integration tests of every crate.
//!
//! # Example
//!
//! ```
//! use common::BusLink;
//! use common::test_utils::{ScriptedLink, sim_ack};
//!
//! let mut link = ScriptedLink::new().respond(sim_ack());
//! link.send(vec![vec![0xa5, 0x00, 0x10]]).unwrap();
//! assert_eq!(link.recv().unwrap(), vec![0xd2]);
//! assert_eq!(link.sent_batches().len(), 1);
//! ```

use crate::channel::BusLink;
use crate::error::LinkError;
use protocol::bus::{BusPacket, Handshake, data_packet, handshake_packet};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A bus link that records what the host sends and answers from a script
///
/// When the script runs out, `recv` fails with [`LinkError::Closed`] (or
/// [`LinkError::Timeout`] after [`ScriptedLink::timing_out`]).
#[derive(Debug, Default)]
pub struct ScriptedLink {
    responses: VecDeque<Vec<u8>>,
    sent: Vec<Vec<Vec<u8>>>,
    exhausted: Option<LinkError>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device response to the script
    pub fn respond(mut self, packet: impl Into<Vec<u8>>) -> Self {
        self.responses.push_back(packet.into());
        self
    }

    /// Append several device responses
    pub fn respond_all<I, P>(mut self, packets: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.responses.extend(packets.into_iter().map(Into::into));
        self
    }

    /// Report a timeout instead of a closed link once the script is used up
    pub fn timing_out(mut self) -> Self {
        self.exhausted = Some(LinkError::Timeout);
        self
    }

    /// Every batch sent so far, in order
    pub fn sent_batches(&self) -> &[Vec<Vec<u8>>] {
        &self.sent
    }

    /// Every batch sent so far, parsed
    ///
    /// # Panics
    /// If the host sent a packet that does not validate.
    pub fn sent_parsed(&self) -> Vec<Vec<BusPacket>> {
        self.sent
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|p| {
                        BusPacket::parse(p)
                            .unwrap_or_else(|e| panic!("host sent invalid packet {:02x?}: {}", p, e))
                    })
                    .collect()
            })
            .collect()
    }

    /// Responses not yet consumed
    pub fn remaining_responses(&self) -> usize {
        self.responses.len()
    }
}

impl BusLink for ScriptedLink {
    fn send(&mut self, packets: Vec<Vec<u8>>) -> Result<(), LinkError> {
        self.sent.push(packets);
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, LinkError> {
        self.responses
            .pop_front()
            .ok_or(self.exhausted.unwrap_or(LinkError::Closed))
    }
}

/// Device ACK handshake
pub fn sim_ack() -> Vec<u8> {
    handshake_packet(Handshake::Ack).to_vec()
}

/// Device NAK handshake
pub fn sim_nak() -> Vec<u8> {
    handshake_packet(Handshake::Nak).to_vec()
}

/// Device STALL handshake
pub fn sim_stall() -> Vec<u8> {
    handshake_packet(Handshake::Stall).to_vec()
}

/// Device DATA0/DATA1 packet
pub fn sim_data(payload: &[u8], toggle: bool) -> Vec<u8> {
    data_packet(payload, toggle)
}

/// Device answers for a bulk IN transfer of `data`
///
/// Splits `data` into `max_packet` payloads with alternating toggles
/// starting at DATA0. A final zero-length packet is added when the last
/// payload is full-sized and `terminate` is set.
pub fn sim_bulk_in_packets(data: &[u8], max_packet: usize, terminate: bool) -> Vec<Vec<u8>> {
    let mut packets: Vec<Vec<u8>> = data
        .chunks(max_packet)
        .enumerate()
        .map(|(i, chunk)| data_packet(chunk, i % 2 == 1))
        .collect();
    if terminate && data.len() % max_packet == 0 {
        packets.push(data_packet(&[], packets.len() % 2 == 1));
    }
    packets
}

/// Run a future with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// # async fn demo() {
/// let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
/// assert_eq!(result, 42);
/// # }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// A standard 18-byte device descriptor (GET_DESCRIPTOR Device response)
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0xD0, 0x16, // idVendor (0x16D0)
        0x3B, 0x0F, // idProduct (0x0F3B)
        0x00, 0x00, // bcdDevice
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}
