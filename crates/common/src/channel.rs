//! Session queues between the Tokio I/O tasks and the coordinator thread
//!
//! A bridge session has four socket tasks (a reader and a writer for each
//! of the USB/IP client and the simulator) and one coordinator running on a
//! dedicated OS thread. They only share these queues:
//!
//! ```text
//! usbip reader ──SessionEvent──┐
//! sim reader ────SessionEvent──┴─> coordinator ──ServerMessage──> usbip writer
//! sim reader ────packet (d2h)────> coordinator ──batch (h2d)─────> sim writer
//! ```
//!
//! The async side uses `.send().await` / `.recv().await`; the coordinator
//! uses the blocking variants.

use crate::error::LinkError;
use async_channel::{Receiver, Sender, bounded};
use protocol::{ClientMessage, ServerMessage};
use std::time::Duration;
use tracing::{debug, trace};

/// Queue capacity for every session queue
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// Events delivered to the coordinator in arrival order
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded USB/IP request
    Client(ClientMessage),

    /// The USB/IP connection ended
    ClientClosed {
        /// `None` for a clean EOF, otherwise the framing or I/O error
        reason: Option<String>,
    },

    /// The simulator connection ended
    SimulatorClosed {
        /// `None` for a clean EOF, otherwise the framing or I/O error
        reason: Option<String>,
    },
}

/// Synchronous packet link to the simulated device
///
/// One transaction is a [`send`](BusLink::send) of a packet batch followed,
/// when the device is expected to answer, by exactly one
/// [`recv`](BusLink::recv).
pub trait BusLink {
    /// Send a batch of packets to be written as one buffer
    fn send(&mut self, packets: Vec<Vec<u8>>) -> Result<(), LinkError>;

    /// Block for the next packet from the device
    fn recv(&mut self) -> Result<Vec<u8>, LinkError>;
}

/// Coordinator end of the simulator queues
pub struct SimPort {
    h2d_tx: Sender<Vec<Vec<u8>>>,
    d2h_rx: Receiver<Vec<u8>>,
    response_timeout: Option<(Duration, tokio::runtime::Handle)>,
}

impl SimPort {
    /// Bound the wait for each simulator response
    ///
    /// The wait runs on `runtime`'s timer, so the calling thread must not be
    /// a runtime worker.
    pub fn with_response_timeout(
        mut self,
        timeout: Duration,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        self.response_timeout = Some((timeout, runtime));
        self
    }
}

impl BusLink for SimPort {
    /// Packets still queued from the device answered an earlier, abandoned
    /// wait and are discarded before the next batch goes out.
    fn send(&mut self, packets: Vec<Vec<u8>>) -> Result<(), LinkError> {
        while let Ok(stale) = self.d2h_rx.try_recv() {
            debug!("Dropping stale device packet {:02x?}", stale);
        }
        trace!("h2d batch of {} packets", packets.len());
        self.h2d_tx
            .send_blocking(packets)
            .map_err(|_| LinkError::Closed)
    }

    fn recv(&mut self) -> Result<Vec<u8>, LinkError> {
        match &self.response_timeout {
            None => self.d2h_rx.recv_blocking().map_err(|_| LinkError::Closed),
            Some((timeout, runtime)) => {
                let wait = runtime.block_on(async {
                    tokio::time::timeout(*timeout, self.d2h_rx.recv()).await
                });
                match wait {
                    Ok(Ok(packet)) => Ok(packet),
                    Ok(Err(_)) => Err(LinkError::Closed),
                    Err(_) => Err(LinkError::Timeout),
                }
            }
        }
    }
}

/// Handles for the Tokio I/O tasks (async)
#[derive(Clone)]
pub struct IoQueues {
    /// Shared by both readers
    pub events_tx: Sender<SessionEvent>,
    /// Drained by the USB/IP writer
    pub replies_rx: Receiver<ServerMessage>,
    /// Drained by the simulator writer
    pub h2d_rx: Receiver<Vec<Vec<u8>>>,
    /// Fed by the simulator reader
    pub d2h_tx: Sender<Vec<u8>>,
}

/// Handles for the coordinator thread (blocking)
pub struct CoordinatorQueues {
    pub mailbox: Mailbox,
    /// Simulator link handed to the transfer engine
    pub sim: SimPort,
}

/// Event/reply queues of the coordinator
pub struct Mailbox {
    events_rx: Receiver<SessionEvent>,
    replies_tx: Sender<ServerMessage>,
}

impl Mailbox {
    /// Receive the next session event (blocking)
    pub fn recv_event(&self) -> crate::Result<SessionEvent> {
        self.events_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Queue a reply for the USB/IP writer (blocking)
    pub fn send_reply(&self, reply: ServerMessage) -> crate::Result<()> {
        self.replies_tx
            .send_blocking(reply)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the queues for one session
///
/// Returns (IoQueues for Tokio tasks, CoordinatorQueues for the coordinator)
pub fn create_session_queues() -> (IoQueues, CoordinatorQueues) {
    let (events_tx, events_rx) = bounded(SESSION_QUEUE_CAPACITY);
    let (replies_tx, replies_rx) = bounded(SESSION_QUEUE_CAPACITY);
    let (h2d_tx, h2d_rx) = bounded(SESSION_QUEUE_CAPACITY);
    let (d2h_tx, d2h_rx) = bounded(SESSION_QUEUE_CAPACITY);

    (
        IoQueues {
            events_tx,
            replies_rx,
            h2d_rx,
            d2h_tx,
        },
        CoordinatorQueues {
            mailbox: Mailbox {
                events_rx,
                replies_tx,
            },
            sim: SimPort {
                h2d_tx,
                d2h_rx,
                response_timeout: None,
            },
        },
    )
}
