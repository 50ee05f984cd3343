//! TCP listeners and session wiring

use anyhow::{Context, Result, anyhow};
use common::{BusLink, IoQueues, create_session_queues};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use super::simulator::{sim_reader, sim_writer};
use super::usbip::{usbip_reader, usbip_writer};
use crate::config::BridgeConfig;
use crate::coordinator::{Coordinator, SessionEnd, spawn_coordinator};
use crate::device::SimulatedDevice;

/// Bridge between one USB/IP client and one bus simulator at a time
pub struct BridgeServer {
    usbip_listener: TcpListener,
    sim_listener: TcpListener,
    device: SimulatedDevice,
    config: BridgeConfig,
}

impl BridgeServer {
    /// Bind both listeners from `config`
    pub async fn bind(config: BridgeConfig) -> Result<Self> {
        let usbip_addr = config.usbip_addr()?;
        let sim_addr = config.sim_addr()?;

        let usbip_listener = TcpListener::bind(usbip_addr)
            .await
            .with_context(|| format!("Failed to bind USB/IP listener on {}", usbip_addr))?;
        let sim_listener = TcpListener::bind(sim_addr)
            .await
            .with_context(|| format!("Failed to bind simulator listener on {}", sim_addr))?;

        let device = SimulatedDevice::from_settings(&config.device);
        info!(
            "Exporting {} ({:04x}:{:04x})",
            device.busid(),
            config.device.vendor_id,
            config.device.product_id
        );

        Ok(Self {
            usbip_listener,
            sim_listener,
            device,
            config,
        })
    }

    /// Bound (USB/IP, simulator) addresses
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((
            self.usbip_listener
                .local_addr()
                .context("USB/IP listener has no local address")?,
            self.sim_listener
                .local_addr()
                .context("Simulator listener has no local address")?,
        ))
    }

    /// Serve sessions back to back, forever
    ///
    /// A failed session is logged and the next pair is accepted.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_session().await {
                Ok(end) => info!("Session finished: {:?}", end),
                Err(e) => error!("Session failed: {:#}", e),
            }
        }
    }

    /// Accept one USB/IP client and one simulator and bridge them until the
    /// session ends
    pub async fn run_session(&self) -> Result<SessionEnd> {
        let (usbip_addr, sim_addr) = self.local_addrs()?;
        info!(
            "Waiting for a USB/IP client on {} and a simulator on {}",
            usbip_addr, sim_addr
        );

        let ((usbip_stream, usbip_peer), (sim_stream, sim_peer)) = tokio::try_join!(
            async {
                self.usbip_listener
                    .accept()
                    .await
                    .context("Failed to accept USB/IP client")
            },
            async {
                self.sim_listener
                    .accept()
                    .await
                    .context("Failed to accept simulator")
            },
        )?;
        info!("Session started: client {}, simulator {}", usbip_peer, sim_peer);

        let (io, queues) = create_session_queues();
        let sim_link = match self.config.bridge.sim_response_timeout() {
            Some(timeout) => queues
                .sim
                .with_response_timeout(timeout, tokio::runtime::Handle::current()),
            None => queues.sim,
        };
        let coordinator = Coordinator::new(
            queues.mailbox,
            sim_link,
            self.device.clone(),
            self.config.transfer.max_packet_size as usize,
        );

        self.bridge(usbip_stream, sim_stream, io, coordinator).await
    }

    async fn bridge<L>(
        &self,
        usbip_stream: TcpStream,
        sim_stream: TcpStream,
        io: IoQueues,
        coordinator: Coordinator<L>,
    ) -> Result<SessionEnd>
    where
        L: BusLink + Send + 'static,
    {
        for stream in [&usbip_stream, &sim_stream] {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        let IoQueues {
            events_tx,
            replies_rx,
            h2d_rx,
            d2h_tx,
        } = io;
        let (usbip_read, usbip_write) = usbip_stream.into_split();
        let (sim_read, sim_write) = sim_stream.into_split();

        let usbip_reader = tokio::spawn(usbip_reader(usbip_read, events_tx.clone()));
        let sim_reader = tokio::spawn(sim_reader(sim_read, d2h_tx, events_tx));
        let usbip_writer = tokio::spawn(usbip_writer(usbip_write, replies_rx));
        let sim_writer = tokio::spawn(sim_writer(sim_write, h2d_rx));

        let handle = spawn_coordinator(coordinator).context("Failed to spawn coordinator thread")?;
        let outcome = tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("Coordinator join task failed")?
            .map_err(|_| anyhow!("Coordinator thread panicked"));

        // The coordinator's queue ends are gone; writers drain and exit
        for (name, writer) in [("USB/IP", usbip_writer), ("simulator", sim_writer)] {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} writer stopped: {:#}", name, e),
                Err(e) => warn!("{} writer task failed: {}", name, e),
            }
        }
        usbip_reader.abort();
        sim_reader.abort();

        Ok(outcome??)
    }
}
