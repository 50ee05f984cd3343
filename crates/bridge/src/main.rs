//! usbip-sim-bridge
//!
//! Exposes a simulated USB 2.0 device to USB/IP clients. The device lives in
//! an external bus simulator that speaks raw USB packets over TCP.

use anyhow::{Context, Result};
use bridge::config::{self, BridgeConfig};
use bridge::network::BridgeServer;
use clap::Parser;
use common::setup_logging;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usbip-sim-bridge")]
#[command(
    author,
    version,
    about = "USB/IP bridge - Attach a simulated USB device over USB/IP"
)]
#[command(long_about = "
Bridges a USB/IP client to a bit-level USB 2.0 bus simulator. Every URB the
client submits is run as SOF/token/data/handshake transactions against the
simulated device.

EXAMPLES:
    # Run with default config (USB/IP on 3240, simulator on 2443)
    usbip-sim-bridge

    # Run with custom config
    usbip-sim-bridge --config /path/to/bridge.toml

    # Use other ports
    usbip-sim-bridge --usbip-port 13240 --sim-port 12443

    # Serve a single session, then exit
    usbip-sim-bridge --once

    # Run with packet traces
    usbip-sim-bridge --log-level trace

    # Then, on the client:
    usbip attach -r <host> -b 47-6.0

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-sim-bridge/bridge.toml
    3. /etc/usbip-sim-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// USB/IP listen port (overrides config)
    #[arg(long, value_name = "PORT")]
    usbip_port: Option<u16>,

    /// Simulator listen port (overrides config)
    #[arg(long, value_name = "PORT")]
    sim_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Serve one session and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(config::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };
    config
        .override_ports(args.usbip_port, args.sim_port)
        .context("Invalid listen address")?;

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.bridge.log_level.clone());

    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usbip-sim-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let server = BridgeServer::bind(config)
        .await
        .context("Failed to start bridge")?;
    let (usbip_addr, sim_addr) = server.local_addrs()?;
    info!("USB/IP listening on: {}", usbip_addr);
    info!("Simulator listening on: {}", sim_addr);

    if args.once {
        let end = server.run_session().await?;
        info!("Session finished: {:?}", end);
        return Ok(());
    }

    info!("Press Ctrl+C to shutdown");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {:#}", e);
        }
    });

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(e) => {
            error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    server_handle.abort();

    info!("Bridge shutdown complete");
    Ok(())
}
