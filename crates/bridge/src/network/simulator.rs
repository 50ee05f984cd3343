//! Simulator connection tasks

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use common::SessionEvent;
use protocol::{Hex, read_frame_async, write_frames_async};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{info, trace, warn};

/// Push each device packet onto the device-to-host queue
///
/// Dropping `packets` on exit is what unblocks a coordinator waiting on a
/// response from a simulator that went away.
pub async fn sim_reader<R>(reader: R, packets: Sender<Vec<u8>>, events: Sender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let reason = loop {
        match read_frame_async(&mut reader).await {
            Ok(Some(packet)) => {
                trace!("d2h: {}", Hex(&packet));
                if packets.send(packet).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                info!("Simulator closed the connection");
                break None;
            }
            Err(e) => {
                warn!("Simulator read failed: {}", e);
                break Some(e.to_string());
            }
        }
    };
    drop(packets);
    let _ = events.send(SessionEvent::SimulatorClosed { reason }).await;
}

/// Write each host batch as one buffer of length-prefixed frames
pub async fn sim_writer<W>(mut writer: W, batches: Receiver<Vec<Vec<u8>>>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(batch) = batches.recv().await {
        for packet in &batch {
            trace!("h2d: {}", Hex(packet));
        }
        write_frames_async(&mut writer, &batch)
            .await
            .context("Failed to write to simulator")?;
    }
    Ok(())
}
