//! USB/IP connection tasks

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use common::SessionEvent;
use protocol::{ClientMessage, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Decode client messages into the session event queue
///
/// Ends with a `ClientClosed` event on EOF or the first framing error.
pub async fn usbip_reader<R>(reader: R, events: Sender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let reason = loop {
        match ClientMessage::read_from_async(&mut reader).await {
            Ok(Some(message)) => {
                debug!("USB/IP request: {}", describe(&message));
                if events.send(SessionEvent::Client(message)).await.is_err() {
                    // Coordinator already gone
                    return;
                }
            }
            Ok(None) => {
                info!("USB/IP client closed the connection");
                break None;
            }
            Err(e) => {
                warn!("USB/IP read failed: {}", e);
                break Some(e.to_string());
            }
        }
    };
    let _ = events.send(SessionEvent::ClientClosed { reason }).await;
}

/// Encode queued replies until the coordinator drops its end
pub async fn usbip_writer<W>(mut writer: W, replies: Receiver<ServerMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(reply) = replies.recv().await {
        let bytes = reply.encode();
        writer
            .write_all(&bytes)
            .await
            .context("Failed to write USB/IP reply")?;
    }
    writer.flush().await.context("Failed to flush USB/IP replies")?;
    Ok(())
}

fn describe(message: &ClientMessage) -> String {
    match message {
        ClientMessage::Op(request) => format!("{:?}", request.code()),
        ClientMessage::Urb(cmd) => {
            let header = cmd.header();
            format!(
                "URB seqnum={} ep={} dir={:?}",
                header.seqnum, header.ep, header.direction
            )
        }
    }
}
