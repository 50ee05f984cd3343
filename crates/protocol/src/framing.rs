//! Length-prefixed framing for the simulator connection
//!
//! Each bus packet travels as one frame:
//! ```text
//! [Length: u32 (big-endian)][packet bytes]
//! ```
//!
//! Several frames may be written back to back for one bus transaction (for
//! example SOF + token + data). Frames larger than a legal USB 2.0 packet are
//! rejected to keep a misbehaving peer from forcing large allocations.

use crate::bus::MAX_PACKET_SIZE;
use crate::error::{ProtocolError, Result};
use std::io::{ErrorKind, Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed frame payload
pub const MAX_FRAME_SIZE: usize = MAX_PACKET_SIZE;

/// Length prefix size
pub const FRAME_HEADER_SIZE: usize = 4;

fn check_frame_len(length: usize) -> Result<()> {
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Encode one packet as a frame
///
/// # Example
/// ```
/// use protocol::framing::encode_frame;
///
/// let framed = encode_frame(&[0xd2]).unwrap();
/// assert_eq!(framed, vec![0, 0, 0, 1, 0xd2]);
/// ```
pub fn encode_frame(packet: &[u8]) -> Result<Vec<u8>> {
    check_frame_len(packet.len())?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + packet.len());
    frame.extend_from_slice(&(packet.len() as u32).to_be_bytes());
    frame.extend_from_slice(packet);
    Ok(frame)
}

/// Encode a batch of packets as consecutive frames in one buffer
pub fn encode_frames<P: AsRef<[u8]>>(packets: &[P]) -> Result<Vec<u8>> {
    let total = packets
        .iter()
        .map(|p| FRAME_HEADER_SIZE + p.as_ref().len())
        .sum();
    let mut buf = Vec::with_capacity(total);
    for packet in packets {
        let packet = packet.as_ref();
        check_frame_len(packet.len())?;
        buf.extend_from_slice(&(packet.len() as u32).to_be_bytes());
        buf.extend_from_slice(packet);
    }
    Ok(buf)
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, packet: &[u8]) -> Result<()> {
    let framed = encode_frame(packet)?;
    writer.write_all(&framed)?;
    Ok(())
}

/// Read one frame
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
    let got = read_until_eof(reader, &mut len_bytes)?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_SIZE,
            actual: got,
        });
    }

    let length = u32::from_be_bytes(len_bytes) as usize;
    check_frame_len(length)?;

    let mut packet = vec![0u8; length];
    let got = read_until_eof(reader, &mut packet)?;
    if got < length {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_SIZE + length,
            actual: FRAME_HEADER_SIZE + got,
        });
    }
    Ok(Some(packet))
}

/// Fill `buf`, stopping early only at EOF; returns bytes read
pub(crate) fn read_until_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Async: write a batch of packets as consecutive frames
#[cfg(feature = "async")]
pub async fn write_frames_async<W, P>(writer: &mut W, packets: &[P]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    P: AsRef<[u8]>,
{
    let buf = encode_frames(packets)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: read one frame
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
#[cfg(feature = "async")]
pub async fn read_frame_async<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
    let got = read_until_eof_async(reader, &mut len_bytes).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_SIZE,
            actual: got,
        });
    }

    let length = u32::from_be_bytes(len_bytes) as usize;
    check_frame_len(length)?;

    let mut packet = vec![0u8; length];
    let got = read_until_eof_async(reader, &mut packet).await?;
    if got < length {
        return Err(ProtocolError::IncompleteFrame {
            expected: FRAME_HEADER_SIZE + length,
            actual: FRAME_HEADER_SIZE + got,
        });
    }
    Ok(Some(packet))
}

#[cfg(feature = "async")]
pub(crate) async fn read_until_eof_async<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncReadExt + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
