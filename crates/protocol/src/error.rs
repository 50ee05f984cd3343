//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Operation header carried a version other than 0x0111
    #[error("Unsupported USB/IP version: {0:#06x}")]
    InvalidVersion(u16),

    /// Operation code not defined by USB/IP
    #[error("Unknown USB/IP operation code: {0:#06x}")]
    UnknownOpCode(u16),

    /// URB command tag not defined by USB/IP
    #[error("Unknown USB/IP command: {0:#010x}")]
    UnknownCommand(u32),

    /// Direction field was neither 0 (OUT) nor 1 (IN)
    #[error("Invalid transfer direction: {0}")]
    InvalidDirection(u32),

    /// Bus packet failed length, PID or CRC validation
    #[error("Invalid bus packet: {reason}")]
    InvalidPacket { reason: String },

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer closed the stream inside a header or body
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn invalid_packet(reason: impl Into<String>) -> Self {
        Self::InvalidPacket {
            reason: reason.into(),
        }
    }

    /// True when the error means the byte stream can no longer be trusted
    ///
    /// Every decode failure on a stream loses framing, so callers treat these
    /// like EOF and close the connection.
    pub fn is_framing(&self) -> bool {
        !matches!(self, ProtocolError::InvalidPacket { .. })
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
