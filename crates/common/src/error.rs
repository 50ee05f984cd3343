//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the host-to-simulator bus link
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The simulator side of the session is gone
    #[error("Simulator link closed")]
    Closed,

    /// No response frame arrived within the configured wait
    #[error("Timed out waiting for simulator response")]
    Timeout,
}
