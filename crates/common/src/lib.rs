//! Common utilities for the USB/IP simulator bridge
//!
//! This crate provides what the bridge's network tasks and its coordinator
//! thread share: the session queues that connect them, the [`BusLink`]
//! abstraction the transfer engine talks to, error handling and logging.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    BusLink, CoordinatorQueues, IoQueues, Mailbox, SessionEvent, SimPort, create_session_queues,
};
pub use error::{Error, LinkError, Result};
pub use logging::setup_logging;
