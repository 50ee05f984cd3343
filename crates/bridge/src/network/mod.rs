//! Network subsystem
//!
//! Two TCP listeners, one per side of the bridge. Each accepted pair of
//! connections becomes a session:
//!
//! ```text
//! BridgeServer
//!   ├─> accept USB/IP client + simulator
//!   ├─> usbip reader/writer tasks ──┐
//!   ├─> sim reader/writer tasks ────┼── session queues
//!   └─> coordinator thread ─────────┘
//! ```

pub mod server;
pub mod simulator;
pub mod usbip;

pub use server::BridgeServer;
