//! USB/IP to simulated USB 2.0 bus bridge
//!
//! Accepts a USB/IP client (such as the Linux `vhci-hcd` driver) on one
//! port and a bit-level bus simulator on another, and drives every URB the
//! client submits as host-side bus transactions against the simulator.

pub mod config;
pub mod coordinator;
pub mod device;
pub mod engine;
pub mod network;
