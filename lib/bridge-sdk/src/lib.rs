//! Debug-bridge client SDK
//!
//! Models the external "debug-bridge client library" collaborator from the
//! fleet manager's contract: a socket protocol to a local host daemon, a
//! device-tracking background loop that drives [`listener::DeviceChangeListener`]
//! callbacks, and a per-device shell-exec/property/reboot/screenshot API.
mod client;
pub mod dto;
pub mod error;
pub mod listener;
mod protocol;

pub use client::{BridgeClient, ListenerHandle};
