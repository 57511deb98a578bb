//! Sync bridge that mirrors a Roo Code AI session to spatial-computing
//! clients on the local network.
//!
//! Remote clients find the service through the HTTP discovery endpoint, open
//! a WebSocket, handshake, receive a replay of the current conversation and
//! live deltas from then on, and drive the session back through user
//! messages, ask responses and send/cancel triggers.

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod host;
pub mod network;
pub mod protocol;
pub mod server;
pub mod service;
pub mod util;

pub use config::SyncConfig;
pub use service::{SyncEvent, SyncService, SyncStatus};
