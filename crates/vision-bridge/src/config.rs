//! Service configuration.
//!
//! Exactly five options are recognized; everything else (heartbeat timing,
//! port-scan width, cleanup period) is an internal constant. Updating the
//! record takes effect on the next `start()`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// When false, `start()` returns immediately without binding ports.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Preferred WebSocket port; scanned upward if busy.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Preferred HTTP discovery port; scanned upward if busy.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Name surfaced in the `/discover` response.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Hard cap on simultaneous connected sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    8765
}

fn default_discovery_port() -> u16 {
    8766
}

fn default_service_name() -> String {
    format!("RooCode-{}", hostname())
}

fn default_max_connections() -> usize {
    10
}

/// Best-effort hostname, `"Unknown"` when the environment does not say.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
            discovery_port: default_discovery_port(),
            service_name: default_service_name(),
            max_connections: default_max_connections(),
        }
    }
}
