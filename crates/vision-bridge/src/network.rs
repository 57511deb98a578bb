//! Best-effort LAN probing helpers.
//!
//! Nothing in here is fatal: when a value cannot be determined it is reported
//! as the literal string `"Unknown"` and callers degrade accordingly.

use std::net::Ipv4Addr;

use serde::Serialize;

pub const UNKNOWN: &str = "Unknown";

/// Interfaces tried first when picking the primary LAN address.
const PREFERRED_INTERFACES: [&str; 4] = ["en0", "en1", "eth0", "wlan0"];

/// How many ports to try past the preferred one before giving up.
const PORT_SCAN_WIDTH: u16 = 10;

/// Well-known host resolved to decide whether we look online.
const ONLINE_PROBE_HOST: &str = "apple.com:443";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub ip_address: String,
    pub interface: String,
    pub network_segment: String,
    pub online: bool,
}

impl NetworkInfo {
    /// The primary IPv4 as a string, `None` when probing failed.
    pub fn primary_ip(&self) -> Option<&str> {
        (self.ip_address != UNKNOWN).then_some(self.ip_address.as_str())
    }
}

/// Gather the full network picture in one shot.
pub async fn probe() -> NetworkInfo {
    let (interface, ip) = match primary_ipv4() {
        Some((name, addr)) => (name, Some(addr)),
        None => (UNKNOWN.to_string(), None),
    };
    NetworkInfo {
        ip_address: ip
            .map(|a| a.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        network_segment: ip
            .map(network_segment)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        interface,
        online: is_online().await,
    }
}

/// Pick the primary LAN IPv4 and the interface carrying it.
///
/// Preference order first, then any non-loopback interface, then a UDP
/// connect probe that at least recovers the address without a name.
fn primary_ipv4() -> Option<(String, Ipv4Addr)> {
    if let Ok(addrs) = if_addrs::get_if_addrs() {
        for preferred in PREFERRED_INTERFACES {
            if let Some(found) = addrs
                .iter()
                .filter(|ifa| ifa.name == preferred)
                .find_map(|ifa| lan_ipv4(ifa))
            {
                return Some((preferred.to_string(), found));
            }
        }
        if let Some(ifa) = addrs.iter().find(|ifa| lan_ipv4(ifa).is_some()) {
            return Some((ifa.name.clone(), lan_ipv4(ifa)?));
        }
    }
    guess_local_ipv4().map(|ip| (UNKNOWN.to_string(), ip))
}

fn lan_ipv4(ifa: &if_addrs::Interface) -> Option<Ipv4Addr> {
    match ifa.ip() {
        std::net::IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
        _ => None,
    }
}

/// Recover the outbound address by "connecting" a UDP socket. No packets are
/// actually sent.
fn guess_local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
        _ => None,
    }
}

/// Textual `/24` segment the primary address lives in. Informational only.
pub fn network_segment(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.0/24", o[0], o[1], o[2])
}

/// Best-effort online check: can we resolve a well-known hostname?
pub async fn is_online() -> bool {
    tokio::net::lookup_host(ONLINE_PROBE_HOST)
        .await
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// Whether `port` can currently be bound on all interfaces.
pub async fn port_available(port: u16) -> bool {
    tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

/// First free port in `start .. start + 10`, or `None` when the whole window
/// is taken.
pub async fn find_available_port(start: u16) -> Option<u16> {
    for port in start..start.saturating_add(PORT_SCAN_WIDTH) {
        if port_available(port).await {
            return Some(port);
        }
    }
    None
}

pub fn websocket_url(ip: &str, port: u16) -> String {
    format!("ws://{ip}:{port}")
}

pub fn discovery_url(ip: &str, port: u16) -> String {
    format!("http://{ip}:{port}")
}
