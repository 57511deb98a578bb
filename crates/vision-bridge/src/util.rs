//! Small utilities shared across bridge modules.

#[inline]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Mint a fresh opaque id for messages and connections.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
