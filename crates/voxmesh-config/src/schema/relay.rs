//! Signaling relay connection settings.

use serde::{Deserialize, Serialize};

/// Where and how to reach the signaling relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket endpoint of the voice relay.
    pub url: String,
    /// Connect and auth timeout in seconds (valid range: 1-120).
    pub connect_timeout_secs: u32,
    /// Base reconnect interval in milliseconds; attempt `n` waits `base * 2^n`.
    pub reconnect_base_ms: u32,
    /// Reconnect attempts before giving up (valid range: 1-20).
    pub max_reconnect_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/voice".into(),
            connect_timeout_secs: 15,
            reconnect_base_ms: 3000,
            max_reconnect_attempts: 5,
        }
    }
}
