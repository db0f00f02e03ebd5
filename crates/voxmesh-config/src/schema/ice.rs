//! ICE server discovery settings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// HTTP endpoint returning `{ "iceServers": [...] }`. Empty disables the lookup.
    pub server_url: String,
    pub request_timeout_secs: u32,
    /// STUN server used when the lookup fails or returns nothing.
    pub fallback_stun: String,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            request_timeout_secs: 5,
            fallback_stun: "stun:stun.l.google.com:19302".into(),
        }
    }
}
