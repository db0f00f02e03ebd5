//! Voice-activity detection settings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub enabled: bool,
    /// Sampling interval in milliseconds (valid range: 50-2000).
    pub interval_ms: u32,
    /// FFT window length; a power of two in 32-2048.
    pub fft_size: u32,
    /// Level above which the local user counts as speaking.
    pub threshold_db: f64,
    /// How far below the threshold the level must fall to count as silent again.
    pub hysteresis_db: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 200,
            fft_size: 256,
            threshold_db: -45.0,
            hysteresis_db: 3.0,
        }
    }
}
