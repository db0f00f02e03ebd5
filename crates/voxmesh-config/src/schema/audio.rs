//! Local capture settings.

use serde::{Deserialize, Serialize};

/// Sample rates the Opus encoder accepts.
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// `"default"` or a case-insensitive substring of the device name.
    pub input_device: String,
    pub sample_rate: u32,
    /// Gate captured frames that stay below the noise floor.
    pub noise_suppression: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: "default".into(),
            sample_rate: 48000,
            noise_suppression: true,
        }
    }
}
