//! Configuration schema types for Voxmesh.
//!
//! All structs use `serde(default)` so partial configs work correctly.
//! Missing fields are filled with defaults that match the relay's
//! expectations.

mod audio;
mod ice;
mod relay;
mod system;
mod vad;

pub use audio::*;
pub use ice::*;
pub use relay::*;
pub use system::*;
pub use vad::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration for Voxmesh.
///
/// Only override what you want to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct VoxmeshConfig {
    pub relay: RelayConfig,
    pub ice: IceConfig,
    pub vad: VadConfig,
    pub audio: AudioConfig,
    pub logging: LoggingConfig,
}
