//! Full configuration validation.
//!
//! Each domain has its own submodule; this orchestrator calls them all
//! and collects errors into a single `ConfigError`.

mod helpers;
mod network;
mod vad;


use crate::schema::VoxmeshConfig;
use voxmesh_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &VoxmeshConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    network::validate_relay(&mut errors, config);
    network::validate_ice(&mut errors, config);
    vad::validate_vad(&mut errors, config);
    vad::validate_audio(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
