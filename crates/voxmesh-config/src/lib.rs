//! Voxmesh configuration system.
//!
//! TOML-based configuration with range validation. Every section has
//! defaults, so a partial file (or none at all) works.
//!
//! ```rust,no_run
//! use voxmesh_config::{config_to_json, load_config};
//!
//! let loaded = load_config(None).expect("explicit paths only fail when given");
//! println!("{}", config_to_json(&loaded.config));
//! ```

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{
    default_config_path, load_config, load_default, load_explicit, write_template, ConfigOrigin,
    LoadedConfig,
};
pub use schema::{
    AudioConfig, IceConfig, LogLevel, LoggingConfig, RelayConfig, VadConfig, VoxmeshConfig,
    CONFIG_SCHEMA_VERSION, OPUS_SAMPLE_RATES,
};

/// Serialize a config to a pretty-printed JSON string.
pub fn config_to_json(config: &VoxmeshConfig) -> String {
    serde_json::to_string_pretty(config)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_to_json_contains_all_sections() {
        let config = VoxmeshConfig::default();
        let json = config_to_json(&config);
        assert!(json.contains("\"relay\""));
        assert!(json.contains("\"ice\""));
        assert!(json.contains("\"vad\""));
        assert!(json.contains("\"audio\""));
        assert!(json.contains("\"logging\""));
    }

    #[test]
    fn config_schema_version_is_1() {
        assert_eq!(CONFIG_SCHEMA_VERSION, 1);
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let config = VoxmeshConfig::default();
        let json = config_to_json(&config);
        let parsed: VoxmeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.relay.url, "ws://localhost:8000/ws/voice");
        assert_eq!(parsed.vad.fft_size, 256);
        assert_eq!(parsed.ice.fallback_stun, "stun:stun.l.google.com:19302");
    }
}
