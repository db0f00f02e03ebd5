//! Finding, reading and bootstrapping `config.toml`.
//!
//! A path given on the command line is strict: it must exist, parse and
//! validate. The per-user default path is lenient: a missing file is
//! created from [`TEMPLATE`], and an unusable one falls back to built-in
//! defaults so a broken file never keeps the client from starting.

use std::path::{Path, PathBuf};

use tracing::debug;
use voxmesh_common::ConfigError;

use crate::schema::VoxmeshConfig;
use crate::validation;

/// Written to the default path on first run. Every key is commented out so
/// the built-in defaults stay in effect until the user edits one.
pub const TEMPLATE: &str = r##"# Voxmesh configuration (schema version 1)
# Uncomment a key to override its default.

[relay]
# url = "ws://localhost:8000/ws/voice"
# connect_timeout_secs = 15   # 1-120
# reconnect_base_ms = 3000    # 100-60000, attempt n waits base * 2^n
# max_reconnect_attempts = 5  # 1-20

[ice]
# server_url = ""             # e.g. "https://example.com/api/ice-servers"
# request_timeout_secs = 5    # 1-120
# fallback_stun = "stun:stun.l.google.com:19302"

[vad]
# enabled = true
# interval_ms = 200           # 50-2000
# fft_size = 256              # power of two, 32-2048
# threshold_db = -45.0        # -100 to 0
# hysteresis_db = 3.0         # 0-20

[audio]
# input_device = "default"    # or a substring of the device name
# sample_rate = 48000         # 8000, 12000, 16000, 24000 or 48000
# noise_suppression = true    # gate frames below the noise floor

[logging]
# level = "INFO"              # DEBUG, INFO, WARNING, ERROR
"##;

/// How the active config was obtained. Reported by the caller once logging
/// is up, since the logging level itself comes from the config.
#[derive(Debug)]
pub enum ConfigOrigin {
    /// Read from this file.
    File(PathBuf),
    /// No file existed, so the template was written here.
    Created(PathBuf),
    /// The default file could not be used; built-in defaults apply.
    Fallback {
        path: Option<PathBuf>,
        error: ConfigError,
    },
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: VoxmeshConfig,
    pub origin: ConfigOrigin,
}

/// `<config dir>/voxmesh/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("voxmesh").join("config.toml"))
}

/// Load `path` if given (strict), else the default path (lenient).
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    match path {
        Some(path) => Ok(LoadedConfig {
            config: load_explicit(path)?,
            origin: ConfigOrigin::File(path.to_path_buf()),
        }),
        None => Ok(load_default()),
    }
}

/// Read and validate a user-named file. Any problem is an error.
pub fn load_explicit(path: &Path) -> Result<VoxmeshConfig, ConfigError> {
    let config = read(path)?;
    validation::validate(&config)?;
    Ok(config)
}

/// Load the per-user file, creating it on first run. Never fails.
pub fn load_default() -> LoadedConfig {
    match default_config_path() {
        Some(path) => load_default_at(&path),
        None => LoadedConfig {
            config: VoxmeshConfig::default(),
            origin: ConfigOrigin::Fallback {
                path: None,
                error: ConfigError::FileNotFound(PathBuf::from("<no config directory>")),
            },
        },
    }
}

pub(crate) fn load_default_at(path: &Path) -> LoadedConfig {
    let fallback = |error| LoadedConfig {
        config: VoxmeshConfig::default(),
        origin: ConfigOrigin::Fallback {
            path: Some(path.to_path_buf()),
            error,
        },
    };

    match load_explicit(path) {
        Ok(config) => LoadedConfig {
            config,
            origin: ConfigOrigin::File(path.to_path_buf()),
        },
        Err(ConfigError::FileNotFound(_)) => match write_template(path) {
            Ok(()) => LoadedConfig {
                config: VoxmeshConfig::default(),
                origin: ConfigOrigin::Created(path.to_path_buf()),
            },
            Err(e) => fallback(e),
        },
        Err(e) => fallback(e),
    }
}

/// Write [`TEMPLATE`] to `path`, creating parent directories.
pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    let io_err = |what: &str, e: std::io::Error| {
        ConfigError::ParseError(format!("{what} {}: {e}", path.display()))
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err("cannot create directory for", e))?;
    }
    std::fs::write(path, TEMPLATE).map_err(|e| io_err("cannot write", e))?;
    debug!(path = %path.display(), "config template written");
    Ok(())
}

fn read(path: &Path) -> Result<VoxmeshConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(ConfigError::ParseError(format!("{}: {e}", path.display())));
        }
    };
    toml::from_str(&text).map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LogLevel;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r##"
[relay]
url = "wss://voice.example.com/ws/voice"
max_reconnect_attempts = 3

[vad]
threshold_db = -60.0
"##,
        );

        let config = load_explicit(&path).unwrap();
        assert_eq!(config.relay.url, "wss://voice.example.com/ws/voice");
        assert_eq!(config.relay.max_reconnect_attempts, 3);
        assert_eq!(config.vad.threshold_db, -60.0);
        assert_eq!(config.relay.reconnect_base_ms, 3000);
        assert_eq!(config.vad.interval_ms, 200);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn explicit_path_is_strict() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            load_config(Some(&missing)).unwrap_err(),
            ConfigError::FileNotFound(_)
        ));
        assert!(!missing.exists());

        let garbage = write(&dir, "this is not valid toml {{{");
        assert!(matches!(
            load_explicit(&garbage).unwrap_err(),
            ConfigError::ParseError(_)
        ));

        let out_of_range = write(&dir, "[vad]\nfft_size = 100\n");
        let err = load_explicit(&out_of_range).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("vad.fft_size"));
    }

    #[test]
    fn first_run_writes_the_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voxmesh").join("config.toml");

        let loaded = load_default_at(&path);
        assert!(matches!(loaded.origin, ConfigOrigin::Created(ref p) if p == &path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), TEMPLATE);

        let again = load_default_at(&path);
        assert!(matches!(again.origin, ConfigOrigin::File(_)));
        assert_eq!(again.config.relay.url, "ws://localhost:8000/ws/voice");
    }

    #[test]
    fn broken_default_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[vad]\ninterval_ms = 5\n");

        let loaded = load_default_at(&path);
        assert_eq!(loaded.config.vad.interval_ms, 200);
        match loaded.origin {
            ConfigOrigin::Fallback { path: Some(p), error } => {
                assert_eq!(p, path);
                assert!(matches!(error, ConfigError::ValidationError(_)));
            }
            other => panic!("expected fallback, got {other:?}"),
        }
        // The user's file is left alone.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[vad]\ninterval_ms = 5\n");
    }

    #[test]
    fn template_parses_and_validates() {
        let config: VoxmeshConfig = toml::from_str(TEMPLATE).unwrap();
        assert!(validation::validate(&config).is_ok());
    }

    #[test]
    fn log_level_accepts_uppercase_names() {
        let config: VoxmeshConfig = toml::from_str("[logging]\nlevel = \"WARNING\"\n").unwrap();
        assert_eq!(config.logging.level, LogLevel::Warning);
        assert_eq!(config.logging.level.as_filter(), "warn");
    }

    #[test]
    fn default_path_lives_under_voxmesh() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("voxmesh/config.toml"));
        }
    }
}
