//! Config file sections to runtime settings.

use std::time::Duration;

use voxmesh_config::{AudioConfig, IceConfig, RelayConfig, VadConfig, VoxmeshConfig};
use voxmesh_voice::{
    ActivityConfig, AudioConstraints, ReconnectPolicy, SignalingConfig, VoiceSessionConfig,
};

pub fn session_config(config: &VoxmeshConfig, url_override: Option<&str>) -> VoiceSessionConfig {
    VoiceSessionConfig {
        signaling: signaling_config(&config.relay, url_override),
        activity: activity_config(&config.vad),
        audio: audio_constraints(&config.audio),
        fallback_stun: config.ice.fallback_stun.clone(),
    }
}

pub fn signaling_config(relay: &RelayConfig, url_override: Option<&str>) -> SignalingConfig {
    SignalingConfig {
        url: url_override.unwrap_or(&relay.url).to_string(),
        connect_timeout: Duration::from_secs(u64::from(relay.connect_timeout_secs)),
        reconnect: ReconnectPolicy::new(
            Duration::from_millis(u64::from(relay.reconnect_base_ms)),
            relay.max_reconnect_attempts,
        ),
    }
}

/// `None` when detection is disabled.
pub fn activity_config(vad: &VadConfig) -> Option<ActivityConfig> {
    vad.enabled.then(|| ActivityConfig {
        interval: Duration::from_millis(u64::from(vad.interval_ms)),
        fft_size: vad.fft_size as usize,
        threshold_db: vad.threshold_db,
        hysteresis_db: vad.hysteresis_db,
    })
}

pub fn audio_constraints(audio: &AudioConfig) -> AudioConstraints {
    AudioConstraints {
        device: audio.input_device.clone(),
        sample_rate: audio.sample_rate,
        noise_suppression: audio.noise_suppression,
    }
}

/// ICE endpoint and request timeout, when a lookup is configured.
pub fn ice_endpoint(ice: &IceConfig) -> Option<(&str, Duration)> {
    let url = ice.server_url.trim();
    if url.is_empty() {
        return None;
    }
    Some((url, Duration::from_secs(u64::from(ice.request_timeout_secs))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_runtime_defaults() {
        let config = VoxmeshConfig::default();
        let session = session_config(&config, None);

        assert_eq!(session.signaling.url, SignalingConfig::default().url);
        assert_eq!(session.signaling.connect_timeout, Duration::from_secs(15));
        assert_eq!(session.signaling.reconnect, ReconnectPolicy::default());
        assert_eq!(session.activity, Some(ActivityConfig::default()));
        assert_eq!(session.audio, AudioConstraints::default());
        assert_eq!(session.fallback_stun, "stun:stun.l.google.com:19302");
    }

    #[test]
    fn url_override_wins() {
        let relay = RelayConfig::default();
        let signaling = signaling_config(&relay, Some("wss://relay.example.org/ws/voice"));
        assert_eq!(signaling.url, "wss://relay.example.org/ws/voice");
    }

    #[test]
    fn disabled_vad_turns_detection_off() {
        let vad = VadConfig {
            enabled: false,
            ..VadConfig::default()
        };
        assert_eq!(activity_config(&vad), None);
    }

    #[test]
    fn empty_ice_url_skips_lookup() {
        assert!(ice_endpoint(&IceConfig::default()).is_none());

        let ice = IceConfig {
            server_url: "https://api.example.org/ice".into(),
            request_timeout_secs: 3,
            ..IceConfig::default()
        };
        assert_eq!(
            ice_endpoint(&ice),
            Some(("https://api.example.org/ice", Duration::from_secs(3)))
        );
    }
}
