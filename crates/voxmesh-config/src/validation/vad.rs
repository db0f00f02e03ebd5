//! Validation for voice-activity detection and capture settings.

use crate::schema::{VoxmeshConfig, OPUS_SAMPLE_RATES};

use super::helpers::{validate_range, validate_range_f64};

pub(crate) fn validate_vad(errors: &mut Vec<String>, config: &VoxmeshConfig) {
    let vad = &config.vad;
    validate_range(errors, "vad.interval_ms", vad.interval_ms, 50, 2000);
    if !vad.fft_size.is_power_of_two() || !(32..=2048).contains(&vad.fft_size) {
        errors.push(format!(
            "vad.fft_size = {} must be a power of two in [32, 2048]",
            vad.fft_size
        ));
    }
    validate_range_f64(errors, "vad.threshold_db", vad.threshold_db, -100.0, 0.0);
    validate_range_f64(errors, "vad.hysteresis_db", vad.hysteresis_db, 0.0, 20.0);
}

pub(crate) fn validate_audio(errors: &mut Vec<String>, config: &VoxmeshConfig) {
    if !OPUS_SAMPLE_RATES.contains(&config.audio.sample_rate) {
        errors.push(format!(
            "audio.sample_rate = {} must be one of {OPUS_SAMPLE_RATES:?}",
            config.audio.sample_rate
        ));
    }
    if config.audio.input_device.trim().is_empty() {
        errors.push("audio.input_device must not be empty".into());
    }
}
