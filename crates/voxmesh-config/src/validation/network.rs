//! Validation for the relay and ICE sections.

use crate::schema::VoxmeshConfig;

use super::helpers::{validate_range, validate_scheme};

pub(crate) fn validate_relay(errors: &mut Vec<String>, config: &VoxmeshConfig) {
    let relay = &config.relay;
    validate_scheme(errors, "relay.url", &relay.url, &["ws://", "wss://"]);
    validate_range(
        errors,
        "relay.connect_timeout_secs",
        relay.connect_timeout_secs,
        1,
        120,
    );
    validate_range(
        errors,
        "relay.reconnect_base_ms",
        relay.reconnect_base_ms,
        100,
        60_000,
    );
    validate_range(
        errors,
        "relay.max_reconnect_attempts",
        relay.max_reconnect_attempts,
        1,
        20,
    );
}

pub(crate) fn validate_ice(errors: &mut Vec<String>, config: &VoxmeshConfig) {
    let ice = &config.ice;
    if !ice.server_url.is_empty() {
        validate_scheme(
            errors,
            "ice.server_url",
            &ice.server_url,
            &["http://", "https://"],
        );
    }
    validate_range(
        errors,
        "ice.request_timeout_secs",
        ice.request_timeout_secs,
        1,
        120,
    );
    validate_scheme(
        errors,
        "ice.fallback_stun",
        &ice.fallback_stun,
        &["stun:", "stuns:"],
    );
}
