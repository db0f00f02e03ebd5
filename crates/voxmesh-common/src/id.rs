use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Canonical form of an identifier that could not be normalized.
pub const INVALID_PEER_ID: &str = "invalid-uuid";

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identifier of a voice-channel member in canonical form.
///
/// Ids arrive either as a hyphenated UUID (any case) or packed as the
/// base64 encoding of the 16 UUID bytes, padded or not. Both normalize to
/// the lowercase hyphenated UUID. Anything else becomes [`INVALID_PEER_ID`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Normalize a wire identifier. Never fails; malformed input yields the
    /// invalid sentinel and a warning.
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            tracing::warn!("empty peer id");
            return Self::invalid();
        }

        if let Ok(uuid) = uuid::Uuid::try_parse(raw) {
            return Self(uuid.hyphenated().to_string());
        }

        match decode_packed(raw) {
            Some(uuid) => Self(uuid.hyphenated().to_string()),
            None => {
                tracing::warn!(raw, "peer id is neither a uuid nor a packed uuid");
                Self::invalid()
            }
        }
    }

    pub fn invalid() -> Self {
        Self(INVALID_PEER_ID.to_string())
    }

    pub fn is_valid(&self) -> bool {
        self.0 != INVALID_PEER_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Packed form: unpadded standard base64 of the UUID bytes.
    pub fn to_packed(&self) -> Option<String> {
        let uuid = uuid::Uuid::try_parse(&self.0).ok()?;
        Some(STANDARD_NO_PAD.encode(uuid.as_bytes()))
    }
}

fn decode_packed(raw: &str) -> Option<uuid::Uuid> {
    let trimmed = raw.trim_end_matches('=');
    let bytes = if trimmed.contains(['-', '_']) {
        URL_SAFE_NO_PAD.decode(trimmed).ok()?
    } else {
        STANDARD_NO_PAD.decode(trimmed).ok()?
    };
    uuid::Uuid::from_slice(&bytes).ok()
}

impl From<&str> for PeerId {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::normalize(&raw))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeee1111";

    fn packed(canonical: &str) -> String {
        let uuid = uuid::Uuid::parse_str(canonical).unwrap();
        base64::engine::general_purpose::STANDARD.encode(uuid.as_bytes())
    }

    #[test]
    fn new_id_is_valid_uuid() {
        let id = new_id();
        let parsed = uuid::Uuid::parse_str(&id);
        assert!(parsed.is_ok());
        assert_eq!(parsed.unwrap().get_version_num(), 4);
    }

    #[test]
    fn canonical_passes_through() {
        assert_eq!(PeerId::normalize(CANONICAL).as_str(), CANONICAL);
    }

    #[test]
    fn uppercase_is_lowered() {
        let upper = CANONICAL.to_uppercase();
        assert_eq!(PeerId::normalize(&upper).as_str(), CANONICAL);
    }

    #[test]
    fn packed_padded_and_unpadded_agree() {
        let padded = packed(CANONICAL);
        assert!(padded.ends_with("=="));
        let unpadded = padded.trim_end_matches('=');

        assert_eq!(PeerId::normalize(&padded).as_str(), CANONICAL);
        assert_eq!(PeerId::normalize(unpadded).as_str(), CANONICAL);
    }

    #[test]
    fn url_safe_packed_is_accepted() {
        // 0xfb 0xff ... encodes to '+' and '/' in the standard alphabet.
        let canonical = "fbfffbff-fbff-4bff-bfff-fbfffbfffbff";
        let uuid = uuid::Uuid::parse_str(canonical).unwrap();
        let url_safe = URL_SAFE_NO_PAD.encode(uuid.as_bytes());
        assert!(url_safe.contains(['-', '_']));
        assert_eq!(PeerId::normalize(&url_safe).as_str(), canonical);
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            CANONICAL.to_string(),
            CANONICAL.to_uppercase(),
            packed(CANONICAL),
            "garbage!".to_string(),
            String::new(),
            INVALID_PEER_ID.to_string(),
        ];
        for input in inputs {
            let once = PeerId::normalize(&input);
            let twice = PeerId::normalize(once.as_str());
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    #[test]
    fn both_encodings_map_to_same_id() {
        let from_text = PeerId::normalize(CANONICAL);
        let from_packed = PeerId::normalize(&packed(CANONICAL));
        assert_eq!(from_text, from_packed);
    }

    #[test]
    fn malformed_input_is_invalid() {
        assert!(!PeerId::normalize("").is_valid());
        assert!(!PeerId::normalize("   ").is_valid());
        assert!(!PeerId::normalize("not an id").is_valid());
        // Valid base64 but not 16 bytes long.
        assert!(!PeerId::normalize("aGVsbG8").is_valid());
        assert_eq!(PeerId::normalize("nope").as_str(), INVALID_PEER_ID);
    }

    #[test]
    fn packed_round_trip() {
        let id = PeerId::normalize(CANONICAL);
        let packed = id.to_packed().unwrap();
        assert!(!packed.contains('='));
        assert_eq!(PeerId::normalize(&packed), id);
        assert!(PeerId::invalid().to_packed().is_none());
    }

    #[test]
    fn deserialize_normalizes() {
        let json = format!("\"{}\"", packed(CANONICAL));
        let id: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id.as_str(), CANONICAL);

        let out = serde_json::to_string(&id).unwrap();
        assert_eq!(out, format!("\"{CANONICAL}\""));
    }

    #[test]
    fn ordering_follows_canonical_text() {
        let low = PeerId::normalize("00000000-0000-4000-8000-000000000001");
        let high = PeerId::normalize("ffffffff-0000-4000-8000-000000000001");
        assert!(low < high);
    }
}
