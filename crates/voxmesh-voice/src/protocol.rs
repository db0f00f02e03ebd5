//! Wire protocol spoken with the voice relay.
//!
//! Every frame is a JSON envelope `{type, room?, sender?, target?, payload?}`.
//! Inbound frames are decoded once, here, into [`InboundEvent`]; nothing
//! past this module looks at raw JSON.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use voxmesh_common::PeerId;

// ---------------------------------------------------------------------------
// Message type names
// ---------------------------------------------------------------------------

pub mod kinds {
    pub const AUTH: &str = "auth";
    pub const AUTH_RESPONSE: &str = "auth-response";
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const CANDIDATE: &str = "candidate";
    pub const USER_SPEAKING: &str = "user-speaking";
    pub const USER_LIST: &str = "user-list";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Raw relay frame. Peer ids stay in their wire encoding at this level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Negotiation artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => kinds::OFFER,
            Self::Answer => kinds::ANSWER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => kinds::OFFER,
            Self::Answer => kinds::ANSWER,
            Self::Candidate => kinds::CANDIDATE,
        }
    }

    fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            kinds::OFFER => Some(Self::Offer),
            kinds::ANSWER => Some(Self::Answer),
            kinds::CANDIDATE => Some(Self::Candidate),
            _ => None,
        }
    }
}

/// One offer, answer, or candidate addressed between two peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::Candidate(_) => SignalKind::Candidate,
        }
    }

    /// Payload object as browsers send it: `{offer: {...}}`, `{answer: {...}}`
    /// or `{candidate: {...}}`.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Offer(desc) => json!({ "offer": desc }),
            Self::Answer(desc) => json!({ "answer": desc }),
            Self::Candidate(candidate) => json!({ "candidate": candidate }),
        }
    }

    /// Parse a payload object for the given signal kind.
    pub fn from_payload(kind: SignalKind, payload: &Value) -> Result<Self, String> {
        match kind {
            SignalKind::Offer => description(SdpKind::Offer, payload).map(Self::Offer),
            SignalKind::Answer => description(SdpKind::Answer, payload).map(Self::Answer),
            SignalKind::Candidate => candidate(payload).map(Self::Candidate),
        }
    }
}

fn description(kind: SdpKind, payload: &Value) -> Result<SessionDescription, String> {
    let key = kind.as_str();
    let nested = payload.get(key);

    if let Some(declared) = nested.and_then(|d| d.get("type")).and_then(Value::as_str) {
        if declared != key {
            return Err(format!("{key} payload declares type {declared:?}"));
        }
    }

    let sdp = nested
        .and_then(|d| d.get("sdp"))
        .or_else(|| payload.get("sdp"))
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{key} payload has no sdp"))?;

    if sdp.trim().is_empty() {
        return Err(format!("{key} payload has an empty sdp"));
    }

    Ok(SessionDescription {
        kind,
        sdp: sdp.to_string(),
    })
}

fn candidate(payload: &Value) -> Result<IceCandidate, String> {
    match payload.get("candidate") {
        Some(Value::String(line)) => Ok(IceCandidate {
            candidate: line.clone(),
            sdp_mid: payload
                .get("sdpMid")
                .and_then(Value::as_str)
                .map(str::to_string),
            sdp_m_line_index: payload
                .get("sdpMLineIndex")
                .and_then(Value::as_u64)
                .and_then(|i| u16::try_from(i).ok()),
            username_fragment: None,
        }),
        Some(obj @ Value::Object(_)) => serde_json::from_value(obj.clone())
            .map_err(|e| format!("candidate payload is malformed: {e}")),
        _ => Err("candidate payload has no candidate".into()),
    }
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// A decoded relay frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    AuthResponse {
        success: bool,
        error: Option<String>,
        user_id: Option<PeerId>,
    },
    Join {
        peer: PeerId,
    },
    Leave {
        peer: PeerId,
    },
    /// Full membership snapshot. Sorted, deduplicated, invalid ids dropped.
    UserList {
        users: Vec<PeerId>,
    },
    Signal {
        from: PeerId,
        target: Option<PeerId>,
        signal: SignalPayload,
    },
    /// A negotiation frame from a known sender whose payload did not parse.
    MalformedSignal {
        from: PeerId,
        target: Option<PeerId>,
        kind: SignalKind,
        reason: String,
    },
    UserSpeaking {
        peer: PeerId,
        is_speaking: bool,
    },
    /// Known type, but a required field is missing or unusable.
    Invalid {
        kind: String,
        reason: String,
    },
    Unrecognized {
        kind: String,
    },
}

/// Decode a text frame. Only non-JSON input is an error; everything else
/// maps to some [`InboundEvent`] variant.
pub fn decode_inbound(text: &str) -> Result<InboundEvent, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(classify(envelope))
}

fn classify(envelope: Envelope) -> InboundEvent {
    let Some(kind) = envelope.kind.clone() else {
        // The relay rejects credentials with a bare `{"error": "..."}`.
        if let Some(error) = envelope.error {
            return InboundEvent::AuthResponse {
                success: false,
                error: Some(error),
                user_id: None,
            };
        }
        return InboundEvent::Unrecognized {
            kind: String::new(),
        };
    };

    match kind.as_str() {
        kinds::AUTH_RESPONSE => auth_response(&envelope),
        kinds::JOIN | kinds::LEAVE => match sender(&envelope) {
            Some(peer) if kind == kinds::JOIN => InboundEvent::Join { peer },
            Some(peer) => InboundEvent::Leave { peer },
            None => invalid(&kind, "missing or invalid sender"),
        },
        kinds::USER_LIST => user_list(&envelope),
        kinds::USER_SPEAKING => {
            let Some(peer) = sender(&envelope) else {
                return invalid(&kind, "missing or invalid sender");
            };
            match envelope
                .payload
                .as_ref()
                .and_then(|p| p.get("isSpeaking"))
                .and_then(Value::as_bool)
            {
                Some(is_speaking) => InboundEvent::UserSpeaking { peer, is_speaking },
                None => invalid(&kind, "payload.isSpeaking is missing"),
            }
        }
        other => match SignalKind::from_wire(other) {
            Some(signal_kind) => signal(&envelope, signal_kind),
            None => InboundEvent::Unrecognized { kind },
        },
    }
}

fn auth_response(envelope: &Envelope) -> InboundEvent {
    let payload = envelope.payload.as_ref();
    let success = envelope
        .success
        .or_else(|| payload.and_then(|p| p.get("success")).and_then(Value::as_bool))
        .unwrap_or(false);
    let error = envelope.error.clone().or_else(|| {
        payload
            .and_then(|p| p.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let user_id = envelope
        .user_id
        .as_deref()
        .or_else(|| payload.and_then(|p| p.get("userId")).and_then(Value::as_str))
        .map(PeerId::normalize)
        .filter(PeerId::is_valid);

    InboundEvent::AuthResponse {
        success,
        error,
        user_id,
    }
}

fn user_list(envelope: &Envelope) -> InboundEvent {
    let Some(users) = envelope
        .payload
        .as_ref()
        .and_then(|p| p.get("users"))
        .and_then(Value::as_array)
    else {
        return invalid(kinds::USER_LIST, "payload.users is not an array");
    };

    let mut peers = BTreeSet::new();
    for user in users {
        let raw = match user {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => obj
                .get("id")
                .or_else(|| obj.get("userId"))
                .and_then(Value::as_str),
            _ => None,
        };
        match raw.map(PeerId::normalize) {
            Some(peer) if peer.is_valid() => {
                peers.insert(peer);
            }
            _ => warn!(entry = %user, "dropping unusable user-list entry"),
        }
    }

    InboundEvent::UserList {
        users: peers.into_iter().collect(),
    }
}

fn signal(envelope: &Envelope, kind: SignalKind) -> InboundEvent {
    let Some(from) = sender(envelope) else {
        return invalid(kind.as_str(), "missing or invalid sender");
    };
    let target = envelope.target.as_deref().map(PeerId::normalize);

    let parsed = match envelope.payload.as_ref() {
        Some(payload) => SignalPayload::from_payload(kind, payload),
        None => Err(format!("{} has no payload", kind.as_str())),
    };

    match parsed {
        Ok(signal) => InboundEvent::Signal {
            from,
            target,
            signal,
        },
        Err(reason) => InboundEvent::MalformedSignal {
            from,
            target,
            kind,
            reason,
        },
    }
}

fn sender(envelope: &Envelope) -> Option<PeerId> {
    envelope
        .sender
        .as_deref()
        .map(PeerId::normalize)
        .filter(PeerId::is_valid)
}

fn invalid(kind: &str, reason: &str) -> InboundEvent {
    InboundEvent::Invalid {
        kind: kind.to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// Messages this client sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Auth { token: String, channel_id: String },
    Join,
    Leave,
    Signal { target: PeerId, signal: SignalPayload },
    Speaking { is_speaking: bool },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => kinds::AUTH,
            Self::Join => kinds::JOIN,
            Self::Leave => kinds::LEAVE,
            Self::Signal { signal, .. } => signal.kind().as_str(),
            Self::Speaking { .. } => kinds::USER_SPEAKING,
        }
    }

    /// Build the envelope routed to `room`.
    pub fn to_envelope(&self, room: &str) -> Envelope {
        let mut envelope = Envelope {
            kind: Some(self.kind().to_string()),
            room: Some(room.to_string()),
            ..Envelope::default()
        };
        match self {
            Self::Auth { token, channel_id } => {
                envelope.token = Some(token.clone());
                envelope.payload = Some(json!({ "channelId": channel_id }));
            }
            Self::Join | Self::Leave => {}
            Self::Signal { target, signal } => {
                envelope.target = Some(target.as_str().to_string());
                envelope.payload = Some(signal.to_payload());
            }
            Self::Speaking { is_speaking } => {
                envelope.payload = Some(json!({ "isSpeaking": is_speaking }));
            }
        }
        envelope
    }

    pub fn encode(&self, room: &str) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope(room))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P1: &str = "aaaaaaaa-0000-4000-8000-000000001111";
    const P2: &str = "bbbbbbbb-0000-4000-8000-000000002222";

    fn decode(value: Value) -> InboundEvent {
        decode_inbound(&value.to_string()).unwrap()
    }

    #[test]
    fn auth_response_success_with_user_id() {
        let event = decode(json!({"type": "auth-response", "success": true, "userId": P1}));
        assert_eq!(
            event,
            InboundEvent::AuthResponse {
                success: true,
                error: None,
                user_id: Some(PeerId::normalize(P1)),
            }
        );
    }

    #[test]
    fn auth_response_fields_inside_payload() {
        let event = decode(json!({
            "type": "auth-response",
            "payload": {"success": false, "error": "token expired"}
        }));
        assert_eq!(
            event,
            InboundEvent::AuthResponse {
                success: false,
                error: Some("token expired".into()),
                user_id: None,
            }
        );
    }

    #[test]
    fn bare_error_frame_is_auth_failure() {
        let event = decode(json!({"error": "invalid token"}));
        assert!(matches!(
            event,
            InboundEvent::AuthResponse { success: false, error: Some(ref e), .. } if e == "invalid token"
        ));
    }

    #[test]
    fn join_and_leave_normalize_sender() {
        let upper = P2.to_uppercase();
        assert_eq!(
            decode(json!({"type": "join", "sender": upper})),
            InboundEvent::Join {
                peer: PeerId::normalize(P2)
            }
        );
        assert_eq!(
            decode(json!({"type": "leave", "sender": P2})),
            InboundEvent::Leave {
                peer: PeerId::normalize(P2)
            }
        );
        assert!(matches!(
            decode(json!({"type": "join"})),
            InboundEvent::Invalid { .. }
        ));
    }

    #[test]
    fn user_list_is_sorted_and_deduplicated() {
        let event = decode(json!({
            "type": "user-list",
            "payload": {"users": [P2, P1, P1.to_uppercase(), "???", {"id": P2}]}
        }));
        assert_eq!(
            event,
            InboundEvent::UserList {
                users: vec![PeerId::normalize(P1), PeerId::normalize(P2)]
            }
        );
    }

    #[test]
    fn browser_offer_payload() {
        let event = decode(json!({
            "type": "offer",
            "sender": P1,
            "target": P2,
            "payload": {"offer": {"type": "offer", "sdp": "v=0\r\n"}}
        }));
        assert_eq!(
            event,
            InboundEvent::Signal {
                from: PeerId::normalize(P1),
                target: Some(PeerId::normalize(P2)),
                signal: SignalPayload::Offer(SessionDescription::offer("v=0\r\n")),
            }
        );
    }

    #[test]
    fn flat_answer_payload() {
        let event = decode(json!({
            "type": "answer",
            "sender": P1,
            "payload": {"type": "answer", "sdp": "v=0\r\n"}
        }));
        assert!(matches!(
            event,
            InboundEvent::Signal { signal: SignalPayload::Answer(_), target: None, .. }
        ));
    }

    #[test]
    fn candidate_object_and_string_forms() {
        let event = decode(json!({
            "type": "candidate",
            "sender": P1,
            "payload": {"candidate": {
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }}
        }));
        let InboundEvent::Signal {
            signal: SignalPayload::Candidate(c),
            ..
        } = event
        else {
            panic!("expected candidate, got {event:?}");
        };
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_m_line_index, Some(0));

        let event = decode(json!({
            "type": "candidate",
            "sender": P1,
            "payload": {"candidate": "candidate:2", "sdpMid": "audio"}
        }));
        let InboundEvent::Signal {
            signal: SignalPayload::Candidate(c),
            ..
        } = event
        else {
            panic!("expected candidate, got {event:?}");
        };
        assert_eq!(c.candidate, "candidate:2");
        assert_eq!(c.sdp_mid.as_deref(), Some("audio"));
    }

    #[test]
    fn malformed_signal_keeps_sender() {
        let event = decode(json!({"type": "offer", "sender": P1, "payload": {"offer": {}}}));
        assert!(matches!(
            event,
            InboundEvent::MalformedSignal { ref from, kind: SignalKind::Offer, .. }
                if *from == PeerId::normalize(P1)
        ));

        let event = decode(json!({
            "type": "answer",
            "sender": P1,
            "payload": {"answer": {"type": "offer", "sdp": "v=0"}}
        }));
        assert!(matches!(event, InboundEvent::MalformedSignal { .. }));
    }

    #[test]
    fn speaking_event() {
        let event = decode(json!({
            "type": "user-speaking",
            "sender": P1,
            "payload": {"isSpeaking": true}
        }));
        assert_eq!(
            event,
            InboundEvent::UserSpeaking {
                peer: PeerId::normalize(P1),
                is_speaking: true
            }
        );
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        assert_eq!(
            decode(json!({"type": "screen-share", "sender": P1})),
            InboundEvent::Unrecognized {
                kind: "screen-share".into()
            }
        );
        assert!(decode_inbound("not json").is_err());
    }

    #[test]
    fn outbound_auth_carries_token_and_channel() {
        let message = OutboundMessage::Auth {
            token: "secret".into(),
            channel_id: "chan-1".into(),
        };
        let value: Value = serde_json::from_str(&message.encode("chan-1").unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "auth",
                "room": "chan-1",
                "token": "secret",
                "payload": {"channelId": "chan-1"}
            })
        );
    }

    #[test]
    fn outbound_signal_is_targeted() {
        let message = OutboundMessage::Signal {
            target: PeerId::normalize(P2),
            signal: SignalPayload::Offer(SessionDescription::offer("v=0")),
        };
        let value: Value = serde_json::from_str(&message.encode("room").unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["target"], P2);
        assert_eq!(value["room"], "room");
        assert_eq!(value["payload"]["offer"]["type"], "offer");
        assert_eq!(value["payload"]["offer"]["sdp"], "v=0");
    }

    #[test]
    fn outbound_candidate_uses_browser_field_names() {
        let mut candidate = IceCandidate::new("candidate:1");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_m_line_index = Some(0);
        let message = OutboundMessage::Signal {
            target: PeerId::normalize(P2),
            signal: SignalPayload::Candidate(candidate),
        };
        let value = message.to_envelope("room").payload.unwrap();
        assert_eq!(
            value,
            json!({"candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}})
        );
    }

    #[test]
    fn outbound_speaking() {
        let value = OutboundMessage::Speaking { is_speaking: false }
            .to_envelope("room")
            .payload
            .unwrap();
        assert_eq!(value, json!({"isSpeaking": false}));
    }
}
