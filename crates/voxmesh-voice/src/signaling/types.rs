//! Configuration, session state, and event types for the signaling channel.

use std::fmt;
use std::time::Duration;

use voxmesh_common::{PeerId, VoiceError};

use super::backoff::ReconnectPolicy;
use crate::protocol::InboundEvent;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the relay; `channelId` is appended as a query
    /// parameter.
    pub url: String,
    /// Bound on the TCP/TLS/WebSocket handshake and on waiting for the
    /// auth response.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/voice".into(),
            connect_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Everything a session needs to know about who is joining where.
///
/// Passed to the channel at open time and scoped to that session.
#[derive(Clone)]
pub struct SessionContext {
    credential: String,
    channel_id: String,
    local_peer: Option<PeerId>,
}

impl SessionContext {
    pub fn new(credential: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            channel_id: channel_id.into(),
            local_peer: None,
        }
    }

    /// Local identity to assume until the relay reports one.
    pub fn with_local_peer(mut self, peer: PeerId) -> Self {
        self.local_peer = Some(peer);
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn local_peer(&self) -> Option<&PeerId> {
        self.local_peer.as_ref()
    }

    pub(crate) fn credential(&self) -> &str {
        &self.credential
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("credential", &"[REDACTED]")
            .field("channel_id", &self.channel_id)
            .field("local_peer", &self.local_peer)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Authenticating,
    Active,
    Reconnecting,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingSession {
    pub transport_state: TransportState,
    pub reconnect_attempt: u32,
    pub last_error: Option<VoiceError>,
}

impl Default for SignalingSession {
    fn default() -> Self {
        Self {
            transport_state: TransportState::Idle,
            reconnect_attempt: 0,
            last_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events published to every [`Subscription`](super::Subscription).
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    StateChanged(TransportState),
    /// The relay accepted the credential. `user_id` is the identity it
    /// assigned, when it reports one.
    Authenticated { user_id: Option<PeerId> },
    /// The relay rejected the credential. The channel closes without retrying.
    AuthFailed { reason: String },
    /// The connection dropped abnormally. Everything negotiated over it is gone.
    Disconnected { code: Option<u16> },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnect budget exhausted, or the endpoint is unusable. Terminal.
    TransportFailed(VoiceError),
    Message(InboundEvent),
}
