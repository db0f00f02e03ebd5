//! Voice-channel signaling and full-mesh peer orchestration.
//!
//! One [`VoiceSession`] per joined voice channel. It owns a single control
//! connection to the signaling relay ([`signaling`]), tracks who is in the
//! channel ([`membership`]), negotiates one peer connection per remote
//! member ([`orchestrator`]), detects local speech ([`activity`]), and folds
//! all of that into a presence view ([`presence`]).
//!
//! Media capture and the peer-connection engine are seams ([`media`],
//! [`engine`]) so the same core runs against a WebRTC stack or test doubles.

pub mod activity;
pub mod engine;
pub mod ice;
pub mod media;
pub mod membership;
pub mod orchestrator;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::{ActivityConfig, VoiceActivityMonitor};
pub use engine::{EngineEvent, PeerConnectionState, PeerEngine, PeerSession, SessionEvents};
pub use ice::{HttpIceServerProvider, IceServer, IceServerProvider, StaticIceServers};
pub use media::{
    AudioCodec, AudioConstraints, EncodedFrame, LocalAudioStream, LocalTrack, MediaCapability,
    NoCaptureDevice, PushAudioStream,
};
pub use membership::{MembershipChange, MembershipSnapshot, MembershipTracker};
pub use orchestrator::{ConnectionOrchestrator, NegotiationState, Role};
pub use presence::{PeerPresence, PresenceAggregator, PresenceView};
pub use protocol::{IceCandidate, InboundEvent, OutboundMessage, SessionDescription, SignalPayload};
pub use session::{VoiceDeps, VoiceEvent, VoiceSession, VoiceSessionConfig};
pub use signaling::{
    ReconnectPolicy, SessionContext, SignalSink, SignalingChannel, SignalingConfig,
    SignalingEvent, SignalingSession, Subscription, TransportState,
};
