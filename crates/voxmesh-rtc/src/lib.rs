//! WebRTC implementation of the voxmesh peer-engine seam.
//!
//! [`RtcPeerEngine`] builds one `RTCPeerConnection` per remote member.
//! Local audio arrives as already-encoded Opus frames and is written to a
//! static sample track; remote audio is surfaced as raw RTP payloads on a
//! broadcast channel for the host to decode.

mod convert;
mod engine;
mod session;

pub use engine::{RemoteAudioPacket, RtcPeerEngine};
pub use session::RtcPeerSession;
