//! Peer-connection engine seam.
//!
//! The orchestrator decides *what* to negotiate with whom; a [`PeerEngine`]
//! knows *how* to build a peer connection, produce descriptions, and apply
//! remote ones. `voxmesh-rtc` provides the WebRTC implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use voxmesh_common::{PeerId, VoiceError};

use crate::ice::IceServer;
use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SessionDescription};

/// Transport-level state of a peer connection, as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something the engine noticed asynchronously about one session.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate {
        peer: PeerId,
        generation: u64,
        candidate: IceCandidate,
    },
    ConnectionState {
        peer: PeerId,
        generation: u64,
        state: PeerConnectionState,
    },
}

impl EngineEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::LocalCandidate { peer, .. } | Self::ConnectionState { peer, .. } => peer,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            Self::LocalCandidate { generation, .. } | Self::ConnectionState { generation, .. } => {
                *generation
            }
        }
    }
}

/// Callback handle an engine uses to report events for one session.
///
/// Events are tagged with the connection record they belong to, so
/// reports from a replaced record are recognised as stale.
#[derive(Clone)]
pub struct SessionEvents {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl SessionEvents {
    pub fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        let _ = self.tx.send(EngineEvent::LocalCandidate {
            peer: self.peer.clone(),
            generation: self.generation,
            candidate,
        });
    }

    pub fn connection_state(&self, state: PeerConnectionState) {
        let _ = self.tx.send(EngineEvent::ConnectionState {
            peer: self.peer.clone(),
            generation: self.generation,
            state,
        });
    }
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Build a fresh peer connection for `events.peer()`.
    async fn create_session(
        &self,
        events: SessionEvents,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerSession>, VoiceError>;
}

/// One negotiated connection to one remote peer.
///
/// Calls for a given session are always serialized by the caller.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Send a clone of the local audio track to this peer.
    async fn attach_local_audio(&self, track: LocalTrack) -> Result<(), VoiceError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, VoiceError>;

    /// Create an answer to the applied remote offer and install it locally.
    async fn create_answer(&self) -> Result<SessionDescription, VoiceError>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), VoiceError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), VoiceError>;

    /// Release transports and stop forwarding the local track. Idempotent.
    async fn close(&self);
}
