//! Per-peer negotiation record.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use voxmesh_common::PeerId;

use super::worker::WorkerHandle;
use crate::engine::PeerConnectionState;
use crate::protocol::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    New,
    OfferSent,
    AnswerPending,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::OfferSent => "offer-sent",
            Self::AnswerPending => "answer-pending",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Progress of the remote description on this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDescription {
    Unset,
    /// Handed to the worker; candidates are forwarded behind it from now on.
    Applying,
    Applied,
}

/// Everything the orchestrator knows about one remote peer.
pub struct ConnectionRecord {
    pub(super) peer_id: PeerId,
    pub(super) role: Role,
    pub(super) state: NegotiationState,
    pub(super) remote: RemoteDescription,
    /// Remote candidates that arrived before the remote description.
    pub(super) pending_candidates: VecDeque<IceCandidate>,
    /// Local candidates gathered before our offer or answer went out.
    pub(super) held_local: Vec<IceCandidate>,
    pub(super) local_sent: bool,
    pub(super) receive_only: bool,
    pub(super) link: Option<PeerConnectionState>,
    pub(super) generation: u64,
    pub(super) created_at: Instant,
    pub(super) worker: Option<WorkerHandle>,
}

impl ConnectionRecord {
    pub(super) fn new(peer_id: PeerId, role: Role, generation: u64) -> Self {
        Self {
            peer_id,
            role,
            state: NegotiationState::New,
            remote: RemoteDescription::Unset,
            pending_candidates: VecDeque::new(),
            held_local: Vec::new(),
            local_sent: false,
            receive_only: false,
            link: None,
            generation,
            created_at: Instant::now(),
            worker: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote(&self) -> RemoteDescription {
        self.remote
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_receive_only(&self) -> bool {
        self.receive_only
    }

    /// Last transport state reported by the engine.
    pub fn link_state(&self) -> Option<PeerConnectionState> {
        self.link
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(super) fn take_pending(&mut self) -> Vec<IceCandidate> {
        self.pending_candidates.drain(..).collect()
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote", &self.remote)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("generation", &self.generation)
            .finish()
    }
}
