//! Who is currently in the voice channel.

use std::collections::BTreeSet;

use tracing::{debug, warn};
use voxmesh_common::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Joined(PeerId),
    Left(PeerId),
}

impl MembershipChange {
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::Joined(peer) | Self::Left(peer) => peer,
        }
    }
}

/// Point-in-time copy of the member set. `version` increases with every
/// applied change, so consumers can tell an old snapshot from a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub version: u64,
    pub members: BTreeSet<PeerId>,
}

/// Set of peers in the channel, built from join/leave events and full
/// user-list snapshots. Includes the local peer when the relay reports it.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    members: BTreeSet<PeerId>,
    version: u64,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the change, or `None` if the peer was already present.
    pub fn apply_join(&mut self, peer: &PeerId) -> Option<MembershipChange> {
        if !peer.is_valid() {
            warn!(peer = %peer, "ignoring join with invalid peer id");
            return None;
        }
        if !self.members.insert(peer.clone()) {
            debug!(peer = %peer, "duplicate join");
            return None;
        }
        self.version += 1;
        Some(MembershipChange::Joined(peer.clone()))
    }

    /// Returns the change, or `None` if the peer was not present.
    pub fn apply_leave(&mut self, peer: &PeerId) -> Option<MembershipChange> {
        if !self.members.remove(peer) {
            debug!(peer = %peer, "leave for unknown peer");
            return None;
        }
        self.version += 1;
        Some(MembershipChange::Left(peer.clone()))
    }

    /// Replace the member set with an authoritative list. Leaves come first,
    /// then joins, each in peer-id order.
    pub fn reconcile(&mut self, users: &[PeerId]) -> Vec<MembershipChange> {
        let incoming: BTreeSet<PeerId> = users.iter().filter(|p| p.is_valid()).cloned().collect();

        let departed: Vec<PeerId> = self.members.difference(&incoming).cloned().collect();
        let arrived: Vec<PeerId> = incoming.difference(&self.members).cloned().collect();

        let mut changes = Vec::with_capacity(departed.len() + arrived.len());
        for peer in departed {
            changes.extend(self.apply_leave(&peer));
        }
        for peer in arrived {
            changes.extend(self.apply_join(&peer));
        }
        changes
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    pub fn members(&self) -> impl Iterator<Item = &PeerId> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            version: self.version,
            members: self.members.clone(),
        }
    }

    /// Forget everyone. Bumps the version when anything was removed.
    pub fn clear(&mut self) {
        if !self.members.is_empty() {
            self.members.clear();
            self.version += 1;
        }
    }
}
