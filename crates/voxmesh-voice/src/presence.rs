//! Read-side view of who is present, connected, and speaking.

use std::collections::BTreeMap;
use std::time::Instant;

use voxmesh_common::PeerId;

use crate::membership::MembershipTracker;
use crate::orchestrator::NegotiationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakingState {
    pub is_speaking: bool,
    pub last_changed_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPresence {
    pub present: bool,
    /// `None` when no connection record exists (e.g. the local peer).
    pub connection_state: Option<NegotiationState>,
    pub is_speaking: bool,
}

/// `peer → presence`, ordered by peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceView(BTreeMap<PeerId, PeerPresence>);

impl PresenceView {
    pub fn get(&self, peer: &PeerId) -> Option<&PeerPresence> {
        self.0.get(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerPresence)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn speaking(&self) -> impl Iterator<Item = &PeerId> {
        self.0
            .iter()
            .filter(|(_, p)| p.is_speaking)
            .map(|(peer, _)| peer)
    }

    /// Mark the local peer as present. It never appears in the membership
    /// list, which only carries remote peers.
    pub(crate) fn with_local(mut self, local: &PeerId) -> Self {
        self.0
            .entry(local.clone())
            .or_insert(PeerPresence {
                present: true,
                connection_state: None,
                is_speaking: false,
            })
            .present = true;
        self
    }
}

/// Owns the speaking map and folds it together with membership and
/// connection states on demand.
#[derive(Debug, Default)]
pub struct PresenceAggregator {
    speaking: BTreeMap<PeerId, SpeakingState>,
}

impl PresenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the stored state changed.
    pub fn record_speaking(&mut self, peer: &PeerId, is_speaking: bool, at: Instant) -> bool {
        if !peer.is_valid() {
            return false;
        }
        match self.speaking.get_mut(peer) {
            Some(state) if state.is_speaking == is_speaking => false,
            Some(state) => {
                state.is_speaking = is_speaking;
                state.last_changed_at = at;
                true
            }
            None => {
                self.speaking.insert(
                    peer.clone(),
                    SpeakingState {
                        is_speaking,
                        last_changed_at: at,
                    },
                );
                true
            }
        }
    }

    /// Drop the peer's speaking entry. Returns whether one existed.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        self.speaking.remove(peer).is_some()
    }

    pub fn clear_speaking(&mut self) {
        self.speaking.clear();
    }

    pub fn speaking(&self, peer: &PeerId) -> Option<&SpeakingState> {
        self.speaking.get(peer)
    }

    /// Deterministic fold of the three sources. Peers known to any of them
    /// appear in the view.
    pub fn view(
        &self,
        membership: &MembershipTracker,
        connections: &BTreeMap<PeerId, NegotiationState>,
    ) -> PresenceView {
        let mut view = BTreeMap::new();

        let peers = membership
            .members()
            .chain(connections.keys())
            .chain(self.speaking.keys());
        for peer in peers {
            view.entry(peer.clone()).or_insert_with(|| PeerPresence {
                present: membership.contains(peer),
                connection_state: connections.get(peer).copied(),
                is_speaking: self
                    .speaking
                    .get(peer)
                    .is_some_and(|state| state.is_speaking),
            });
        }
        PresenceView(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::normalize(&format!("00000000-0000-4000-8000-0000000000{n:02x}"))
    }

    #[test]
    fn record_speaking_reports_changes_only() {
        let mut agg = PresenceAggregator::new();
        let t0 = Instant::now();
        assert!(agg.record_speaking(&peer(1), true, t0));
        assert!(!agg.record_speaking(&peer(1), true, t0));
        assert!(agg.record_speaking(&peer(1), false, t0));
        assert!(!agg.record_speaking(&PeerId::invalid(), true, t0));
        assert!(!agg.speaking(&peer(1)).unwrap().is_speaking);
    }

    #[test]
    fn view_merges_all_sources() {
        let mut membership = MembershipTracker::new();
        membership.apply_join(&peer(1));
        membership.apply_join(&peer(2));

        let mut connections = BTreeMap::new();
        connections.insert(peer(2), NegotiationState::Connected);
        connections.insert(peer(3), NegotiationState::AnswerPending);

        let mut agg = PresenceAggregator::new();
        agg.record_speaking(&peer(2), true, Instant::now());

        let view = agg.view(&membership, &connections);
        assert_eq!(view.len(), 3);
        assert_eq!(
            view.get(&peer(1)),
            Some(&PeerPresence {
                present: true,
                connection_state: None,
                is_speaking: false
            })
        );
        assert_eq!(
            view.get(&peer(2)),
            Some(&PeerPresence {
                present: true,
                connection_state: Some(NegotiationState::Connected),
                is_speaking: true
            })
        );
        assert!(!view.get(&peer(3)).unwrap().present);
        assert_eq!(view.speaking().collect::<Vec<_>>(), vec![&peer(2)]);
    }

    #[test]
    fn view_is_deterministic_and_forget_removes() {
        let mut membership = MembershipTracker::new();
        membership.apply_join(&peer(1));
        let connections = BTreeMap::new();
        let mut agg = PresenceAggregator::new();
        agg.record_speaking(&peer(1), true, Instant::now());

        assert_eq!(
            agg.view(&membership, &connections),
            agg.view(&membership, &connections)
        );

        assert!(agg.forget(&peer(1)));
        assert!(!agg.forget(&peer(1)));
        assert!(!agg.view(&membership, &connections).get(&peer(1)).unwrap().is_speaking);
    }

    #[test]
    fn local_peer_is_present_without_membership() {
        let membership = MembershipTracker::new();
        let mut agg = PresenceAggregator::new();
        agg.record_speaking(&peer(9), true, Instant::now());

        let view = agg.view(&membership, &BTreeMap::new());
        assert!(!view.get(&peer(9)).unwrap().present);

        let view = view.with_local(&peer(9));
        assert_eq!(
            view.get(&peer(9)),
            Some(&PeerPresence {
                present: true,
                connection_state: None,
                is_speaking: true
            })
        );
        assert!(view.with_local(&peer(4)).get(&peer(4)).unwrap().present);
    }
}
