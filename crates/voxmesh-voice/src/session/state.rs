//! Synchronous session logic. Every handler reads live state from the
//! owning component and queues the resulting UI events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use voxmesh_common::{PeerId, VoiceError};

use super::VoiceEvent;
use crate::activity::VoiceActivityMonitor;
use crate::ice::IceServer;
use crate::media::LocalAudioStream;
use crate::membership::{MembershipChange, MembershipTracker};
use crate::orchestrator::{ConnectionOrchestrator, Feedback, NegotiationState};
use crate::presence::{PresenceAggregator, PresenceView};
use crate::protocol::{InboundEvent, OutboundMessage};
use crate::signaling::{SignalSink, SignalingEvent, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    AwaitingAuth,
    /// Authenticated once; media and ICE servers are being resolved.
    Preparing,
    Ready,
    Closed,
}

/// Result of the one-time media and ICE lookup.
pub(crate) struct Prepared {
    pub(crate) media: Result<Arc<dyn LocalAudioStream>, VoiceError>,
    pub(crate) ice_servers: Vec<IceServer>,
}

pub(crate) struct ChannelState {
    sink: Arc<dyn SignalSink>,
    membership: MembershipTracker,
    orchestrator: ConnectionOrchestrator,
    presence: PresenceAggregator,
    monitor: Option<VoiceActivityMonitor>,
    assumed_local: Option<PeerId>,
    local_id: Option<PeerId>,
    phase: Phase,
    /// Our join was announced on the current connection.
    joined: bool,
    prepare_requested: bool,
    events: Vec<VoiceEvent>,
    last_states: BTreeMap<PeerId, NegotiationState>,
}

impl ChannelState {
    pub(crate) fn new(
        sink: Arc<dyn SignalSink>,
        orchestrator: ConnectionOrchestrator,
        monitor: Option<VoiceActivityMonitor>,
        assumed_local: Option<PeerId>,
    ) -> Self {
        let mut state = Self {
            sink,
            membership: MembershipTracker::new(),
            orchestrator,
            presence: PresenceAggregator::new(),
            monitor,
            assumed_local: None,
            local_id: None,
            phase: Phase::AwaitingAuth,
            joined: false,
            prepare_requested: false,
            events: Vec::new(),
            last_states: BTreeMap::new(),
        };
        if let Some(local) = assumed_local.filter(PeerId::is_valid) {
            state.set_local_id(local.clone());
            state.assumed_local = Some(local);
        }
        state
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub(crate) fn membership(&self) -> &MembershipTracker {
        &self.membership
    }

    pub(crate) fn orchestrator(&self) -> &ConnectionOrchestrator {
        &self.orchestrator
    }

    /// True once, after the first successful authentication.
    pub(crate) fn take_prepare_request(&mut self) -> bool {
        std::mem::take(&mut self.prepare_requested)
    }

    // -- Signaling ----------------------------------------------------------

    pub(crate) fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::StateChanged(state) => {
                self.events.push(VoiceEvent::StatusChanged(state));
                if state == TransportState::Closed {
                    self.teardown();
                }
            }
            SignalingEvent::Authenticated { user_id } => self.on_authenticated(user_id),
            SignalingEvent::AuthFailed { reason } => {
                self.events.push(VoiceEvent::Error(VoiceError::Auth(reason)));
            }
            SignalingEvent::Disconnected { code } => {
                debug!(?code, "signaling lost; dropping channel state");
                self.reset_channel();
            }
            SignalingEvent::ReconnectScheduled { .. } => {}
            SignalingEvent::TransportFailed(error) => {
                self.events.push(VoiceEvent::Error(error));
            }
            SignalingEvent::Message(inbound) => self.on_inbound(inbound),
        }
    }

    fn on_authenticated(&mut self, user_id: Option<PeerId>) {
        if let Some(local) = user_id.or_else(|| self.assumed_local.clone()) {
            self.set_local_id(local);
        }
        self.events.push(VoiceEvent::Authenticated {
            local_id: self.local_id.clone(),
        });

        match self.phase {
            Phase::AwaitingAuth => {
                self.phase = Phase::Preparing;
                self.prepare_requested = true;
            }
            // Reconnected: announce ourselves again so members renegotiate.
            Phase::Ready => self.announce_join(),
            Phase::Preparing | Phase::Closed => {}
        }
    }

    fn set_local_id(&mut self, local: PeerId) {
        if self.local_id.as_ref() != Some(&local) {
            info!(local_id = %local, "local peer id");
        }
        self.orchestrator.set_local_id(local.clone());
        self.local_id = Some(local);
    }

    fn is_local(&self, peer: &PeerId) -> bool {
        self.local_id.as_ref() == Some(peer)
    }

    /// Signals addressed to someone else, or echoed back from us, are not
    /// ours to handle.
    fn is_for_us(&self, from: &PeerId, target: Option<&PeerId>) -> bool {
        if self.is_local(from) {
            return false;
        }
        match (target, &self.local_id) {
            (Some(target), Some(local)) => target == local,
            _ => true,
        }
    }

    fn on_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Join { peer } => {
                if self.is_local(&peer) {
                    return;
                }
                if let Some(change) = self.membership.apply_join(&peer) {
                    self.push_change(change);
                }
                self.orchestrator.on_peer_joined(&peer);
            }
            InboundEvent::Leave { peer } => {
                if self.is_local(&peer) {
                    return;
                }
                if let Some(change) = self.membership.apply_leave(&peer) {
                    self.push_change(change);
                }
                self.forget_peer(&peer);
            }
            InboundEvent::UserList { users } => {
                for change in self.membership.reconcile(&users) {
                    if let MembershipChange::Left(peer) = &change {
                        self.forget_peer(peer);
                    }
                    self.push_change(change);
                }
                let snapshot = self.membership.snapshot();
                self.orchestrator.reconcile(&snapshot);
            }
            InboundEvent::Signal {
                from,
                target,
                signal,
            } => {
                if !self.is_for_us(&from, target.as_ref()) {
                    debug!(peer = %from, kind = signal.kind().as_str(), "signal not addressed to us");
                    return;
                }
                self.orchestrator.on_signal(&from, signal);
            }
            InboundEvent::MalformedSignal {
                from,
                target,
                kind,
                reason,
            } => {
                if !self.is_for_us(&from, target.as_ref()) {
                    return;
                }
                warn!(peer = %from, kind = kind.as_str(), "dropping malformed signal");
                self.orchestrator.on_malformed_signal(&from, &reason);
            }
            InboundEvent::UserSpeaking { peer, is_speaking } => {
                if self.is_local(&peer) {
                    return;
                }
                if self.orchestrator.has_departed(&peer) {
                    debug!(peer = %peer, "speaking update from a departed peer");
                    return;
                }
                if self.presence.record_speaking(&peer, is_speaking, Instant::now()) {
                    self.events
                        .push(VoiceEvent::SpeakingChanged { peer, is_speaking });
                }
            }
            InboundEvent::AuthResponse { .. } => {}
            InboundEvent::Invalid { kind, reason } => {
                warn!(kind = %kind, reason = %reason, "invalid relay message");
            }
            InboundEvent::Unrecognized { kind } => {
                debug!(kind = %kind, "unrecognized relay message");
            }
        }
    }

    fn push_change(&mut self, change: MembershipChange) {
        self.events.push(match change {
            MembershipChange::Joined(peer) => VoiceEvent::MemberJoined(peer),
            MembershipChange::Left(peer) => VoiceEvent::MemberLeft(peer),
        });
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        self.orchestrator.on_peer_left(peer);
        self.presence.forget(peer);
    }

    /// The control connection dropped. Everything negotiated over it is gone
    /// and will be rebuilt after re-authentication.
    fn reset_channel(&mut self) {
        self.joined = false;
        self.orchestrator.close_all();
        for change in self.membership.reconcile(&[]) {
            self.push_change(change);
        }
        self.presence.clear_speaking();
    }

    // -- Local side ---------------------------------------------------------

    pub(crate) fn on_prepared(&mut self, prepared: Prepared) {
        if self.phase == Phase::Closed {
            if let Ok(stream) = prepared.media {
                stream.stop();
            }
            return;
        }

        self.orchestrator.set_ice_servers(prepared.ice_servers);
        match prepared.media {
            Ok(stream) => {
                if let Some(monitor) = self.monitor.as_mut() {
                    monitor.start(Arc::clone(&stream));
                }
                self.orchestrator.attach_local_media(stream);
            }
            Err(error) => {
                warn!(error = %error, "joining without local audio");
                self.events.push(VoiceEvent::Error(error));
                self.orchestrator.mark_media_unavailable();
            }
        }

        self.phase = Phase::Ready;
        self.announce_join();
    }

    fn announce_join(&mut self) {
        match self.sink.send(&OutboundMessage::Join) {
            Ok(()) => self.joined = true,
            Err(e) => warn!(error = %e, "could not announce join"),
        }
    }

    pub(crate) fn on_local_speaking(&mut self, is_speaking: bool) {
        if self.phase == Phase::Closed {
            return;
        }
        if let Some(local) = self.local_id.clone() {
            if self.presence.record_speaking(&local, is_speaking, Instant::now()) {
                self.events.push(VoiceEvent::SpeakingChanged {
                    peer: local,
                    is_speaking,
                });
            }
        }
        if let Err(e) = self.sink.send(&OutboundMessage::Speaking { is_speaking }) {
            debug!(error = %e, "speaking state not sent");
        }
    }

    pub(crate) fn handle_feedback(&mut self, feedback: Feedback) {
        self.orchestrator.handle_feedback(feedback);
    }

    /// Stop detection, close every connection, release local media. Safe to
    /// call more than once.
    pub(crate) fn teardown(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let announced = self.phase == Phase::Ready;
        self.phase = Phase::Closed;
        self.joined = false;

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
        self.orchestrator.close_all();
        self.orchestrator.release_local_media();
        self.presence.clear_speaking();
        if announced {
            let _ = self.sink.send(&OutboundMessage::Leave);
        }
        info!("voice channel state torn down");
    }

    // -- Output -------------------------------------------------------------

    /// Queued events plus any connection state changes since the last call.
    pub(crate) fn drain_events(&mut self) -> Vec<VoiceEvent> {
        let states = self.orchestrator.states();
        for (peer, state) in &states {
            if self.last_states.get(peer) != Some(state) {
                self.events.push(VoiceEvent::ConnectionChanged {
                    peer: peer.clone(),
                    state: *state,
                });
            }
        }
        for peer in self.last_states.keys() {
            if !states.contains_key(peer) {
                self.events.push(VoiceEvent::ConnectionChanged {
                    peer: peer.clone(),
                    state: NegotiationState::Closed,
                });
            }
        }
        self.last_states = states;
        std::mem::take(&mut self.events)
    }

    pub(crate) fn presence_view(&self) -> PresenceView {
        let view = self
            .presence
            .view(&self.membership, &self.orchestrator.states());
        match (&self.local_id, self.joined) {
            (Some(local), true) => view.with_local(local),
            _ => view,
        }
    }
}
