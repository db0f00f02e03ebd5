//! Full-mesh peer connection orchestration.
//!
//! One [`ConnectionRecord`] per remote peer. The orchestrator is a plain
//! state machine driven by the session task: membership changes and
//! inbound signals come in through `on_*` methods, asynchronous engine work
//! runs in a per-peer worker, and the results come back through
//! [`handle_feedback`](ConnectionOrchestrator::handle_feedback). Every
//! handler reads current state, so late events for removed or replaced
//! records are recognised by their generation and dropped.

mod record;
mod worker;


pub use record::{ConnectionRecord, NegotiationState, RemoteDescription, Role};
pub use worker::{Feedback, FeedbackReceiver, StepOutcome, StepResult};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use voxmesh_common::PeerId;

use crate::engine::{EngineEvent, PeerConnectionState, PeerEngine};
use crate::ice::{IceServer, FALLBACK_STUN_URL};
use crate::media::LocalAudioStream;
use crate::membership::MembershipSnapshot;
use crate::protocol::{IceCandidate, SessionDescription, SignalPayload};
use crate::signaling::SignalSink;
use worker::{Op, WorkerFactory};

/// Where local audio acquisition stands.
enum LocalMedia {
    /// Not settled yet. Joins are deferred and offers held.
    Pending,
    Ready(Arc<dyn LocalAudioStream>),
    /// Denied or absent. Receive-only from here on.
    Unavailable,
}

pub struct ConnectionOrchestrator {
    local_id: Option<PeerId>,
    sink: Arc<dyn SignalSink>,
    workers: WorkerFactory,
    ice_servers: Vec<IceServer>,
    records: BTreeMap<PeerId, ConnectionRecord>,
    media: LocalMedia,
    held_offers: BTreeMap<PeerId, SessionDescription>,
    deferred_joins: BTreeSet<PeerId>,
    /// Peers that left and have not rejoined. Stray candidates from them
    /// must not open a new record.
    departed: BTreeSet<PeerId>,
    next_generation: u64,
    last_reconciled: Option<u64>,
}

impl ConnectionOrchestrator {
    pub fn new(engine: Arc<dyn PeerEngine>, sink: Arc<dyn SignalSink>) -> (Self, FeedbackReceiver) {
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            local_id: None,
            sink,
            workers: WorkerFactory {
                engine,
                steps: steps_tx,
                events: events_tx,
            },
            ice_servers: vec![IceServer::stun(FALLBACK_STUN_URL)],
            records: BTreeMap::new(),
            media: LocalMedia::Pending,
            held_offers: BTreeMap::new(),
            deferred_joins: BTreeSet::new(),
            departed: BTreeSet::new(),
            next_generation: 0,
            last_reconciled: None,
        };
        let feedback = FeedbackReceiver {
            steps: steps_rx,
            engine: events_rx,
        };
        (orchestrator, feedback)
    }

    pub fn set_local_id(&mut self, id: PeerId) {
        if id.is_valid() {
            self.local_id = Some(id);
        }
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    /// Servers used for connections created from now on.
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
    }

    pub fn has_local_media(&self) -> bool {
        matches!(self.media, LocalMedia::Ready(_))
    }

    pub fn record(&self, peer: &PeerId) -> Option<&ConnectionRecord> {
        self.records.get(peer)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `peer` left the channel and has not come back.
    pub fn has_departed(&self, peer: &PeerId) -> bool {
        self.departed.contains(peer)
    }

    pub fn states(&self) -> BTreeMap<PeerId, NegotiationState> {
        self.records
            .iter()
            .map(|(peer, record)| (peer.clone(), record.state))
            .collect()
    }

    // -- Membership ---------------------------------------------------------

    /// A peer entered the channel: open an initiator connection to it.
    pub fn on_peer_joined(&mut self, peer: &PeerId) {
        if !peer.is_valid() || self.is_self(peer) {
            return;
        }
        self.departed.remove(peer);
        if self.records.contains_key(peer) {
            debug!(peer = %peer, "connection already exists");
            return;
        }
        let track = match &self.media {
            LocalMedia::Pending => {
                debug!(peer = %peer, "local media not settled; deferring connection");
                self.deferred_joins.insert(peer.clone());
                return;
            }
            LocalMedia::Unavailable => {
                debug!(peer = %peer, "no local media; waiting for the peer to offer");
                return;
            }
            LocalMedia::Ready(stream) => stream.clone_track(),
        };

        self.insert_record(peer, Role::Initiator);
        info!(peer = %peer, "initiating connection");
        self.dispatch(peer, Op::Offer { local: Some(track) });
    }

    /// Close and forget the peer's connection. Returns whether one existed.
    pub fn on_peer_left(&mut self, peer: &PeerId) -> bool {
        self.held_offers.remove(peer);
        self.deferred_joins.remove(peer);
        if peer.is_valid() && !self.is_self(peer) {
            self.departed.insert(peer.clone());
        }
        self.teardown(peer, "peer left")
    }

    /// Align connections with an authoritative member list. Snapshots older
    /// than the last one applied are ignored.
    pub fn reconcile(&mut self, snapshot: &MembershipSnapshot) {
        if let Some(last) = self.last_reconciled {
            if snapshot.version < last {
                debug!(version = snapshot.version, last, "discarding stale reconciliation");
                return;
            }
        }
        self.last_reconciled = Some(snapshot.version);

        let departed: Vec<PeerId> = self
            .records
            .keys()
            .chain(self.deferred_joins.iter())
            .filter(|peer| !snapshot.members.contains(*peer))
            .cloned()
            .collect();
        for peer in departed {
            self.on_peer_left(&peer);
        }

        for peer in &snapshot.members {
            if !self.records.contains_key(peer) {
                self.on_peer_joined(peer);
            }
        }
    }

    // -- Signals ------------------------------------------------------------

    pub fn on_signal(&mut self, from: &PeerId, signal: SignalPayload) {
        if !from.is_valid() || self.is_self(from) {
            return;
        }
        match signal {
            SignalPayload::Offer(offer) => self.on_offer(from, offer),
            SignalPayload::Answer(answer) => self.on_answer(from, answer),
            SignalPayload::Candidate(candidate) => self.on_remote_candidate(from, candidate),
        }
    }

    /// A signal from `from` could not be parsed. Only that peer is affected.
    pub fn on_malformed_signal(&mut self, from: &PeerId, reason: &str) {
        warn!(peer = %from, reason, "malformed signal");
        self.held_offers.remove(from);
        self.teardown(from, "malformed signal");
    }

    fn on_offer(&mut self, from: &PeerId, offer: SessionDescription) {
        let existing = self
            .records
            .get(from)
            .map(|record| (record.role, record.state, record.remote));

        match existing {
            None => {
                // An offer is a fresh negotiation, even from a peer we saw leave.
                self.departed.remove(from);
                self.insert_record(from, Role::Responder);
            }
            Some((Role::Initiator, _, RemoteDescription::Unset)) => {
                if !self.yields_to(from) {
                    info!(peer = %from, "offer collision; keeping our offer");
                    return;
                }
                info!(peer = %from, "offer collision; answering theirs");
                let carried = self
                    .records
                    .get_mut(from)
                    .map(ConnectionRecord::take_pending)
                    .unwrap_or_default();
                self.insert_record(from, Role::Responder);
                if let Some(record) = self.records.get_mut(from) {
                    record.pending_candidates.extend(carried);
                }
            }
            Some((Role::Responder, NegotiationState::New, RemoteDescription::Unset)) => {}
            Some((Role::Responder, NegotiationState::AnswerPending, _)) => {
                debug!(peer = %from, "duplicate offer while answering");
                return;
            }
            Some((_, state, _)) => {
                info!(peer = %from, %state, "renegotiation; replacing connection");
                self.insert_record(from, Role::Responder);
            }
        }

        if matches!(self.media, LocalMedia::Pending) {
            debug!(peer = %from, "holding offer until local media settles");
            self.held_offers.insert(from.clone(), offer);
            return;
        }
        self.answer(from, offer);
    }

    fn answer(&mut self, peer: &PeerId, offer: SessionDescription) {
        let local = match &self.media {
            LocalMedia::Ready(stream) => Some(stream.clone_track()),
            _ => None,
        };
        let Some(record) = self.records.get_mut(peer) else {
            return;
        };
        record.state = NegotiationState::AnswerPending;
        record.remote = RemoteDescription::Applying;
        record.receive_only = local.is_none();
        let candidates = record.take_pending();

        info!(peer = %peer, receive_only = local.is_none(), "answering offer");
        self.dispatch(
            peer,
            Op::Answer {
                offer,
                local,
                candidates,
            },
        );
    }

    fn on_answer(&mut self, from: &PeerId, answer: SessionDescription) {
        let Some(record) = self.records.get_mut(from) else {
            warn!(peer = %from, "answer from a peer with no connection");
            return;
        };
        let expected = record.role == Role::Initiator
            && record.state == NegotiationState::OfferSent
            && record.remote == RemoteDescription::Unset;
        if !expected {
            warn!(
                peer = %from,
                role = ?record.role,
                state = %record.state,
                "answer does not match negotiation state"
            );
            self.teardown(from, "unexpected answer");
            return;
        }

        record.remote = RemoteDescription::Applying;
        let candidates = record.take_pending();
        self.dispatch(from, Op::ApplyAnswer { answer, candidates });
    }

    fn on_remote_candidate(&mut self, from: &PeerId, candidate: IceCandidate) {
        if !self.records.contains_key(from) {
            if self.departed.contains(from) {
                debug!(peer = %from, "candidate from a departed peer; ignoring");
                return;
            }
            debug!(peer = %from, "candidate before offer; opening responder record");
            self.insert_record(from, Role::Responder);
        }
        let Some(record) = self.records.get_mut(from) else {
            return;
        };
        match record.remote {
            RemoteDescription::Unset => {
                record.pending_candidates.push_back(candidate);
                debug!(
                    peer = %from,
                    buffered = record.pending_candidates.len(),
                    "buffered remote candidate"
                );
            }
            RemoteDescription::Applying | RemoteDescription::Applied => {
                self.dispatch(from, Op::AddCandidate(candidate));
            }
        }
    }

    // -- Worker feedback ----------------------------------------------------

    pub fn handle_feedback(&mut self, feedback: Feedback) {
        match feedback {
            Feedback::Step(step) => self.on_step(step),
            Feedback::Engine(event) => self.on_engine_event(event),
        }
    }

    fn on_step(&mut self, step: StepResult) {
        let peer = step.peer;
        let Some(record) = current(&mut self.records, &peer, step.generation) else {
            debug!(peer = %peer, generation = step.generation, "dropping stale step result");
            return;
        };

        let failure = match step.outcome {
            StepOutcome::OfferReady(offer) => {
                if self.sink.send_signal(&peer, SignalPayload::Offer(offer)) {
                    record.state = NegotiationState::OfferSent;
                    record.local_sent = true;
                    None
                } else {
                    Some("offer could not be sent".to_string())
                }
            }
            StepOutcome::AnswerReady(answer) => {
                if self.sink.send_signal(&peer, SignalPayload::Answer(answer)) {
                    record.remote = RemoteDescription::Applied;
                    record.state = NegotiationState::Connected;
                    record.local_sent = true;
                    None
                } else {
                    Some("answer could not be sent".to_string())
                }
            }
            StepOutcome::RemoteApplied => {
                record.remote = RemoteDescription::Applied;
                record.state = NegotiationState::Connected;
                None
            }
            StepOutcome::Failed(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            warn!(peer = %peer, reason = %reason, "negotiation failed");
            self.teardown(&peer, "negotiation failed");
            return;
        }

        if record.local_sent {
            for candidate in record.held_local.drain(..) {
                self.sink
                    .send_signal(&peer, SignalPayload::Candidate(candidate));
            }
        }
        if record.state == NegotiationState::Connected {
            info!(peer = %peer, role = ?record.role, "negotiation complete");
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate {
                peer,
                generation,
                candidate,
            } => {
                let Some(record) = current(&mut self.records, &peer, generation) else {
                    return;
                };
                if record.local_sent {
                    self.sink
                        .send_signal(&peer, SignalPayload::Candidate(candidate));
                } else {
                    record.held_local.push(candidate);
                }
            }
            EngineEvent::ConnectionState {
                peer,
                generation,
                state,
            } => {
                let Some(record) = current(&mut self.records, &peer, generation) else {
                    return;
                };
                record.link = Some(state);
                debug!(peer = %peer, ?state, "peer transport state");
                if state == PeerConnectionState::Failed {
                    warn!(peer = %peer, "peer transport failed");
                    self.teardown(&peer, "transport failed");
                }
            }
        }
    }

    // -- Local media --------------------------------------------------------

    /// Local audio is available. Answers held offers and opens deferred
    /// connections.
    pub fn attach_local_media(&mut self, stream: Arc<dyn LocalAudioStream>) {
        info!(stream = stream.id(), "local media attached");
        self.media = LocalMedia::Ready(stream);
        self.settle_media();
    }

    /// Local audio was denied. Held offers are answered receive-only.
    pub fn mark_media_unavailable(&mut self) {
        info!("local media unavailable; continuing receive-only");
        self.media = LocalMedia::Unavailable;
        self.settle_media();
    }

    fn settle_media(&mut self) {
        let held = std::mem::take(&mut self.held_offers);
        for (peer, offer) in held {
            if self.records.contains_key(&peer) {
                self.answer(&peer, offer);
            }
        }
        let deferred = std::mem::take(&mut self.deferred_joins);
        for peer in deferred {
            self.on_peer_joined(&peer);
        }
    }

    /// Stop the local stream. Safe to call more than once.
    pub fn release_local_media(&mut self) {
        if let LocalMedia::Ready(stream) = std::mem::replace(&mut self.media, LocalMedia::Pending)
        {
            stream.stop();
        }
    }

    /// Close every connection, e.g. after the control channel dropped.
    pub fn close_all(&mut self) -> usize {
        let closed = self.records.len();
        self.records.clear();
        self.held_offers.clear();
        self.deferred_joins.clear();
        self.departed.clear();
        self.last_reconciled = None;
        if closed > 0 {
            info!(closed, "closed all peer connections");
        }
        closed
    }

    // -- Internals ----------------------------------------------------------

    fn is_self(&self, peer: &PeerId) -> bool {
        self.local_id.as_ref() == Some(peer)
    }

    /// Lower id yields in an offer collision. Without a known local id we
    /// always yield.
    fn yields_to(&self, remote: &PeerId) -> bool {
        match &self.local_id {
            Some(local) => local < remote,
            None => true,
        }
    }

    /// Replace any existing record for `peer` with a fresh one.
    fn insert_record(&mut self, peer: &PeerId, role: Role) {
        self.teardown(peer, "replaced");
        self.next_generation += 1;
        let record = ConnectionRecord::new(peer.clone(), role, self.next_generation);
        self.records.insert(peer.clone(), record);
    }

    fn dispatch(&mut self, peer: &PeerId, op: Op) {
        let Some(record) = self.records.get_mut(peer) else {
            return;
        };
        if record.worker.is_none() {
            record.worker = Some(self.workers.spawn(
                peer.clone(),
                record.generation,
                self.ice_servers.clone(),
            ));
        }
        if let Some(worker) = &record.worker {
            worker.submit(op);
        }
    }

    fn teardown(&mut self, peer: &PeerId, reason: &str) -> bool {
        match self.records.remove(peer) {
            Some(record) => {
                info!(peer = %peer, role = ?record.role, reason, "closing connection");
                true
            }
            None => false,
        }
    }
}

/// Record for `peer` if it is still the given generation.
fn current<'a>(
    records: &'a mut BTreeMap<PeerId, ConnectionRecord>,
    peer: &PeerId,
    generation: u64,
) -> Option<&'a mut ConnectionRecord> {
    records
        .get_mut(peer)
        .filter(|record| record.generation == generation)
}
