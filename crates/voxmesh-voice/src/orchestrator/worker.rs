//! Per-peer negotiation worker.
//!
//! Each connection record owns one worker task that holds the engine
//! session and runs negotiation steps strictly one after another. Results
//! flow back to the orchestrator as [`StepResult`]s tagged with the record
//! generation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voxmesh_common::{PeerId, VoiceError};

use crate::engine::{EngineEvent, PeerEngine, PeerSession, SessionEvents};
use crate::ice::IceServer;
use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SessionDescription};

/// Negotiation steps, executed in submission order.
#[derive(Debug)]
pub(crate) enum Op {
    Offer {
        local: Option<LocalTrack>,
    },
    Answer {
        offer: SessionDescription,
        local: Option<LocalTrack>,
        candidates: Vec<IceCandidate>,
    },
    ApplyAnswer {
        answer: SessionDescription,
        candidates: Vec<IceCandidate>,
    },
    AddCandidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    RemoteApplied,
    Failed(VoiceError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub peer: PeerId,
    pub generation: u64,
    pub outcome: StepOutcome,
}

/// Anything the orchestrator must react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    Step(StepResult),
    Engine(EngineEvent),
}

/// Receiving end of step results and engine events.
pub struct FeedbackReceiver {
    pub(super) steps: mpsc::UnboundedReceiver<StepResult>,
    pub(super) engine: mpsc::UnboundedReceiver<EngineEvent>,
}

impl FeedbackReceiver {
    pub async fn recv(&mut self) -> Option<Feedback> {
        tokio::select! {
            Some(step) = self.steps.recv() => Some(Feedback::Step(step)),
            Some(event) = self.engine.recv() => Some(Feedback::Engine(event)),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Feedback> {
        if let Ok(step) = self.steps.try_recv() {
            return Some(Feedback::Step(step));
        }
        self.engine.try_recv().ok().map(Feedback::Engine)
    }
}

/// Everything needed to start a worker.
pub(super) struct WorkerFactory {
    pub(super) engine: Arc<dyn PeerEngine>,
    pub(super) steps: mpsc::UnboundedSender<StepResult>,
    pub(super) events: mpsc::UnboundedSender<EngineEvent>,
}

impl WorkerFactory {
    pub(super) fn spawn(
        &self,
        peer: PeerId,
        generation: u64,
        ice_servers: Vec<IceServer>,
    ) -> WorkerHandle {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = Worker {
            engine: Arc::clone(&self.engine),
            events: SessionEvents::new(peer.clone(), generation, self.events.clone()),
            steps: self.steps.clone(),
            peer,
            generation,
        };
        tokio::spawn(worker.run(ice_servers, ops_rx, cancel.clone()));
        WorkerHandle { ops: ops_tx, cancel }
    }
}

/// Dropping the handle stops the worker and closes its session.
pub(crate) struct WorkerHandle {
    ops: mpsc::UnboundedSender<Op>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub(super) fn submit(&self, op: Op) {
        if self.ops.send(op).is_err() {
            debug!("negotiation worker already gone");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    engine: Arc<dyn PeerEngine>,
    events: SessionEvents,
    steps: mpsc::UnboundedSender<StepResult>,
    peer: PeerId,
    generation: u64,
}

impl Worker {
    async fn run(
        self,
        ice_servers: Vec<IceServer>,
        mut ops: mpsc::UnboundedReceiver<Op>,
        cancel: CancellationToken,
    ) {
        let created = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.engine.create_session(self.events.clone(), &ice_servers) => result,
        };
        let session = match created {
            Ok(session) => session,
            Err(e) => {
                self.report(StepOutcome::Failed(e));
                return;
            }
        };

        loop {
            let op = tokio::select! {
                _ = cancel.cancelled() => break,
                op = ops.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            if let Err(e) = self.apply(session.as_ref(), op).await {
                self.report(StepOutcome::Failed(e));
                break;
            }
        }

        session.close().await;
        debug!(peer = %self.peer, generation = self.generation, "negotiation worker stopped");
    }

    async fn apply(&self, session: &dyn PeerSession, op: Op) -> Result<(), VoiceError> {
        match op {
            Op::Offer { local } => {
                if let Some(track) = local {
                    session.attach_local_audio(track).await?;
                }
                let offer = session.create_offer().await?;
                self.report(StepOutcome::OfferReady(offer));
            }
            Op::Answer {
                offer,
                local,
                candidates,
            } => {
                session.set_remote_description(offer).await?;
                if let Some(track) = local {
                    session.attach_local_audio(track).await?;
                }
                self.add_candidates(session, candidates).await;
                let answer = session.create_answer().await?;
                self.report(StepOutcome::AnswerReady(answer));
            }
            Op::ApplyAnswer { answer, candidates } => {
                session.set_remote_description(answer).await?;
                self.add_candidates(session, candidates).await;
                self.report(StepOutcome::RemoteApplied);
            }
            Op::AddCandidate(candidate) => {
                self.add_candidates(session, vec![candidate]).await;
            }
        }
        Ok(())
    }

    /// Apply in arrival order. A bad candidate is not fatal to the session.
    async fn add_candidates(&self, session: &dyn PeerSession, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = session.add_ice_candidate(candidate).await {
                warn!(peer = %self.peer, error = %e, "failed to add remote candidate");
            }
        }
    }

    fn report(&self, outcome: StepOutcome) {
        let _ = self.steps.send(StepResult {
            peer: self.peer.clone(),
            generation: self.generation,
            outcome,
        });
    }
}
