//! The session task: one loop, every input handled in order.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use voxmesh_common::PeerId;

use super::state::{ChannelState, Phase, Prepared};
use super::{Command, VoiceDeps, VoiceEvent};
use crate::activity::SpeakingTransition;
use crate::ice::resolve_ice_servers;
use crate::media::AudioConstraints;
use crate::orchestrator::FeedbackReceiver;
use crate::presence::PresenceView;
use crate::signaling::{SignalingChannel, Subscription};

pub(super) struct Runner {
    pub(super) state: ChannelState,
    pub(super) signaling: SignalingChannel,
    pub(super) subscription: Subscription,
    pub(super) feedback: FeedbackReceiver,
    pub(super) transitions: mpsc::UnboundedReceiver<SpeakingTransition>,
    pub(super) commands: mpsc::UnboundedReceiver<Command>,
    pub(super) events: mpsc::Sender<VoiceEvent>,
    pub(super) presence: watch::Sender<PresenceView>,
    pub(super) local_id: watch::Sender<Option<PeerId>>,
    pub(super) deps: VoiceDeps,
    pub(super) audio: AudioConstraints,
    pub(super) fallback_stun: String,
}

impl Runner {
    pub(super) async fn run(mut self) {
        let (prepared_tx, mut prepared_rx) = mpsc::unbounded_channel();
        let mut pending_ack = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Leave(ack)) => {
                        self.state.teardown();
                        pending_ack = Some(ack);
                    }
                    // Handle dropped without leaving.
                    None => self.state.teardown(),
                },
                event = self.subscription.recv() => match event {
                    Some(event) => self.state.on_signaling_event(event),
                    None => self.state.teardown(),
                },
                Some(feedback) = self.feedback.recv() => self.state.handle_feedback(feedback),
                Some(transition) = self.transitions.recv() => {
                    self.state.on_local_speaking(transition.is_speaking);
                }
                Some(prepared) = prepared_rx.recv() => self.state.on_prepared(prepared),
            }

            if self.state.take_prepare_request() {
                self.prepare(prepared_tx.clone());
            }
            self.flush();

            if self.state.phase() == Phase::Closed {
                break;
            }
        }

        self.signaling.close();
        self.flush();
        if let Some(ack) = pending_ack {
            let _ = ack.send(());
        }
        debug!("voice session task finished");
    }

    /// Acquire local audio and resolve ICE servers in the background.
    fn prepare(&self, done: mpsc::UnboundedSender<Prepared>) {
        let media = Arc::clone(&self.deps.media);
        let ice = self.deps.ice.clone();
        let constraints = self.audio.clone();
        let fallback = self.fallback_stun.clone();

        tokio::spawn(async move {
            let (media, ice_servers) = tokio::join!(
                media.acquire(&constraints),
                resolve_ice_servers(ice.as_deref(), &fallback),
            );
            // Session already gone: release the device ourselves.
            if let Err(mpsc::error::SendError(late)) = done.send(Prepared { media, ice_servers }) {
                if let Ok(stream) = late.media {
                    stream.stop();
                }
            }
        });
    }

    fn flush(&mut self) {
        for event in self.state.drain_events() {
            if let Err(e) = self.events.try_send(event) {
                warn!(error = %e, "voice event dropped");
            }
        }

        let view = self.state.presence_view();
        self.presence.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });

        let local = self.state.local_id().cloned();
        self.local_id.send_if_modified(|current| {
            if *current == local {
                return false;
            }
            *current = local;
            true
        });
    }
}
