//! One joined voice channel.
//!
//! [`VoiceSession::join`] opens the signaling channel and spawns a single
//! task that owns membership, the orchestrator, the activity monitor and
//! presence, and reacts to every event in order. The handle talks to it
//! through commands and reads presence through a watch channel.

mod runner;
mod state;


use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use voxmesh_common::{PeerId, VoiceError};

use crate::activity::{ActivityConfig, VoiceActivityMonitor};
use crate::engine::PeerEngine;
use crate::ice::{IceServerProvider, FALLBACK_STUN_URL};
use crate::media::{AudioConstraints, MediaCapability};
use crate::orchestrator::{ConnectionOrchestrator, NegotiationState};
use crate::presence::PresenceView;
use crate::signaling::{SessionContext, SignalSink, SignalingChannel, SignalingConfig, TransportState};
use runner::Runner;
use state::ChannelState;

/// Platform collaborators for a session.
#[derive(Clone)]
pub struct VoiceDeps {
    pub engine: Arc<dyn PeerEngine>,
    pub media: Arc<dyn MediaCapability>,
    /// `None` uses only the fallback STUN server.
    pub ice: Option<Arc<dyn IceServerProvider>>,
}

#[derive(Debug, Clone)]
pub struct VoiceSessionConfig {
    pub signaling: SignalingConfig,
    /// `None` disables local speech detection.
    pub activity: Option<ActivityConfig>,
    pub audio: AudioConstraints,
    pub fallback_stun: String,
}

impl Default for VoiceSessionConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            activity: Some(ActivityConfig::default()),
            audio: AudioConstraints::default(),
            fallback_stun: FALLBACK_STUN_URL.into(),
        }
    }
}

/// Events for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    StatusChanged(TransportState),
    Authenticated { local_id: Option<PeerId> },
    MemberJoined(PeerId),
    MemberLeft(PeerId),
    SpeakingChanged { peer: PeerId, is_speaking: bool },
    /// `Closed` when the connection record went away.
    ConnectionChanged { peer: PeerId, state: NegotiationState },
    /// Transport exhaustion, auth rejection, or media denial.
    Error(VoiceError),
}

pub(crate) enum Command {
    Leave(oneshot::Sender<()>),
}

/// Handle to a joined voice channel. Dropping it leaves the channel.
pub struct VoiceSession {
    signaling: SignalingChannel,
    commands: mpsc::UnboundedSender<Command>,
    presence: watch::Receiver<PresenceView>,
    local_id: watch::Receiver<Option<PeerId>>,
    level: Option<watch::Receiver<u8>>,
}

impl VoiceSession {
    /// Connect to the relay and start the session task. Events arrive on the
    /// returned receiver until the session ends.
    pub fn join(
        config: VoiceSessionConfig,
        ctx: SessionContext,
        deps: VoiceDeps,
    ) -> (Self, mpsc::Receiver<VoiceEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        info!(channel_id = ctx.channel_id(), "joining voice channel");
        let (signaling, subscription) = SignalingChannel::open(config.signaling.clone(), ctx.clone());
        let sink: Arc<dyn SignalSink> = Arc::new(signaling.clone());

        let (orchestrator, feedback) =
            ConnectionOrchestrator::new(Arc::clone(&deps.engine), Arc::clone(&sink));
        let (transition_tx, transition_rx) = mpsc::unbounded_channel();
        let monitor = config
            .activity
            .clone()
            .map(|activity| VoiceActivityMonitor::new(activity, transition_tx));
        let level = monitor.as_ref().map(VoiceActivityMonitor::level);

        let state = ChannelState::new(sink, orchestrator, monitor, ctx.local_peer().cloned());
        let (presence_tx, presence_rx) = watch::channel(PresenceView::default());
        let (local_tx, local_rx) = watch::channel(ctx.local_peer().cloned());

        let runner = Runner {
            state,
            signaling: signaling.clone(),
            subscription,
            feedback,
            transitions: transition_rx,
            commands: command_rx,
            events: event_tx,
            presence: presence_tx,
            local_id: local_tx,
            deps,
            audio: config.audio,
            fallback_stun: config.fallback_stun,
        };
        tokio::spawn(runner.run());

        let session = Self {
            signaling,
            commands: command_tx,
            presence: presence_rx,
            local_id: local_rx,
            level,
        };
        (session, event_rx)
    }

    /// Leave the channel: stop activity detection, close every peer
    /// connection, then close the signaling channel. Safe to call repeatedly.
    pub async fn leave(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Leave(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        self.signaling.close();
        self.signaling.closed().await;
    }

    pub fn presence(&self) -> PresenceView {
        self.presence.borrow().clone()
    }

    pub fn watch_presence(&self) -> watch::Receiver<PresenceView> {
        self.presence.clone()
    }

    pub fn transport_state(&self) -> TransportState {
        self.signaling.state()
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id.borrow().clone()
    }

    /// Local 0-100 input level, when activity detection is enabled.
    pub fn input_level(&self) -> Option<watch::Receiver<u8>> {
        self.level.clone()
    }
}
