//! Public handle for the signaling connection.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use voxmesh_common::{PeerId, VoiceError};

use super::connection::connection_loop;
use super::subscribers::{Subscribers, Subscription};
use super::types::{SessionContext, SignalingConfig, SignalingEvent, SignalingSession, TransportState};
use crate::protocol::{OutboundMessage, SignalPayload};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the handle and the background connection task.
pub(crate) struct Shared {
    session: Mutex<SignalingSession>,
    pub(crate) subscribers: Arc<Subscribers>,
    outbound: mpsc::UnboundedSender<String>,
    room: String,
    /// Cancelled by `close()`; suppresses any further reconnect.
    pub(crate) shutdown: CancellationToken,
    /// Cancelled by the connection task on exit.
    pub(crate) finished: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SignalingSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn snapshot(&self) -> SignalingSession {
        self.lock().clone()
    }

    pub(crate) fn state(&self) -> TransportState {
        self.lock().transport_state
    }

    /// Update the transport state, publishing only actual changes.
    pub(crate) fn set_state(&self, state: TransportState) {
        let changed = {
            let mut session = self.lock();
            let changed = session.transport_state != state;
            session.transport_state = state;
            changed
        };
        if changed {
            debug!(%state, "signaling state changed");
            self.publish(SignalingEvent::StateChanged(state));
        }
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.lock().reconnect_attempt = attempt;
    }

    pub(crate) fn record_error(&self, error: VoiceError) {
        self.lock().last_error = Some(error);
    }

    pub(crate) fn publish(&self, event: SignalingEvent) {
        self.subscribers.publish(event);
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Handle for one voice-channel control connection.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<Shared>,
}

impl SignalingChannel {
    /// Start connecting in the background and return the handle plus a first
    /// subscription that sees every event from the start.
    pub fn open(config: SignalingConfig, ctx: SessionContext) -> (Self, Subscription) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(Subscribers::default());
        let subscription = subscribers.subscribe();

        let shared = Arc::new(Shared {
            session: Mutex::new(SignalingSession::default()),
            subscribers,
            outbound: outbound_tx,
            room: ctx.channel_id().to_string(),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        info!(channel_id = ctx.channel_id(), "opening signaling channel");
        tokio::spawn(connection_loop(
            Arc::clone(&shared),
            config,
            ctx,
            outbound_rx,
        ));

        (Self { shared }, subscription)
    }

    /// Queue a message for the relay. Fails with [`VoiceError::NotConnected`]
    /// unless the session is authenticated and active.
    pub fn send(&self, message: &OutboundMessage) -> Result<(), VoiceError> {
        if self.shared.state() != TransportState::Active {
            return Err(VoiceError::NotConnected);
        }
        let text = message
            .encode(&self.shared.room)
            .map_err(|e| VoiceError::Transport(format!("failed to encode {}: {e}", message.kind())))?;
        self.shared
            .outbound
            .send(text)
            .map_err(|_| VoiceError::NotConnected)
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.subscribers.subscribe()
    }

    pub fn session(&self) -> SignalingSession {
        self.shared.snapshot()
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    /// Shut down without reconnecting. Safe to call any number of times.
    pub fn close(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!(channel_id = %self.shared.room, "closing signaling channel");
            self.shared.shutdown.cancel();
        }
    }

    /// Wait until the background connection task has exited.
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await;
    }
}

/// Outbound path used by the negotiation and activity layers.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), VoiceError>;

    /// Send a negotiation artifact to one peer. Returns whether it was queued.
    fn send_signal(&self, target: &PeerId, signal: SignalPayload) -> bool {
        let message = OutboundMessage::Signal {
            target: target.clone(),
            signal,
        };
        match self.send(&message) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %target, kind = message.kind(), error = %e, "signal not sent");
                false
            }
        }
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, message: &OutboundMessage) -> Result<(), VoiceError> {
        SignalingChannel::send(self, message)
    }
}
