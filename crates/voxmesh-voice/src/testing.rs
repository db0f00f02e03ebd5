//! Test doubles shared by the unit tests: a scripted peer engine, a
//! recording signal sink, and an in-process relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use voxmesh_common::{PeerId, VoiceError};

use crate::engine::{PeerEngine, PeerSession, SessionEvents};
use crate::ice::IceServer;
use crate::media::{
    AudioConstraints, LocalAudioStream, LocalTrack, MediaCapability, PushAudioStream,
};
use crate::protocol::{IceCandidate, OutboundMessage, SdpKind, SessionDescription, SignalPayload};
use crate::signaling::SignalSink;

pub(crate) const P1: &str = "aaaaaaaa-0000-4000-8000-000000001111";
pub(crate) const P2: &str = "bbbbbbbb-0000-4000-8000-000000002222";
pub(crate) const P3: &str = "cccccccc-0000-4000-8000-000000003333";

pub(crate) fn peer(raw: &str) -> PeerId {
    PeerId::normalize(raw)
}

/// Let spawned tasks run until they park.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Create,
    AttachAudio,
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
struct EngineLog {
    calls: Vec<(PeerId, Call)>,
    events: Vec<SessionEvents>,
    fail_create: bool,
    fail_remote: bool,
}

/// Engine that records every call and answers instantly.
#[derive(Default, Clone)]
pub(crate) struct FakeEngine {
    log: Arc<Mutex<EngineLog>>,
}

impl FakeEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls_for(&self, peer: &PeerId) -> Vec<Call> {
        self.log
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub(crate) fn sessions_created(&self) -> usize {
        self.log
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(_, call)| *call == Call::Create)
            .count()
    }

    pub(crate) fn fail_create(&self) {
        self.log.lock().unwrap().fail_create = true;
    }

    pub(crate) fn fail_remote_description(&self) {
        self.log.lock().unwrap().fail_remote = true;
    }

    /// Event handle of the latest session created for `peer`.
    pub(crate) fn events_for(&self, peer: &PeerId) -> Option<SessionEvents> {
        self.log
            .lock()
            .unwrap()
            .events
            .iter()
            .rev()
            .find(|events| events.peer() == peer)
            .cloned()
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn create_session(
        &self,
        events: SessionEvents,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerSession>, VoiceError> {
        let peer = events.peer().clone();
        let mut log = self.log.lock().unwrap();
        log.calls.push((peer.clone(), Call::Create));
        if log.fail_create {
            return Err(VoiceError::Negotiation {
                peer: peer.to_string(),
                reason: "engine unavailable".into(),
            });
        }
        log.events.push(events.clone());
        Ok(Arc::new(FakeSession {
            peer,
            events,
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeSession {
    peer: PeerId,
    events: SessionEvents,
    log: Arc<Mutex<EngineLog>>,
}

impl FakeSession {
    fn record(&self, call: Call) {
        self.log.lock().unwrap().calls.push((self.peer.clone(), call));
    }
}

#[async_trait]
impl PeerSession for FakeSession {
    async fn attach_local_audio(&self, _track: LocalTrack) -> Result<(), VoiceError> {
        self.record(Call::AttachAudio);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, VoiceError> {
        self.record(Call::CreateOffer);
        self.events
            .local_candidate(IceCandidate::new("candidate:local 1 udp 1 10.0.0.1 5000 typ host"));
        Ok(SessionDescription::offer("v=0 local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer("v=0 local-answer"))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), VoiceError> {
        self.record(Call::SetRemote(description.kind));
        if self.log.lock().unwrap().fail_remote {
            return Err(VoiceError::Negotiation {
                peer: self.peer.to_string(),
                reason: "bad sdp".into(),
            });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), VoiceError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.record(Call::Close);
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Grants a shared push-fed stream.
pub(crate) struct GrantedMedia(pub(crate) Arc<PushAudioStream>);

impl GrantedMedia {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(PushAudioStream::new("test-mic", 48000, 1024)))
    }
}

#[async_trait]
impl MediaCapability for GrantedMedia {
    async fn acquire(
        &self,
        _constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, VoiceError> {
        let stream: Arc<dyn LocalAudioStream> = self.0.clone();
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Sink that keeps every message it is asked to send.
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<OutboundMessage>>,
    connected: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        })
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn signals_to(&self, peer: &PeerId) -> Vec<SignalPayload> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Signal { target, signal } if target == *peer => Some(signal),
                _ => None,
            })
            .collect()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, message: &OutboundMessage) -> Result<(), VoiceError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(VoiceError::NotConnected);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// A WebSocket server on a loopback port standing in for the relay.
pub(crate) struct MockRelay {
    listener: TcpListener,
    url: String,
}

impl MockRelay {
    pub(crate) async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/voice", listener.local_addr().unwrap());
        Self { listener, url }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) async fn accept(&self) -> RelayConn {
        self.try_accept(Duration::from_secs(5))
            .await
            .expect("client never connected")
    }

    pub(crate) async fn try_accept(&self, within: Duration) -> Option<RelayConn> {
        let (stream, _) = tokio::time::timeout(within, self.listener.accept())
            .await
            .ok()?
            .unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        Some(RelayConn { ws })
    }
}

pub(crate) struct RelayConn {
    ws: WebSocketStream<TcpStream>,
}

impl RelayConn {
    /// Next text frame as JSON.
    pub(crate) async fn recv_json(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a client frame");
            match frame {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    pub(crate) async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub(crate) async fn expect_auth(&mut self) -> Value {
        let frame = self.recv_json().await;
        assert_eq!(frame["type"], "auth", "first frame must be auth: {frame}");
        frame
    }

    /// Consume the auth frame and accept it, reporting `user_id`.
    pub(crate) async fn accept_auth(&mut self, user_id: &str) -> Value {
        let auth = self.expect_auth().await;
        self.send_json(json!({"type": "auth-response", "success": true, "userId": user_id}))
            .await;
        auth
    }

    /// Skip frames until the client closes; returns its close code.
    pub(crate) async fn close_code(&mut self) -> Option<u16> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for close");
            match frame {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    pub(crate) async fn close_with(&mut self, code: CloseCode) {
        let frame = CloseFrame {
            code,
            reason: "bye".into(),
        };
        let _ = self.ws.send(Message::Close(Some(frame))).await;
    }
}
