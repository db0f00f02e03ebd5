//! One `RTCPeerConnection` to one remote member.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxmesh_common::{PeerId, VoiceError};
use voxmesh_voice::media::EncodedFrame;
use voxmesh_voice::{IceCandidate, LocalTrack, PeerSession, SessionDescription, SessionEvents};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::convert;
use crate::engine::RemoteAudioPacket;

const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

pub struct RtcPeerSession {
    peer: PeerId,
    connection: Arc<RTCPeerConnection>,
    sending: AtomicBool,
    receive_transceiver: AtomicBool,
    /// Stops the frame forwarder, the RTCP reader and remote track readers.
    tasks: CancellationToken,
    closed: AtomicBool,
}

impl RtcPeerSession {
    pub(crate) fn new(
        connection: Arc<RTCPeerConnection>,
        events: SessionEvents,
        remote_audio: broadcast::Sender<RemoteAudioPacket>,
    ) -> Self {
        let tasks = CancellationToken::new();
        install_handlers(&connection, &events, remote_audio, tasks.clone());
        Self {
            peer: events.peer().clone(),
            connection,
            sending: AtomicBool::new(false),
            receive_transceiver: AtomicBool::new(false),
            tasks,
            closed: AtomicBool::new(false),
        }
    }

    fn error(&self, reason: impl Into<String>) -> VoiceError {
        convert::negotiation(self.peer.as_str(), reason)
    }

    /// Without a local track an offer would carry no audio section at all.
    async fn ensure_receive_transceiver(&self) -> Result<(), VoiceError> {
        if self.sending.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.receive_transceiver.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        self.connection
            .add_transceiver_from_kind(RTPCodecType::Audio, Some(init))
            .await
            .map_err(|e| self.error(format!("add receive-only transceiver: {e}")))?;
        debug!(peer = %self.peer, "receive-only audio transceiver added");
        Ok(())
    }

    async fn local_sdp(&self) -> Result<String, VoiceError> {
        self.connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| self.error("no local description after setting it"))
    }
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn attach_local_audio(&self, track: LocalTrack) -> Result<(), VoiceError> {
        let LocalTrack {
            id,
            stream_id,
            codec,
            frames,
        } = track;

        let fmtp = if codec.mime_type.eq_ignore_ascii_case("audio/opus") {
            OPUS_FMTP.to_string()
        } else {
            String::new()
        };
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                sdp_fmtp_line: fmtp,
                rtcp_feedback: vec![],
            },
            id,
            stream_id,
        ));

        let sender = self
            .connection
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| self.error(format!("add local audio track: {e}")))?;
        self.sending.store(true, Ordering::Release);

        tokio::spawn(drain_rtcp(sender, self.tasks.clone()));
        tokio::spawn(forward_frames(
            self.peer.clone(),
            rtc_track,
            frames,
            self.tasks.clone(),
        ));
        info!(peer = %self.peer, "local audio attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, VoiceError> {
        self.ensure_receive_transceiver().await?;
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| self.error(format!("create offer: {e}")))?;
        self.connection
            .set_local_description(offer)
            .await
            .map_err(|e| self.error(format!("set local offer: {e}")))?;
        Ok(SessionDescription::offer(self.local_sdp().await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| self.error(format!("create answer: {e}")))?;
        self.connection
            .set_local_description(answer)
            .await
            .map_err(|e| self.error(format!("set local answer: {e}")))?;
        Ok(SessionDescription::answer(self.local_sdp().await?))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), VoiceError> {
        let description = convert::to_rtc_description(self.peer.as_str(), description)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| self.error(format!("set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), VoiceError> {
        self.connection
            .add_ice_candidate(convert::to_rtc_candidate(candidate))
            .await
            .map_err(|e| self.error(format!("add remote candidate: {e}")))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tasks.cancel();
        if let Err(e) = self.connection.close().await {
            warn!(peer = %self.peer, error = %e, "error closing peer connection");
        }
        debug!(peer = %self.peer, "rtc session closed");
    }
}

impl Drop for RtcPeerSession {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}

// ---------------------------------------------------------------------------
// Connection callbacks
// ---------------------------------------------------------------------------

fn install_handlers(
    connection: &RTCPeerConnection,
    events: &SessionEvents,
    remote_audio: broadcast::Sender<RemoteAudioPacket>,
    tasks: CancellationToken,
) {
    let candidate_events = events.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.local_candidate(convert::from_rtc_candidate(init)),
                Err(e) => warn!(peer = %events.peer(), error = %e, "unserializable local candidate"),
            }
        })
    }));

    let state_events = events.clone();
    connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            debug!(peer = %events.peer(), %state, "peer connection state");
            if let Some(state) = convert::connection_state(state) {
                events.connection_state(state);
            }
        })
    }));

    let peer = events.peer().clone();
    connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let peer = peer.clone();
            let remote_audio = remote_audio.clone();
            let tasks = tasks.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    debug!(peer = %peer, "ignoring non-audio remote track");
                    return;
                }
                info!(peer = %peer, ssrc = track.ssrc(), "remote audio track");
                tokio::spawn(read_remote_audio(peer, track, remote_audio, tasks));
            })
        },
    ));
}

// ---------------------------------------------------------------------------
// Media tasks
// ---------------------------------------------------------------------------

async fn forward_frames(
    peer: PeerId,
    track: Arc<TrackLocalStaticSample>,
    mut frames: broadcast::Receiver<EncodedFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(peer = %peer, skipped, "local audio forwarder lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        let sample = Sample {
            data: frame.data,
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!(peer = %peer, error = %e, "failed to write audio sample");
        }
    }
    debug!(peer = %peer, "local audio forwarder stopped");
}

/// Interceptors only run while RTCP is being read.
async fn drain_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = sender.read(&mut buf) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_remote_audio(
    peer: PeerId,
    track: Arc<TrackRemote>,
    sink: broadcast::Sender<RemoteAudioPacket>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "remote audio track ended");
                    break;
                }
            },
        };
        // No subscribers is fine.
        let _ = sink.send(RemoteAudioPacket {
            peer: peer.clone(),
            payload: packet.payload,
            sequence_number: packet.header.sequence_number,
            timestamp: packet.header.timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use voxmesh_voice::media::{LocalAudioStream, PushAudioStream};
    use voxmesh_voice::PeerEngine;

    use crate::RtcPeerEngine;

    use super::*;

    const PEER: &str = "bbbbbbbb-0000-4000-8000-000000002222";

    async fn session(engine: &RtcPeerEngine) -> Arc<dyn PeerSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let events = SessionEvents::new(PeerId::normalize(PEER), 1, tx);
        engine.create_session(events, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn offer_with_local_audio_sends_opus() {
        let engine = RtcPeerEngine::new().unwrap();
        let session = session(&engine).await;
        let stream = PushAudioStream::new("mic", 48000, 960);

        session.attach_local_audio(stream.clone_track()).await.unwrap();
        let offer = session.create_offer().await.unwrap();

        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_ascii_lowercase().contains("opus"));
        assert!(offer.sdp.contains("a=sendrecv"));
        session.close().await;
    }

    #[tokio::test]
    async fn offer_without_local_audio_is_receive_only() {
        let engine = RtcPeerEngine::new().unwrap();
        let session = session(&engine).await;

        let offer = session.create_offer().await.unwrap();

        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("a=recvonly"));
        session.close().await;
    }

    #[tokio::test]
    async fn two_sessions_complete_offer_answer() {
        let engine = RtcPeerEngine::new().unwrap();
        let caller = session(&engine).await;
        let callee = session(&engine).await;
        let stream = PushAudioStream::new("mic", 48000, 960);
        caller.attach_local_audio(stream.clone_track()).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        caller.set_remote_description(answer.clone()).await.unwrap();

        assert!(answer.sdp.contains("m=audio"));
        assert!(answer.sdp.contains("a=recvonly"));
        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn garbage_remote_description_is_a_negotiation_error() {
        let engine = RtcPeerEngine::new().unwrap();
        let session = session(&engine).await;

        let err = session
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();

        assert!(matches!(err, VoiceError::Negotiation { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_forwarding() {
        let engine = RtcPeerEngine::new().unwrap();
        let session = session(&engine).await;
        let stream = PushAudioStream::new("mic", 48000, 960);
        session.attach_local_audio(stream.clone_track()).await.unwrap();

        session.close().await;
        session.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let delivered = stream.push_frame(EncodedFrame {
            data: bytes::Bytes::from_static(&[0xf8, 0xff, 0xfe]),
            duration: Duration::from_millis(20),
        });
        assert_eq!(delivered, 0);
    }
}
