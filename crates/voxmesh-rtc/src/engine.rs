//! Peer-connection factory backed by `webrtc`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info};
use voxmesh_common::{PeerId, VoiceError};
use voxmesh_voice::{IceServer, PeerEngine, PeerSession, SessionEvents};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::convert;
use crate::session::RtcPeerSession;

/// Buffered remote packets per subscriber before the slowest one lags.
const REMOTE_AUDIO_BUFFER: usize = 512;

/// One RTP payload received from a remote member. Still Opus-encoded.
#[derive(Debug, Clone)]
pub struct RemoteAudioPacket {
    pub peer: PeerId,
    pub payload: Bytes,
    pub sequence_number: u16,
    pub timestamp: u32,
}

/// Builds one [`RtcPeerSession`] per remote member. All sessions share the
/// codec and interceptor setup.
pub struct RtcPeerEngine {
    api: API,
    remote_audio: broadcast::Sender<RemoteAudioPacket>,
}

impl RtcPeerEngine {
    pub fn new() -> Result<Self, VoiceError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| VoiceError::Transport(format!("failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| VoiceError::Transport(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (remote_audio, _) = broadcast::channel(REMOTE_AUDIO_BUFFER);
        Ok(Self { api, remote_audio })
    }

    /// Encoded audio from every connected member, tagged with its sender.
    pub fn remote_audio(&self) -> broadcast::Receiver<RemoteAudioPacket> {
        self.remote_audio.subscribe()
    }
}

#[async_trait]
impl PeerEngine for RtcPeerEngine {
    async fn create_session(
        &self,
        events: SessionEvents,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerSession>, VoiceError> {
        let peer = events.peer().clone();
        let config = RTCConfiguration {
            ice_servers: convert::ice_servers(ice_servers),
            ..Default::default()
        };

        let connection = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| convert::negotiation(peer.as_str(), format!("create peer connection: {e}")))?;
        debug!(peer = %peer, servers = ice_servers.len(), "peer connection created");

        let session = RtcPeerSession::new(Arc::new(connection), events, self.remote_audio.clone());
        info!(peer = %peer, "rtc session ready");
        Ok(Arc::new(session))
    }
}
