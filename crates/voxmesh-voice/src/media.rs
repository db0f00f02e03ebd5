//! Local audio capture seam.
//!
//! A [`MediaCapability`] hands out one [`LocalAudioStream`] per session. The
//! stream exposes raw samples for activity analysis and encoded frames that
//! each peer connection forwards through its own [`LocalTrack`] clone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::info;
use voxmesh_common::VoiceError;

/// Requested capture settings. Audio only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    /// `"default"` or part of a device name.
    pub device: String,
    pub sample_rate: u32,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            device: "default".into(),
            sample_rate: 48000,
            noise_suppression: true,
        }
    }
}

/// Codec of the encoded frames a stream produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

impl AudioCodec {
    pub fn opus() -> Self {
        Self {
            mime_type: "audio/opus".into(),
            clock_rate: 48000,
            channels: 2,
        }
    }
}

/// One encoded audio frame ready for packetization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// A per-peer view of the local audio track.
#[derive(Debug)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: String,
    pub codec: AudioCodec,
    pub frames: broadcast::Receiver<EncodedFrame>,
}

pub trait LocalAudioStream: Send + Sync {
    fn id(&self) -> &str;

    fn sample_rate(&self) -> u32;

    /// Copy the most recent mono samples into the tail of `buf`'s prefix and
    /// return how many were written (at most `buf.len()`).
    fn read_recent(&self, buf: &mut [f32]) -> usize;

    /// A new receiver of the encoded frames, for one peer connection.
    fn clone_track(&self) -> LocalTrack;

    /// Stop capture. Idempotent; afterwards no samples or frames are produced.
    fn stop(&self);
}

#[async_trait]
pub trait MediaCapability: Send + Sync {
    /// Open a local audio stream, or fail with [`VoiceError::MediaAccess`].
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, VoiceError>;
}

// ---------------------------------------------------------------------------
// No capture
// ---------------------------------------------------------------------------

/// Capability for hosts without a microphone. Sessions using it join
/// receive-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCaptureDevice;

#[async_trait]
impl MediaCapability for NoCaptureDevice {
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, VoiceError> {
        Err(VoiceError::MediaAccess(format!(
            "no capture device available for {:?}",
            constraints.device
        )))
    }
}

// ---------------------------------------------------------------------------
// Push-fed stream
// ---------------------------------------------------------------------------

/// A [`LocalAudioStream`] fed by the host: push raw samples for analysis and
/// encoded frames for transport.
pub struct PushAudioStream {
    id: String,
    sample_rate: u32,
    codec: AudioCodec,
    capacity: usize,
    samples: Mutex<VecDeque<f32>>,
    frames: broadcast::Sender<EncodedFrame>,
    stopped: AtomicBool,
}

impl PushAudioStream {
    /// `capacity` bounds how many recent samples are retained.
    pub fn new(id: impl Into<String>, sample_rate: u32, capacity: usize) -> Arc<Self> {
        let (frames, _) = broadcast::channel(64);
        Arc::new(Self {
            id: id.into(),
            sample_rate,
            codec: AudioCodec::opus(),
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            frames,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn push_samples(&self, samples: &[f32]) {
        if self.is_stopped() {
            return;
        }
        let mut buf = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        buf.extend(samples.iter().copied());
        let excess = buf.len().saturating_sub(self.capacity);
        buf.drain(..excess);
    }

    /// Forward an encoded frame to every attached track. Returns how many
    /// tracks received it.
    pub fn push_frame(&self, frame: EncodedFrame) -> usize {
        if self.is_stopped() {
            return 0;
        }
        self.frames.send(frame).unwrap_or(0)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl LocalAudioStream for PushAudioStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_recent(&self, buf: &mut [f32]) -> usize {
        if self.is_stopped() {
            return 0;
        }
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let n = samples.len().min(buf.len());
        let start = samples.len() - n;
        for (dst, src) in buf.iter_mut().zip(samples.range(start..)) {
            *dst = *src;
        }
        n
    }

    fn clone_track(&self) -> LocalTrack {
        LocalTrack {
            id: format!("{}-audio", self.id),
            stream_id: self.id.clone(),
            codec: self.codec.clone(),
            frames: self.frames.subscribe(),
        }
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!(stream = %self.id, "local audio stream stopped");
            self.samples
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
    }
}
