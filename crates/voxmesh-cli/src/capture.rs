//! Microphone capture through cpal, encoded to Opus for the peer tracks.
//!
//! cpal streams are not `Send` on every backend, and neither is the Opus
//! encoder, so both live on one dedicated thread. The audio callback only
//! downmixes and forwards buffers to that thread; the thread feeds raw
//! samples to activity detection and 20 ms Opus frames to every track.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use voxmesh_common::VoiceError;
use voxmesh_voice::{
    AudioConstraints, EncodedFrame, LocalAudioStream, MediaCapability, PushAudioStream,
};

const FRAME_MS: u32 = 20;
const MAX_PACKET: usize = 4000;
const BITRATE: i32 = 32_000;
/// How often the capture thread checks whether the stream was stopped.
const POLL: Duration = Duration::from_millis(100);

/// Frames quieter than this are replaced with silence when noise
/// suppression is on.
const NOISE_FLOOR_DB: f32 = -55.0;
/// Frames kept open after the last loud one, so word tails are not clipped.
const GATE_HOLD_FRAMES: u32 = 10;

/// Opens the configured input device on each `acquire`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MicrophoneCapability;

#[async_trait]
impl MediaCapability for MicrophoneCapability {
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, VoiceError> {
        // One second of samples is plenty for the activity analyzer.
        let rate = constraints.sample_rate;
        let stream = PushAudioStream::new("microphone", rate, rate as usize);
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = CaptureWorker {
            constraints: constraints.clone(),
            stream: Arc::clone(&stream),
        };
        std::thread::Builder::new()
            .name("voxmesh-capture".into())
            .spawn(move || worker.run(ready_tx))
            .map_err(|e| VoiceError::MediaAccess(format!("cannot start capture thread: {e}")))?;

        let device = ready_rx
            .await
            .map_err(|_| VoiceError::MediaAccess("capture thread exited".into()))??;
        info!(device = %device, rate = constraints.sample_rate, "microphone open");

        let stream: Arc<dyn LocalAudioStream> = stream;
        Ok(stream)
    }
}

struct CaptureWorker {
    constraints: AudioConstraints,
    stream: Arc<PushAudioStream>,
}

impl CaptureWorker {
    fn run(self, ready: oneshot::Sender<Result<String, VoiceError>>) {
        let (pcm_tx, pcm_rx) = mpsc::channel();
        let opened = open_input(&self.constraints, pcm_tx).and_then(|(input, name)| {
            let encoder = FrameEncoder::new(
                self.constraints.sample_rate,
                self.constraints.noise_suppression,
            )?;
            Ok((input, name, encoder))
        });
        let (input, name, mut encoder) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        if ready.send(Ok(name)).is_err() {
            return;
        }

        // The session holds the other reference; once it is gone or the
        // stream was stopped there is nobody left to feed.
        while !self.stream.is_stopped() && Arc::strong_count(&self.stream) > 1 {
            match pcm_rx.recv_timeout(POLL) {
                Ok(chunk) => {
                    self.stream.push_samples(&chunk);
                    for frame in encoder.push(&chunk) {
                        self.stream.push_frame(frame);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(input);
        debug!("capture thread finished");
    }
}

/// Open and start the input stream, forwarding mono buffers to `pcm`.
fn open_input(
    constraints: &AudioConstraints,
    pcm: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, String), VoiceError> {
    let host = cpal::default_host();
    let device = find_device(&host, &constraints.device)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let wanted = constraints.sample_rate;
    let range = device
        .supported_input_configs()
        .map_err(|e| media_err(&name, e))?
        .filter(|range| {
            range.sample_format() == cpal::SampleFormat::F32
                && range.min_sample_rate().0 <= wanted
                && wanted <= range.max_sample_rate().0
        })
        .min_by_key(|range| range.channels())
        .ok_or_else(|| {
            VoiceError::MediaAccess(format!("'{name}' cannot capture f32 audio at {wanted} Hz"))
        })?;
    let config: cpal::StreamConfig = range.with_sample_rate(cpal::SampleRate(wanted)).into();
    let channels = usize::from(config.channels.max(1));

    let input = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = pcm.send(downmix(data, channels));
            },
            |err| error!("audio capture error: {err}"),
            None,
        )
        .map_err(|e| media_err(&name, e))?;
    input.play().map_err(|e| media_err(&name, e))?;

    debug!(device = %name, channels, rate = wanted, "input stream started");
    Ok((input, name))
}

fn find_device(host: &cpal::Host, wanted: &str) -> Result<cpal::Device, VoiceError> {
    if wanted.trim().eq_ignore_ascii_case("default") {
        return host
            .default_input_device()
            .ok_or_else(|| VoiceError::MediaAccess("no default input device".into()));
    }
    let needle = wanted.trim().to_lowercase();
    host.input_devices()
        .map_err(|e| media_err(wanted, e))?
        .find(|device| {
            device
                .name()
                .map(|name| name.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
        .ok_or_else(|| VoiceError::MediaAccess(format!("no input device matching {wanted:?}")))
}

fn media_err(device: &str, e: impl std::fmt::Display) -> VoiceError {
    VoiceError::MediaAccess(format!("'{device}': {e}"))
}

/// Average interleaved channels into one.
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Cuts mono samples into 20 ms frames and Opus-encodes them.
struct FrameEncoder {
    encoder: opus::Encoder,
    frame_len: usize,
    pending: Vec<f32>,
    gate: Option<NoiseGate>,
    out: Vec<u8>,
}

impl FrameEncoder {
    fn new(sample_rate: u32, noise_suppression: bool) -> Result<Self, VoiceError> {
        let codec_err = |e: opus::Error| VoiceError::MediaAccess(format!("opus encoder: {e}"));
        let mut encoder =
            opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)
                .map_err(codec_err)?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(BITRATE))
            .map_err(codec_err)?;

        let frame_len = (sample_rate * FRAME_MS / 1000) as usize;
        Ok(Self {
            encoder,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
            gate: noise_suppression.then(NoiseGate::default),
            out: vec![0; MAX_PACKET],
        })
    }

    /// Encoded frames completed by `samples`. A remainder is kept for the
    /// next call.
    fn push(&mut self, samples: &[f32]) -> Vec<EncodedFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let mut frame: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            if let Some(gate) = self.gate.as_mut() {
                gate.apply(&mut frame);
            }
            match self.encoder.encode_float(&frame, &mut self.out) {
                Ok(len) => frames.push(EncodedFrame {
                    data: Bytes::copy_from_slice(&self.out[..len]),
                    duration: Duration::from_millis(u64::from(FRAME_MS)),
                }),
                Err(e) => warn!("dropping audio frame: {e}"),
            }
        }
        frames
    }
}

/// Silences frames below the noise floor, with a short hold after speech.
#[derive(Debug)]
struct NoiseGate {
    floor_db: f32,
    hold_frames: u32,
    open_for: u32,
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self {
            floor_db: NOISE_FLOOR_DB,
            hold_frames: GATE_HOLD_FRAMES,
            open_for: 0,
        }
    }
}

impl NoiseGate {
    /// Returns whether the frame was passed through.
    fn apply(&mut self, frame: &mut [f32]) -> bool {
        if rms_db(frame) >= self.floor_db {
            self.open_for = self.hold_frames;
            return true;
        }
        if self.open_for > 0 {
            self.open_for -= 1;
            return true;
        }
        frame.fill(0.0);
        false
    }
}

fn rms_db(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
    10.0 * mean_square.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (i as f32 * 0.05).sin())
            .collect()
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix(&[0.25, 0.75, -1.0, 1.0], 2), vec![0.5, 0.0]);
        assert_eq!(downmix(&[0.5, -0.5], 1), vec![0.5, -0.5]);
    }

    #[test]
    fn gate_silences_quiet_frames_after_hold() {
        let mut gate = NoiseGate {
            hold_frames: 2,
            ..NoiseGate::default()
        };

        let mut loud = tone(480, 0.5);
        assert!(gate.apply(&mut loud));
        assert!(loud.iter().any(|s| *s != 0.0));

        // Two held frames, then the gate closes.
        for _ in 0..2 {
            let mut hiss = tone(480, 0.0005);
            assert!(gate.apply(&mut hiss));
        }
        let mut hiss = tone(480, 0.0005);
        assert!(!gate.apply(&mut hiss));
        assert!(hiss.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn silence_is_minus_infinity() {
        assert_eq!(rms_db(&[0.0; 16]), f32::NEG_INFINITY);
        assert!((rms_db(&[1.0; 16])).abs() < 1e-6);
    }

    #[test]
    fn encoder_emits_one_frame_per_twenty_ms() {
        let mut encoder = FrameEncoder::new(48_000, false).unwrap();

        // 30 ms: one frame out, 10 ms carried over.
        let frames = encoder.push(&tone(1440, 0.3));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].duration, Duration::from_millis(20));
        assert!(!frames[0].data.is_empty());

        // Another 10 ms completes the second frame.
        assert_eq!(encoder.push(&tone(480, 0.3)).len(), 1);
        assert!(encoder.push(&tone(100, 0.3)).is_empty());
    }

    #[test]
    fn encoder_rejects_rates_opus_cannot_take() {
        assert!(matches!(
            FrameEncoder::new(44_100, false),
            Err(VoiceError::MediaAccess(_))
        ));
    }
}
