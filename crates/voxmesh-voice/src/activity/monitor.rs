//! Periodic sampling task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::analyzer::SpectrumAnalyzer;
use super::classifier::ActivityClassifier;
use crate::media::LocalAudioStream;

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityConfig {
    pub interval: Duration,
    pub fft_size: usize,
    pub threshold_db: f64,
    pub hysteresis_db: f64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            fft_size: 256,
            threshold_db: -45.0,
            hysteresis_db: 3.0,
        }
    }
}

/// The local user started or stopped speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakingTransition {
    pub is_speaking: bool,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Emits a [`SpeakingTransition`] whenever the local classification
/// changes, and nothing while it is stable.
pub struct VoiceActivityMonitor {
    config: ActivityConfig,
    transitions: mpsc::UnboundedSender<SpeakingTransition>,
    level: Arc<watch::Sender<u8>>,
    running: Option<Running>,
}

impl VoiceActivityMonitor {
    pub fn new(
        config: ActivityConfig,
        transitions: mpsc::UnboundedSender<SpeakingTransition>,
    ) -> Self {
        let (level, _) = watch::channel(0);
        Self {
            config,
            transitions,
            level: Arc::new(level),
            running: None,
        }
    }

    /// Begin sampling `stream`. Returns `false` if already running.
    pub fn start(&mut self, stream: Arc<dyn LocalAudioStream>) -> bool {
        if self.running.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sample_loop(
            self.config.clone(),
            stream,
            self.transitions.clone(),
            Arc::clone(&self.level),
            cancel.clone(),
        ));
        info!(interval_ms = self.config.interval.as_millis() as u64, "voice activity monitor started");
        self.running = Some(Running { cancel, task });
        true
    }

    /// Stop sampling. Returns `false` if it was not running.
    pub fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };
        running.cancel.cancel();
        running.task.abort();
        self.level.send_replace(0);
        info!("voice activity monitor stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Live 0-100 meter level of the local stream.
    pub fn level(&self) -> watch::Receiver<u8> {
        self.level.subscribe()
    }
}

impl Drop for VoiceActivityMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

async fn sample_loop(
    config: ActivityConfig,
    stream: Arc<dyn LocalAudioStream>,
    transitions: mpsc::UnboundedSender<SpeakingTransition>,
    level: Arc<watch::Sender<u8>>,
    cancel: CancellationToken,
) {
    let mut analyzer = SpectrumAnalyzer::new(config.fft_size);
    let mut classifier = ActivityClassifier::new(config.threshold_db, config.hysteresis_db);
    let mut samples = vec![0.0f32; analyzer.fft_size()];

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let n = stream.read_recent(&mut samples);
        let reading = analyzer.analyze(&samples[..n]);
        level.send_replace(reading.level);

        if let Some(is_speaking) = classifier.classify(reading.decibels) {
            debug!(is_speaking, decibels = reading.decibels, "local speaking state changed");
            if transitions.send(SpeakingTransition { is_speaking }).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PushAudioStream;
    use std::f32::consts::PI;

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.6 * (2.0 * PI * 440.0 * i as f32 / 48000.0).sin())
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SpeakingTransition>) -> Vec<bool> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t.is_speaking);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn one_event_per_transition() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = VoiceActivityMonitor::new(ActivityConfig::default(), tx);
        let stream = PushAudioStream::new("mic", 48000, 256);

        assert!(monitor.start(stream.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut rx).is_empty());

        stream.push_samples(&tone(256));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rx), vec![true]);
        assert!(*monitor.level().borrow() > 0);

        stream.push_samples(&[0.0; 256]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rx), vec![false]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut rx).is_empty());
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = VoiceActivityMonitor::new(ActivityConfig::default(), tx);
        let stream = PushAudioStream::new("mic", 48000, 256);

        assert!(monitor.start(stream.clone()));
        assert!(!monitor.start(stream.clone()));
        assert!(monitor.is_running());

        assert!(monitor.stop());
        assert!(!monitor.stop());
        assert!(!monitor.is_running());

        stream.push_samples(&tone(256));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(*monitor.level().borrow(), 0);

        assert!(monitor.start(stream));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rx), vec![true]);
    }
}
