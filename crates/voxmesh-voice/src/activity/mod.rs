//! Local voice-activity detection.
//!
//! A [`VoiceActivityMonitor`] samples the local stream on a fixed interval,
//! turns each window into a decibel reading with [`SpectrumAnalyzer`], and
//! reports only the ticks where [`ActivityClassifier`] flips between
//! speaking and silent.

mod analyzer;
mod classifier;
mod monitor;

pub use analyzer::{EnergyReading, SpectrumAnalyzer};
pub use classifier::ActivityClassifier;
pub use monitor::{ActivityConfig, SpeakingTransition, VoiceActivityMonitor};
