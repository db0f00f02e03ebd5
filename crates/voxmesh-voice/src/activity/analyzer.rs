//! Frequency-domain energy estimate of a sample window.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Bin levels are mapped linearly from this range onto 0..=255.
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyReading {
    /// `20·log10(avg/255)` of the mean bin byte; `-inf` for silence.
    pub decibels: f64,
    /// 0-100 meter level.
    pub level: u8,
}

impl EnergyReading {
    pub const SILENT: Self = Self {
        decibels: f64::NEG_INFINITY,
        level: 0,
    };
}

pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    /// `fft_size` is clamped to at least 2.
    pub fn new(fft_size: usize) -> Self {
        let size = fft_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);
        let denom = (size - 1) as f32;
        let window = (0..size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / denom).cos())
            .collect();
        Self {
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); size],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Analyze the most recent `fft_size` samples; shorter input is
    /// zero-padded at the front.
    pub fn analyze(&mut self, samples: &[f32]) -> EnergyReading {
        let size = self.fft_size();
        let recent = &samples[samples.len().saturating_sub(size)..];
        let offset = size - recent.len();

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i >= offset { recent[i - offset] } else { 0.0 };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let bins = size / 2;
        let scale = size as f32;
        let total: u32 = self.buffer[..bins]
            .iter()
            .map(|bin| u32::from(bin_byte(bin.norm() / scale)))
            .sum();
        let avg = f64::from(total) / bins as f64;

        if avg <= 0.0 {
            return EnergyReading::SILENT;
        }
        EnergyReading {
            decibels: 20.0 * (avg / 255.0).log10(),
            level: (avg / 255.0 * 100.0).round().min(100.0) as u8,
        }
    }
}

fn bin_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 || !magnitude.is_finite() {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = (db - MIN_DB) / (MAX_DB - MIN_DB) * 255.0;
    scaled.clamp(0.0, 255.0) as u8
}
