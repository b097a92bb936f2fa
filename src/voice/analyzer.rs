//! Band-energy analysis for visualization
//!
//! Mirrors a browser analyser node: Blackman window, FFT, temporally
//! smoothed magnitudes mapped from decibels onto a byte scale, then averaged
//! into bass/mid/treble bands.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AnalyzerConfig;

/// Decibel level mapped to byte 0
const MIN_DECIBELS: f32 = -100.0;

/// Decibel level mapped to byte 255
const MAX_DECIBELS: f32 = -30.0;

const BASS_BINS: std::ops::Range<usize> = 0..60;
const MID_BINS: std::ops::Range<usize> = 60..180;
const TREBLE_BINS: std::ops::Range<usize> = 180..512;
const OVERALL_BINS: std::ops::Range<usize> = 0..512;

/// Smoothed band metrics, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandEnergy {
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    pub overall: f32,
    /// Loudest bin of the latest frame, unsmoothed
    pub peak: f32,
}

/// Computes band energies from a window of recent samples
pub struct FrequencyAnalyzer {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothing_time_constant: f32,
    smoothing_factor: f32,
    magnitudes: Vec<f32>,
    bytes: Vec<u8>,
    smoothed: BandEnergy,
}

impl FrequencyAnalyzer {
    /// Create an analyzer with the configured FFT size and smoothing
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: &AnalyzerConfig) -> Self {
        let fft_size = config.fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / n;
                0.08f32.mul_add((4.0 * PI * x).cos(), 0.5f32.mul_add(-(2.0 * PI * x).cos(), 0.42))
            })
            .collect();

        Self {
            fft_size,
            fft,
            window,
            smoothing_time_constant: config.smoothing_time_constant,
            smoothing_factor: config.smoothing_factor,
            magnitudes: vec![0.0; fft_size / 2],
            bytes: vec![0; fft_size / 2],
            smoothed: BandEnergy::default(),
        }
    }

    /// Number of frequency bins
    #[must_use]
    pub const fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Latest byte-scaled spectrum
    #[must_use]
    pub fn frequency_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Most recent smoothed metrics
    #[must_use]
    pub const fn current(&self) -> BandEnergy {
        self.smoothed
    }

    /// Analyze the newest `fft_size` samples and update the smoothed metrics
    ///
    /// Shorter input is zero-padded at the front.
    pub fn analyze(&mut self, samples: &[f32]) -> BandEnergy {
        self.update_spectrum(samples);

        let bass = self.band_average(BASS_BINS);
        let mid = self.band_average(MID_BINS);
        let treble = self.band_average(TREBLE_BINS);
        let overall = self.band_average(OVERALL_BINS);
        let peak = f32::from(self.bytes.iter().copied().max().unwrap_or(0)) / 255.0;

        let k = self.smoothing_factor;
        let ema = |prev: f32, next: f32| prev.mul_add(k, next * (1.0 - k));
        self.smoothed = BandEnergy {
            bass: ema(self.smoothed.bass, bass),
            mid: ema(self.smoothed.mid, mid),
            treble: ema(self.smoothed.treble, treble),
            overall: ema(self.smoothed.overall, overall),
            peak,
        };
        self.smoothed
    }

    /// Forget all smoothing history
    pub fn reset(&mut self) {
        self.magnitudes.fill(0.0);
        self.bytes.fill(0);
        self.smoothed = BandEnergy::default();
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn update_spectrum(&mut self, samples: &[f32]) {
        let take = samples.len().min(self.fft_size);
        let offset = self.fft_size - take;
        let recent = &samples[samples.len() - take..];

        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.fft_size];
        for (i, &sample) in recent.iter().enumerate() {
            let idx = offset + i;
            buffer[idx] = Complex::new(sample * self.window[idx], 0.0);
        }
        self.fft.process(&mut buffer);

        let n = self.fft_size as f32;
        let tau = self.smoothing_time_constant;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (bin, value) in buffer.iter().take(self.fft_size / 2).enumerate() {
            let magnitude = value.norm() / n;
            let smoothed = self.magnitudes[bin].mul_add(tau, magnitude * (1.0 - tau));
            self.magnitudes[bin] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                MIN_DECIBELS
            };
            let scaled = (255.0 / range) * (db - MIN_DECIBELS);
            self.bytes[bin] = scaled.clamp(0.0, 255.0) as u8;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn band_average(&self, bins: std::ops::Range<usize>) -> f32 {
        let end = bins.end.min(self.bytes.len());
        let start = bins.start.min(end);
        let slice = &self.bytes[start..end];
        if slice.is_empty() {
            return 0.0;
        }
        let sum: u32 = slice.iter().map(|&b| u32::from(b)).sum();
        sum as f32 / slice.len() as f32 / 255.0
    }
}

/// Shared ring of the most recent samples fed to the analyzer
///
/// Capture and playback both push into the tap; the feed task reads it.
#[derive(Clone)]
pub struct AnalyzerTap {
    samples: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl AnalyzerTap {
    /// Create a tap holding at most `capacity` samples
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append samples, evicting the oldest beyond capacity
    pub fn push(&self, data: &[f32]) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.extend(data.iter().copied());
            let excess = buf.len().saturating_sub(self.capacity);
            buf.drain(..excess);
        }
    }

    /// Copy of the buffered samples, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples
            .lock()
            .map(|buf| buf.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop all buffered samples
    pub fn clear(&self) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.clear();
        }
    }
}

/// Handle to a running analyzer feed
pub struct AnalyzerFeed {
    receiver: watch::Receiver<BandEnergy>,
    task: JoinHandle<()>,
}

impl AnalyzerFeed {
    /// Subscribe to metric updates
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BandEnergy> {
        self.receiver.clone()
    }

    /// Latest published metrics
    #[must_use]
    pub fn latest(&self) -> BandEnergy {
        *self.receiver.borrow()
    }

    /// Stop sampling
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for AnalyzerFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sample the tap at the configured cadence and publish band energies
#[must_use]
pub fn spawn_feed(tap: AnalyzerTap, config: &AnalyzerConfig) -> AnalyzerFeed {
    let (tx, receiver) = watch::channel(BandEnergy::default());
    let mut analyzer = FrequencyAnalyzer::new(config);
    let period = Duration::from_millis(config.frame_interval_ms.max(1));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let energy = analyzer.analyze(&tap.snapshot());
            if tx.send(energy).is_err() {
                tracing::trace!("analyzer feed has no subscribers, stopping");
                break;
            }
        }
    });

    AnalyzerFeed { receiver, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.8 * (2.0 * PI * freq * i as f32 / 16_000.0).sin())
            .collect()
    }

    #[test]
    fn silence_is_zero() {
        let mut analyzer = FrequencyAnalyzer::new(&AnalyzerConfig::default());
        let energy = analyzer.analyze(&[0.0; 2048]);
        assert_eq!(energy, BandEnergy::default());
    }

    #[test]
    fn low_tone_lands_in_bass() {
        let mut analyzer = FrequencyAnalyzer::new(&AnalyzerConfig::default());
        // 200 Hz at 16 kHz with 2048 bins of 7.8 Hz is bin ~25
        let tone = sine(200.0, 2048);
        let mut energy = BandEnergy::default();
        for _ in 0..30 {
            energy = analyzer.analyze(&tone);
        }
        assert!(energy.bass > energy.treble);
        assert!(energy.peak > 0.5);
        assert!(energy.overall <= 1.0 && energy.overall >= 0.0);
    }

    #[test]
    fn band_metrics_are_smoothed() {
        let mut analyzer = FrequencyAnalyzer::new(&AnalyzerConfig::default());
        let tone = sine(200.0, 2048);
        let first = analyzer.analyze(&tone);
        let second = analyzer.analyze(&tone);
        assert!(second.bass > first.bass);
    }

    #[test]
    fn short_input_is_padded() {
        let mut analyzer = FrequencyAnalyzer::new(&AnalyzerConfig::default());
        let energy = analyzer.analyze(&sine(440.0, 100));
        assert!(energy.peak >= 0.0);
        assert_eq!(analyzer.frequency_bytes().len(), analyzer.bin_count());
    }

    #[test]
    fn tap_keeps_latest_samples() {
        let tap = AnalyzerTap::new(4);
        tap.push(&[1.0, 2.0, 3.0]);
        tap.push(&[4.0, 5.0]);
        assert_eq!(tap.snapshot(), vec![2.0, 3.0, 4.0, 5.0]);
        tap.clear();
        assert!(tap.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn feed_publishes_updates() {
        let tap = AnalyzerTap::new(2048);
        tap.push(&sine(200.0, 2048));
        let feed = spawn_feed(tap, &AnalyzerConfig::default());
        let mut rx = feed.subscribe();

        tokio::time::sleep(Duration::from_millis(100)).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().bass > 0.0);
        feed.stop();
    }
}
