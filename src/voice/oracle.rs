//! Voice-activity oracle boundary
//!
//! The oracle scores every analysis frame with a speech probability and
//! groups speech frames into bursts. It reports through [`SpeechEventSink`],
//! one method per event, so anything that can replay a frame sequence can
//! stand in for a real model.

use std::collections::VecDeque;

use crate::config::SegmenterConfig;
use crate::{Error, Result};

/// Receiver of voice-activity events
pub trait SpeechEventSink {
    /// Per-frame speech probability
    fn on_frame(&mut self, probability: f32, timestamp_ms: u64);

    /// A speech burst started
    fn on_speech_start(&mut self, timestamp_ms: u64);

    /// A speech burst finished, carrying its raw samples
    fn on_speech_end(&mut self, samples: Vec<f32>, timestamp_ms: u64);

    /// A burst was too short to count as speech
    fn on_misfire(&mut self) {}

    /// The model or the capture device failed
    fn on_error(&mut self, error: Error);
}

/// Opaque per-frame speech probability model
pub trait SpeechModel: Send {
    /// Probability in `[0, 1]` that the frame contains speech
    ///
    /// # Errors
    ///
    /// Returns `Error::Oracle` if inference fails
    fn probability(&mut self, frame: &[f32]) -> Result<f32>;
}

/// RMS energy below which a frame is certainly silence
const ENERGY_FLOOR: f32 = 0.01;

/// RMS energy above which a frame is certainly speech
const ENERGY_CEILING: f32 = 0.05;

/// Energy-based speech model
///
/// Maps frame RMS linearly between a floor and a ceiling, so a frame with
/// RMS 0.03 sits right at probability 0.5.
#[derive(Debug, Clone, Copy)]
pub struct EnergyModel {
    floor: f32,
    ceiling: f32,
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self {
            floor: ENERGY_FLOOR,
            ceiling: ENERGY_CEILING,
        }
    }
}

impl EnergyModel {
    /// Create a model with custom energy bounds
    ///
    /// # Errors
    ///
    /// Returns error if the floor is not below the ceiling
    pub fn new(floor: f32, ceiling: f32) -> Result<Self> {
        if floor.is_nan() || ceiling.is_nan() || floor >= ceiling {
            return Err(Error::Config(format!(
                "energy floor {floor} must be below ceiling {ceiling}"
            )));
        }
        Ok(Self { floor, ceiling })
    }
}

impl SpeechModel for EnergyModel {
    fn probability(&mut self, frame: &[f32]) -> Result<f32> {
        let energy = calculate_energy(frame);
        Ok(((energy - self.floor) / (self.ceiling - self.floor)).clamp(0.0, 1.0))
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Groups scored frames into speech bursts
pub struct FrameOracle<M> {
    model: M,
    positive_threshold: f32,
    negative_threshold: f32,
    min_speech_frames: usize,
    redemption_frames: usize,
    pre_speech_pad_frames: usize,
    speaking: bool,
    redemption_counter: usize,
    speech_frame_count: usize,
    burst: Vec<Vec<f32>>,
    pre_speech: VecDeque<Vec<f32>>,
    failed: bool,
}

impl<M: SpeechModel> FrameOracle<M> {
    /// Create an oracle around a model
    #[must_use]
    pub fn new(model: M, config: &SegmenterConfig) -> Self {
        Self {
            model,
            positive_threshold: config.positive_speech_threshold,
            negative_threshold: config.negative_speech_threshold,
            min_speech_frames: config.min_speech_frames,
            redemption_frames: config.redemption_frames,
            pre_speech_pad_frames: config.pre_speech_pad_frames,
            speaking: false,
            redemption_counter: 0,
            speech_frame_count: 0,
            burst: Vec::new(),
            pre_speech: VecDeque::new(),
            failed: false,
        }
    }

    /// Whether a burst is currently open
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Score one frame and report the resulting events
    pub fn process<S: SpeechEventSink>(&mut self, frame: &[f32], timestamp_ms: u64, sink: &mut S) {
        if self.failed {
            return;
        }

        let probability = match self.model.probability(frame) {
            Ok(p) => p.clamp(0.0, 1.0),
            Err(e) => {
                self.failed = true;
                self.reset();
                tracing::error!(error = %e, "speech model failed");
                sink.on_error(match e {
                    Error::Oracle(_) => e,
                    other => Error::Oracle(other.to_string()),
                });
                return;
            }
        };

        sink.on_frame(probability, timestamp_ms);

        // a frame must exceed the threshold; one sitting on it is not speech
        let is_speech = probability > self.positive_threshold;

        if is_speech && self.redemption_counter > 0 {
            self.redemption_counter = 0;
        }

        if is_speech && !self.speaking {
            self.speaking = true;
            self.burst.extend(self.pre_speech.drain(..));
            tracing::trace!(probability, timestamp_ms, "burst opened");
            sink.on_speech_start(timestamp_ms);
        }

        if !self.speaking {
            if self.pre_speech_pad_frames > 0 {
                self.pre_speech.push_back(frame.to_vec());
                while self.pre_speech.len() > self.pre_speech_pad_frames {
                    self.pre_speech.pop_front();
                }
            }
            return;
        }

        self.burst.push(frame.to_vec());
        if is_speech {
            self.speech_frame_count += 1;
        }

        if probability < self.negative_threshold {
            self.redemption_counter += 1;
            if self.redemption_counter >= self.redemption_frames {
                self.end_burst(timestamp_ms, sink);
            }
        }
    }

    /// Close any open burst, e.g. when capture pauses
    pub fn flush<S: SpeechEventSink>(&mut self, timestamp_ms: u64, sink: &mut S) {
        if self.speaking {
            self.end_burst(timestamp_ms, sink);
        }
    }

    /// Drop all burst state without reporting
    pub fn reset(&mut self) {
        self.speaking = false;
        self.redemption_counter = 0;
        self.speech_frame_count = 0;
        self.burst.clear();
        self.pre_speech.clear();
    }

    fn end_burst<S: SpeechEventSink>(&mut self, timestamp_ms: u64, sink: &mut S) {
        let speech_frames = self.speech_frame_count;
        let frames = std::mem::take(&mut self.burst);
        self.speaking = false;
        self.redemption_counter = 0;
        self.speech_frame_count = 0;

        if speech_frames >= self.min_speech_frames {
            let samples: Vec<f32> = frames.into_iter().flatten().collect();
            tracing::trace!(speech_frames, samples = samples.len(), "burst closed");
            sink.on_speech_end(samples, timestamp_ms);
        } else {
            tracing::debug!(speech_frames, "burst too short, misfire");
            sink.on_misfire();
        }
    }
}
