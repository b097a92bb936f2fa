//! Voice processing module
//!
//! Capture side: microphone frames feed the voice-activity oracle, whose
//! events drive the segmenter; committed segments are WAV encoded.
//! Playback side: server fragments are decoded and played through the
//! streaming queue. The analyzer follows whichever side is audible.

pub mod analyzer;
pub mod capture;
pub mod decode;
pub mod encoder;
pub mod oracle;
pub mod queue;
pub mod segmenter;
pub mod sink;

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

pub use analyzer::{AnalyzerFeed, AnalyzerTap, BandEnergy, FrequencyAnalyzer, spawn_feed};
pub use capture::{AudioCapture, AudioFrame, FrameReceiver, FrameSource};
pub use decode::{AudioDecoder, DecodedAudio, DefaultDecoder};
pub use encoder::{CommittedAudio, WAV_MIME_TYPE};
pub use oracle::{EnergyModel, FrameOracle, SpeechEventSink, SpeechModel};
pub use queue::{AudioFragment, PlaybackEvent, PlaybackMetrics, PlaybackMode, PlaybackQueue};
pub use segmenter::{SegmenterEvent, SegmenterState, SpeechSegment, VoiceSegmenter};
pub use sink::{AudioSink, CpalSink};
