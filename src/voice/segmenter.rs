//! Speech/silence segmentation
//!
//! Accumulates the speech bursts reported by the voice-activity oracle and
//! commits them as one encoded segment once the user has been silent for
//! longer than the configured threshold.
//!
//! ```text
//!   frame p > threshold ──► segment opens (SpeechStart)
//!   burst finalized     ──► frames appended, last speech = now
//!   periodic check      ──► now - last speech >= silence threshold
//!                           and frames non-empty ──► Commit, buffer cleared
//! ```

use std::collections::VecDeque;

use crate::config::SegmenterConfig;
use crate::voice::encoder::{self, CommittedAudio};
use crate::voice::oracle::SpeechEventSink;
use crate::{Error, Result};

/// Lifecycle of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Not consuming events; buffer empty
    Stopped,
    /// Consuming oracle events
    Running,
    /// Temporarily ignoring oracle events; buffer retained
    Paused,
}

/// Events produced by the segmenter
#[derive(Debug)]
pub enum SegmenterEvent {
    /// First speech frame of a new segment
    SpeechStart {
        /// Frame timestamp
        timestamp_ms: u64,
    },
    /// A speech burst was appended to the open segment
    BurstAppended {
        /// Samples in the burst
        samples: usize,
        /// Bursts buffered so far
        bursts: usize,
    },
    /// The oracle discarded a burst as too short
    Misfire,
    /// The segment was finalized and encoded
    Commit(CommittedAudio),
    /// The oracle failed; the segmenter stopped
    Error(Error),
}

/// Speech accumulated since the last commit
#[derive(Debug, Default)]
pub struct SpeechSegment {
    /// Finalized bursts in arrival order
    pub frames: Vec<Vec<f32>>,
    /// Timestamp of the frame that opened the segment
    pub started_at_ms: u64,
}

impl SpeechSegment {
    /// Total samples across all bursts
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }
}

/// Decides when the user has finished speaking
pub struct VoiceSegmenter {
    positive_speech_threshold: f32,
    silence_threshold_ms: u64,
    sample_rate: u32,
    state: SegmenterState,
    segment: Option<SpeechSegment>,
    last_speech_ms: Option<u64>,
    last_probability: f32,
    frames_seen: u64,
    commits: u64,
    events: VecDeque<SegmenterEvent>,
}

impl VoiceSegmenter {
    /// Create a stopped segmenter
    #[must_use]
    pub const fn new(config: &SegmenterConfig) -> Self {
        Self {
            positive_speech_threshold: config.positive_speech_threshold,
            silence_threshold_ms: config.silence_threshold_ms,
            sample_rate: config.sample_rate,
            state: SegmenterState::Stopped,
            segment: None,
            last_speech_ms: None,
            last_probability: 0.0,
            frames_seen: 0,
            commits: 0,
            events: VecDeque::new(),
        }
    }

    /// Begin consuming oracle events
    pub fn start(&mut self) {
        if self.state != SegmenterState::Running {
            tracing::debug!(
                threshold = self.positive_speech_threshold,
                silence_threshold_ms = self.silence_threshold_ms,
                sample_rate = self.sample_rate,
                "segmenter started"
            );
        }
        self.state = SegmenterState::Running;
    }

    /// Ignore oracle events until resumed
    pub fn pause(&mut self) {
        if self.state == SegmenterState::Running {
            self.state = SegmenterState::Paused;
            tracing::debug!("segmenter paused");
        }
    }

    /// Resume after a pause
    pub fn resume(&mut self) {
        if self.state == SegmenterState::Paused {
            self.state = SegmenterState::Running;
            tracing::debug!("segmenter resumed");
        }
    }

    /// Stop and discard any uncommitted speech
    pub fn stop(&mut self) {
        self.state = SegmenterState::Stopped;
        self.discard();
        tracing::debug!("segmenter stopped");
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }

    /// Whether speech is buffered awaiting commit
    #[must_use]
    pub fn has_pending_speech(&self) -> bool {
        self.segment.as_ref().is_some_and(|s| !s.frames.is_empty())
    }

    /// The open segment, if any
    #[must_use]
    pub const fn segment(&self) -> Option<&SpeechSegment> {
        self.segment.as_ref()
    }

    /// Timestamp of the most recent speech evidence
    #[must_use]
    pub const fn last_speech_ms(&self) -> Option<u64> {
        self.last_speech_ms
    }

    /// Probability of the most recent frame
    #[must_use]
    pub const fn last_probability(&self) -> f32 {
        self.last_probability
    }

    /// Number of segments committed so far
    #[must_use]
    pub const fn commits(&self) -> u64 {
        self.commits
    }

    /// Take the next pending event
    pub fn next_event(&mut self) -> Option<SegmenterEvent> {
        self.events.pop_front()
    }

    /// Drain all pending events in order
    pub fn take_events(&mut self) -> Vec<SegmenterEvent> {
        self.events.drain(..).collect()
    }

    /// Periodic silence check
    ///
    /// Commits when speech is buffered and the time since the last speech
    /// reaches the silence threshold. Returns whether a commit happened.
    /// Calling it again on an empty buffer is a no-op.
    pub fn check_for_commit(&mut self, now_ms: u64) -> bool {
        if self.state == SegmenterState::Stopped || !self.has_pending_speech() {
            return false;
        }
        let Some(last_speech) = self.last_speech_ms else {
            return false;
        };

        let since_last_speech = now_ms.saturating_sub(last_speech);
        if since_last_speech < self.silence_threshold_ms {
            return false;
        }

        tracing::debug!(since_last_speech, "silence threshold reached");
        match self.commit() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode segment");
                self.discard();
                self.events.push_back(SegmenterEvent::Error(e));
                false
            }
        }
    }

    /// Concatenate, encode and emit the buffered speech, then reset
    fn commit(&mut self) -> Result<()> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        self.last_speech_ms = None;

        if segment.frames.is_empty() {
            return Ok(());
        }

        let audio = encoder::encode_frames(&segment.frames, self.sample_rate)?;
        self.commits += 1;

        tracing::info!(
            bursts = segment.frames.len(),
            samples = audio.sample_count(),
            duration_ms = audio.duration_ms(),
            started_at_ms = segment.started_at_ms,
            "segment committed"
        );
        self.events.push_back(SegmenterEvent::Commit(audio));
        Ok(())
    }

    fn discard(&mut self) {
        self.segment = None;
        self.last_speech_ms = None;
    }

    fn open_segment(&mut self, timestamp_ms: u64) {
        if self.segment.is_none() {
            self.segment = Some(SpeechSegment {
                frames: Vec::new(),
                started_at_ms: timestamp_ms,
            });
            tracing::debug!(timestamp_ms, "speech started");
            self.events
                .push_back(SegmenterEvent::SpeechStart { timestamp_ms });
        }
    }
}

impl SpeechEventSink for VoiceSegmenter {
    fn on_frame(&mut self, probability: f32, timestamp_ms: u64) {
        if self.state != SegmenterState::Running {
            return;
        }

        self.frames_seen += 1;
        self.last_probability = probability;
        if self.frames_seen % 100 == 0 {
            tracing::trace!(frame = self.frames_seen, probability, "frame processed");
        }

        if probability > self.positive_speech_threshold {
            self.open_segment(timestamp_ms);
            self.last_speech_ms = Some(timestamp_ms);
        }
    }

    fn on_speech_start(&mut self, timestamp_ms: u64) {
        if self.state != SegmenterState::Running {
            return;
        }
        self.open_segment(timestamp_ms);
        self.last_speech_ms = Some(timestamp_ms);
    }

    fn on_speech_end(&mut self, samples: Vec<f32>, timestamp_ms: u64) {
        if self.state != SegmenterState::Running || samples.is_empty() {
            return;
        }

        self.open_segment(timestamp_ms);
        let count = samples.len();
        let bursts = self.segment.as_mut().map_or(0, |segment| {
            segment.frames.push(samples);
            segment.frames.len()
        });
        self.last_speech_ms = Some(timestamp_ms);
        self.events.push_back(SegmenterEvent::BurstAppended {
            samples: count,
            bursts,
        });

        self.check_for_commit(timestamp_ms);
    }

    fn on_misfire(&mut self) {
        if self.segment.as_ref().is_some_and(|s| s.frames.is_empty()) {
            self.discard();
            self.events.push_back(SegmenterEvent::Misfire);
        }
    }

    fn on_error(&mut self, error: Error) {
        tracing::error!(error = %error, "voice activity failure, segmenter stopping");
        self.state = SegmenterState::Stopped;
        self.discard();
        self.events.push_back(SegmenterEvent::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> VoiceSegmenter {
        let mut seg = VoiceSegmenter::new(&SegmenterConfig::default());
        seg.start();
        seg
    }

    fn commits(events: &[SegmenterEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SegmenterEvent::Commit(_)))
            .count()
    }

    #[test]
    fn rising_edge_emits_single_start() {
        let mut seg = segmenter();
        seg.on_frame(0.9, 0);
        seg.on_speech_start(0);
        seg.on_frame(0.9, 30);
        let events = seg.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SegmenterEvent::SpeechStart { timestamp_ms: 0 }));
    }

    #[test]
    fn threshold_is_exclusive() {
        let mut seg = segmenter();
        seg.on_frame(0.5, 0);
        assert!(seg.take_events().is_empty());
        assert!(seg.last_speech_ms().is_none());
    }

    #[test]
    fn commits_after_silence_threshold() {
        let mut seg = segmenter();
        seg.on_frame(0.9, 0);
        seg.on_speech_end(vec![0.1; 160], 300);

        assert!(!seg.check_for_commit(1299));
        assert!(seg.check_for_commit(1300));
        assert!(!seg.has_pending_speech());
        assert!(seg.last_speech_ms().is_none());

        let events = seg.take_events();
        assert_eq!(commits(&events), 1);
        assert!(!seg.check_for_commit(5000));
        assert_eq!(seg.commits(), 1);
    }

    #[test]
    fn no_speech_means_no_commit() {
        let mut seg = segmenter();
        for i in 0..100 {
            seg.on_frame(0.1, i * 30);
            assert!(!seg.check_for_commit(i * 30));
        }
        assert!(seg.take_events().is_empty());
    }

    #[test]
    fn bursts_concatenate_in_order() {
        let mut seg = segmenter();
        seg.on_speech_end(vec![0.5; 10], 0);
        seg.on_speech_end(vec![-0.5; 6], 400);
        assert!(seg.check_for_commit(1400));

        let commit = seg
            .take_events()
            .into_iter()
            .find_map(|e| match e {
                SegmenterEvent::Commit(a) => Some(a),
                _ => None,
            })
            .unwrap();
        assert_eq!(commit.sample_count(), 16);
        let data = &commit.bytes[encoder::WAV_HEADER_LEN..];
        assert!(i16::from_le_bytes([data[0], data[1]]) > 0);
        assert!(i16::from_le_bytes([data[30], data[31]]) < 0);
    }

    #[test]
    fn misfire_closes_empty_segment() {
        let mut seg = segmenter();
        seg.on_frame(0.9, 0);
        seg.on_misfire();
        seg.on_frame(0.9, 500);
        let starts = seg
            .take_events()
            .iter()
            .filter(|e| matches!(e, SegmenterEvent::SpeechStart { .. }))
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn error_stops_segmenter() {
        let mut seg = segmenter();
        seg.on_speech_end(vec![0.5; 10], 0);
        seg.on_error(Error::Capture("permission revoked".into()));

        assert_eq!(seg.state(), SegmenterState::Stopped);
        assert!(!seg.has_pending_speech());
        seg.on_speech_end(vec![0.5; 10], 100);
        assert!(!seg.check_for_commit(5000));

        let events = seg.take_events();
        assert!(matches!(events.last(), Some(SegmenterEvent::Error(_))));
    }

    #[test]
    fn paused_segmenter_ignores_frames_but_keeps_buffer() {
        let mut seg = segmenter();
        seg.on_speech_end(vec![0.5; 10], 0);
        seg.pause();
        seg.on_speech_end(vec![0.5; 10], 200);
        assert_eq!(seg.segment().map(SpeechSegment::sample_count), Some(10));
        seg.resume();
        assert!(seg.check_for_commit(1000));
    }

    #[test]
    fn stop_discards_buffer() {
        let mut seg = segmenter();
        seg.on_speech_end(vec![0.5; 10], 0);
        seg.stop();
        assert!(!seg.has_pending_speech());
        assert!(!seg.check_for_commit(10_000));
    }
}
