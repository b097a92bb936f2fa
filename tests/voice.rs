//! Segmentation and encoding integration tests
//!
//! Frames come from a scripted model on a simulated clock, so no audio
//! hardware is involved.

use std::io::Cursor;

use murmur::Result;
use murmur::config::SegmenterConfig;
use murmur::voice::encoder;
use murmur::voice::{
    FrameOracle, SAMPLE_RATE, SegmenterEvent, SegmenterState, SpeechModel, VoiceSegmenter,
};

mod common;
use common::{FRAME_SAMPLES, ScriptedModel, frame};

const FRAME_MS: u64 = 25;
const CHECK_MS: u64 = 500;

/// Oracle and segmenter driven by a simulated clock
struct Pipeline<M> {
    oracle: FrameOracle<M>,
    segmenter: VoiceSegmenter,
    events: Vec<(u64, SegmenterEvent)>,
    clock_ms: u64,
    next_frame_ms: u64,
}

impl<M: SpeechModel> Pipeline<M> {
    fn new(model: M) -> Self {
        let config = SegmenterConfig::default();
        let mut segmenter = VoiceSegmenter::new(&config);
        segmenter.start();
        Self {
            oracle: FrameOracle::new(model, &config),
            segmenter,
            events: Vec::new(),
            clock_ms: 0,
            next_frame_ms: 0,
        }
    }

    /// Feed frames one every 25 ms, running the periodic silence check
    /// whenever the clock crosses a multiple of 500 ms
    fn feed(&mut self, probabilities: &[f32]) {
        for &p in probabilities {
            let t = self.next_frame_ms;
            self.advance_to(t);
            self.oracle.process(&frame(p), t, &mut self.segmenter);
            self.collect(t);
            self.next_frame_ms += FRAME_MS;
        }
    }

    /// Let time pass without frames
    fn advance_to(&mut self, until_ms: u64) {
        let mut next_check = (self.clock_ms / CHECK_MS + 1) * CHECK_MS;
        while next_check <= until_ms {
            self.segmenter.check_for_commit(next_check);
            self.collect(next_check);
            next_check += CHECK_MS;
        }
        self.clock_ms = self.clock_ms.max(until_ms);
    }

    fn collect(&mut self, t: u64) {
        for event in self.segmenter.take_events() {
            self.events.push((t, event));
        }
    }

    fn commits(&self) -> Vec<(u64, &encoder::CommittedAudio)> {
        self.events
            .iter()
            .filter_map(|(t, e)| match e {
                SegmenterEvent::Commit(audio) => Some((*t, audio)),
                _ => None,
            })
            .collect()
    }

    fn speech_starts(&self) -> usize {
        self.events
            .iter()
            .filter(|(_, e)| matches!(e, SegmenterEvent::SpeechStart { .. }))
            .count()
    }
}

fn repeat(p: f32, n: usize) -> Vec<f32> {
    vec![p; n]
}

#[test]
fn no_commit_while_pauses_stay_short() {
    let mut pipeline = Pipeline::new(ScriptedModel);

    // five bursts separated by 750 ms of quiet
    for _ in 0..5 {
        pipeline.feed(&repeat(0.9, 4));
        pipeline.feed(&repeat(0.1, 30));
    }

    assert!(pipeline.commits().is_empty());
    assert!(pipeline.segmenter.has_pending_speech());
    assert_eq!(pipeline.speech_starts(), 1);
    assert_eq!(pipeline.segmenter.segment().map(|s| s.frames.len()), Some(5));
}

#[test]
fn commits_once_per_silence_gap() {
    let mut pipeline = Pipeline::new(ScriptedModel);

    pipeline.feed(&repeat(0.9, 10));
    // silence for threshold / interval + 1 check intervals
    pipeline.feed(&repeat(0.1, 60));

    assert_eq!(pipeline.commits().len(), 1);
    assert!(!pipeline.segmenter.has_pending_speech());
    assert!(pipeline.segmenter.segment().is_none());

    // a second silent stretch finds nothing left to commit
    pipeline.feed(&repeat(0.1, 60));
    assert_eq!(pipeline.commits().len(), 1);
    assert_eq!(pipeline.segmenter.commits(), 1);
}

#[test]
fn scripted_conversation_commits_after_threshold() {
    let mut pipeline = Pipeline::new(ScriptedModel);

    pipeline.feed(&repeat(0.9, 10));
    pipeline.feed(&repeat(0.1, 40));
    pipeline.advance_to(2000);

    let last_speech_frame_ms = 9 * FRAME_MS;
    assert_eq!(pipeline.speech_starts(), 1);

    let commits = pipeline.commits();
    assert_eq!(commits.len(), 1);
    let (at_ms, audio) = commits[0];
    assert!(at_ms >= last_speech_frame_ms + 1000, "committed at {at_ms}ms");

    // ten speech frames plus the eight quiet frames that closed the burst
    assert_eq!(audio.sample_count(), 18 * FRAME_SAMPLES);
    assert_eq!(audio.sample_rate, SAMPLE_RATE);

    let reader = hound::WavReader::new(Cursor::new(audio.bytes.clone())).unwrap();
    assert_eq!(reader.spec().sample_rate, 16000);
    assert_eq!(reader.spec().channels, 1);
    assert!(reader.len() > 0);
}

#[test]
fn short_burst_is_a_misfire() {
    let mut pipeline = Pipeline::new(ScriptedModel);

    pipeline.feed(&repeat(0.9, 2));
    pipeline.feed(&repeat(0.1, 60));

    assert!(
        pipeline
            .events
            .iter()
            .any(|(_, e)| matches!(e, SegmenterEvent::Misfire))
    );
    assert!(pipeline.commits().is_empty());
    assert!(!pipeline.segmenter.has_pending_speech());
}

#[test]
fn frames_on_the_threshold_are_not_speech() {
    let mut pipeline = Pipeline::new(ScriptedModel);

    pipeline.feed(&repeat(0.5, 20));
    pipeline.feed(&repeat(0.1, 60));

    assert!(pipeline.events.is_empty());
    assert!(pipeline.segmenter.last_speech_ms().is_none());
    assert!(pipeline.segmenter.segment().is_none());
}

#[test]
fn paused_segmenter_ignores_speech() {
    let mut pipeline = Pipeline::new(ScriptedModel);
    pipeline.segmenter.pause();

    pipeline.feed(&repeat(0.9, 10));
    pipeline.feed(&repeat(0.1, 60));
    assert!(pipeline.events.is_empty());

    pipeline.segmenter.resume();
    pipeline.feed(&repeat(0.9, 10));
    pipeline.feed(&repeat(0.1, 60));
    pipeline.advance_to(4000);
    assert_eq!(pipeline.commits().len(), 1);
}

struct FailingModel {
    frames_left: usize,
}

impl SpeechModel for FailingModel {
    fn probability(&mut self, frame: &[f32]) -> Result<f32> {
        if self.frames_left == 0 {
            return Err(murmur::Error::Oracle("inference failed".to_string()));
        }
        self.frames_left -= 1;
        Ok(frame[0])
    }
}

#[test]
fn model_failure_stops_the_segmenter() {
    let mut pipeline = Pipeline::new(FailingModel { frames_left: 5 });

    pipeline.feed(&repeat(0.9, 10));

    let errors: Vec<_> = pipeline
        .events
        .iter()
        .filter(|(_, e)| matches!(e, SegmenterEvent::Error(_)))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(pipeline.segmenter.state(), SegmenterState::Stopped);
    assert!(!pipeline.segmenter.has_pending_speech());
    assert!(pipeline.commits().is_empty());
}

#[test]
fn encoded_sine_survives_round_trip() {
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..1000)
        .map(|i| {
            let t = i as f32 / 16000.0;
            0.8 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect();

    let audio = encoder::encode(&samples, 16000).unwrap();
    assert_eq!(audio.mime_type, "audio/wav");
    assert_eq!(audio.bytes.len(), 44 + 2 * samples.len());

    let mut reader = hound::WavReader::new(Cursor::new(audio.bytes)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 1000);

    let step = 1.0 / 32767.0;
    for (original, decoded) in samples.iter().zip(reader.samples::<i16>()) {
        let decoded = f32::from(decoded.unwrap()) / 32767.0;
        assert!(
            (original - decoded).abs() <= step,
            "{original} decoded as {decoded}"
        );
    }
}

#[test]
fn encoding_clamps_out_of_range_samples() {
    let audio = encoder::encode(&[2.0, -2.0, 0.0], 16000).unwrap();
    let mut reader = hound::WavReader::new(Cursor::new(audio.bytes)).unwrap();
    let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(decoded, vec![i16::MAX, i16::MIN, 0]);
}
