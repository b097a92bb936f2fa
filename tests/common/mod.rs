//! Shared test doubles
//!
//! Each integration test binary uses a different subset.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use murmur::protocol::ClientMessage;
use murmur::transport::Transport;
use murmur::voice::{
    AudioDecoder, AudioFragment, AudioFrame, AudioSink, DecodedAudio, FrameReceiver, FrameSource,
    SpeechModel,
};
use murmur::{Error, Result};

/// Samples per scripted frame
pub const FRAME_SAMPLES: usize = 400;

/// Model whose probability is the first sample of each frame
pub struct ScriptedModel;

impl SpeechModel for ScriptedModel {
    fn probability(&mut self, frame: &[f32]) -> Result<f32> {
        Ok(frame.first().copied().unwrap_or(0.0))
    }
}

/// A frame the scripted model scores as `probability`
pub fn frame(probability: f32) -> Vec<f32> {
    vec![probability; FRAME_SAMPLES]
}

#[derive(Default)]
struct SourceInner {
    sender: Option<mpsc::Sender<Result<AudioFrame>>>,
    started_at: Option<Instant>,
    paused: bool,
    starts: usize,
    stops: usize,
    pauses: usize,
    resumes: usize,
    fail_start: bool,
}

/// Test-side handle to a [`ScriptedSource`]
#[derive(Clone, Default)]
pub struct SourceHandle {
    inner: Arc<Mutex<SourceInner>>,
}

impl SourceHandle {
    /// Make the next `start` fail like a denied microphone
    pub fn fail_next_start(&self) {
        self.inner.lock().unwrap().fail_start = true;
    }

    /// Deliver one frame stamped with the time since capture started
    pub async fn push(&self, probability: f32) {
        let started_at = self.inner.lock().unwrap().started_at;
        let timestamp_ms = started_at.map_or(0, |t| {
            u64::try_from(t.elapsed().as_millis()).unwrap()
        });
        self.push_at(probability, timestamp_ms).await;
    }

    /// Deliver one frame carrying a device timestamp of the caller's choosing
    pub async fn push_at(&self, probability: f32, timestamp_ms: u64) {
        let sender = {
            let inner = self.inner.lock().unwrap();
            if inner.paused {
                return;
            }
            inner.sender.clone()
        };
        if let Some(sender) = sender {
            let _ = sender
                .send(Ok(AudioFrame {
                    samples: frame(probability),
                    timestamp_ms,
                }))
                .await;
        }
    }

    /// Deliver a device failure
    pub async fn push_error(&self, message: &str) {
        let sender = self.inner.lock().unwrap().sender.clone();
        if let Some(sender) = sender {
            let _ = sender.send(Err(Error::Capture(message.to_string()))).await;
        }
    }

    pub fn starts(&self) -> usize {
        self.inner.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.inner.lock().unwrap().stops
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.lock().unwrap().sender.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn pauses(&self) -> usize {
        self.inner.lock().unwrap().pauses
    }

    pub fn resumes(&self) -> usize {
        self.inner.lock().unwrap().resumes
    }
}

/// Frame source fed by the test through a [`SourceHandle`]
pub struct ScriptedSource {
    handle: SourceHandle,
}

impl ScriptedSource {
    pub fn new() -> (Self, SourceHandle) {
        let handle = SourceHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl FrameSource for ScriptedSource {
    fn start(&mut self) -> Result<FrameReceiver> {
        let mut inner = self.handle.inner.lock().unwrap();
        if std::mem::take(&mut inner.fail_start) {
            return Err(Error::Capture("permission denied".to_string()));
        }
        let (tx, rx) = mpsc::channel(256);
        inner.sender = Some(tx);
        inner.started_at = Some(Instant::now());
        inner.paused = false;
        inner.starts += 1;
        Ok(rx)
    }

    fn pause(&self) {
        let mut inner = self.handle.inner.lock().unwrap();
        inner.paused = true;
        inner.pauses += 1;
    }

    fn resume(&self) {
        let mut inner = self.handle.inner.lock().unwrap();
        inner.paused = false;
        inner.resumes += 1;
    }

    fn stop(&mut self) {
        let mut inner = self.handle.inner.lock().unwrap();
        if inner.sender.take().is_some() {
            inner.stops += 1;
        }
    }

    fn is_capturing(&self) -> bool {
        self.handle.is_capturing()
    }
}

/// Decoder that turns every byte into one sample at 1 kHz, so a fragment of
/// `n` bytes plays for `n` milliseconds. Payloads starting with `BAD` fail.
#[derive(Default)]
pub struct FakeDecoder {
    decoded: Mutex<Vec<usize>>,
}

impl FakeDecoder {
    /// Sizes of every payload handed to `decode`, in call order
    pub fn decoded(&self) -> Vec<usize> {
        self.decoded.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioDecoder for FakeDecoder {
    async fn decode(&self, bytes: &[u8], _mime_type: &str) -> Result<DecodedAudio> {
        self.decoded.lock().unwrap().push(bytes.len());
        if bytes.starts_with(b"BAD") {
            return Err(Error::Decode("corrupt frame".to_string()));
        }
        Ok(DecodedAudio {
            samples: vec![0.1; bytes.len()],
            sample_rate: 1000,
        })
    }
}

/// Sink that takes as long as the audio lasts and records what it played
#[derive(Default)]
pub struct FakeSink {
    played: Mutex<Vec<usize>>,
    stops: AtomicUsize,
}

impl FakeSink {
    /// Sample counts of every `play` call
    pub fn played(&self) -> Vec<usize> {
        self.played.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn play(&self, audio: DecodedAudio) -> Result<()> {
        self.played.lock().unwrap().push(audio.samples.len());
        tokio::time::sleep(Duration::from_millis(audio.duration_ms())).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that records what the session sends
pub struct RecordingTransport {
    sent: Mutex<Vec<ClientMessage>>,
    connected: AtomicBool,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of committed segments sent
    pub fn audio_sent(&self) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, ClientMessage::AudioData { .. }))
            .count()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Transport("not connected".to_string()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A well-formed fragment of `len` bytes
pub fn fragment(sequence_number: u64, len: usize) -> AudioFragment {
    AudioFragment {
        payload: vec![7; len],
        sequence_number,
        mime_type: "audio/mpeg".to_string(),
    }
}

/// A fragment the fake decoder rejects
pub fn corrupt_fragment(sequence_number: u64, len: usize) -> AudioFragment {
    let mut payload = b"BAD".to_vec();
    payload.resize(len.max(3), 0);
    AudioFragment {
        payload,
        sequence_number,
        mime_type: "audio/mpeg".to_string(),
    }
}
