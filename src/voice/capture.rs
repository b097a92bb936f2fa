//! Audio capture from microphone
//!
//! The cpal stream lives on a dedicated thread so the capture handle itself
//! can move freely between tasks. Samples are cut into fixed analysis
//! frames and delivered over a bounded channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use crate::voice::SAMPLE_RATE;
use crate::voice::analyzer::AnalyzerTap;
use crate::{Error, Result};

/// Frames buffered between the device callback and the consumer
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// One fixed-size analysis frame
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Mono samples at 16 kHz
    pub samples: Vec<f32>,
    /// Position of the first sample in the device stream (sample clock,
    /// starts at 0 with the first delivered sample and skips device overruns)
    pub timestamp_ms: u64,
}

/// Receiving end of a capture session
pub type FrameReceiver = mpsc::Receiver<Result<AudioFrame>>;

/// Anything that can produce a live stream of analysis frames
pub trait FrameSource: Send {
    /// Begin capturing
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if the input device cannot be opened
    fn start(&mut self) -> Result<FrameReceiver>;

    /// Drop frames until resumed
    fn pause(&self);

    /// Deliver frames again
    fn resume(&self);

    /// Release the input device
    fn stop(&mut self);

    /// Whether the device is held
    fn is_capturing(&self) -> bool;
}

struct CaptureWorker {
    shutdown: std::sync::mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Captures audio from the default input device
pub struct AudioCapture {
    frame_samples: usize,
    paused: Arc<AtomicBool>,
    tap: Option<AnalyzerTap>,
    worker: Option<CaptureWorker>,
}

impl AudioCapture {
    /// Create a capture handle producing frames of `frame_samples`
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            paused: Arc::new(AtomicBool::new(false)),
            tap: None,
            worker: None,
        }
    }

    /// Mirror captured samples into an analyzer tap
    #[must_use]
    pub fn with_tap(mut self, tap: AnalyzerTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

impl FrameSource for AudioCapture {
    fn start(&mut self) -> Result<FrameReceiver> {
        self.stop();
        self.paused.store(false, Ordering::SeqCst);

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let (shutdown, shutdown_rx) = std::sync::mpsc::channel();

        let frame_samples = self.frame_samples;
        let paused = Arc::clone(&self.paused);
        let tap = self.tap.clone();

        let thread = std::thread::Builder::new()
            .name("murmur-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(frame_samples, paused, tap, frames_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // park until asked to release the device
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| Error::Capture(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { shutdown, thread });
                tracing::debug!(frame_samples, "audio capture started");
                Ok(frames_rx)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Capture("capture thread exited during setup".to_string()))
            }
        }
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            if worker.thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(
    frame_samples: usize,
    paused: Arc<AtomicBool>,
    tap: Option<AnalyzerTap>,
    frames: mpsc::Sender<Result<AudioFrame>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Capture("no input device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
            && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
    };
    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Capture(e.to_string()))?
        .filter(supports_rate)
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Capture("no 16 kHz input config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels,
        "audio capture initialized"
    );

    let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);
    let mut emitted: u64 = 0;
    let error_frames = frames.clone();

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if paused.load(Ordering::Relaxed) {
                    return;
                }
                if channels == 1 {
                    pending.extend_from_slice(data);
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    pending.extend(
                        data.chunks(channels)
                            .map(|f| f.iter().sum::<f32>() / f.len() as f32),
                    );
                }
                while pending.len() >= frame_samples {
                    let samples: Vec<f32> = pending.drain(..frame_samples).collect();
                    if let Some(tap) = &tap {
                        tap.push(&samples);
                    }
                    let timestamp_ms = emitted * 1000 / u64::from(SAMPLE_RATE);
                    emitted += samples.len() as u64;
                    if frames.try_send(Ok(AudioFrame { samples, timestamp_ms })).is_err() {
                        tracing::trace!("frame consumer lagging, frame dropped");
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = error_frames.try_send(Err(Error::Capture(err.to_string())));
            },
            None,
        )
        .map_err(|e| Error::Capture(e.to_string()))?;

    stream.play().map_err(|e| Error::Capture(e.to_string()))?;
    Ok(stream)
}
