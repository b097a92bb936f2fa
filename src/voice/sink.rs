//! Audio output to speakers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::voice::analyzer::AnalyzerTap;
use crate::voice::decode::DecodedAudio;
use crate::{Error, Result};

/// Destination for decoded playback audio
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play a buffer to completion, or until stopped
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the output device fails
    async fn play(&self, audio: DecodedAudio) -> Result<()>;

    /// Halt whatever is playing now
    fn stop(&self);
}

/// Plays audio on the default output device
pub struct CpalSink {
    config: StreamConfig,
    epoch: Arc<AtomicU64>,
    tap: Option<AnalyzerTap>,
}

impl CpalSink {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let config: StreamConfig = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?
            .into();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio output initialized"
        );

        Ok(Self {
            config,
            epoch: Arc::new(AtomicU64::new(0)),
            tap: None,
        })
    }

    /// Mirror every played sample into an analyzer tap
    #[must_use]
    pub fn with_tap(mut self, tap: AnalyzerTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Output sample rate of the device
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, audio: DecodedAudio) -> Result<()> {
        if audio.samples.is_empty() {
            return Ok(());
        }

        let config = self.config.clone();
        let samples = resample(&audio.samples, audio.sample_rate, config.sample_rate.0)?;
        let epoch = Arc::clone(&self.epoch);
        let started_epoch = epoch.load(Ordering::SeqCst);
        let tap = self.tap.clone();

        tokio::task::spawn_blocking(move || {
            play_blocking(&config, samples, &epoch, started_epoch, tap)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }

    fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// Play samples, returning when they finish or the epoch moves on
fn play_blocking(
    config: &StreamConfig,
    samples: Vec<f32>,
    epoch: &AtomicU64,
    started_epoch: u64,
    tap: Option<AnalyzerTap>,
) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let channels = usize::from(config.channels);
    let sample_count = samples.len();
    let finished = Arc::new(AtomicBool::new(false));
    let finished_cb = Arc::clone(&finished);
    let position = Arc::new(AtomicUsize::new(0));
    let position_cb = Arc::clone(&position);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let start = position_cb.load(Ordering::Relaxed);
                let mut pos = start;
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(pos).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    if pos < samples.len() {
                        pos += 1;
                    }
                }
                if let Some(tap) = &tap {
                    tap.push(&samples[start..pos]);
                }
                position_cb.store(pos, Ordering::Relaxed);
                if pos >= samples.len() {
                    finished_cb.store(true, Ordering::Relaxed);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(config.sample_rate.0.max(1));
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::Relaxed) {
        if epoch.load(Ordering::SeqCst) != started_epoch {
            let _ = stream.pause();
            tracing::debug!(
                played = position.load(Ordering::Relaxed),
                samples = sample_count,
                "playback stopped"
            );
            return Ok(());
        }
        if start.elapsed() > timeout {
            tracing::warn!(samples = sample_count, "playback timed out");
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(50));
    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");
    Ok(())
}

/// Resample mono audio with rubato
///
/// The final partial chunk is zero-padded so no trailing speech is lost.
///
/// # Errors
///
/// Returns `Error::Audio` if the resampler cannot be built
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let mut output = Vec::with_capacity(samples.len() * to_rate as usize / from_rate as usize + 1);
    for chunk in samples.chunks(chunk_size) {
        let mut input: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        input.resize(chunk_size, 0.0);
        let result = resampler
            .process(&[input], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        if let Some(channel) = result.first() {
            output.extend(channel.iter().map(|&s| s as f32));
        }
    }

    let expected = (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    output.truncate(expected.max(1));
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&samples, 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn upsampling_scales_length() {
        let samples = vec![0.25; 4_000];
        let out = resample(&samples, 16_000, 48_000).unwrap();
        assert!(out.len() <= 12_000);
        assert!(out.len() > 10_000);
    }
}
