//! Fragment decoding
//!
//! Synthesized speech arrives as MP3 from the TTS collaborator; committed
//! segments and test fixtures are WAV. Both decode to mono `f32`.

use std::io::Cursor;

use async_trait::async_trait;

use crate::{Error, Result};

/// Decoded mono PCM ready for a sink
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedAudio {
    /// Mono samples in `[-1, 1]`
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback duration in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate.max(1))
    }
}

/// Turns encoded audio bytes into PCM
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    /// Decode one complete audio payload
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the payload is not valid audio
    async fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<DecodedAudio>;
}

/// Decoder for `audio/mpeg` and `audio/wav`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoder;

#[async_trait]
impl AudioDecoder for DefaultDecoder {
    async fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<DecodedAudio> {
        let data = bytes.to_vec();
        let mime = mime_type.to_ascii_lowercase();
        tokio::task::spawn_blocking(move || decode_blocking(&data, &mime))
            .await
            .map_err(|e| Error::Decode(format!("decode task failed: {e}")))?
    }
}

fn decode_blocking(bytes: &[u8], mime_type: &str) -> Result<DecodedAudio> {
    match mime_type {
        "audio/wav" | "audio/wave" | "audio/x-wav" => decode_wav(bytes),
        "audio/mpeg" | "audio/mp3" => decode_mp3(bytes),
        other if bytes.starts_with(b"RIFF") => {
            tracing::debug!(mime_type = other, "sniffed WAV payload");
            decode_wav(bytes)
        }
        other => {
            tracing::debug!(mime_type = other, "assuming MP3 payload");
            decode_mp3(bytes)
        }
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns `Error::Decode` if no frame decodes
pub fn decode_mp3(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                #[allow(clippy::cast_sign_loss)]
                {
                    sample_rate = frame.sample_rate as u32;
                }
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Decode(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Decode("no MP3 frames found".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Decode a WAV container to mono f32 samples
///
/// # Errors
///
/// Returns `Error::Decode` for malformed or unsupported containers
#[allow(clippy::cast_precision_loss)]
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Decode(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(e.to_string()))?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}
