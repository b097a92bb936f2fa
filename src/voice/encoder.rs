//! Speech segment encoding
//!
//! Packs floating point samples into a mono 16-bit PCM WAV container,
//! the format the transcription collaborator accepts.

use std::io::Cursor;

use crate::{Error, Result};

/// MIME type of committed segments
pub const WAV_MIME_TYPE: &str = "audio/wav";

/// Size of the canonical PCM WAV header
pub const WAV_HEADER_LEN: usize = 44;

/// An encoded, immutable speech segment ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedAudio {
    /// Complete WAV container
    pub bytes: Vec<u8>,
    /// Sample rate declared in the header
    pub sample_rate: u32,
    /// Container MIME type
    pub mime_type: &'static str,
}

impl CommittedAudio {
    /// Number of PCM samples in the container
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.bytes.len().saturating_sub(WAV_HEADER_LEN) / 2
    }

    /// Duration of the segment in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        (self.sample_count() as u64 * 1000) / u64::from(self.sample_rate.max(1))
    }
}

/// Convert one float sample to signed 16-bit PCM
///
/// Negative values scale by 32768 and non-negative by 32767 so both ends of
/// the range map exactly onto `i16::MIN` and `i16::MAX`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn quantize(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Encode samples as a single channel 16-bit PCM WAV container
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<CommittedAudio> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(quantize(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(CommittedAudio {
        bytes: cursor.into_inner(),
        sample_rate,
        mime_type: WAV_MIME_TYPE,
    })
}

/// Concatenate frames in order and encode them
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn encode_frames(frames: &[Vec<f32>], sample_rate: u32) -> Result<CommittedAudio> {
    let total: usize = frames.iter().map(Vec::len).sum();
    let mut samples = Vec::with_capacity(total);
    for frame in frames {
        samples.extend_from_slice(frame);
    }
    encode(&samples, sample_rate)
}
