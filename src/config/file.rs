//! TOML configuration file loading
//!
//! Supports `~/.config/murmur/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::voice::PlaybackMode;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MurmurConfigFile {
    /// Speech segmentation tuning
    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    /// Playback queue configuration
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Visualization analyzer configuration
    #[serde(default)]
    pub analyzer: AnalyzerFileConfig,

    /// Client connection configuration
    #[serde(default)]
    pub client: ClientFileConfig,

    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Collaborator model selection
    #[serde(default)]
    pub models: ModelsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Speech segmentation configuration
#[derive(Debug, Default, Deserialize)]
pub struct SegmenterFileConfig {
    pub positive_speech_threshold: Option<f32>,
    pub negative_speech_threshold: Option<f32>,
    pub silence_threshold_ms: Option<u64>,
    pub check_interval_ms: Option<u64>,
    pub frame_samples: Option<usize>,
    pub min_speech_frames: Option<usize>,
    pub redemption_frames: Option<usize>,
    pub pre_speech_pad_frames: Option<usize>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// "incremental" or "batch"
    pub mode: Option<PlaybackMode>,

    /// Fragments smaller than this many decoded bytes are dropped
    pub min_fragment_bytes: Option<usize>,
}

/// Analyzer configuration
#[derive(Debug, Default, Deserialize)]
pub struct AnalyzerFileConfig {
    pub fft_size: Option<usize>,
    pub smoothing_time_constant: Option<f32>,
    pub smoothing_factor: Option<f32>,
    pub frame_interval_ms: Option<u64>,
}

/// Client configuration
#[derive(Debug, Default, Deserialize)]
pub struct ClientFileConfig {
    /// WebSocket endpoint (e.g. "ws://127.0.0.1:3000/ws")
    pub server_url: Option<String>,

    /// Base URL for one-shot HTTP calls
    pub http_url: Option<String>,

    pub reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub error_dismiss_ms: Option<u64>,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Port to listen on
    pub port: Option<u16>,

    /// Directory of static files for the web client
    pub static_dir: Option<String>,

    /// Maximum accepted audio upload in bytes
    pub max_audio_bytes: Option<usize>,
}

/// Collaborator models
#[derive(Debug, Default, Deserialize)]
pub struct ModelsFileConfig {
    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// Chat model (e.g. "gpt-4o-mini")
    pub llm_model: Option<String>,

    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,

    /// ElevenLabs voice identifier
    pub tts_voice: Option<String>,

    /// ElevenLabs model identifier
    pub tts_model: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `MurmurConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> MurmurConfigFile {
    config_file_path().map_or_else(MurmurConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path
pub fn load_from(path: &Path) -> MurmurConfigFile {
    if !path.exists() {
        return MurmurConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                MurmurConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            MurmurConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/murmur/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("murmur").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_overlay() {
        let raw = r#"
            [segmenter]
            silence_threshold_ms = 1500

            [playback]
            mode = "batch"
        "#;
        let file: MurmurConfigFile = toml::from_str(raw).unwrap();
        assert_eq!(file.segmenter.silence_threshold_ms, Some(1500));
        assert_eq!(file.segmenter.check_interval_ms, None);
        assert_eq!(file.playback.mode, Some(PlaybackMode::Batch));
        assert!(file.server.port.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let file = load_from(Path::new("/nonexistent/murmur/config.toml"));
        assert!(file.client.server_url.is_none());
    }
}
