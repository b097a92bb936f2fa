//! Configuration management for murmur
//!
//! Precedence is env > TOML file > defaults.

pub mod file;

use std::path::PathBuf;

use secrecy::SecretString;

use crate::voice::{PlaybackMode, SAMPLE_RATE};
use crate::{Error, Result};

/// Full murmur configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Speech segmentation tuning
    pub segmenter: SegmenterConfig,

    /// Playback queue configuration
    pub playback: PlaybackConfig,

    /// Visualization analyzer configuration
    pub analyzer: AnalyzerConfig,

    /// Client connection configuration
    pub client: ClientConfig,

    /// Server configuration
    pub server: ServerConfig,

    /// Collaborator models
    pub models: ModelConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Voice segmentation configuration
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Probability above which a frame counts as speech
    pub positive_speech_threshold: f32,

    /// Probability below which a frame counts toward ending a burst
    pub negative_speech_threshold: f32,

    /// Trailing silence required before a commit
    pub silence_threshold_ms: u64,

    /// Cadence of the periodic silence check
    pub check_interval_ms: u64,

    /// Capture sample rate (the transcription collaborator requires 16 kHz)
    pub sample_rate: u32,

    /// Samples per analysis frame
    pub frame_samples: usize,

    /// Bursts with fewer speech frames are misfires
    pub min_speech_frames: usize,

    /// Consecutive non-speech frames that end a burst
    pub redemption_frames: usize,

    /// Frames prepended to a burst from before its onset
    pub pre_speech_pad_frames: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            positive_speech_threshold: 0.5,
            negative_speech_threshold: 0.35,
            silence_threshold_ms: 1000,
            check_interval_ms: 500,
            sample_rate: SAMPLE_RATE,
            frame_samples: 480,
            min_speech_frames: 3,
            redemption_frames: 8,
            pre_speech_pad_frames: 1,
        }
    }
}

impl SegmenterConfig {
    /// Duration of one analysis frame in milliseconds
    #[must_use]
    pub fn frame_ms(&self) -> u64 {
        (self.frame_samples as u64 * 1000) / u64::from(self.sample_rate.max(1))
    }
}

/// Playback queue configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Strategy for new playback sessions
    pub mode: PlaybackMode,

    /// Fragments smaller than this many decoded bytes are padding
    pub min_fragment_bytes: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            mode: PlaybackMode::Incremental,
            min_fragment_bytes: 50,
        }
    }
}

/// Frequency analyzer configuration
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// FFT window size (power of two)
    pub fft_size: usize,

    /// Temporal smoothing applied to raw bin magnitudes
    pub smoothing_time_constant: f32,

    /// Exponential smoothing applied to band metrics
    pub smoothing_factor: f32,

    /// Feed cadence (roughly one animation frame)
    pub frame_interval_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing_time_constant: 0.85,
            smoothing_factor: 0.8,
            frame_interval_ms: 16,
        }
    }
}

/// Client connection configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the conversation server
    pub server_url: String,

    /// Base URL for one-shot HTTP calls
    pub http_url: String,

    /// Reconnection attempts before giving up
    pub reconnect_attempts: u32,

    /// Delay between reconnection attempts
    pub reconnect_delay_ms: u64,

    /// How long a user-visible error stays on screen
    pub error_dismiss_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000/ws".to_string(),
            http_url: "http://127.0.0.1:3000".to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            error_dismiss_ms: 5000,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Static web client directory
    pub static_dir: Option<PathBuf>,

    /// Maximum accepted audio upload in bytes
    pub max_audio_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            static_dir: None,
            max_audio_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Collaborator model selection
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// STT model (e.g. "whisper-1")
    pub stt_model: String,

    /// Chat model
    pub llm_model: String,

    /// Response length cap
    pub max_tokens: u32,

    /// System prompt for the responder
    pub system_prompt: String,

    /// ElevenLabs voice identifier
    pub tts_voice: String,

    /// ElevenLabs model identifier
    pub tts_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            stt_model: "whisper-1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            max_tokens: 500,
            system_prompt: "You are a friendly voice assistant. Keep answers short and conversational."
                .to_string(),
            tts_voice: "21m00Tcm4TlvDq8ikWAM".to_string(),
            tts_model: "eleven_multilingual_v2".to_string(),
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper and chat)
    pub openai: Option<SecretString>,

    /// `ElevenLabs` API key (TTS)
    pub elevenlabs: Option<SecretString>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration from env, the TOML file and defaults
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::from_file(file::load_config_file())
    }

    /// Build configuration from a parsed file, applying env overrides
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_file(fc: file::MurmurConfigFile) -> Result<Self> {
        let seg_defaults = SegmenterConfig::default();
        let segmenter = SegmenterConfig {
            positive_speech_threshold: env_parse("MURMUR_POSITIVE_SPEECH_THRESHOLD")
                .or(fc.segmenter.positive_speech_threshold)
                .unwrap_or(seg_defaults.positive_speech_threshold),
            negative_speech_threshold: fc
                .segmenter
                .negative_speech_threshold
                .unwrap_or(seg_defaults.negative_speech_threshold),
            silence_threshold_ms: env_parse("MURMUR_SILENCE_THRESHOLD_MS")
                .or(fc.segmenter.silence_threshold_ms)
                .unwrap_or(seg_defaults.silence_threshold_ms),
            check_interval_ms: fc
                .segmenter
                .check_interval_ms
                .unwrap_or(seg_defaults.check_interval_ms),
            sample_rate: SAMPLE_RATE,
            frame_samples: fc.segmenter.frame_samples.unwrap_or(seg_defaults.frame_samples),
            min_speech_frames: fc
                .segmenter
                .min_speech_frames
                .unwrap_or(seg_defaults.min_speech_frames),
            redemption_frames: fc
                .segmenter
                .redemption_frames
                .unwrap_or(seg_defaults.redemption_frames),
            pre_speech_pad_frames: fc
                .segmenter
                .pre_speech_pad_frames
                .unwrap_or(seg_defaults.pre_speech_pad_frames),
        };

        let playback = PlaybackConfig {
            mode: env_parse("MURMUR_PLAYBACK_MODE")
                .or(fc.playback.mode)
                .unwrap_or_default(),
            min_fragment_bytes: fc
                .playback
                .min_fragment_bytes
                .unwrap_or(PlaybackConfig::default().min_fragment_bytes),
        };

        let an_defaults = AnalyzerConfig::default();
        let analyzer = AnalyzerConfig {
            fft_size: fc.analyzer.fft_size.unwrap_or(an_defaults.fft_size),
            smoothing_time_constant: fc
                .analyzer
                .smoothing_time_constant
                .unwrap_or(an_defaults.smoothing_time_constant),
            smoothing_factor: fc
                .analyzer
                .smoothing_factor
                .unwrap_or(an_defaults.smoothing_factor),
            frame_interval_ms: fc
                .analyzer
                .frame_interval_ms
                .unwrap_or(an_defaults.frame_interval_ms),
        };

        let cl_defaults = ClientConfig::default();
        let client = ClientConfig {
            server_url: std::env::var("MURMUR_SERVER_URL")
                .ok()
                .or(fc.client.server_url)
                .unwrap_or(cl_defaults.server_url),
            http_url: std::env::var("MURMUR_HTTP_URL")
                .ok()
                .or(fc.client.http_url)
                .unwrap_or(cl_defaults.http_url),
            reconnect_attempts: fc
                .client
                .reconnect_attempts
                .unwrap_or(cl_defaults.reconnect_attempts),
            reconnect_delay_ms: fc
                .client
                .reconnect_delay_ms
                .unwrap_or(cl_defaults.reconnect_delay_ms),
            error_dismiss_ms: fc
                .client
                .error_dismiss_ms
                .unwrap_or(cl_defaults.error_dismiss_ms),
        };

        let sv_defaults = ServerConfig::default();
        let server = ServerConfig {
            port: env_parse("MURMUR_PORT")
                .or_else(|| env_parse("PORT"))
                .or(fc.server.port)
                .unwrap_or(sv_defaults.port),
            static_dir: std::env::var("MURMUR_STATIC_DIR")
                .ok()
                .or(fc.server.static_dir)
                .map(PathBuf::from),
            max_audio_bytes: fc
                .server
                .max_audio_bytes
                .unwrap_or(sv_defaults.max_audio_bytes),
        };

        let md_defaults = ModelConfig::default();
        let models = ModelConfig {
            stt_model: std::env::var("MURMUR_STT_MODEL")
                .ok()
                .or(fc.models.stt_model)
                .unwrap_or(md_defaults.stt_model),
            llm_model: std::env::var("MURMUR_LLM_MODEL")
                .ok()
                .or(fc.models.llm_model)
                .unwrap_or(md_defaults.llm_model),
            max_tokens: fc.models.max_tokens.unwrap_or(md_defaults.max_tokens),
            system_prompt: fc.models.system_prompt.unwrap_or(md_defaults.system_prompt),
            tts_voice: std::env::var("MURMUR_TTS_VOICE")
                .ok()
                .or(fc.models.tts_voice)
                .unwrap_or(md_defaults.tts_voice),
            tts_model: fc.models.tts_model.unwrap_or(md_defaults.tts_model),
        };

        let api_keys = ApiKeys {
            openai: std::env::var("OPENAI_API_KEY")
                .ok()
                .or(fc.api_keys.openai)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            elevenlabs: std::env::var("ELEVENLABS_API_KEY")
                .ok()
                .or(fc.api_keys.elevenlabs)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };

        let config = Self {
            segmenter,
            playback,
            analyzer,
            client,
            server,
            models,
            api_keys,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        let seg = &self.segmenter;
        for (name, value) in [
            ("positive_speech_threshold", seg.positive_speech_threshold),
            ("negative_speech_threshold", seg.negative_speech_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if seg.negative_speech_threshold > seg.positive_speech_threshold {
            return Err(Error::Config(
                "negative_speech_threshold must not exceed positive_speech_threshold".to_string(),
            ));
        }
        if seg.check_interval_ms == 0 || seg.silence_threshold_ms == 0 {
            return Err(Error::Config(
                "silence_threshold_ms and check_interval_ms must be non-zero".to_string(),
            ));
        }
        if seg.sample_rate != SAMPLE_RATE {
            return Err(Error::Config(format!(
                "sample_rate must be {SAMPLE_RATE} Hz for transcription"
            )));
        }
        if seg.frame_samples == 0 {
            return Err(Error::Config("frame_samples must be non-zero".to_string()));
        }
        if !self.analyzer.fft_size.is_power_of_two() || self.analyzer.fft_size < 1024 {
            return Err(Error::Config(format!(
                "fft_size must be a power of two >= 1024, got {}",
                self.analyzer.fft_size
            )));
        }
        for (name, value) in [
            ("smoothing_time_constant", self.analyzer.smoothing_time_constant),
            ("smoothing_factor", self.analyzer.smoothing_factor),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be within [0, 1), got {value}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn frame_duration_is_thirty_ms() {
        assert_eq!(SegmenterConfig::default().frame_ms(), 30);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.segmenter.negative_speech_threshold = 0.9;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_non_power_of_two_fft() {
        let mut config = Config::default();
        config.analyzer.fft_size = 1500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_values_overlay_defaults() {
        let fc: file::MurmurConfigFile = toml::from_str(
            r#"
            [segmenter]
            check_interval_ms = 250

            [server]
            max_audio_bytes = 1024
            "#,
        )
        .unwrap();
        let config = Config::from_file(fc).unwrap();
        assert_eq!(config.segmenter.check_interval_ms, 250);
        assert_eq!(config.server.max_audio_bytes, 1024);
        assert_eq!(config.playback.min_fragment_bytes, 50);
    }
}
