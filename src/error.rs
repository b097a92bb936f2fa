//! Error types for murmur

use thiserror::Error;

/// Result type alias for murmur operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone permission denied or input device unavailable
    #[error("capture error: {0}")]
    Capture(String),

    /// Voice-activity model failed to load or errored during inference
    #[error("voice activity error: {0}")]
    Oracle(String),

    /// Network channel disconnected or a send failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Audio fragment or concatenated blob failed to decode
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio output error
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Response generation error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse error classes the session controller reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal to the current session; the user must retry explicitly
    Capture,
    /// Recoverable; the controller returns to idle
    Transport,
    /// Fatal for batch playback, skipped for single fragments
    Decode,
    /// Voice-activity failure, handled like a capture failure
    Oracle,
    /// Everything else
    Other,
}

impl ErrorKind {
    /// Whether the error ends the capture session
    #[must_use]
    pub const fn is_capture_like(self) -> bool {
        matches!(self, Self::Capture | Self::Oracle)
    }
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Capture(_) => ErrorKind::Capture,
            Self::Oracle(_) => ErrorKind::Oracle,
            Self::Transport(_) | Self::WebSocket(_) | Self::Http(_) => ErrorKind::Transport,
            Self::Decode(_) => ErrorKind::Decode,
            _ => ErrorKind::Other,
        }
    }
}
