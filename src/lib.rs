//! Murmur - real-time voice conversation pipeline
//!
//! This library provides:
//! - Continuous speech segmentation driven by a per-frame voice oracle
//! - WAV packaging of committed utterances
//! - Gapless streaming playback of server-pushed audio fragments
//! - A frequency-band feed for visualization
//! - The conversation session state machine tying them together
//! - A thin conversation server (STT, response, TTS collaborators)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ConversationSession                  │
//! │  capture → oracle → segmenter → encoder → transport   │
//! │  transport → playback queue → decoder → sink          │
//! │                 analyzer (tap on capture/sink)        │
//! └─────────────────────────┬────────────────────────────┘
//!                           │ WebSocket / HTTP
//! ┌─────────────────────────▼────────────────────────────┐
//! │                        Server                         │
//! │          Transcriber → Responder → Synthesizer        │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use session::{ConversationSession, ConversationState, Notice, SessionParts, UserAction};
