//! Wire protocol between the voice client and the conversation server
//!
//! Messages are JSON text frames tagged by `type`. Audio travels base64
//! encoded so it survives text framing.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::voice::{AudioFragment, CommittedAudio};
use crate::{Error, Result};

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// A committed speech segment
    AudioData {
        /// Base64 audio container
        audio: String,
        mime_type: String,
    },
    /// Abandon the turn in flight
    CancelProcessing,
    /// Keep-alive
    Ping,
}

impl ClientMessage {
    /// Wrap a committed segment for sending
    #[must_use]
    pub fn audio(audio: &CommittedAudio) -> Self {
        Self::AudioData {
            audio: BASE64.encode(&audio.bytes),
            mime_type: audio.mime_type.to_string(),
        }
    }

    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known client message
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Pipeline stage reported by `status` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Transcribing,
    Generating,
    Synthesizing,
    Done,
    Cancelled,
}

impl Stage {
    /// Human-readable status line
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Transcribing => "Transcribing...",
            Self::Generating => "Generating response...",
            Self::Synthesizing => "Generating audio...",
            Self::Done => "Done",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transcribing => "transcribing",
            Self::Generating => "generating",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Messages sent by the server, in emission order within a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// What the user said
    Transcript { text: String },
    /// What the assistant answers
    Response { text: String },
    /// Pipeline progress
    Status { stage: Stage, message: String },
    /// One piece of synthesized speech
    AudioFragment {
        /// Base64 audio bytes
        payload: String,
        sequence_number: u64,
        mime_type: String,
    },
    /// No more fragments for this turn
    AudioEnd {
        fragment_count: u64,
        total_time_ms: u64,
        #[serde(default)]
        time_to_first_fragment_ms: Option<u64>,
    },
    /// The turn failed
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// Keep-alive reply
    Pong,
}

impl ServerMessage {
    /// Status message with the stage's standard text
    #[must_use]
    pub fn status(stage: Stage) -> Self {
        Self::Status {
            stage,
            message: stage.message().to_string(),
        }
    }

    /// Fragment message carrying raw audio bytes
    #[must_use]
    pub fn audio_fragment(bytes: &[u8], sequence_number: u64, mime_type: &str) -> Self {
        Self::AudioFragment {
            payload: BASE64.encode(bytes),
            sequence_number,
            mime_type: mime_type.to_string(),
        }
    }

    /// Error message with optional details
    #[must_use]
    pub fn error(message: impl Into<String>, details: Option<String>) -> Self {
        Self::Error {
            message: message.into(),
            details,
        }
    }

    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known server message
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this message carries audio
    #[must_use]
    pub const fn is_audio(&self) -> bool {
        matches!(self, Self::AudioFragment { .. })
    }
}

/// Reply of the one-shot conversation endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationReply {
    pub transcript: String,
    pub response: String,
    /// Synthesizer that will voice the response
    pub tts_provider: String,
    pub processing_time_ms: u64,
}

/// Body of the one-shot synthesis endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,
}

/// Reply of the one-shot synthesis endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsReply {
    /// Base64 audio bytes
    pub audio: String,
    pub provider: String,
    #[serde(default = "default_tts_mime")]
    pub mime_type: String,
}

fn default_tts_mime() -> String {
    "audio/mpeg".to_string()
}

/// Decode a base64 payload
///
/// # Errors
///
/// Returns `Error::Decode` for invalid base64
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload.trim())
        .map_err(|e| Error::Decode(format!("invalid base64 payload: {e}")))
}

/// Decoded size of a base64 payload, computed without decoding
#[must_use]
pub fn estimated_decoded_len(payload: &str) -> usize {
    let trimmed = payload.trim();
    let padding = trimmed.bytes().rev().take_while(|&b| b == b'=').count();
    (trimmed.len() / 4 * 3).saturating_sub(padding.min(2))
}

/// Turn an `audio-fragment` payload into a queue fragment
///
/// # Errors
///
/// Returns `Error::Decode` for invalid base64
pub fn fragment_from_wire(
    payload: &str,
    sequence_number: u64,
    mime_type: &str,
) -> Result<AudioFragment> {
    Ok(AudioFragment {
        payload: decode_payload(payload)?,
        sequence_number,
        mime_type: mime_type.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_audio_wire_format() {
        let msg = ClientMessage::AudioData {
            audio: "AAEC".into(),
            mime_type: "audio/wav".into(),
        };
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"audio-data","audio":"AAEC","mime_type":"audio/wav"}"#
        );
        assert_eq!(ClientMessage::parse(&json).unwrap(), msg);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"cancel-processing"}"#).unwrap(),
            ClientMessage::CancelProcessing
        );
    }

    #[test]
    fn server_messages_are_kebab_tagged() {
        let json = ServerMessage::status(Stage::Synthesizing).to_json().unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""stage":"synthesizing""#));

        let end = ServerMessage::parse(
            r#"{"type":"audio-end","fragment_count":3,"total_time_ms":900}"#,
        )
        .unwrap();
        assert_eq!(
            end,
            ServerMessage::AudioEnd {
                fragment_count: 3,
                total_time_ms: 900,
                time_to_first_fragment_ms: None,
            }
        );

        let err = ServerMessage::error("failed", None).to_json().unwrap();
        assert!(!err.contains("details"));
    }

    #[test]
    fn fragment_payload_survives_base64() {
        let bytes: Vec<u8> = (0..=255).collect();
        let ServerMessage::AudioFragment {
            payload,
            sequence_number,
            mime_type,
        } = ServerMessage::audio_fragment(&bytes, 4, "audio/mpeg")
        else {
            panic!("expected fragment");
        };
        let fragment = fragment_from_wire(&payload, sequence_number, &mime_type).unwrap();
        assert_eq!(fragment.payload, bytes);
        assert_eq!(fragment.sequence_number, 4);
    }

    #[test]
    fn decoded_length_estimate() {
        assert_eq!(estimated_decoded_len(""), 0);
        assert_eq!(estimated_decoded_len("QQ=="), 1);
        assert_eq!(estimated_decoded_len("QUI="), 2);
        assert_eq!(estimated_decoded_len("QUJD"), 3);
        let payload = BASE64.encode([0u8; 49]);
        assert_eq!(estimated_decoded_len(&payload), 49);
    }

    #[test]
    fn bad_base64_is_decode_error() {
        assert!(matches!(decode_payload("***"), Err(Error::Decode(_))));
    }
}
