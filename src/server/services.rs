//! Speech collaborators used by the conversation server
//!
//! Transcription (Whisper), response generation (chat completions) and
//! speech synthesis (ElevenLabs), each behind a trait so tests and
//! alternative providers can stand in.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::{Error, Result};

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ELEVENLABS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Stream of synthesized audio chunks
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Turns committed speech into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one audio container
    ///
    /// # Errors
    ///
    /// Returns `Error::Stt` if the collaborator rejects the audio
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String>;
}

/// Produces the assistant's reply to a transcript
#[async_trait]
pub trait Responder: Send + Sync {
    /// Generate a reply
    ///
    /// # Errors
    ///
    /// Returns `Error::Llm` if generation fails
    async fn respond(&self, transcript: &str) -> Result<String>;
}

/// Voices reply text
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Provider name reported to clients
    fn provider(&self) -> &'static str;

    /// Container type of the produced audio
    fn mime_type(&self) -> &'static str {
        "audio/mpeg"
    }

    /// Synthesize the whole reply at once
    ///
    /// # Errors
    ///
    /// Returns `Error::Tts` if synthesis fails
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Synthesize as a stream of chunks, first audio as early as possible
    ///
    /// # Errors
    ///
    /// Returns `Error::Tts` if the stream cannot be opened
    async fn synthesize_stream(&self, text: &str) -> Result<AudioStream>;
}

/// File name hint Whisper uses to detect the container
fn upload_name(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or_default().trim();
    match base {
        "audio/webm" => "audio.webm",
        "audio/mpeg" | "audio/mp3" => "audio.mp3",
        "audio/ogg" => "audio.ogg",
        _ => "audio.wav",
    }
}

/// Response from `OpenAI` Whisper transcription API
#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

/// `OpenAI` Whisper transcription
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl WhisperTranscriber {
    /// Create a transcriber for `model`
    #[must_use]
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), mime_type, "starting Whisper transcription");

        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(upload_name(mime_type))
            .mime_str(mime_type)
            .map_err(|e| Error::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(WHISPER_URL)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Stateless chat completion: every turn sees only the system prompt and
/// the latest transcript
pub struct ChatResponder {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    system_prompt: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatResponder {
    /// Create a responder from model settings
    #[must_use]
    pub fn new(api_key: SecretString, models: &ModelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: models.llm_model.clone(),
            system_prompt: models.system_prompt.clone(),
            max_tokens: models.max_tokens,
            temperature: 0.7,
        }
    }
}

#[async_trait]
impl Responder for ChatResponder {
    async fn respond(&self, transcript: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: transcript,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(CHAT_URL)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Llm(format!("chat API error {status}: {body}")));
        }

        let reply: ChatResponse = response.json().await?;
        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Llm("empty chat completion".to_string()))?;

        tracing::info!(chars = text.len(), "response generated");
        Ok(text)
    }
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    use_speaker_boost: bool,
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

/// ElevenLabs speech synthesis, MP3 output
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    model: String,
}

impl ElevenLabsSynthesizer {
    /// Create a synthesizer for the configured voice and model
    #[must_use]
    pub fn new(api_key: SecretString, models: &ModelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            voice: models.tts_voice.clone(),
            model: models.tts_model.clone(),
        }
    }

    async fn post(&self, url: &str, text: &str) -> Result<reqwest::Response> {
        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
                style: 0.0,
                use_speaker_boost: true,
            },
        };

        let response = self
            .client
            .post(url)
            .query(&[("output_format", "mp3_44100_128")])
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    fn provider(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{ELEVENLABS_URL}/{}", self.voice);
        let audio = self.post(&url, text).await?.bytes().await?;
        tracing::debug!(bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }

    async fn synthesize_stream(&self, text: &str) -> Result<AudioStream> {
        let url = format!("{ELEVENLABS_URL}/{}/stream", self.voice);
        let response = self.post(&url, text).await?;
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from));
        Ok(chunks.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_name_follows_container() {
        assert_eq!(upload_name("audio/wav"), "audio.wav");
        assert_eq!(upload_name("audio/webm;codecs=opus"), "audio.webm");
        assert_eq!(upload_name("audio/mpeg"), "audio.mp3");
        assert_eq!(upload_name("application/octet-stream"), "audio.wav");
    }

    #[test]
    fn chat_request_is_stateless() {
        let models = ModelConfig::default();
        let responder = ChatResponder::new(SecretString::from("sk-test"), &models);
        let request = ChatRequest {
            model: &responder.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &responder.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: "hola",
                },
            ],
            max_tokens: responder.max_tokens,
            temperature: responder.temperature,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert_eq!(json["max_tokens"], 500);
    }
}
