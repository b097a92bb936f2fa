//! One-shot HTTP endpoints

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use super::ServerState;
use crate::protocol::{ConversationReply, TtsReply, TtsRequest};
use crate::voice::WAV_MIME_TYPE;

/// Build the `/api` router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/conversation", post(conversation))
        .route("/tts", post(tts))
        .route("/status", get(status))
        .with_state(state)
}

/// Build health router (liveness only, no state needed)
pub fn health_router() -> Router {
    Router::new().route("/health", get(health))
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Collaborator readiness
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub stt_available: bool,
    pub llm_available: bool,
    pub tts_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_provider: Option<&'static str>,
}

async fn status(State(state): State<Arc<ServerState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        stt_available: state.transcriber.is_some(),
        llm_available: state.responder.is_some(),
        tts_available: state.synthesizer.is_some(),
        tts_provider: state.synthesizer.as_ref().map(|s| s.provider()),
    })
}

/// Transcribe and answer one utterance
///
/// The body is the raw audio container; its `Content-Type` names the format.
async fn conversation(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ConversationReply>, ConversationError> {
    let started = Instant::now();

    let transcriber = state
        .transcriber
        .as_ref()
        .ok_or(ConversationError::NotConfigured("STT not configured"))?;
    let responder = state
        .responder
        .as_ref()
        .ok_or(ConversationError::NotConfigured("response generation not configured"))?;

    if body.is_empty() {
        return Err(ConversationError::BadRequest("Empty audio data"));
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.starts_with("audio/"))
        .unwrap_or(WAV_MIME_TYPE);

    let transcript = transcriber
        .transcribe(&body, mime_type)
        .await
        .map_err(|e| ConversationError::TranscriptionFailed(e.to_string()))?;

    let response = responder
        .respond(&transcript)
        .await
        .map_err(|e| ConversationError::ResponseFailed(e.to_string()))?;

    let tts_provider = state
        .synthesizer
        .as_ref()
        .map_or("none", |s| s.provider())
        .to_string();

    let processing_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(processing_time_ms, "conversation turn answered");

    Ok(Json(ConversationReply {
        transcript,
        response,
        tts_provider,
        processing_time_ms,
    }))
}

/// Synthesize reply text in one piece
async fn tts(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TtsRequest>,
) -> Result<Json<TtsReply>, ConversationError> {
    let synthesizer = state
        .synthesizer
        .as_ref()
        .ok_or(ConversationError::NotConfigured("TTS not configured"))?;

    if request.text.trim().is_empty() {
        return Err(ConversationError::BadRequest("Empty text"));
    }

    let audio = synthesizer
        .synthesize(&request.text)
        .await
        .map_err(|e| ConversationError::SynthesisFailed(e.to_string()))?;

    Ok(Json(TtsReply {
        audio: BASE64.encode(audio),
        provider: synthesizer.provider().to_string(),
        mime_type: synthesizer.mime_type().to_string(),
    }))
}

/// HTTP endpoint errors
#[derive(Debug)]
pub enum ConversationError {
    NotConfigured(&'static str),
    BadRequest(&'static str),
    TranscriptionFailed(String),
    ResponseFailed(String),
    SynthesisFailed(String),
}

impl IntoResponse for ConversationError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::NotConfigured(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "not_configured", msg.to_string())
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
            Self::TranscriptionFailed(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "transcription_failed", msg)
            }
            Self::ResponseFailed(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "response_failed", msg),
            Self::SynthesisFailed(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "synthesis_failed", msg)
            }
        };

        tracing::warn!(code, message = %message, "request failed");
        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}
