//! Conversation server
//!
//! Hosts the WebSocket turn pipeline at `/ws` plus the one-shot HTTP
//! endpoints. Speech collaborators are optional so the server can start
//! (and report readiness) without keys.

pub mod http;
pub mod services;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

pub use services::{
    AudioStream, ChatResponder, ElevenLabsSynthesizer, Responder, Synthesizer, Transcriber,
    WhisperTranscriber,
};

use crate::{Config, Error, Result};

/// Shared state for all connections
pub struct ServerState {
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub responder: Option<Arc<dyn Responder>>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    /// Largest accepted audio upload
    pub max_audio_bytes: usize,
}

impl ServerState {
    /// Build collaborators from configured API keys
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let openai = config.api_keys.openai.clone();
        let transcriber = openai.clone().map(|key| {
            Arc::new(WhisperTranscriber::new(key, config.models.stt_model.clone()))
                as Arc<dyn Transcriber>
        });
        let responder = openai
            .map(|key| Arc::new(ChatResponder::new(key, &config.models)) as Arc<dyn Responder>);
        let synthesizer = config.api_keys.elevenlabs.clone().map(|key| {
            Arc::new(ElevenLabsSynthesizer::new(key, &config.models)) as Arc<dyn Synthesizer>
        });

        if transcriber.is_none() {
            tracing::warn!("no OpenAI API key: transcription and responses unavailable");
        }
        if synthesizer.is_none() {
            tracing::warn!("no ElevenLabs API key: speech synthesis unavailable");
        }

        Self {
            transcriber,
            responder,
            synthesizer,
            max_audio_bytes: config.server.max_audio_bytes,
        }
    }

    /// Whether every collaborator of a full turn is present
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.transcriber.is_some() && self.responder.is_some() && self.synthesizer.is_some()
    }

    fn transcriber(&self) -> Result<&Arc<dyn Transcriber>> {
        self.transcriber
            .as_ref()
            .ok_or_else(|| Error::Config("transcription not configured".to_string()))
    }

    fn responder(&self) -> Result<&Arc<dyn Responder>> {
        self.responder
            .as_ref()
            .ok_or_else(|| Error::Config("response generation not configured".to_string()))
    }

    fn synthesizer(&self) -> Result<&Arc<dyn Synthesizer>> {
        self.synthesizer
            .as_ref()
            .ok_or_else(|| Error::Config("speech synthesis not configured".to_string()))
    }
}

/// Build the router with all routes
pub fn router(state: Arc<ServerState>, static_dir: Option<&PathBuf>) -> Router {
    let body_limit = state.max_audio_bytes;
    let mut router = Router::new()
        .nest("/ws", websocket::router(Arc::clone(&state)))
        .nest("/api", http::router(state))
        .merge(http::health_router());

    if let Some(static_dir) = static_dir {
        let index_file = static_dir.join("index.html");
        let serve_dir = ServeDir::new(static_dir).not_found_service(ServeFile::new(&index_file));
        router = router.fallback_service(serve_dir);
        tracing::info!(path = %static_dir.display(), "serving static files");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Run the server until it fails
///
/// # Errors
///
/// Returns error if the server fails to bind or run
pub async fn serve(config: &Config) -> Result<()> {
    let state = Arc::new(ServerState::from_config(config));
    let app = router(state, config.server.static_dir.as_ref());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind server: {e}")))?;

    tracing::info!(port = config.server.port, "conversation server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Config(format!("server error: {e}")))?;

    Ok(())
}
