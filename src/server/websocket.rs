//! WebSocket turn pipeline
//!
//! One turn at a time per connection: audio that arrives while a turn is
//! in flight is ignored, and `cancel-processing` aborts the turn.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::ServerState;
use crate::protocol::{ClientMessage, ServerMessage, Stage, decode_payload};
use crate::voice::WAV_MIME_TYPE;
use crate::{Error, Result};

/// Build the `/ws` router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new().route("/", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // base64 inflates audio by a third
    let max_message = state.max_audio_bytes.saturating_mul(4) / 3 + 1024;
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);

    tracing::info!("WebSocket connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg.to_json() {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize server message"),
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        let mut turn: Option<JoinHandle<()>> = None;

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match ClientMessage::parse(text.as_str()) {
                    Ok(ClientMessage::AudioData { audio, mime_type }) => match decode_payload(&audio)
                    {
                        Ok(bytes) => begin_turn(&mut turn, &state, &tx, bytes, mime_type),
                        Err(e) => {
                            let _ = tx
                                .send(ServerMessage::error("invalid audio", Some(e.to_string())))
                                .await;
                        }
                    },
                    Ok(ClientMessage::CancelProcessing) => {
                        if let Some(handle) = turn.take() {
                            handle.abort();
                            tracing::info!("turn cancelled by client");
                        }
                        let _ = tx.send(ServerMessage::status(Stage::Cancelled)).await;
                    }
                    Ok(ClientMessage::Ping) => {
                        let _ = tx.send(ServerMessage::Pong).await;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(ServerMessage::error("invalid message", Some(e.to_string())))
                            .await;
                    }
                },
                Message::Binary(data) => {
                    begin_turn(&mut turn, &state, &tx, data.to_vec(), WAV_MIME_TYPE.to_string());
                }
                Message::Close(_) => {
                    tracing::info!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }

        if let Some(handle) = turn {
            handle.abort();
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

fn begin_turn(
    turn: &mut Option<JoinHandle<()>>,
    state: &Arc<ServerState>,
    tx: &mpsc::Sender<ServerMessage>,
    audio: Vec<u8>,
    mime_type: String,
) {
    if turn.as_ref().is_some_and(|t| !t.is_finished()) {
        tracing::warn!("turn already in flight, ignoring audio");
        return;
    }
    let state = Arc::clone(state);
    let tx = tx.clone();
    *turn = Some(tokio::spawn(async move {
        run_turn(&state, audio, &mime_type, &tx).await;
    }));
}

/// Run one conversation turn, streaming its messages into `tx`
pub async fn run_turn(
    state: &ServerState,
    audio: Vec<u8>,
    mime_type: &str,
    tx: &mpsc::Sender<ServerMessage>,
) {
    tracing::info!(audio_bytes = audio.len(), mime_type, "turn started");
    if let Err(e) = turn_pipeline(state, &audio, mime_type, tx).await {
        tracing::error!(error = %e, "turn failed");
        let _ = tx
            .send(ServerMessage::error("Error processing audio", Some(e.to_string())))
            .await;
    }
}

async fn emit(tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) -> Result<()> {
    tx.send(msg)
        .await
        .map_err(|_| Error::Transport("client disconnected".to_string()))
}

fn millis_since(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn turn_pipeline(
    state: &ServerState,
    audio: &[u8],
    mime_type: &str,
    tx: &mpsc::Sender<ServerMessage>,
) -> Result<()> {
    let started = Instant::now();
    let transcriber = state.transcriber()?;
    let responder = state.responder()?;
    let synthesizer = state.synthesizer()?;

    emit(tx, ServerMessage::status(Stage::Transcribing)).await?;
    let transcript = transcriber.transcribe(audio, mime_type).await?;
    emit(tx, ServerMessage::Transcript { text: transcript.clone() }).await?;

    if transcript.trim().is_empty() {
        tracing::info!("empty transcript, nothing to answer");
        return emit(tx, ServerMessage::status(Stage::Done)).await;
    }

    emit(tx, ServerMessage::status(Stage::Generating)).await?;
    let response = responder.respond(&transcript).await?;
    emit(tx, ServerMessage::Response { text: response.clone() }).await?;

    emit(tx, ServerMessage::status(Stage::Synthesizing)).await?;
    let mut chunks = synthesizer.synthesize_stream(&response).await?;

    let mut fragment_count = 0u64;
    let mut time_to_first_fragment_ms = None;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        if fragment_count == 0 {
            let ms = millis_since(started);
            tracing::info!(ms, "first audio fragment");
            time_to_first_fragment_ms = Some(ms);
        }
        fragment_count += 1;
        emit(
            tx,
            ServerMessage::audio_fragment(&chunk, fragment_count, synthesizer.mime_type()),
        )
        .await?;
    }

    let total_time_ms = millis_since(started);
    tracing::info!(fragment_count, total_time_ms, "turn complete");
    emit(
        tx,
        ServerMessage::AudioEnd {
            fragment_count,
            total_time_ms,
            time_to_first_fragment_ms,
        },
    )
    .await?;
    emit(tx, ServerMessage::status(Stage::Done)).await
}
