//! Conversation server integration tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use tokio::sync::mpsc;
use tower::ServiceExt;

use murmur::config::ClientConfig;
use murmur::protocol::{ClientMessage, ConversationReply, ServerMessage, Stage, TtsReply};
use murmur::server::{self, AudioStream, Responder, ServerState, Synthesizer, Transcriber};
use murmur::transport::{Transport, TransportEvent, WsTransport};
use murmur::voice::encoder;
use murmur::{Error, Result};

struct FakeTranscriber {
    text: &'static str,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &[u8], _mime_type: &str) -> Result<String> {
        if audio.starts_with(b"BAD") {
            return Err(Error::Stt("unsupported audio".to_string()));
        }
        Ok(self.text.to_string())
    }
}

struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, transcript: &str) -> Result<String> {
        Ok(format!("you said {transcript}"))
    }
}

/// Synthesizer whose audio is the reply text, streamed in 4-byte chunks
struct TextSynthesizer;

#[async_trait]
impl Synthesizer for TextSynthesizer {
    fn provider(&self) -> &'static str {
        "fake"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        Ok(text.as_bytes().to_vec())
    }

    async fn synthesize_stream(&self, text: &str) -> Result<AudioStream> {
        let chunks: Vec<Result<Vec<u8>>> = text
            .as_bytes()
            .chunks(4)
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

fn state(transcript: &'static str) -> Arc<ServerState> {
    Arc::new(ServerState {
        transcriber: Some(Arc::new(FakeTranscriber { text: transcript })),
        responder: Some(Arc::new(EchoResponder)),
        synthesizer: Some(Arc::new(TextSynthesizer)),
        max_audio_bytes: 1024 * 1024,
    })
}

fn unconfigured() -> Arc<ServerState> {
    Arc::new(ServerState {
        transcriber: None,
        responder: None,
        synthesizer: None,
        max_audio_bytes: 1024 * 1024,
    })
}

async fn json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = server::router(state("hola"), None);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_status_reports_collaborators() {
    let response = server::router(unconfigured(), None)
        .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = json(response).await;
    assert_eq!(json["stt_available"], false);
    assert_eq!(json["tts_available"], false);
    assert!(json.get("tts_provider").is_none());

    let response = server::router(state("hola"), None)
        .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = crate::json(response).await;
    assert_eq!(json["stt_available"], true);
    assert_eq!(json["llm_available"], true);
    assert_eq!(json["tts_provider"], "fake");
}

#[tokio::test]
async fn test_conversation_endpoint() {
    let audio = encoder::encode(&[0.1; 1600], 16000).unwrap();

    let response = server::router(state("hola"), None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/conversation")
                .header(header::CONTENT_TYPE, "audio/wav")
                .body(Body::from(audio.bytes))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let reply: ConversationReply = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply.transcript, "hola");
    assert_eq!(reply.response, "you said hola");
    assert_eq!(reply.tts_provider, "fake");
}

#[tokio::test]
async fn test_conversation_errors() {
    let empty = server::router(state("hola"), None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/conversation")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(empty).await["error"]["code"], "bad_request");

    let unconfigured = server::router(unconfigured(), None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/conversation")
                .body(Body::from(vec![1u8; 64]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unconfigured.status(), StatusCode::SERVICE_UNAVAILABLE);

    let rejected = server::router(state("hola"), None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/conversation")
                .body(Body::from(b"BAD audio".to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(rejected).await["error"]["code"], "transcription_failed");
}

#[tokio::test]
async fn test_tts_endpoint() {
    let response = server::router(state("hola"), None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tts")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"text":"buenas tardes"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let reply: TtsReply = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply.provider, "fake");
    assert_eq!(reply.mime_type, "audio/mpeg");
    assert_eq!(
        murmur::protocol::decode_payload(&reply.audio).unwrap(),
        b"buenas tardes"
    );

    let blank = server::router(state("hola"), None)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tts")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"text":"  "}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
}

async fn run_turn(state: &ServerState, audio: &[u8]) -> Vec<ServerMessage> {
    let (tx, mut rx) = mpsc::channel(256);
    server::websocket::run_turn(state, audio.to_vec(), "audio/wav", &tx).await;
    drop(tx);
    let mut messages = Vec::new();
    while let Some(msg) = rx.recv().await {
        messages.push(msg);
    }
    messages
}

#[tokio::test]
async fn turn_emits_messages_in_order() {
    let messages = run_turn(&state("hola"), &[1u8; 64]).await;

    // "you said hola" is 13 bytes: four fragments
    assert_eq!(messages[0], ServerMessage::status(Stage::Transcribing));
    assert_eq!(messages[1], ServerMessage::Transcript { text: "hola".into() });
    assert_eq!(messages[2], ServerMessage::status(Stage::Generating));
    assert_eq!(
        messages[3],
        ServerMessage::Response {
            text: "you said hola".into()
        }
    );
    assert_eq!(messages[4], ServerMessage::status(Stage::Synthesizing));

    let sequence: Vec<u64> = messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::AudioFragment {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        })
        .collect();
    assert_eq!(sequence, vec![1, 2, 3, 4]);

    let n = messages.len();
    assert!(matches!(
        messages[n - 2],
        ServerMessage::AudioEnd {
            fragment_count: 4,
            time_to_first_fragment_ms: Some(_),
            ..
        }
    ));
    assert_eq!(messages[n - 1], ServerMessage::status(Stage::Done));
}

#[tokio::test]
async fn empty_transcript_ends_the_turn_early() {
    let messages = run_turn(&state("   "), &[1u8; 64]).await;
    assert_eq!(messages.last(), Some(&ServerMessage::status(Stage::Done)));
    assert!(!messages.iter().any(ServerMessage::is_audio));
    assert!(!messages.iter().any(|m| matches!(m, ServerMessage::Response { .. })));
}

#[tokio::test]
async fn failed_turn_reports_an_error() {
    let messages = run_turn(&state("hola"), b"BAD").await;
    let Some(ServerMessage::Error { message, details }) = messages.last() else {
        panic!("expected an error, got {messages:?}");
    };
    assert_eq!(message, "Error processing audio");
    assert!(details.as_deref().unwrap_or_default().contains("unsupported audio"));

    let messages = run_turn(&unconfigured(), &[1u8; 64]).await;
    assert!(matches!(messages.as_slice(), [ServerMessage::Error { .. }]));
}

async fn next_server_message(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> ServerMessage {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Some(TransportEvent::Server(message))) => return message,
            Ok(Some(TransportEvent::Connected)) => {}
            Ok(Some(other)) => panic!("unexpected transport event: {other:?}"),
            Ok(None) | Err(_) => panic!("no server message"),
        }
    }
}

#[tokio::test]
async fn websocket_round_trip() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = server::router(state("hola"), None);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = ClientConfig {
        server_url: format!("ws://127.0.0.1:{port}/ws"),
        reconnect_attempts: 2,
        reconnect_delay_ms: 50,
        ..ClientConfig::default()
    };
    let (transport, mut events) = WsTransport::connect(&config);

    let connected = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .unwrap();
    assert_eq!(connected, Some(TransportEvent::Connected));

    transport.send(ClientMessage::Ping).await.unwrap();
    assert_eq!(next_server_message(&mut events).await, ServerMessage::Pong);

    let audio = encoder::encode(&[0.2; 800], 16000).unwrap();
    transport.send_audio(&audio).await.unwrap();

    let mut fragments = 0;
    loop {
        match next_server_message(&mut events).await {
            ServerMessage::AudioFragment { .. } => fragments += 1,
            ServerMessage::Status {
                stage: Stage::Done, ..
            } => break,
            ServerMessage::Error { message, details } => {
                panic!("turn failed: {message} {details:?}")
            }
            _ => {}
        }
    }
    assert_eq!(fragments, 4);

    transport.close().await;
}
