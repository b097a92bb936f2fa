//! Client side of the network channel
//!
//! [`WsTransport`] keeps one persistent WebSocket open and reconnects on
//! loss. [`HttpTransport`] drives the one-shot HTTP endpoints instead and
//! replays their replies as the same event sequence, so the session
//! controller does not care which one it talks to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::ClientConfig;
use crate::protocol::{
    ClientMessage, ConversationReply, ServerMessage, Stage, TtsReply, TtsRequest, decode_payload,
};
use crate::voice::{CommittedAudio, SAMPLE_RATE, WAV_MIME_TYPE};
use crate::{Error, Result};

/// What the channel reports to the controller, in connection order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is usable
    Connected,
    /// The channel dropped; reconnection may follow
    Disconnected { reason: String },
    /// Reconnection attempts are exhausted
    Closed { reason: String },
    /// A message from the server
    Server(ServerMessage),
}

/// Bidirectional channel to the conversation server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the channel is down; the message is dropped
    async fn send(&self, message: ClientMessage) -> Result<()>;

    /// Send a committed segment
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the channel is down; the audio is dropped
    async fn send_audio(&self, audio: &CommittedAudio) -> Result<()> {
        tracing::debug!(bytes = audio.bytes.len(), "sending committed audio");
        self.send(ClientMessage::audio(audio)).await
    }

    /// Whether messages can currently be sent
    fn is_connected(&self) -> bool;
}

/// Persistent WebSocket channel with automatic reconnection
pub struct WsTransport {
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WsTransport {
    /// Start connecting in the background
    ///
    /// Progress is reported through the returned event receiver.
    #[must_use]
    pub fn connect(config: &ClientConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let outgoing = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let supervisor = Supervisor {
            url: config.server_url.clone(),
            attempts: config.reconnect_attempts,
            delay: Duration::from_millis(config.reconnect_delay_ms),
            outgoing: Arc::clone(&outgoing),
            connected: Arc::clone(&connected),
            running: Arc::clone(&running),
            events,
        };
        let task = tokio::spawn(supervisor.run());

        let transport = Self {
            outgoing,
            connected,
            running,
            task,
        };
        (transport, rx)
    }

    /// Close the connection and stop reconnecting
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.outgoing.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        let slot = self.outgoing.lock().await;
        let sender = slot
            .as_ref()
            .ok_or_else(|| Error::Transport("not connected".to_string()))?;
        sender
            .send(text)
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct Supervisor {
    url: String,
    attempts: u32,
    delay: Duration,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Supervisor {
    async fn run(self) {
        let mut failures = 0u32;

        while self.running.load(Ordering::SeqCst) {
            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    failures = 0;
                    tracing::info!(url = %self.url, "connected to conversation server");
                    let reason = self.serve(stream).await;
                    self.connected.store(false, Ordering::SeqCst);
                    self.outgoing.lock().await.take();
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::warn!(reason = %reason, "connection lost");
                    let _ = self.events.send(TransportEvent::Disconnected { reason });
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        url = %self.url,
                        attempt = failures,
                        error = %e,
                        "connection attempt failed"
                    );
                    if failures > self.attempts {
                        let reason = format!("gave up after {failures} attempts: {e}");
                        tracing::error!(reason = %reason, "conversation server unreachable");
                        let _ = self.events.send(TransportEvent::Closed { reason });
                        break;
                    }
                }
            }

            tokio::time::sleep(self.delay).await;
        }
    }

    /// Pump one connection until it ends, returning why it ended
    async fn serve<S>(&self, stream: tokio_tungstenite::WebSocketStream<S>) -> String
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.outgoing.lock().await = Some(out_tx);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected);

        loop {
            tokio::select! {
                Some(text) = out_rx.recv() => {
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        return format!("send failed: {e}");
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => match ServerMessage::parse(&text) {
                        Ok(message) => {
                            let _ = self.events.send(TransportEvent::Server(message));
                        }
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                frame = %text.chars().take(100).collect::<String>(),
                                "unrecognized server frame"
                            );
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return "server closed connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return e.to_string(),
                },
            }
        }
    }
}

/// One-shot HTTP client for the conversation endpoints
#[derive(Clone)]
pub struct HttpConversationClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConversationClient {
    /// Create a client for the server at `base_url`
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Submit audio, receiving transcript and response text
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the server reports an error
    pub async fn converse(&self, audio: &CommittedAudio) -> Result<ConversationReply> {
        let response = self
            .client
            .post(format!("{}/api/conversation", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, audio.mime_type)
            .body(audio.bytes.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("conversation error {status}: {body}")));
        }
        Ok(response.json().await?)
    }

    /// Request synthesized audio for `text`
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the server reports an error
    pub async fn synthesize(&self, text: &str) -> Result<TtsReply> {
        let response = self
            .client
            .post(format!("{}/api/tts", self.base_url))
            .json(&TtsRequest {
                text: text.to_string(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("tts error {status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

/// Request/response alternative to the persistent channel
///
/// Each submitted segment becomes one conversation call plus one synthesis
/// call; the replies are re-emitted as server messages.
pub struct HttpTransport {
    client: HttpConversationClient,
    events: mpsc::UnboundedSender<TransportEvent>,
    in_flight: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Create the transport; it reports itself connected immediately
    #[must_use]
    pub fn new(config: &ClientConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Connected);
        let transport = Self {
            client: HttpConversationClient::new(&config.http_url),
            events,
            in_flight: std::sync::Mutex::new(None),
        };
        (transport, rx)
    }

    fn replace_in_flight(&self, task: Option<JoinHandle<()>>) {
        if let Ok(mut slot) = self.in_flight.lock() {
            if let Some(previous) = slot.take() {
                previous.abort();
            }
            *slot = task;
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::AudioData { audio, mime_type } => {
                let bytes = decode_payload(&audio)?;
                let committed = CommittedAudio {
                    bytes,
                    sample_rate: SAMPLE_RATE,
                    mime_type: if mime_type == WAV_MIME_TYPE {
                        WAV_MIME_TYPE
                    } else {
                        "application/octet-stream"
                    },
                };
                let client = self.client.clone();
                let events = self.events.clone();
                let task = tokio::spawn(async move {
                    run_http_turn(&client, &committed, &events).await;
                });
                self.replace_in_flight(Some(task));
            }
            ClientMessage::CancelProcessing => {
                self.replace_in_flight(None);
                let _ = self
                    .events
                    .send(TransportEvent::Server(ServerMessage::status(Stage::Cancelled)));
            }
            ClientMessage::Ping => {
                let _ = self.events.send(TransportEvent::Server(ServerMessage::Pong));
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.events.is_closed()
    }
}

async fn run_http_turn(
    client: &HttpConversationClient,
    audio: &CommittedAudio,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let emit = |message: ServerMessage| {
        let _ = events.send(TransportEvent::Server(message));
    };
    let started = Instant::now();

    emit(ServerMessage::status(Stage::Transcribing));
    let reply = match client.converse(audio).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(error = %e, "conversation request failed");
            emit(ServerMessage::error("Error processing audio", Some(e.to_string())));
            return;
        }
    };
    emit(ServerMessage::Transcript {
        text: reply.transcript,
    });
    emit(ServerMessage::Response {
        text: reply.response.clone(),
    });

    emit(ServerMessage::status(Stage::Synthesizing));
    let tts = match client.synthesize(&reply.response).await {
        Ok(tts) => tts,
        Err(e) => {
            tracing::error!(error = %e, "synthesis request failed");
            emit(ServerMessage::error("Error generating audio", Some(e.to_string())));
            return;
        }
    };

    #[allow(clippy::cast_possible_truncation)]
    let elapsed = started.elapsed().as_millis() as u64;
    emit(ServerMessage::AudioFragment {
        payload: tts.audio,
        sequence_number: 1,
        mime_type: tts.mime_type,
    });
    emit(ServerMessage::AudioEnd {
        fragment_count: 1,
        total_time_ms: elapsed,
        time_to_first_fragment_ms: Some(elapsed),
    });
    emit(ServerMessage::status(Stage::Done));
}
