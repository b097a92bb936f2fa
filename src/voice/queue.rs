//! Streaming playback queue
//!
//! Plays server-pushed audio fragments either one at a time as they arrive
//! (incremental) or as a single gapless buffer once the stream ends (batch).
//! Both strategies share one session runner so interruption works the same
//! way for each.
//!
//! Every session is stamped with a generation number. Starting a new session
//! or interrupting bumps the counter, and a session task re-checks its
//! generation after every await, so results from a superseded session never
//! reach the sink or the event channel.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PlaybackConfig;
use crate::voice::decode::{AudioDecoder, DecodedAudio};
use crate::voice::sink::AudioSink;
use crate::{Error, Result};

/// Playback strategy, chosen per session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Decode and play each fragment as it arrives
    #[default]
    Incremental,
    /// Buffer everything and play one concatenation at the end
    Batch,
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incremental => write!(f, "incremental"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

impl FromStr for PlaybackMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" | "streaming" => Ok(Self::Incremental),
            "batch" => Ok(Self::Batch),
            other => Err(Error::Config(format!("unknown playback mode: {other}"))),
        }
    }
}

/// One unit of synthesized audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    /// Encoded audio bytes
    pub payload: Vec<u8>,
    /// Position in the stream
    pub sequence_number: u64,
    /// Container MIME type
    pub mime_type: String,
}

/// Aggregate figures for a completed session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackMetrics {
    /// Fragments accepted and played
    pub fragment_count: usize,
    /// Fragments that failed to decode
    pub skipped_count: usize,
    /// Session start to completion
    pub elapsed_ms: u64,
    /// Session start to first audible output
    pub time_to_first_audio_ms: Option<u64>,
}

/// Notifications from playback sessions, tagged with their generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// First audio of the session reached the sink
    Started { generation: u64 },
    /// A fragment failed to decode and was skipped
    FragmentSkipped {
        generation: u64,
        sequence_number: u64,
        reason: String,
    },
    /// All fragments played
    Completed {
        generation: u64,
        metrics: PlaybackMetrics,
    },
    /// The session aborted
    Failed { generation: u64, message: String },
}

impl PlaybackEvent {
    /// Generation of the session that produced the event
    #[must_use]
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Started { generation }
            | Self::FragmentSkipped { generation, .. }
            | Self::Completed { generation, .. }
            | Self::Failed { generation, .. } => *generation,
        }
    }
}

enum SessionCommand {
    Fragment(AudioFragment),
    End,
}

struct ActiveSession {
    generation: u64,
    mode: PlaybackMode,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

/// Owner of the single audio output lane
pub struct PlaybackQueue {
    decoder: Arc<dyn AudioDecoder>,
    sink: Arc<dyn AudioSink>,
    min_fragment_bytes: usize,
    generation: Arc<AtomicU64>,
    active: Option<ActiveSession>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackQueue {
    /// Create a queue and the receiver for its events
    #[must_use]
    pub fn new(
        decoder: Arc<dyn AudioDecoder>,
        sink: Arc<dyn AudioSink>,
        config: &PlaybackConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let queue = Self {
            decoder,
            sink,
            min_fragment_bytes: config.min_fragment_bytes,
            generation: Arc::new(AtomicU64::new(0)),
            active: None,
            events,
        };
        (queue, rx)
    }

    /// Generation of the newest session
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether a session is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|s| s.generation == self.current_generation() && !s.task.is_finished())
    }

    /// Mode of the live session
    #[must_use]
    pub fn mode(&self) -> Option<PlaybackMode> {
        self.active.as_ref().map(|s| s.mode)
    }

    /// Start a new session, superseding any previous one
    pub fn start(&mut self, mode: PlaybackMode) -> u64 {
        if self.active.is_some() {
            self.invalidate();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (commands, rx) = mpsc::unbounded_channel();
        let runner = SessionRunner {
            generation,
            current: Arc::clone(&self.generation),
            decoder: Arc::clone(&self.decoder),
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
            started: Instant::now(),
            first_audio: None,
            played: 0,
            skipped: 0,
        };
        let task = tokio::spawn(runner.run(mode, rx));

        tracing::debug!(generation, %mode, "playback session started");
        self.active = Some(ActiveSession {
            generation,
            mode,
            commands,
            task,
        });
        generation
    }

    /// Whether a fragment of `decoded_len` bytes is padding rather than audio
    #[must_use]
    pub const fn is_negligible(&self, decoded_len: usize) -> bool {
        decoded_len < self.min_fragment_bytes
    }

    /// Append a fragment to the session it belongs to
    ///
    /// Returns `false` when the fragment was dropped, either because its
    /// session is no longer current or because it is below the size floor.
    pub fn enqueue(&self, generation: u64, fragment: AudioFragment) -> bool {
        let Some(session) = self.current_session(generation) else {
            tracing::warn!(
                generation,
                sequence = fragment.sequence_number,
                "dropping fragment for stale playback session"
            );
            return false;
        };

        if self.is_negligible(fragment.payload.len()) {
            tracing::debug!(
                generation,
                sequence = fragment.sequence_number,
                bytes = fragment.payload.len(),
                "dropping negligible fragment"
            );
            return false;
        }

        session
            .commands
            .send(SessionCommand::Fragment(fragment))
            .is_ok()
    }

    /// Mark the end of the fragment stream
    pub fn signal_end(&self, generation: u64) {
        if let Some(session) = self.current_session(generation) {
            if session.commands.send(SessionCommand::End).is_err() {
                tracing::debug!(generation, "playback session already finished");
            }
        } else {
            tracing::debug!(generation, "end signal for stale playback session ignored");
        }
    }

    /// Halt playback immediately and discard everything pending
    pub fn interrupt(&mut self) {
        if self.active.is_some() {
            self.invalidate();
            tracing::debug!(
                generation = self.current_generation(),
                "playback interrupted"
            );
        }
    }

    fn current_session(&self, generation: u64) -> Option<&ActiveSession> {
        self.active
            .as_ref()
            .filter(|s| s.generation == generation && generation == self.current_generation())
    }

    fn invalidate(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sink.stop();
        if let Some(session) = self.active.take() {
            session.task.abort();
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.invalidate();
    }
}

struct SessionRunner {
    generation: u64,
    current: Arc<AtomicU64>,
    decoder: Arc<dyn AudioDecoder>,
    sink: Arc<dyn AudioSink>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    started: Instant,
    first_audio: Option<u64>,
    played: usize,
    skipped: usize,
}

impl SessionRunner {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn emit(&self, event: PlaybackEvent) {
        if self.is_current() {
            let _ = self.events.send(event);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn run(mut self, mode: PlaybackMode, commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let outcome = match mode {
            PlaybackMode::Incremental => self.run_incremental(commands).await,
            PlaybackMode::Batch => self.run_batch(commands).await,
        };

        if !self.is_current() {
            tracing::debug!(generation = self.generation, "superseded session exiting");
            return;
        }

        match outcome {
            Ok(()) => {
                let metrics = PlaybackMetrics {
                    fragment_count: self.played,
                    skipped_count: self.skipped,
                    elapsed_ms: self.elapsed_ms(),
                    time_to_first_audio_ms: self.first_audio,
                };
                tracing::info!(
                    generation = self.generation,
                    fragments = metrics.fragment_count,
                    skipped = metrics.skipped_count,
                    elapsed_ms = metrics.elapsed_ms,
                    first_audio_ms = ?metrics.time_to_first_audio_ms,
                    "playback complete"
                );
                self.emit(PlaybackEvent::Completed {
                    generation: self.generation,
                    metrics,
                });
            }
            Err(e) => {
                tracing::error!(generation = self.generation, error = %e, "playback session failed");
                self.emit(PlaybackEvent::Failed {
                    generation: self.generation,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn run_incremental(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<()> {
        while let Some(command) = commands.recv().await {
            let fragment = match command {
                SessionCommand::Fragment(fragment) => fragment,
                SessionCommand::End => break,
            };

            let decoded = self
                .decoder
                .decode(&fragment.payload, &fragment.mime_type)
                .await;
            if !self.is_current() {
                return Ok(());
            }

            match decoded {
                Ok(audio) => {
                    self.play(audio).await?;
                    if !self.is_current() {
                        return Ok(());
                    }
                    self.played += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        generation = self.generation,
                        sequence = fragment.sequence_number,
                        error = %e,
                        "skipping undecodable fragment"
                    );
                    self.skipped += 1;
                    self.emit(PlaybackEvent::FragmentSkipped {
                        generation: self.generation,
                        sequence_number: fragment.sequence_number,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn run_batch(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<()> {
        let mut fragments = Vec::new();
        while let Some(command) = commands.recv().await {
            match command {
                SessionCommand::Fragment(fragment) => fragments.push(fragment),
                SessionCommand::End => break,
            }
        }

        if fragments.is_empty() || !self.is_current() {
            return Ok(());
        }

        let mime_type = fragments[0].mime_type.clone();
        let total: usize = fragments.iter().map(|f| f.payload.len()).sum();
        let mut blob = Vec::with_capacity(total);
        for fragment in &fragments {
            blob.extend_from_slice(&fragment.payload);
        }
        tracing::debug!(
            generation = self.generation,
            fragments = fragments.len(),
            bytes = blob.len(),
            "decoding concatenated stream"
        );

        let audio = self.decoder.decode(&blob, &mime_type).await?;
        if !self.is_current() {
            return Ok(());
        }

        self.play(audio).await?;
        self.played = fragments.len();
        Ok(())
    }

    async fn play(&mut self, audio: DecodedAudio) -> Result<()> {
        if self.first_audio.is_none() {
            self.first_audio = Some(self.elapsed_ms());
            self.emit(PlaybackEvent::Started {
                generation: self.generation,
            });
        }
        self.sink.play(audio).await
    }
}
