//! Conversation session controller
//!
//! Owns the Idle/Listening/Processing/Speaking state machine. Microphone
//! frames, the periodic silence check, server messages, playback events
//! and user actions are all handled on one task, one at a time.
//!
//! Frames are stamped with the session clock when they arrive, so speech
//! timestamps and the silence check read the same clock whatever the
//! device's own sample clock does. Capture is paused while the assistant
//! speaks.
//!
//! ```text
//!   Idle ──Start──► Listening ──commit──► Processing ──first audio──► Speaking
//!    ▲                 ▲  ▲                    │                         │
//!    │                 │  └──────done, no audio┘                         │
//!    │                 └──────────playback complete / Interrupt──────────┘
//!    └──────── Stop, capture failure, transport failure (from anywhere)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;
use crate::protocol::{self, ClientMessage, ServerMessage, Stage};
use crate::transport::{Transport, TransportEvent};
use crate::voice::{
    AudioDecoder, AudioFrame, AudioSink, FrameOracle, FrameReceiver, FrameSource, PlaybackEvent,
    PlaybackMetrics, PlaybackMode, PlaybackQueue, SegmenterEvent, SpeechModel, VoiceSegmenter,
};
use crate::{Error, Result};

/// Conversation state, one per client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl ConversationState {
    /// Whether `self → next` is a legal transition
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Idle)
                | (Self::Idle | Self::Processing | Self::Speaking, Self::Listening)
                | (Self::Listening, Self::Processing)
                | (Self::Processing, Self::Speaking)
        )
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// User-initiated actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Open the microphone and start listening
    Start,
    /// Release the microphone and abandon the current turn
    Stop,
    /// Cut the assistant off and listen again
    Interrupt,
    /// Start, stop or interrupt depending on the current state
    Toggle,
}

/// Updates for whatever presents the session to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    State(ConversationState),
    Status(String),
    Transcript(String),
    Response(String),
    /// Server-side timing reported at the end of a turn
    TurnTiming {
        fragment_count: u64,
        total_time_ms: u64,
        time_to_first_fragment_ms: Option<u64>,
    },
    /// Local playback figures
    Metrics(PlaybackMetrics),
    /// User-visible error, shown until dismissed
    Error {
        id: u64,
        message: String,
        dismiss_after: Duration,
    },
    /// The error with this id should disappear
    ErrorDismissed { id: u64 },
}

/// External pieces a session is built from
pub struct SessionParts<M> {
    pub model: M,
    pub source: Box<dyn FrameSource>,
    pub transport: Arc<dyn Transport>,
    pub decoder: Arc<dyn AudioDecoder>,
    pub sink: Arc<dyn AudioSink>,
}

/// Drives one client conversation
pub struct ConversationSession<M> {
    state: ConversationState,
    mode: PlaybackMode,
    check_interval: Duration,
    error_dismiss: Duration,
    oracle: FrameOracle<M>,
    segmenter: VoiceSegmenter,
    source: Box<dyn FrameSource>,
    frames: Option<FrameReceiver>,
    /// Session clock origin, reset when capture starts
    capture_started: Instant,
    transport: Arc<dyn Transport>,
    queue: PlaybackQueue,
    playback_events: Option<mpsc::UnboundedReceiver<PlaybackEvent>>,
    playback_generation: Option<u64>,
    discarding_turn: bool,
    notices: mpsc::UnboundedSender<Notice>,
    next_error_id: u64,
}

impl<M: SpeechModel> ConversationSession<M> {
    /// Build a session and the receiver for its notices
    #[must_use]
    pub fn new(config: &Config, parts: SessionParts<M>) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let (queue, playback_events) = PlaybackQueue::new(parts.decoder, parts.sink, &config.playback);

        let session = Self {
            state: ConversationState::Idle,
            mode: config.playback.mode,
            check_interval: Duration::from_millis(config.segmenter.check_interval_ms.max(1)),
            error_dismiss: Duration::from_millis(config.client.error_dismiss_ms),
            oracle: FrameOracle::new(parts.model, &config.segmenter),
            segmenter: VoiceSegmenter::new(&config.segmenter),
            source: parts.source,
            frames: None,
            capture_started: Instant::now(),
            transport: parts.transport,
            queue,
            playback_events: Some(playback_events),
            playback_generation: None,
            discarding_turn: false,
            notices,
            next_error_id: 0,
        };
        (session, rx)
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Process inputs until the action channel closes
    ///
    /// # Errors
    ///
    /// Returns error if the session was already run
    pub async fn run(
        mut self,
        mut actions: mpsc::Receiver<UserAction>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<()> {
        let mut playback_events = self
            .playback_events
            .take()
            .ok_or_else(|| Error::Config("session already running".to_string()))?;

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => self.handle_action(action).await,
                    None => break,
                },
                frame = next_frame(&mut self.frames) => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => self.fail(&Error::Capture("microphone stream ended".to_string())),
                },
                _ = ticker.tick() => self.check_silence().await,
                Some(event) = transport_events.recv() => self.handle_transport(event).await,
                Some(event) = playback_events.recv() => self.handle_playback(event),
            }
        }

        self.release_capture();
        self.queue.interrupt();
        tracing::debug!("conversation session ended");
        Ok(())
    }

    async fn handle_action(&mut self, action: UserAction) {
        tracing::debug!(?action, state = %self.state, "user action");
        match action {
            UserAction::Start => self.start_listening(),
            UserAction::Stop => self.stop().await,
            UserAction::Interrupt => self.interrupt().await,
            UserAction::Toggle => match self.state {
                ConversationState::Idle => self.start_listening(),
                ConversationState::Listening => self.stop().await,
                ConversationState::Processing | ConversationState::Speaking => {
                    self.interrupt().await;
                }
            },
        }
    }

    fn start_listening(&mut self) {
        if self.state != ConversationState::Idle {
            return;
        }

        match self.source.start() {
            Ok(frames) => {
                self.frames = Some(frames);
                self.capture_started = Instant::now();
                self.oracle.reset();
                self.segmenter.start();
                self.transition(ConversationState::Listening);
                self.status("Listening continuously, speak whenever you like");
            }
            Err(e) => self.fail(&e),
        }
    }

    async fn stop(&mut self) {
        if matches!(
            self.state,
            ConversationState::Processing | ConversationState::Speaking
        ) {
            self.cancel_turn().await;
        }
        self.release_capture();
        self.transition(ConversationState::Idle);
        self.status("Stopped");
    }

    async fn interrupt(&mut self) {
        if !matches!(
            self.state,
            ConversationState::Processing | ConversationState::Speaking
        ) {
            return;
        }
        tracing::info!(state = %self.state, "interrupting assistant");
        self.cancel_turn().await;
        self.resume_after_turn();
    }

    /// Abandon the turn in flight, locally and on the server
    async fn cancel_turn(&mut self) {
        self.queue.interrupt();
        self.playback_generation = None;
        self.discarding_turn = true;
        if let Err(e) = self.transport.send(ClientMessage::CancelProcessing).await {
            tracing::debug!(error = %e, "cancel not delivered");
        }
    }

    async fn handle_frame(&mut self, frame: Result<AudioFrame>) {
        match frame {
            Ok(frame) => {
                let received_ms = self.capture_clock_ms();
                tracing::trace!(
                    device_ms = frame.timestamp_ms,
                    received_ms,
                    "frame received"
                );
                self.oracle
                    .process(&frame.samples, received_ms, &mut self.segmenter);
                self.drain_segmenter().await;
            }
            Err(e) => self.fail(&e),
        }
    }

    async fn check_silence(&mut self) {
        if self.frames.is_none() {
            return;
        }
        self.segmenter.check_for_commit(self.capture_clock_ms());
        self.drain_segmenter().await;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn capture_clock_ms(&self) -> u64 {
        self.capture_started.elapsed().as_millis() as u64
    }

    async fn drain_segmenter(&mut self) {
        while let Some(event) = self.segmenter.next_event() {
            match event {
                SegmenterEvent::SpeechStart { timestamp_ms } => {
                    tracing::debug!(timestamp_ms, "user started speaking");
                    if self.state == ConversationState::Listening {
                        self.status("Listening...");
                    }
                }
                SegmenterEvent::BurstAppended { samples, bursts } => {
                    tracing::trace!(samples, bursts, "speech buffered");
                }
                SegmenterEvent::Misfire => tracing::trace!("speech misfire"),
                SegmenterEvent::Commit(audio) => {
                    if self.state != ConversationState::Listening {
                        tracing::debug!(
                            state = %self.state,
                            bytes = audio.bytes.len(),
                            "turn in progress, dropping committed audio"
                        );
                        continue;
                    }
                    self.transition(ConversationState::Processing);
                    self.status("Processing...");
                    self.discarding_turn = false;
                    if let Err(e) = self.transport.send_audio(&audio).await {
                        self.fail(&e);
                        return;
                    }
                }
                SegmenterEvent::Error(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                tracing::debug!("transport connected");
                self.status("Connected");
            }
            TransportEvent::Disconnected { reason } | TransportEvent::Closed { reason } => {
                self.fail(&Error::Transport(reason));
            }
            TransportEvent::Server(message) => self.handle_server(message).await,
        }
    }

    async fn handle_server(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Transcript { text } => self.notify(Notice::Transcript(text)),
            ServerMessage::Response { text } => {
                if !self.discarding_turn {
                    self.notify(Notice::Response(text));
                }
            }
            ServerMessage::Status { stage, message } => {
                self.status(&message);
                if stage == Stage::Done
                    && self.state == ConversationState::Processing
                    && self.playback_generation.is_none()
                {
                    self.resume_after_turn();
                }
            }
            ServerMessage::AudioFragment {
                payload,
                sequence_number,
                mime_type,
            } => self.handle_fragment(&payload, sequence_number, &mime_type),
            ServerMessage::AudioEnd {
                fragment_count,
                total_time_ms,
                time_to_first_fragment_ms,
            } => {
                if std::mem::take(&mut self.discarding_turn) {
                    tracing::debug!("end of interrupted turn");
                    return;
                }
                self.notify(Notice::TurnTiming {
                    fragment_count,
                    total_time_ms,
                    time_to_first_fragment_ms,
                });
                match self.playback_generation {
                    Some(generation) => self.queue.signal_end(generation),
                    None if self.state == ConversationState::Processing => {
                        self.resume_after_turn();
                    }
                    None => {}
                }
            }
            ServerMessage::Error { message, details } => {
                let text = details.map_or_else(|| message.clone(), |d| format!("{message}: {d}"));
                self.fail(&Error::Transport(text));
            }
            ServerMessage::Pong => tracing::trace!("pong"),
        }
    }

    fn handle_fragment(&mut self, payload: &str, sequence_number: u64, mime_type: &str) {
        if self.discarding_turn
            || !matches!(
                self.state,
                ConversationState::Processing | ConversationState::Speaking
            )
        {
            tracing::debug!(sequence_number, "dropping fragment of abandoned turn");
            return;
        }

        // padding and malformed payloads never start playback
        let estimated = protocol::estimated_decoded_len(payload);
        if self.queue.is_negligible(estimated) {
            tracing::debug!(sequence_number, bytes = estimated, "dropping negligible fragment");
            return;
        }
        let fragment = match protocol::fragment_from_wire(payload, sequence_number, mime_type) {
            Ok(fragment) if self.queue.is_negligible(fragment.payload.len()) => {
                tracing::debug!(sequence_number, "dropping negligible fragment");
                return;
            }
            Ok(fragment) => fragment,
            Err(e) => {
                tracing::warn!(sequence_number, error = %e, "skipping malformed fragment");
                return;
            }
        };

        let generation = match self.playback_generation {
            Some(generation) => generation,
            None => {
                let generation = self.queue.start(self.mode);
                self.playback_generation = Some(generation);
                if self.state == ConversationState::Processing {
                    self.transition(ConversationState::Speaking);
                }
                generation
            }
        };

        tracing::trace!(sequence_number, bytes = fragment.payload.len(), "audio fragment");
        self.queue.enqueue(generation, fragment);
    }

    fn handle_playback(&mut self, event: PlaybackEvent) {
        let generation = event.generation();
        if self.playback_generation != Some(generation)
            || generation != self.queue.current_generation()
        {
            tracing::debug!(generation, "ignoring event from superseded playback");
            return;
        }

        match event {
            PlaybackEvent::Started { .. } => self.status("Playing response..."),
            PlaybackEvent::FragmentSkipped {
                sequence_number,
                reason,
                ..
            } => {
                tracing::warn!(sequence_number, reason = %reason, "fragment skipped");
            }
            PlaybackEvent::Completed { metrics, .. } => {
                self.playback_generation = None;
                self.notify(Notice::Metrics(metrics));
                self.resume_after_turn();
            }
            PlaybackEvent::Failed { message, .. } => {
                self.playback_generation = None;
                self.report_error(format!("Playback failed: {message}"));
                self.resume_after_turn();
            }
        }
    }

    /// Back to listening if the microphone is still open, else idle
    fn resume_after_turn(&mut self) {
        if self.frames.is_some() {
            self.transition(ConversationState::Listening);
            self.status("Ready, you can speak again");
        } else {
            self.transition(ConversationState::Idle);
        }
    }

    /// Fatal path for capture, oracle and transport failures
    fn fail(&mut self, error: &Error) {
        tracing::error!(error = %error, kind = ?error.kind(), state = %self.state, "session error");
        self.queue.interrupt();
        self.playback_generation = None;
        if self.state != ConversationState::Idle {
            self.discarding_turn = true;
        }
        self.release_capture();
        self.transition(ConversationState::Idle);

        let message = if error.kind().is_capture_like() {
            "Could not access the microphone. Check permissions.".to_string()
        } else {
            error.to_string()
        };
        self.report_error(message);
    }

    fn release_capture(&mut self) {
        if self.frames.take().is_some() || self.source.is_capturing() {
            self.source.stop();
            self.segmenter.stop();
            self.oracle.reset();
        }
    }

    fn transition(&mut self, next: ConversationState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition(next) {
            tracing::warn!(from = %self.state, to = %next, "illegal state transition ignored");
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "state transition");
        let previous = std::mem::replace(&mut self.state, next);
        if next == ConversationState::Speaking {
            self.pause_capture();
        } else if previous == ConversationState::Speaking && self.frames.is_some() {
            self.resume_capture();
        }
        self.notify(Notice::State(next));
    }

    /// Stop listening to the microphone while the assistant talks
    fn pause_capture(&mut self) {
        self.source.pause();
        self.oracle.reset();
        self.segmenter.pause();
    }

    fn resume_capture(&mut self) {
        self.source.resume();
        self.segmenter.resume();
    }

    fn status(&self, text: &str) {
        self.notify(Notice::Status(text.to_string()));
    }

    fn report_error(&mut self, message: String) {
        self.next_error_id += 1;
        let id = self.next_error_id;
        self.notify(Notice::Error {
            id,
            message,
            dismiss_after: self.error_dismiss,
        });

        let notices = self.notices.clone();
        let delay = self.error_dismiss;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = notices.send(Notice::ErrorDismissed { id });
        });
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

impl<M> Drop for ConversationSession<M> {
    fn drop(&mut self) {
        if self.source.is_capturing() {
            self.source.stop();
        }
    }
}

async fn next_frame(frames: &mut Option<FrameReceiver>) -> Option<Result<AudioFrame>> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
