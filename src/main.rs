use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use murmur::transport::{HttpTransport, Transport, TransportEvent, WsTransport};
use murmur::voice::{
    AnalyzerTap, AudioCapture, AudioSink, CpalSink, DecodedAudio, DefaultDecoder, EnergyModel,
    FrameOracle, FrameSource, PlaybackMode, SegmenterEvent, VoiceSegmenter, spawn_feed,
};
use murmur::{Config, ConversationSession, ConversationState, Notice, SessionParts, UserAction};

/// Murmur - talk to an assistant, hands free
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the conversation server
    Serve {
        /// Port to listen on
        #[arg(long, env = "MURMUR_PORT")]
        port: Option<u16>,
        /// Directory with a web client to serve
        #[arg(long, env = "MURMUR_STATIC_DIR")]
        static_dir: Option<PathBuf>,
    },
    /// Talk to the server through the microphone
    Talk {
        /// Playback strategy: incremental or batch
        #[arg(long)]
        mode: Option<PlaybackMode>,
        /// Use one-shot HTTP calls instead of the WebSocket
        #[arg(long)]
        http: bool,
    },
    /// Segment live microphone audio without a server
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
        /// Write each committed segment as a WAV file here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,murmur=info",
        1 => "info,murmur=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Serve { port, static_dir } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if static_dir.is_some() {
                config.server.static_dir = static_dir;
            }
            murmur::server::serve(&config).await?;
            Ok(())
        }
        Command::Talk { mode, http } => {
            if let Some(mode) = mode {
                config.playback.mode = mode;
            }
            talk(&config, http).await
        }
        Command::TestMic { duration, out } => test_mic(&config, duration, out).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Interactive microphone client
async fn talk(config: &Config, http: bool) -> anyhow::Result<()> {
    let tap = AnalyzerTap::new(config.analyzer.fft_size);
    let capture = AudioCapture::new(config.segmenter.frame_samples).with_tap(tap.clone());
    let sink = CpalSink::new()?.with_tap(tap.clone());
    let feed = spawn_feed(tap, &config.analyzer);

    let (transport, transport_events): (Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>) =
        if http {
            let (t, rx) = HttpTransport::new(&config.client);
            (Arc::new(t), rx)
        } else {
            let (t, rx) = WsTransport::connect(&config.client);
            (Arc::new(t), rx)
        };

    let parts = SessionParts {
        model: EnergyModel::default(),
        source: Box::new(capture),
        transport,
        decoder: Arc::new(DefaultDecoder),
        sink: Arc::new(sink),
    };
    let (session, mut notices) = ConversationSession::new(config, parts);
    let (actions, actions_rx) = mpsc::channel(8);

    println!("Press Enter to start, stop or interrupt. Type q and Enter to quit.\n");

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let action = match line.trim() {
                "q" | "quit" => break,
                "i" => UserAction::Interrupt,
                "s" => UserAction::Stop,
                _ => UserAction::Toggle,
            };
            if actions.send(action).await.is_err() {
                break;
            }
        }
    });

    let levels = feed.subscribe();
    tokio::spawn(async move {
        let mut state = ConversationState::Idle;
        while let Some(notice) = notices.recv().await {
            match notice {
                Notice::State(next) => {
                    state = next;
                    println!("[{state}]");
                }
                Notice::Status(text) => {
                    let level = levels.borrow().overall;
                    if state == ConversationState::Idle {
                        println!("  {text}");
                    } else {
                        println!("  {text} {}", meter(level));
                    }
                }
                Notice::Transcript(text) => println!("you: {text}"),
                Notice::Response(text) => println!("assistant: {text}"),
                Notice::TurnTiming {
                    fragment_count,
                    total_time_ms,
                    time_to_first_fragment_ms,
                } => {
                    let first = time_to_first_fragment_ms
                        .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
                    println!("  server: {fragment_count} fragments, {total_time_ms}ms, first audio {first}");
                }
                Notice::Metrics(m) => println!(
                    "  playback: {} fragments, {} skipped, {}ms",
                    m.fragment_count, m.skipped_count, m.elapsed_ms
                ),
                Notice::Error { message, .. } => eprintln!("error: {message}"),
                Notice::ErrorDismissed { .. } => {}
            }
        }
    });

    session.run(actions_rx, transport_events).await?;
    feed.stop();
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn meter(level: f32) -> String {
    let len = (level.clamp(0.0, 1.0) * 20.0) as usize;
    format!("[{}{}]", "#".repeat(len), " ".repeat(20 - len))
}

/// Segment live audio and report each commit
async fn test_mic(config: &Config, duration: u64, out: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Segmenting microphone audio for {duration} seconds...");
    println!("Speak, then pause for a moment to commit.\n");

    if let Some(dir) = &out {
        std::fs::create_dir_all(dir)?;
    }

    let mut capture = AudioCapture::new(config.segmenter.frame_samples);
    let mut frames = capture.start()?;
    let mut oracle = FrameOracle::new(EnergyModel::default(), &config.segmenter);
    let mut segmenter = VoiceSegmenter::new(&config.segmenter);
    segmenter.start();

    let started = tokio::time::Instant::now();
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.segmenter.check_interval_ms.max(1)));

    loop {
        tokio::select! {
            () = &mut deadline => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let frame = frame?;
                    // stamp on arrival: the ticker reads the same clock
                    oracle.process(&frame.samples, millis_since(started), &mut segmenter);
                }
                None => break,
            },
            _ = ticker.tick() => {
                segmenter.check_for_commit(millis_since(started));
            }
        }

        for event in segmenter.take_events() {
            match event {
                SegmenterEvent::SpeechStart { timestamp_ms } => {
                    println!("[{timestamp_ms:>6}ms] speech");
                }
                SegmenterEvent::Commit(audio) => {
                    println!(
                        "commit #{}: {} bytes, {}ms",
                        segmenter.commits(),
                        audio.bytes.len(),
                        audio.duration_ms()
                    );
                    if let Some(dir) = &out {
                        let path = dir.join(format!("segment-{}.wav", segmenter.commits()));
                        std::fs::write(&path, &audio.bytes)?;
                        println!("  wrote {}", path.display());
                    }
                }
                SegmenterEvent::Error(e) => return Err(e.into()),
                SegmenterEvent::BurstAppended { .. } | SegmenterEvent::Misfire => {}
            }
        }
    }

    capture.stop();
    println!("\n---");
    println!("{} segments committed", segmenter.commits());
    if segmenter.commits() == 0 {
        println!("Nothing committed. Check the input device and speak louder.");
    }
    Ok(())
}

fn millis_since(start: tokio::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sink = CpalSink::new()?;

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    sink.play(DecodedAudio {
        samples,
        sample_rate,
    })
    .await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    Ok(())
}
