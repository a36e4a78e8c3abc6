//! rhotalk - voice conversation with a streaming character
//!
//! Reads configuration, wires the pipeline together and drives it from the
//! microphone and from stdin. Lines typed on stdin are sent as text turns;
//! `/stop`, `/mic on`, `/mic off`, `/silence <ms>` and `/quit` control the session.

use anyhow::{Context, Result};
use clap::Parser;
use rhotalk::asr::HttpRecognizer;
use rhotalk::audio::{self, AudioSink, SinkFactory};
use rhotalk::audio_seg::SegConfig;
use rhotalk::config::Config;
use rhotalk::events::{EventBus, PipelineEvent};
use rhotalk::llm::OpenAiCompatClient;
use rhotalk::synth_queue::{QueueConfig, SynthesisQueue};
use rhotalk::tts::WsSynthesisTransport;
use rhotalk::turn::{CoordinatorHandle, TurnCoordinator, TurnSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "RHOTALK_CONFIG", default_value = "rhotalk.toml")]
    config: PathBuf,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Text input only, do not open the microphone
    #[arg(long)]
    no_mic: bool,

    /// Print observer events as JSON lines on stdout
    #[arg(long)]
    events_json: bool,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "rhotalk=info",
        1 => "rhotalk=debug",
        _ => "rhotalk=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(feature = "pulse")]
fn sink_factory(config: &Config) -> SinkFactory {
    use rhotalk::audio::pulse::PulseSink;
    let rate = config.tts.sample_rate;
    Box::new(move || -> audio::Result<Box<dyn AudioSink>> {
        Ok(Box::new(PulseSink::open("rhotalk", rate)?))
    })
}

#[cfg(not(feature = "pulse"))]
fn sink_factory(_config: &Config) -> SinkFactory {
    warn!("Built without the pulse feature, audio output is discarded");
    Box::new(|| -> audio::Result<Box<dyn AudioSink>> { Ok(Box::new(audio::NullSink::default())) })
}

#[cfg(feature = "pulse")]
fn attach_microphone(coordinator: TurnCoordinator, config: &Config) -> TurnCoordinator {
    use rhotalk::audio::pulse::PulseSource;
    let device = config.asr.device.clone();
    coordinator.with_microphone(Arc::new(move || -> audio::Result<Box<dyn audio::AudioSource>> {
        Ok(Box::new(PulseSource::open("rhotalk", device.as_deref())?))
    }))
}

#[cfg(not(feature = "pulse"))]
fn attach_microphone(coordinator: TurnCoordinator, _config: &Config) -> TurnCoordinator {
    warn!("Built without the pulse feature, microphone unavailable");
    coordinator
}

/// Log every event; optionally mirror observer events to stdout.
async fn observe(bus: EventBus, json: bool) {
    let mut rx = bus.subscribe();
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(RecvError::Lagged(n)) => {
                warn!("Observer lagged {} events", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if json {
            if let Some(value) = ev.to_observer_json() {
                println!("{}", value);
            }
        }

        match &ev {
            PipelineEvent::UtteranceDetected { duration_ms, .. } => {
                info!(duration_ms, "utterance detected")
            }
            PipelineEvent::RecognitionResult { text, emotion } => {
                info!(%text, %emotion, "heard")
            }
            PipelineEvent::SentenceReady { turn, unit } => {
                info!(turn, emotion = %unit.emotion, text = %unit.text, "reply")
            }
            PipelineEvent::GenerationDone { turn, outcome } => {
                info!(turn, ?outcome, "generation done")
            }
            PipelineEvent::InterruptRequested { turn } => info!(?turn, "interrupted"),
            other => debug!(event = ?other, "pipeline event"),
        }
    }
}

/// Returns false when the session should end.
fn handle_line(line: &str, handle: &CoordinatorHandle, neutral: &str, seg: &mut SegConfig) -> bool {
    let line = line.trim();
    if let Some(arg) = line.strip_prefix("/silence ") {
        match arg.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => {
                seg.hangover_ms = ms;
                handle.reconfigure(seg.clone());
                info!(hangover_ms = ms, "segmenter silence updated");
            }
            _ => println!("usage: /silence <milliseconds>"),
        }
        return true;
    }
    match line {
        "" => {}
        "/quit" | "/exit" => return false,
        "/stop" => handle.stop(),
        "/mic on" => handle.start_mic(),
        "/mic off" => handle.stop_mic(),
        "/status" => println!("{:?}", handle.status()),
        text => handle.send_text(text, neutral),
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.apply_env();
    config.validate().context("invalid configuration")?;
    info!(character = %config.character.name, "Starting rhotalk");

    let bus = EventBus::new(config.pipeline.event_capacity);

    let queue_cfg = QueueConfig {
        playback_offset: Duration::from_millis(config.pipeline.playback_offset_ms),
        poll_interval: Duration::from_millis(config.pipeline.playback_poll_ms),
    };
    let transport = Arc::new(WsSynthesisTransport::new(config.tts.clone()));
    let queue = SynthesisQueue::spawn(transport, sink_factory(&config), bus.clone(), queue_cfg)
        .context("starting playback thread")?;

    let client = Arc::new(OpenAiCompatClient::new(&config.llm));
    let (mut coordinator, handle) =
        TurnCoordinator::new(TurnSettings::from(&config), bus.clone(), queue, client);

    if !cli.no_mic {
        match HttpRecognizer::new(&config.asr) {
            Ok(recognizer) => {
                coordinator = attach_microphone(coordinator.with_recognizer(Arc::new(recognizer)), &config);
            }
            Err(e) => warn!("Speech input disabled: {}", e),
        }
    }

    tokio::spawn(observe(bus.clone(), cli.events_json));
    let coordinator_task = tokio::spawn(coordinator.run());
    if !cli.no_mic {
        handle.start_mic();
    }

    let neutral = config.pipeline.neutral_emotion.clone();
    let mut seg = config.asr.seg_config();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => {
                    if !handle_line(&line, &handle, &neutral, &mut seg) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    handle.shutdown();
    if tokio::time::timeout(Duration::from_secs(5), coordinator_task).await.is_err() {
        warn!("Coordinator did not stop in time");
    }
    info!("rhotalk stopped");
    Ok(())
}
