//! Turn coordination
//!
//! The coordinator is the single owner of conversational state: the active
//! generation task, the microphone, and the turn phase. Everything else talks
//! to it through [`CoordinatorHandle`] commands or observes it through the
//! event bus.
//!
//! A new turn always interrupts the previous one first. The handle of the
//! exact task being replaced is taken out of the coordinator, told to stop,
//! the synthesis queue is drained, and the task is awaited before the
//! replacement is spawned.

use crate::asr::{Recognition, SpeechRecognizer};
use crate::audio::{CaptureWorker, SourceFactory};
use crate::audio_seg::{ClassifierFactory, SegConfig, Segmenter, Utterance};
use crate::config::{CharacterConfig, Config};
use crate::events::{EventBus, PipelineEvent};
use crate::history::ConversationHistory;
use crate::llm::{self, GenerationClient, GenerationRequest};
use crate::output_seg::{OutputSegmenter, SegmentEvent, WireShape};
use crate::synth_queue::SynthesisQueue;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub type TurnId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { text: String },
    Cancelled { partial: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    /// Generation stream is open
    Generating,
    /// Generation finished, clips still queued or playing
    Speaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnStatus {
    pub turn: Option<TurnId>,
    pub phase: TurnPhase,
    pub mic_running: bool,
}

#[derive(Debug)]
pub enum Command {
    /// Text input; starts a new turn
    Send { text: String, emotion: String },
    /// Recognized speech; starts a new turn when meaningful
    Recognized(Recognition),
    /// Interrupt without starting a replacement
    Stop,
    StartMic,
    StopMic,
    Reconfigure(SegConfig),
    Shutdown,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TurnStatus>,
}

impl CoordinatorHandle {
    fn command(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            warn!("Coordinator is gone, command dropped");
        }
    }

    pub fn send_text(&self, text: impl Into<String>, emotion: impl Into<String>) {
        self.command(Command::Send {
            text: text.into(),
            emotion: emotion.into(),
        });
    }

    pub fn recognized(&self, recognition: Recognition) {
        self.command(Command::Recognized(recognition));
    }

    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    pub fn start_mic(&self) {
        self.command(Command::StartMic);
    }

    pub fn stop_mic(&self) {
        self.command(Command::StopMic);
    }

    pub fn reconfigure(&self, cfg: SegConfig) {
        self.command(Command::Reconfigure(cfg));
    }

    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    pub fn status(&self) -> TurnStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change
    pub fn watch_status(&self) -> watch::Receiver<TurnStatus> {
        self.status.clone()
    }
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub character: CharacterConfig,
    pub shape: WireShape,
    pub stream_idle_timeout: Duration,
    pub cancel_grace: Duration,
    pub history_turns: usize,
    pub seg: SegConfig,
}

impl From<&Config> for TurnSettings {
    fn from(config: &Config) -> Self {
        Self {
            character: config.character.clone(),
            shape: config.llm.wire_shape,
            stream_idle_timeout: config.pipeline.stream_idle_timeout(),
            cancel_grace: config.pipeline.cancel_grace(),
            history_turns: config.llm.history_turns,
            seg: config.asr.seg_config(),
        }
    }
}

enum MicState {
    Stopped,
    Running {
        segmenter: Arc<Segmenter>,
        capture: CaptureWorker,
    },
}

struct ActiveGeneration {
    id: TurnId,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<GenerationOutcome>,
}

#[derive(Debug, Clone, Copy)]
struct CurrentTurn {
    id: TurnId,
    epoch: u64,
}

pub struct TurnCoordinator {
    settings: TurnSettings,
    bus: EventBus,
    queue: SynthesisQueue,
    client: Arc<dyn GenerationClient>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    history: Arc<Mutex<ConversationHistory>>,
    source: Option<SourceFactory>,
    classifier: Option<ClassifierFactory>,
    mic: MicState,
    next_turn: TurnId,
    current: Option<CurrentTurn>,
    generation: Option<ActiveGeneration>,
    phase: TurnPhase,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    utterance_tx: mpsc::UnboundedSender<Utterance>,
    utterance_rx: mpsc::UnboundedReceiver<Utterance>,
    status_tx: watch::Sender<TurnStatus>,
}

impl TurnCoordinator {
    pub fn new(
        settings: TurnSettings,
        bus: EventBus,
        queue: SynthesisQueue,
        client: Arc<dyn GenerationClient>,
    ) -> (Self, CoordinatorHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TurnStatus {
            turn: None,
            phase: TurnPhase::Idle,
            mic_running: false,
        });
        let history = Arc::new(Mutex::new(ConversationHistory::new(settings.history_turns)));
        let handle = CoordinatorHandle {
            tx: commands_tx.clone(),
            status: status_rx,
        };
        let coordinator = Self {
            settings,
            bus,
            queue,
            client,
            recognizer: None,
            history,
            source: None,
            classifier: None,
            mic: MicState::Stopped,
            next_turn: 1,
            current: None,
            generation: None,
            phase: TurnPhase::Idle,
            commands_tx,
            commands_rx,
            utterance_tx,
            utterance_rx,
            status_tx,
        };
        (coordinator, handle)
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn with_microphone(mut self, source: SourceFactory) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the WebRTC detector used when the microphone starts
    pub fn with_speech_classifier(mut self, classifier: ClassifierFactory) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Shared conversation history, for inspection
    pub fn history(&self) -> Arc<Mutex<ConversationHistory>> {
        self.history.clone()
    }

    pub async fn run(mut self) {
        let mut events = self.bus.subscribe();
        info!("Turn coordinator started");

        loop {
            tokio::select! {
                Some(cmd) = self.commands_rx.recv() => {
                    if matches!(cmd, Command::Shutdown) {
                        break;
                    }
                    self.handle_command(cmd).await;
                }
                Some(utterance) = self.utterance_rx.recv() => {
                    self.on_utterance(utterance);
                }
                ev = events.recv() => match ev {
                    Ok(ev) => self.on_event(ev),
                    Err(RecvError::Lagged(n)) => warn!("Coordinator lagged {} events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.interrupt().await;
        self.stop_mic();
        self.queue.close();
        info!("Turn coordinator stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { text, emotion } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return;
                }
                self.begin_turn(text, emotion).await;
            }
            Command::Recognized(rec) => {
                if !rec.is_meaningful() {
                    debug!(text = %rec.text, "ignoring recognition without content");
                    return;
                }
                self.bus.emit(PipelineEvent::RecognitionResult {
                    text: rec.text.clone(),
                    emotion: rec.emotion.clone(),
                });
                self.begin_turn(rec.text, rec.emotion).await;
            }
            Command::Stop => {
                self.interrupt().await;
            }
            Command::StartMic => self.start_mic(),
            Command::StopMic => self.stop_mic(),
            Command::Reconfigure(cfg) => {
                let applied = match &self.mic {
                    MicState::Running { segmenter, .. } => segmenter.reconfigure(cfg.clone()),
                    MicState::Stopped => cfg.validate(),
                };
                if let Err(e) = applied {
                    warn!("Rejected segmenter config: {}", e);
                    return;
                }
                self.settings.seg = cfg;
            }
            Command::Shutdown => {}
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        let pcm = Arc::new(utterance.pcm);
        self.bus.emit(PipelineEvent::UtteranceDetected {
            pcm: pcm.clone(),
            duration_ms: pcm.len() as u64 * 1000 / u64::from(crate::audio_seg::SAMPLE_RATE),
        });

        let Some(recognizer) = self.recognizer.clone() else {
            debug!("No recognizer configured, utterance dropped");
            return;
        };
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            match recognizer.transcribe(&pcm).await {
                Ok(rec) => {
                    let _ = commands.send(Command::Recognized(rec));
                }
                Err(e) => warn!("Recognition failed: {}", e),
            }
        });
    }

    fn on_event(&mut self, ev: PipelineEvent) {
        match ev {
            PipelineEvent::GenerationDone { turn, outcome } => {
                if self.current.map(|c| c.id) != Some(turn) {
                    return;
                }
                self.generation = None;
                debug!(turn, ?outcome, "generation finished");
                if self.queue.is_idle() {
                    self.finish_turn();
                } else {
                    self.set_phase(TurnPhase::Speaking);
                }
            }
            PipelineEvent::QueueDrained { epoch } => {
                // A job left over from an interrupted epoch may be the last
                // one to finish, so any drain at or before ours counts.
                let ours = self.current.is_some_and(|c| epoch <= c.epoch);
                if ours && self.phase == TurnPhase::Speaking && self.queue.is_idle() {
                    self.finish_turn();
                }
            }
            _ => {}
        }
    }

    fn finish_turn(&mut self) {
        if let Some(turn) = self.current.take() {
            info!(turn = turn.id, "turn complete");
        }
        self.set_phase(TurnPhase::Idle);
    }

    async fn begin_turn(&mut self, text: String, emotion: String) {
        self.interrupt().await;

        let id = self.next_turn;
        self.next_turn += 1;
        let epoch = self.queue.epoch();

        let request = {
            let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            llm::build_request(
                &self.settings.character,
                self.settings.shape,
                &history.context(),
                &text,
                &emotion,
            )
        };

        let ctx = GenerationContext {
            turn: id,
            epoch,
            shape: self.settings.shape,
            idle_timeout: self.settings.stream_idle_timeout,
            client: self.client.clone(),
            queue: self.queue.clone(),
            bus: self.bus.clone(),
            history: self.history.clone(),
            request,
            user_text: text,
            user_emotion: emotion,
        };
        let (cancel, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(run_generation(ctx, cancel_rx));

        self.current = Some(CurrentTurn { id, epoch });
        self.generation = Some(ActiveGeneration { id, cancel, task });
        self.set_phase(TurnPhase::Generating);
        info!(turn = id, epoch, "turn started");
    }

    /// Stop whatever is in progress. Safe to call when idle.
    async fn interrupt(&mut self) {
        let previous = self.generation.take();
        let busy = previous.is_some() || self.phase != TurnPhase::Idle || !self.queue.is_idle();

        if busy {
            self.bus.emit(PipelineEvent::InterruptRequested {
                turn: self.current.map(|c| c.id),
            });
        }

        if let Some(active) = previous {
            let _ = active.cancel.send(());
            self.queue.interrupt();
            let mut task = active.task;
            match timeout(self.settings.cancel_grace, &mut task).await {
                Ok(Ok(outcome)) => debug!(turn = active.id, ?outcome, "generation wound down"),
                Ok(Err(e)) => warn!(turn = active.id, "generation task failed: {}", e),
                Err(_) => {
                    warn!(turn = active.id, "generation ignored cancellation, aborting");
                    task.abort();
                    // The aborted task never reaches its own cleanup
                    self.bus.emit(PipelineEvent::GenerationDone {
                        turn: active.id,
                        outcome: GenerationOutcome::Cancelled {
                            partial: String::new(),
                        },
                    });
                }
            }
        } else if busy {
            self.queue.interrupt();
        }

        if let MicState::Running { segmenter, .. } = &self.mic {
            if let Some(utterance) = segmenter.force_commit() {
                debug!("reclaimed in-flight speech after interrupt");
                let _ = self.utterance_tx.send(utterance);
            }
        }

        self.current = None;
        self.set_phase(TurnPhase::Idle);
    }

    fn start_mic(&mut self) {
        if matches!(self.mic, MicState::Running { .. }) {
            return;
        }
        let Some(source) = self.source.clone() else {
            warn!("No capture device configured");
            return;
        };
        let cfg = self.settings.seg.clone();
        let created = match &self.classifier {
            Some(build) => Segmenter::with_classifier(cfg.clone(), build(&cfg)),
            None => Segmenter::new(cfg),
        };
        let segmenter = match created {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Failed to create segmenter: {}", e);
                return;
            }
        };
        match CaptureWorker::spawn(source, segmenter.clone(), self.utterance_tx.clone()) {
            Ok(capture) => {
                self.mic = MicState::Running { segmenter, capture };
                info!("Microphone started");
                self.publish_status();
            }
            Err(e) => error!("Failed to start capture thread: {}", e),
        }
    }

    fn stop_mic(&mut self) {
        if let MicState::Running { capture, .. } = std::mem::replace(&mut self.mic, MicState::Stopped) {
            capture.stop();
            info!("Microphone stopped");
            self.publish_status();
        }
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        self.phase = phase;
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = TurnStatus {
            turn: self.current.map(|c| c.id),
            phase: self.phase,
            mic_running: matches!(self.mic, MicState::Running { .. }),
        };
        self.status_tx.send_replace(status);
    }
}

/// Everything one generation task needs, captured at turn start
pub struct GenerationContext {
    pub turn: TurnId,
    pub epoch: u64,
    pub shape: WireShape,
    pub idle_timeout: Duration,
    pub client: Arc<dyn GenerationClient>,
    pub queue: SynthesisQueue,
    pub bus: EventBus,
    pub history: Arc<Mutex<ConversationHistory>>,
    pub request: GenerationRequest,
    pub user_text: String,
    pub user_emotion: String,
}

impl GenerationContext {
    fn publish(&self, events: Vec<SegmentEvent>) {
        for ev in events {
            match ev {
                SegmentEvent::Delta(text) => self.bus.emit(PipelineEvent::TextDelta {
                    turn: self.turn,
                    text,
                }),
                SegmentEvent::Text(text) => self.bus.emit(PipelineEvent::StreamText {
                    turn: self.turn,
                    text,
                }),
                SegmentEvent::Unit(unit) => {
                    self.bus.emit(PipelineEvent::SentenceReady {
                        turn: self.turn,
                        unit: unit.clone(),
                    });
                    self.queue.enqueue_at(self.epoch, &unit.text, &unit.emotion);
                }
            }
        }
    }
}

enum StreamEnd {
    Finished,
    Cancelled,
    Failed(String),
}

/// Drive one generation stream to its end. Cleanup (final flush, history,
/// `GenerationDone`) runs the same way however the stream ends.
pub async fn run_generation(
    ctx: GenerationContext,
    mut cancel: oneshot::Receiver<()>,
) -> GenerationOutcome {
    let mut segmenter = OutputSegmenter::new(ctx.shape);
    let end = drive(&ctx, &mut segmenter, &mut cancel).await;

    ctx.publish(segmenter.finish());
    let spoken = segmenter.spoken_text().to_string();

    let outcome = match end {
        StreamEnd::Finished => {
            ctx.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_turn(&ctx.user_text, &ctx.user_emotion, &spoken, segmenter.emotion());
            GenerationOutcome::Completed { text: spoken }
        }
        StreamEnd::Cancelled => GenerationOutcome::Cancelled { partial: spoken },
        StreamEnd::Failed(reason) => GenerationOutcome::Failed { reason },
    };

    ctx.bus.emit(PipelineEvent::GenerationDone {
        turn: ctx.turn,
        outcome: outcome.clone(),
    });
    outcome
}

async fn drive(
    ctx: &GenerationContext,
    segmenter: &mut OutputSegmenter,
    cancel: &mut oneshot::Receiver<()>,
) -> StreamEnd {
    let mut stream = tokio::select! {
        biased;
        _ = &mut *cancel => return StreamEnd::Cancelled,
        opened = ctx.client.stream(ctx.request.clone()) => match opened {
            Ok(stream) => stream,
            Err(e) => {
                error!(turn = ctx.turn, "Failed to open generation stream: {}", e);
                return StreamEnd::Failed(e.to_string());
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = &mut *cancel => return StreamEnd::Cancelled,
            next = timeout(ctx.idle_timeout, stream.next()) => match next {
                Err(_) => {
                    warn!(turn = ctx.turn, "generation stream went quiet, finishing turn");
                    return StreamEnd::Finished;
                }
                Ok(None) => return StreamEnd::Finished,
                Ok(Some(Err(e))) => {
                    error!(turn = ctx.turn, "generation stream error: {}", e);
                    return StreamEnd::Failed(e.to_string());
                }
                Ok(Some(Ok(delta))) => ctx.publish(segmenter.push(&delta)),
            },
        }
    }
}
