//! End-to-end turns through the coordinator, queue and playback thread with
//! in-process stand-ins for the model, synthesizer and audio device.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rhotalk::asr::Recognition;
use rhotalk::audio::{self, AudioSink, AudioSource, SinkFactory, SourceFactory};
use rhotalk::audio_seg::{ClassifierFactory, SegConfig, SpeechClassifier};
use rhotalk::config::CharacterConfig;
use rhotalk::events::{EventBus, PipelineEvent};
use rhotalk::history::ConversationHistory;
use rhotalk::llm::{self, DeltaStream, GenerationClient, GenerationRequest};
use rhotalk::output_seg::WireShape;
use rhotalk::synth_queue::{QueueConfig, SynthesisQueue};
use rhotalk::tts::{self, SynthesisOutput, SynthesisRequest, SynthesisTransport};
use rhotalk::turn::{CoordinatorHandle, GenerationOutcome, TurnCoordinator, TurnPhase, TurnSettings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Replies chosen by a keyword in the user's message.
struct ScriptedClient {
    scripts: Vec<(&'static str, Vec<&'static str>, bool)>,
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn stream(&self, request: GenerationRequest) -> llm::Result<DeltaStream> {
        let user = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let (deltas, hang) = self
            .scripts
            .iter()
            .find(|(key, _, _)| user.contains(key))
            .map(|(_, deltas, hang)| (deltas.clone(), *hang))
            .unwrap_or_default();

        let items = stream::iter(deltas).then(|d| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(d.to_string())
        });
        if hang {
            Ok(Box::pin(items.chain(stream::pending())))
        } else {
            Ok(Box::pin(items))
        }
    }
}

/// Produces 100 ms clips filled with a per-sentence marker value.
struct MarkerTransport {
    markers: HashMap<&'static str, i16>,
    delay: Duration,
}

#[async_trait]
impl SynthesisTransport for MarkerTransport {
    async fn synthesize(&self, request: &SynthesisRequest) -> tts::Result<SynthesisOutput> {
        tokio::time::sleep(self.delay).await;
        let marker = self.markers.get(request.text.as_str()).copied().unwrap_or(1);
        Ok(SynthesisOutput {
            pcm: vec![marker; 1600],
            subtitles: Vec::new(),
        })
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }
}

/// Remembers the marker of every clip it was asked to play.
struct RecordingSink {
    played: Arc<Mutex<Vec<i16>>>,
    stops: Arc<AtomicUsize>,
    until: Option<Instant>,
}

impl AudioSink for RecordingSink {
    fn play(&mut self, pcm: &[i16], sample_rate: u32) -> audio::Result<()> {
        self.played.lock().unwrap().push(pcm[0]);
        let secs = pcm.len() as f64 / f64::from(sample_rate);
        self.until = Some(Instant::now() + Duration::from_secs_f64(secs));
        Ok(())
    }

    fn is_playing(&mut self) -> bool {
        self.until.is_some_and(|t| Instant::now() < t)
    }

    fn stop(&mut self) {
        if self.until.take().is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn recording_sink(played: Arc<Mutex<Vec<i16>>>, stops: Arc<AtomicUsize>) -> SinkFactory {
    Box::new(move || -> audio::Result<Box<dyn AudioSink>> {
        Ok(Box::new(RecordingSink {
            played,
            stops,
            until: None,
        }))
    })
}

/// Hands out loud frames only when the test owes some, and otherwise waits
/// like a device with nothing to deliver. Ends once the test lets go.
struct OwedFrames {
    owed: Arc<AtomicUsize>,
}

impl AudioSource for OwedFrames {
    fn read_frame(&mut self, frame: &mut [i16]) -> audio::Result<()> {
        loop {
            if Arc::strong_count(&self.owed) == 1 {
                return Err(audio::AudioError::NoDevice);
            }
            let taken = self
                .owed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if taken.is_ok() {
                frame.fill(6000);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

fn owed_frames(owed: Arc<AtomicUsize>) -> SourceFactory {
    Arc::new(move || -> audio::Result<Box<dyn AudioSource>> {
        Ok(Box::new(OwedFrames { owed: owed.clone() }))
    })
}

/// Anything past the energy gate counts as speech.
struct AlwaysSpeech;

impl SpeechClassifier for AlwaysSpeech {
    fn is_speech(&mut self, _frame: &[i16]) -> bool {
        true
    }
}

fn always_speech() -> ClassifierFactory {
    Arc::new(|_: &SegConfig| -> Box<dyn SpeechClassifier> { Box::new(AlwaysSpeech) })
}

fn markers() -> HashMap<&'static str, i16> {
    HashMap::from([
        ("第一句。", 1),
        ("第二句。", 2),
        ("甲。", 1),
        ("乙。", 2),
        ("丙。", 3),
        ("丁。", 4),
        ("戊。", 11),
        ("己。", 12),
    ])
}

fn settings() -> TurnSettings {
    TurnSettings {
        character: CharacterConfig::default(),
        shape: WireShape::JsonReply,
        stream_idle_timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_secs(1),
        history_turns: 4,
        seg: SegConfig::default(),
    }
}

struct Harness {
    handle: CoordinatorHandle,
    events: broadcast::Receiver<PipelineEvent>,
    played: Arc<Mutex<Vec<i16>>>,
    history: Arc<Mutex<ConversationHistory>>,
}

fn start(client: ScriptedClient, transport_delay: Duration) -> Harness {
    start_with(Arc::new(client), transport_delay, None)
}

fn start_with(
    client: Arc<dyn GenerationClient>,
    transport_delay: Duration,
    microphone: Option<SourceFactory>,
) -> Harness {
    let bus = EventBus::new(512);
    let events = bus.subscribe();
    let played = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(MarkerTransport {
        markers: markers(),
        delay: transport_delay,
    });
    let queue = SynthesisQueue::spawn(
        transport,
        recording_sink(played.clone(), Arc::new(AtomicUsize::new(0))),
        bus.clone(),
        QueueConfig {
            playback_offset: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
        },
    )
    .unwrap();

    let (mut coordinator, handle) = TurnCoordinator::new(settings(), bus, queue, client);
    if let Some(source) = microphone {
        coordinator = coordinator
            .with_microphone(source)
            .with_speech_classifier(always_speech());
    }
    let history = coordinator.history();
    tokio::spawn(coordinator.run());
    Harness {
        handle,
        events,
        played,
        history,
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<PipelineEvent>, mut pred: F) -> PipelineEvent
where
    F: FnMut(&PipelineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let ev = rx.recv().await.unwrap();
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn wait_idle(handle: &CoordinatorHandle) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = handle.status();
            if status.phase == TurnPhase::Idle && status.turn.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("coordinator returned to idle");
}

#[tokio::test]
async fn test_text_turn_plays_sentences_in_order() {
    let client = ScriptedClient {
        scripts: vec![(
            "你好",
            vec!["{\"emotion\":\"开心\",", "\"text\":\"第一句。", "第二句。\"}"],
            false,
        )],
    };
    let mut h = start(client, Duration::from_millis(10));

    h.handle.send_text("你好", "neutral");
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::GenerationDone { turn: 1, .. })
    })
    .await;
    wait_idle(&h.handle).await;

    assert_eq!(*h.played.lock().unwrap(), vec![1, 2]);

    let context = h.history.lock().unwrap().context();
    assert_eq!(context.len(), 2);
    assert_eq!(context[0].content, "你好");
    assert_eq!(context[1].content, "第一句。第二句。");
    assert_eq!(context[1].emotion, "开心");
}

#[tokio::test]
async fn test_barge_in_never_plays_old_turn_after_new_one() {
    let client = ScriptedClient {
        scripts: vec![
            (
                "one",
                vec!["{\"emotion\":\"平静\",\"text\":\"甲。乙。丙。丁。\"}"],
                true,
            ),
            ("two", vec!["{\"emotion\":\"平静\",\"text\":\"戊。己。\"}"], false),
        ],
    };
    let mut h = start(client, Duration::from_millis(30));

    h.handle.send_text("one", "neutral");
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::PlaybackStarted { .. })
    })
    .await;

    h.handle.send_text("two", "neutral");
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::GenerationDone { turn: 2, .. })
    })
    .await;
    wait_idle(&h.handle).await;

    let played = h.played.lock().unwrap().clone();
    let first_new = played
        .iter()
        .position(|&m| m > 10)
        .expect("second turn was played");
    assert!(
        played[first_new..].iter().all(|&m| m > 10),
        "old audio after new turn: {:?}",
        played
    );
    assert_eq!(&played[first_new..], &[11, 12]);
    assert!(played[..first_new].len() < 4);

    // The interrupted turn left nothing in history
    let context = h.history.lock().unwrap().context();
    assert_eq!(context.len(), 2);
    assert_eq!(context[0].content, "two");
}

struct QueueRig {
    queue: SynthesisQueue,
    events: broadcast::Receiver<PipelineEvent>,
    played: Arc<Mutex<Vec<i16>>>,
    stops: Arc<AtomicUsize>,
}

fn queue_rig() -> QueueRig {
    let bus = EventBus::new(256);
    let events = bus.subscribe();
    let played = Arc::new(Mutex::new(Vec::new()));
    let stops = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(MarkerTransport {
        markers: markers(),
        delay: Duration::from_millis(40),
    });
    let queue = SynthesisQueue::spawn(
        transport,
        recording_sink(played.clone(), stops.clone()),
        bus,
        QueueConfig::default(),
    )
    .unwrap();
    QueueRig {
        queue,
        events,
        played,
        stops,
    }
}

async fn wait_queue_idle(queue: &SynthesisQueue) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !queue.is_idle() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // Give a straggler every chance to reach the device
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_queue_interrupt_while_first_job_synthesizes() {
    let mut rig = queue_rig();

    assert!(rig.queue.enqueue("甲。", "平静"));
    assert!(rig.queue.enqueue("乙。", "平静"));
    assert!(rig.queue.enqueue("丙。", "平静"));

    // The worker has taken 甲 and is synthesizing it
    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.queue.pending() != 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    rig.queue.interrupt();

    wait_for(&mut rig.events, |ev| {
        matches!(ev, PipelineEvent::QueueDrained { epoch: 0 })
    })
    .await;
    wait_queue_idle(&rig.queue).await;

    assert_eq!(*rig.played.lock().unwrap(), vec![1]);
    assert_eq!(rig.stops.load(Ordering::SeqCst), 0);
    rig.queue.close();
}

#[tokio::test]
async fn test_queue_interrupt_during_playback_stops_clip() {
    let mut rig = queue_rig();

    assert!(rig.queue.enqueue("甲。", "平静"));
    assert!(rig.queue.enqueue("乙。", "平静"));
    assert!(rig.queue.enqueue("丙。", "平静"));

    // 甲 is on the device and 乙 already left the queue
    wait_for(&mut rig.events, |ev| {
        matches!(ev, PipelineEvent::PlaybackStarted { .. })
    })
    .await;
    assert_eq!(rig.queue.pending(), 1);
    rig.queue.interrupt();

    wait_queue_idle(&rig.queue).await;

    assert_eq!(*rig.played.lock().unwrap(), vec![1, 2]);
    assert_eq!(rig.stops.load(Ordering::SeqCst), 1);
    rig.queue.close();
}

#[tokio::test]
async fn test_stop_interrupts_without_replacement() {
    let client = ScriptedClient {
        scripts: vec![(
            "long",
            vec!["{\"emotion\":\"平静\",\"text\":\"甲。乙。丙。丁。\"}"],
            true,
        )],
    };
    let mut h = start(client, Duration::from_millis(30));

    h.handle.send_text("long", "neutral");
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::SentenceReady { .. })
    })
    .await;

    h.handle.stop();
    let ev = wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::InterruptRequested { .. })
    })
    .await;
    assert!(matches!(ev, PipelineEvent::InterruptRequested { turn: Some(1) }));
    wait_idle(&h.handle).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.played.lock().unwrap().len() < 4);
    assert!(h.history.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_recognition_without_words_starts_no_turn() {
    let client = ScriptedClient {
        scripts: vec![("早上好", vec!["{\"emotion\":\"平静\",\"text\":\"第一句。\"}"], false)],
    };
    let mut h = start(client, Duration::from_millis(5));

    h.handle.recognized(Recognition {
        text: "。。".into(),
        emotion: "neutral".into(),
    });
    h.handle.recognized(Recognition {
        text: "早上好".into(),
        emotion: "happy".into(),
    });

    // Punctuation alone is never reported
    let first = wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::RecognitionResult { .. })
    })
    .await;
    assert!(matches!(first, PipelineEvent::RecognitionResult { ref text, .. } if text == "早上好"));

    // Only the meaningful result produced a turn, and it is the first one
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::GenerationDone { turn: 1, .. })
    })
    .await;
    wait_idle(&h.handle).await;

    assert_eq!(*h.played.lock().unwrap(), vec![1]);
    let context = h.history.lock().unwrap().context();
    assert_eq!(context[0].emotion, "happy");
}

fn hanging_then_quick() -> Arc<dyn GenerationClient> {
    Arc::new(ScriptedClient {
        scripts: vec![
            (
                "long",
                vec!["{\"emotion\":\"平静\",\"text\":\"甲。乙。丙。丁。\"}"],
                true,
            ),
            ("next", vec!["{\"emotion\":\"平静\",\"text\":\"戊。\"}"], false),
        ],
    })
}

/// Start a long turn with the microphone running, then let the user speak
/// `frames` loud frames into it.
async fn speak_over_turn(h: &mut Harness, owed: &AtomicUsize, frames: usize) {
    h.handle.start_mic();
    h.handle.send_text("long", "neutral");
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::SentenceReady { .. })
    })
    .await;

    owed.store(frames, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), async {
        while owed.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // The last frame is still being segmented when the counter hits zero
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_interrupt_reclaims_speech_in_progress() {
    let owed = Arc::new(AtomicUsize::new(0));
    let mut h = start_with(
        hanging_then_quick(),
        Duration::from_millis(30),
        Some(owed_frames(owed.clone())),
    );

    speak_over_turn(&mut h, &owed, 15).await;
    assert!(h.handle.status().mic_running);

    h.handle.send_text("next", "neutral");
    let ev = wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::InterruptRequested { .. })
    })
    .await;
    assert!(matches!(ev, PipelineEvent::InterruptRequested { turn: Some(1) }));

    // 15 frames of 30 ms, nothing idle before them to pre-roll
    let ev = wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::UtteranceDetected { .. })
    })
    .await;
    match ev {
        PipelineEvent::UtteranceDetected { pcm, duration_ms } => {
            assert_eq!(duration_ms, 450);
            assert!(pcm.iter().all(|&s| s == 6000));
        }
        other => panic!("unexpected event {:?}", other),
    }

    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::GenerationDone { turn: 2, .. })
    })
    .await;
}

async fn no_utterance_within(rx: &mut broadcast::Receiver<PipelineEvent>, window: Duration) -> bool {
    tokio::time::timeout(window, async {
        loop {
            if let PipelineEvent::UtteranceDetected { .. } = rx.recv().await.unwrap() {
                return;
            }
        }
    })
    .await
    .is_err()
}

#[tokio::test]
async fn test_interrupt_discards_speech_below_minimum() {
    let owed = Arc::new(AtomicUsize::new(0));
    let mut h = start_with(
        hanging_then_quick(),
        Duration::from_millis(30),
        Some(owed_frames(owed.clone())),
    );

    // 150 ms of speech against the default 300 ms minimum
    speak_over_turn(&mut h, &owed, 5).await;

    h.handle.send_text("next", "neutral");
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::InterruptRequested { turn: Some(1) })
    })
    .await;
    assert!(no_utterance_within(&mut h.events, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_reconfigure_applies_to_running_microphone() {
    let owed = Arc::new(AtomicUsize::new(0));
    let mut h = start_with(
        hanging_then_quick(),
        Duration::from_millis(30),
        Some(owed_frames(owed.clone())),
    );

    h.handle.start_mic();
    h.handle.reconfigure(SegConfig {
        min_speech_ms: 90,
        ..SegConfig::default()
    });
    // Out of range settings are refused and leave the segmenter alone
    h.handle.reconfigure(SegConfig {
        aggressiveness: 9,
        min_speech_ms: 600,
        ..SegConfig::default()
    });

    speak_over_turn(&mut h, &owed, 5).await;

    h.handle.send_text("next", "neutral");
    wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::InterruptRequested { turn: Some(1) })
    })
    .await;
    let ev = wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::UtteranceDetected { .. })
    })
    .await;
    assert!(matches!(ev, PipelineEvent::UtteranceDetected { duration_ms: 150, .. }));
}

/// Opens a stream whose first poll holds its worker thread for three
/// seconds, so the cancel signal goes unseen.
struct WedgedClient {
    entered: Arc<AtomicBool>,
}

#[async_trait]
impl GenerationClient for WedgedClient {
    async fn stream(&self, _request: GenerationRequest) -> llm::Result<DeltaStream> {
        let entered = self.entered.clone();
        let wedged = stream::poll_fn(move |_cx| -> Poll<Option<llm::Result<String>>> {
            entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_secs(3));
            Poll::Pending
        });
        Ok(Box::pin(wedged))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_generation_still_reports_done() {
    let entered = Arc::new(AtomicBool::new(false));
    let client = Arc::new(WedgedClient {
        entered: entered.clone(),
    });
    let mut h = start_with(client, Duration::from_millis(5), None);

    h.handle.send_text("hello", "neutral");
    tokio::time::timeout(Duration::from_secs(2), async {
        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let stopped_at = Instant::now();
    h.handle.stop();
    let ev = wait_for(&mut h.events, |ev| {
        matches!(ev, PipelineEvent::GenerationDone { turn: 1, .. })
    })
    .await;

    // Reported by the coordinator after the one second grace, well before
    // the task could have noticed the cancel itself
    assert!(stopped_at.elapsed() < Duration::from_millis(2500));
    match ev {
        PipelineEvent::GenerationDone { outcome, .. } => {
            assert_eq!(
                outcome,
                GenerationOutcome::Cancelled {
                    partial: String::new()
                }
            );
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_idle(&h.handle).await;
}
