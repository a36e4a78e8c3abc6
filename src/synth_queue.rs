//! Ordered synthesis and playback of text units
//!
//! Jobs carry the epoch they were enqueued under. `interrupt` bumps the epoch
//! and drains pending jobs in one critical section. Jobs the worker had
//! already taken off the queue at that moment are spared and still reach the
//! player; everything else tagged with an older epoch is discarded wherever
//! it is found. The clip playing when the interrupt lands is stopped.

use crate::audio::{AudioSink, SinkFactory};
use crate::events::{EventBus, PipelineEvent};
use crate::lip_sync::Timeline;
use crate::tts::{SynthesisRequest, SynthesisTransport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, span, warn, Level};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisJob {
    pub id: u64,
    pub text: String,
    pub emotion: String,
    pub epoch: u64,
}

/// A synthesized clip on its way to the playback thread
#[derive(Debug)]
pub struct PlaybackEnvelope {
    pub job: u64,
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lead time between announcing a clip's timeline and its audio
    pub playback_offset: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            playback_offset: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[derive(Default)]
struct JobState {
    pending: VecDeque<SynthesisJob>,
    /// Taken by the worker, not yet playing: (job id, epoch)
    released: Vec<(u64, u64)>,
    /// Released jobs that survived the last interrupt
    spared: Vec<u64>,
    next_id: u64,
}

struct Shared {
    jobs: Mutex<JobState>,
    notify: Notify,
    epoch: watch::Sender<u64>,
    /// Jobs enqueued and not yet finished (dropped, failed or played)
    in_flight: AtomicUsize,
    closed: AtomicBool,
    bus: EventBus,
}

impl Shared {
    fn lock_jobs(&self) -> MutexGuard<'_, JobState> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Whether a released job may still be synthesized or played.
    fn is_live(&self, job: u64, epoch: u64) -> bool {
        let st = self.lock_jobs();
        epoch == self.current_epoch() || st.spared.contains(&job)
    }

    /// Hand a clip to the device. Returns the epoch playback started under,
    /// or `None` when the clip is stale. Either way the job stops being
    /// released.
    fn start_playing(&self, job: u64, epoch: u64) -> Option<u64> {
        let mut st = self.lock_jobs();
        let current = self.current_epoch();
        let live = epoch == current || st.spared.contains(&job);
        st.released.retain(|(id, _)| *id != job);
        st.spared.retain(|id| *id != job);
        live.then_some(current)
    }

    fn drop_job(&self, job: u64, epoch: u64) {
        {
            let mut st = self.lock_jobs();
            st.released.retain(|(id, _)| *id != job);
            st.spared.retain(|id| *id != job);
        }
        self.finish(epoch, 1);
    }

    fn finish(&self, epoch: u64, count: usize) {
        if count == 0 {
            return;
        }
        let before = self.in_flight.fetch_sub(count, Ordering::SeqCst);
        if before == count {
            self.bus.emit(PipelineEvent::QueueDrained { epoch });
        }
    }
}

/// Handle to the synthesis queue. Clones share the same queue.
#[derive(Clone)]
pub struct SynthesisQueue {
    shared: Arc<Shared>,
    cfg: QueueConfig,
}

impl SynthesisQueue {
    pub fn new(bus: EventBus, cfg: QueueConfig) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(JobState::default()),
                notify: Notify::new(),
                epoch,
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                bus,
            }),
            cfg,
        }
    }

    /// Create the queue, its playback thread and its synthesis worker task.
    pub fn spawn(
        transport: Arc<dyn SynthesisTransport>,
        open_sink: SinkFactory,
        bus: EventBus,
        cfg: QueueConfig,
    ) -> std::io::Result<Self> {
        let queue = Self::new(bus, cfg);
        let player = queue.spawn_player(open_sink)?;
        tokio::spawn(queue.clone().run_forever(transport, player));
        Ok(queue)
    }

    /// Start the playback thread. The sink is opened on that thread.
    pub fn spawn_player(
        &self,
        open_sink: SinkFactory,
    ) -> std::io::Result<mpsc::Sender<PlaybackEnvelope>> {
        let (tx, rx) = mpsc::channel();
        let shared = self.shared.clone();
        let poll = self.cfg.poll_interval;
        std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || run_player(open_sink, rx, shared, poll))?;
        Ok(tx)
    }

    pub fn epoch(&self) -> u64 {
        self.shared.current_epoch()
    }

    /// True when nothing is queued, synthesizing or playing
    pub fn is_idle(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst) == 0
    }

    pub fn pending(&self) -> usize {
        self.shared.lock_jobs().pending.len()
    }

    /// Enqueue under the current epoch.
    pub fn enqueue(&self, text: &str, emotion: &str) -> bool {
        self.enqueue_at(self.epoch(), text, emotion)
    }

    /// Enqueue on behalf of work started under `epoch`. Rejected when an
    /// interrupt has happened since.
    pub fn enqueue_at(&self, epoch: u64, text: &str, emotion: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        {
            let mut st = self.shared.lock_jobs();
            if epoch != self.shared.current_epoch() {
                debug!(epoch, "dropping job from an interrupted turn");
                return false;
            }
            let id = st.next_id;
            st.next_id += 1;
            st.pending.push_back(SynthesisJob {
                id,
                text: text.to_string(),
                emotion: emotion.to_string(),
                epoch,
            });
            self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Discard everything still queued and stop the current clip. Jobs the
    /// worker already took are let through. Returns the new epoch.
    pub fn interrupt(&self) -> u64 {
        let (old, drained, spared) = {
            let mut st = self.shared.lock_jobs();
            let old = self.shared.current_epoch();
            self.shared.epoch.send_modify(|e| *e += 1);
            let drained = st.pending.len();
            st.pending.clear();
            st.spared = st
                .released
                .iter()
                .filter(|(_, epoch)| *epoch == old)
                .map(|(id, _)| *id)
                .collect();
            (old, drained, st.spared.len())
        };
        self.shared.finish(old, drained);
        info!(drained, spared, epoch = old + 1, "synthesis queue interrupted");
        old + 1
    }

    /// Stop the worker after the job it is processing.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    async fn next_job(&self) -> Option<SynthesisJob> {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }
            {
                let mut st = self.shared.lock_jobs();
                if let Some(job) = st.pending.pop_front() {
                    st.released.push((job.id, job.epoch));
                    return Some(job);
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Worker loop: one job at a time, in enqueue order.
    pub async fn run_forever(
        self,
        transport: Arc<dyn SynthesisTransport>,
        player: mpsc::Sender<PlaybackEnvelope>,
    ) {
        info!("Synthesis worker started");
        while let Some(job) = self.next_job().await {
            self.process(job, transport.as_ref(), &player).await;
        }
        info!("Synthesis worker stopped");
    }

    async fn process(
        &self,
        job: SynthesisJob,
        transport: &dyn SynthesisTransport,
        player: &mpsc::Sender<PlaybackEnvelope>,
    ) {
        let shared = &self.shared;
        if !shared.is_live(job.id, job.epoch) {
            shared.drop_job(job.id, job.epoch);
            return;
        }

        let mut epoch_rx = shared.epoch.subscribe();
        let request = SynthesisRequest {
            text: job.text.clone(),
            emotion: job.emotion.clone(),
        };
        let mut synthesis = transport.synthesize(&request);
        let result = loop {
            tokio::select! {
                res = &mut synthesis => break res,
                changed = epoch_rx.changed() => {
                    if changed.is_err() || !shared.is_live(job.id, job.epoch) {
                        debug!(text = %job.text, "synthesis abandoned after interrupt");
                        shared.drop_job(job.id, job.epoch);
                        return;
                    }
                }
            }
        };

        let output = match result {
            Ok(output) if output.pcm.is_empty() => {
                warn!(text = %job.text, "synthesis produced no audio");
                shared.drop_job(job.id, job.epoch);
                return;
            }
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, text = %job.text, "synthesis failed");
                shared.bus.emit(PipelineEvent::PlaybackDone);
                shared.drop_job(job.id, job.epoch);
                return;
            }
        };

        if !shared.is_live(job.id, job.epoch) {
            shared.drop_job(job.id, job.epoch);
            return;
        }

        let _span = span!(Level::DEBUG, "synth.deliver").entered();
        shared.bus.emit(PipelineEvent::SubtitleReady {
            text: job.text.clone(),
            emotion: job.emotion.clone(),
        });

        let sample_rate = transport.sample_rate();
        let start_at = now_ms() + self.cfg.playback_offset.as_millis() as u64;
        let timeline = if output.subtitles.is_empty() {
            Timeline::from_audio(&output.pcm, sample_rate)
        } else {
            Timeline::from_timestamps(output.subtitles)
        }
        .schedule(start_at, self.cfg.playback_offset.as_millis() as u64);

        let clip = PlaybackEnvelope {
            job: job.id,
            pcm: output.pcm,
            sample_rate,
            epoch: job.epoch,
        };
        if player.send(clip).is_err() {
            error!("Playback thread is gone, dropping clip");
            shared.drop_job(job.id, job.epoch);
            return;
        }

        if !timeline.is_empty() {
            shared.bus.emit(PipelineEvent::LipSyncReady { timeline });
        }
    }
}

fn run_player(
    open_sink: SinkFactory,
    rx: mpsc::Receiver<PlaybackEnvelope>,
    shared: Arc<Shared>,
    poll: Duration,
) {
    let mut sink: Box<dyn AudioSink> = match open_sink() {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to open playback device: {}", e);
            // Keep accounting correct so turns can still complete
            while let Ok(clip) = rx.recv() {
                shared.bus.emit(PipelineEvent::PlaybackDone);
                shared.drop_job(clip.job, clip.epoch);
            }
            return;
        }
    };
    info!("Playback thread started");

    while let Ok(clip) = rx.recv() {
        let Some(started_under) = shared.start_playing(clip.job, clip.epoch) else {
            shared.finish(clip.epoch, 1);
            continue;
        };

        if let Err(e) = sink.play(&clip.pcm, clip.sample_rate) {
            error!("Playback failed: {}", e);
            shared.bus.emit(PipelineEvent::PlaybackDone);
            shared.finish(clip.epoch, 1);
            continue;
        }
        shared.bus.emit(PipelineEvent::PlaybackStarted {
            started_at_ms: now_ms(),
        });

        while sink.is_playing() {
            if shared.current_epoch() != started_under {
                sink.stop();
                debug!("Playback stopped by interrupt");
                break;
            }
            std::thread::sleep(poll);
        }

        shared.bus.emit(PipelineEvent::PlaybackDone);
        shared.finish(clip.epoch, 1);
    }

    drop(sink);
    info!("Playback thread stopped, device released");
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
