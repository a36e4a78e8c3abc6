//! Audio segmentation module
//!
//! Turns a continuous stream of 30 ms microphone frames into discrete
//! utterances. Every frame first passes an RMS energy gate; only frames that
//! clear the gate are shown to the speech classifier (WebRTC VAD). A small
//! ring of recent idle frames is prepended to each utterance so that word
//! onsets missed by the detector are still present in the emitted audio.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, span, warn, Level};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Capture sample rate in Hz
pub const SAMPLE_RATE: u32 = 16_000;

/// Duration of one segmentation frame in milliseconds
pub const FRAME_MS: u64 = 30;

/// Samples in one 30 ms frame at 16 kHz
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as u64 * FRAME_MS / 1000) as usize;

/// Error type for audio segmentation operations
#[derive(Debug, thiserror::Error)]
pub enum SegmentationError {
    #[error("VAD error: {0}")]
    VadError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, SegmentationError>;

/// Configuration for audio segmentation
#[derive(Debug, Clone, PartialEq)]
pub struct SegConfig {
    /// Frames whose RMS falls below this value are treated as non-speech
    /// without consulting the classifier
    pub rms_threshold: f32,

    /// Consecutive non-speech duration that closes an utterance
    pub hangover_ms: u64,

    /// Utterances with less speech than this are discarded as noise
    pub min_speech_ms: u64,

    /// Number of idle frames kept for prepending to the next utterance
    pub pre_roll_frames: usize,

    /// Classifier aggressiveness, 0 (permissive) to 3 (strict)
    pub aggressiveness: u8,

    /// Hard cap on utterance length; `None` lets an utterance run until silence
    pub max_utterance_ms: Option<u64>,
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 2200.0,
            hangover_ms: 800,
            min_speech_ms: 300,
            pre_roll_frames: 3,
            aggressiveness: 3,
            max_utterance_ms: None,
        }
    }
}

impl SegConfig {
    fn hangover_frames(&self) -> usize {
        ((self.hangover_ms / FRAME_MS) as usize).max(1)
    }

    fn min_speech_frames(&self) -> usize {
        (self.min_speech_ms / FRAME_MS) as usize
    }

    fn max_frames(&self) -> Option<usize> {
        self.max_utterance_ms
            .map(|ms| ((ms / FRAME_MS) as usize).max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggressiveness > 3 {
            return Err(SegmentationError::ConfigError(format!(
                "aggressiveness must be 0..=3, got {}",
                self.aggressiveness
            )));
        }
        if !self.rms_threshold.is_finite() || self.rms_threshold < 0.0 {
            return Err(SegmentationError::ConfigError(format!(
                "invalid RMS threshold {}",
                self.rms_threshold
            )));
        }
        Ok(())
    }
}

/// A completed utterance
#[derive(Debug, Clone)]
pub struct Utterance {
    /// The PCM audio data (16-bit mono at 16kHz), pre-roll included
    pub pcm: Vec<i16>,

    /// Number of frames taken from the pre-roll ring
    pub pre_roll_frames: usize,

    /// Number of frames the classifier judged as speech
    pub speech_frames: usize,

    /// The reason this utterance was closed
    pub close_reason: CloseReason,
}

impl Utterance {
    pub fn frames(&self) -> usize {
        self.pcm.len() / FRAME_SAMPLES
    }

    pub fn duration_ms(&self) -> u64 {
        self.pcm.len() as u64 * 1000 / SAMPLE_RATE as u64
    }
}

/// Reason an utterance was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed after the hangover window of non-speech
    Silence,

    /// Closed due to maximum utterance length
    MaxLength,

    /// Closed by an explicit `force_commit`
    Forced,
}

/// Decides whether a single frame contains speech.
pub trait SpeechClassifier: Send {
    fn is_speech(&mut self, frame: &[i16]) -> bool;

    fn set_aggressiveness(&mut self, _level: u8) {}
}

/// Builds a classifier for a freshly started microphone
pub type ClassifierFactory = Arc<dyn Fn(&SegConfig) -> Box<dyn SpeechClassifier> + Send + Sync>;

/// WebRTC VAD at 16 kHz
pub struct WebRtcClassifier {
    vad: Vad,
}

// The detector holds a raw handle to its C state. It is only ever touched
// through `&mut self`, behind the segmenter's mutex.
unsafe impl Send for WebRtcClassifier {}

impl WebRtcClassifier {
    pub fn new(aggressiveness: u8) -> Result<Self> {
        if aggressiveness > 3 {
            return Err(SegmentationError::VadError(format!(
                "unsupported aggressiveness {aggressiveness}"
            )));
        }
        Ok(Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, vad_mode(aggressiveness)),
        })
    }
}

fn vad_mode(level: u8) -> VadMode {
    match level {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        match self.vad.is_voice_segment(frame) {
            Ok(voiced) => voiced,
            Err(()) => {
                warn!("VAD error: invalid frame length {}", frame.len());
                false
            }
        }
    }

    fn set_aggressiveness(&mut self, level: u8) {
        self.vad.set_mode(vad_mode(level));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Speaking,
}

struct SegState {
    cfg: SegConfig,
    classifier: Box<dyn SpeechClassifier>,
    phase: Phase,
    pre_roll: VecDeque<Vec<i16>>,
    buffer: Vec<i16>,
    frames: usize,
    pre_roll_used: usize,
    speech_frames: usize,
    silent_run: usize,
}

/// Frame-driven utterance segmenter.
///
/// All state sits behind one mutex: the capture thread calls `process` while
/// the turn coordinator may call `force_commit` or `reconfigure` at any time.
pub struct Segmenter {
    state: Mutex<SegState>,
}

impl Segmenter {
    /// Create a segmenter backed by the WebRTC detector
    pub fn new(cfg: SegConfig) -> Result<Self> {
        let classifier = WebRtcClassifier::new(cfg.aggressiveness)?;
        Self::with_classifier(cfg, Box::new(classifier))
    }

    pub fn with_classifier(cfg: SegConfig, classifier: Box<dyn SpeechClassifier>) -> Result<Self> {
        cfg.validate()?;
        let pre_roll = VecDeque::with_capacity(cfg.pre_roll_frames);
        Ok(Self {
            state: Mutex::new(SegState {
                cfg,
                classifier,
                phase: Phase::Idle,
                pre_roll,
                buffer: Vec::with_capacity(SAMPLE_RATE as usize * 8),
                frames: 0,
                pre_roll_used: 0,
                speech_frames: 0,
                silent_run: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SegState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one 30 ms frame. Returns an utterance when this frame closes one.
    pub fn process(&self, frame: &[i16]) -> Option<Utterance> {
        let _span = span!(Level::DEBUG, "segment.process").entered();
        if frame.is_empty() {
            return None;
        }
        if frame.len() != FRAME_SAMPLES {
            debug!(
                "Expected {} samples per frame, got {}",
                FRAME_SAMPLES,
                frame.len()
            );
        }
        self.lock().process(frame)
    }

    /// Close whatever is in flight right now. Returns `None` when idle or
    /// when the accumulated speech is below the minimum.
    pub fn force_commit(&self) -> Option<Utterance> {
        let mut st = self.lock();
        if st.phase == Phase::Idle || st.buffer.is_empty() {
            return None;
        }
        debug!(frames = st.frames, "forcing utterance commit");
        st.close(CloseReason::Forced)
    }

    /// Apply new thresholds without dropping the utterance in progress.
    pub fn reconfigure(&self, cfg: SegConfig) -> Result<()> {
        cfg.validate()?;
        let mut st = self.lock();
        if cfg.aggressiveness != st.cfg.aggressiveness {
            st.classifier.set_aggressiveness(cfg.aggressiveness);
        }
        while st.pre_roll.len() > cfg.pre_roll_frames {
            st.pre_roll.pop_front();
        }
        debug!(?cfg, "segmenter reconfigured");
        st.cfg = cfg;
        Ok(())
    }

    pub fn is_speaking(&self) -> bool {
        self.lock().phase == Phase::Speaking
    }

    pub fn config(&self) -> SegConfig {
        self.lock().cfg.clone()
    }
}

impl SegState {
    fn process(&mut self, frame: &[i16]) -> Option<Utterance> {
        let speech = frame_rms(frame) >= self.cfg.rms_threshold && self.classifier.is_speech(frame);

        match self.phase {
            Phase::Idle => {
                if !speech {
                    self.remember(frame);
                    return None;
                }
                self.open();
                self.append(frame);
                self.speech_frames = 1;
            }
            Phase::Speaking => {
                self.append(frame);
                if speech {
                    self.speech_frames += 1;
                    self.silent_run = 0;
                } else {
                    self.silent_run += 1;
                    if self.silent_run >= self.cfg.hangover_frames() {
                        debug!(
                            "Closing utterance after {} silent frames",
                            self.silent_run
                        );
                        return self.close(CloseReason::Silence);
                    }
                }
            }
        }

        if let Some(max) = self.cfg.max_frames() {
            if self.frames - self.pre_roll_used >= max {
                debug!("Closing utterance due to max length: {} frames", self.frames);
                return self.close(CloseReason::MaxLength);
            }
        }
        None
    }

    fn remember(&mut self, frame: &[i16]) {
        if self.cfg.pre_roll_frames == 0 {
            return;
        }
        if self.pre_roll.len() == self.cfg.pre_roll_frames {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame.to_vec());
    }

    fn open(&mut self) {
        self.phase = Phase::Speaking;
        self.buffer.clear();
        for frame in &self.pre_roll {
            self.buffer.extend_from_slice(frame);
        }
        self.pre_roll_used = self.pre_roll.len();
        self.frames = self.pre_roll_used;
        self.speech_frames = 0;
        self.silent_run = 0;
        debug!(pre_roll = self.pre_roll_used, "speech onset");
    }

    fn append(&mut self, frame: &[i16]) {
        self.buffer.extend_from_slice(frame);
        self.frames += 1;
    }

    fn close(&mut self, reason: CloseReason) -> Option<Utterance> {
        let speech_frames = self.speech_frames;
        let pre_roll_frames = self.pre_roll_used;
        let pcm = std::mem::take(&mut self.buffer);
        self.reset();

        if speech_frames < self.cfg.min_speech_frames() {
            debug!(
                speech_frames,
                "discarding utterance below minimum speech duration"
            );
            return None;
        }

        Some(Utterance {
            pcm,
            pre_roll_frames,
            speech_frames,
            close_reason: reason,
        })
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.buffer.clear();
        self.frames = 0;
        self.pre_roll_used = 0;
        self.speech_frames = 0;
        self.silent_run = 0;
    }
}

/// Root-mean-square amplitude of a frame, in raw sample units
pub fn frame_rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / frame.len() as f64).sqrt() as f32
}

/// Convert i16 PCM samples to u8 bytes (for sending to audio APIs)
pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert u8 bytes to i16 PCM samples. A trailing odd byte is dropped.
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Treats every frame that reaches it as speech and counts calls.
    struct AlwaysSpeech {
        calls: Arc<AtomicUsize>,
    }

    impl SpeechClassifier for AlwaysSpeech {
        fn is_speech(&mut self, _frame: &[i16]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn segmenter(cfg: SegConfig) -> (Segmenter, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seg = Segmenter::with_classifier(
            cfg,
            Box::new(AlwaysSpeech {
                calls: calls.clone(),
            }),
        )
        .unwrap();
        (seg, calls)
    }

    fn loud() -> Vec<i16> {
        vec![5000; FRAME_SAMPLES]
    }

    fn quiet() -> Vec<i16> {
        vec![10; FRAME_SAMPLES]
    }

    fn feed(seg: &Segmenter, frame: &[i16], n: usize) -> Vec<Utterance> {
        (0..n).filter_map(|_| seg.process(frame)).collect()
    }

    #[test]
    fn test_emits_after_hangover_with_pre_roll() {
        let (seg, _) = segmenter(SegConfig::default());

        assert!(feed(&seg, &quiet(), 5).is_empty());
        assert!(feed(&seg, &loud(), 10).is_empty());

        // 800 ms hangover is 26 frames; the 26th silent frame closes it
        let mut emitted = Vec::new();
        for i in 0..30 {
            if let Some(u) = seg.process(&quiet()) {
                emitted.push((i, u));
            }
        }
        assert_eq!(emitted.len(), 1);
        let (at, utt) = &emitted[0];
        assert_eq!(*at, 25);
        assert_eq!(utt.pre_roll_frames, 3);
        assert_eq!(utt.speech_frames, 10);
        assert_eq!(utt.frames(), 3 + 10 + 26);
        assert_eq!(utt.pcm.len(), 39 * FRAME_SAMPLES);
        assert_eq!(utt.close_reason, CloseReason::Silence);
        assert!(!seg.is_speaking());
    }

    #[test]
    fn test_short_noise_is_discarded() {
        let (seg, _) = segmenter(SegConfig::default());
        assert!(feed(&seg, &loud(), 5).is_empty());
        assert!(feed(&seg, &quiet(), 40).is_empty());
        assert!(!seg.is_speaking());
    }

    #[test]
    fn test_energy_gate_skips_classifier() {
        let (seg, calls) = segmenter(SegConfig::default());
        assert!(feed(&seg, &quiet(), 100).is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!seg.is_speaking());
    }

    #[test]
    fn test_force_commit() {
        let (seg, _) = segmenter(SegConfig::default());
        assert!(seg.force_commit().is_none());
        assert!(seg.force_commit().is_none());

        feed(&seg, &quiet(), 3);
        feed(&seg, &loud(), 12);
        let utt = seg.force_commit().expect("enough speech to commit");
        assert_eq!(utt.close_reason, CloseReason::Forced);
        assert_eq!(utt.frames(), 15);
        assert!(!seg.is_speaking());
        assert!(seg.force_commit().is_none());
    }

    #[test]
    fn test_force_commit_below_minimum_resets() {
        let (seg, _) = segmenter(SegConfig::default());
        feed(&seg, &loud(), 4);
        assert!(seg.is_speaking());
        assert!(seg.force_commit().is_none());
        assert!(!seg.is_speaking());
    }

    #[test]
    fn test_pre_roll_survives_emission() {
        let (seg, _) = segmenter(SegConfig::default());
        feed(&seg, &quiet(), 3);
        feed(&seg, &loud(), 10);
        assert_eq!(feed(&seg, &quiet(), 26).len(), 1);

        feed(&seg, &quiet(), 4);
        feed(&seg, &loud(), 10);
        let second = feed(&seg, &quiet(), 26);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].pre_roll_frames, 3);
    }

    #[test]
    fn test_max_length_closes_utterance() {
        let cfg = SegConfig {
            max_utterance_ms: Some(600),
            ..SegConfig::default()
        };
        let (seg, _) = segmenter(cfg);
        let out = feed(&seg, &loud(), 25);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].close_reason, CloseReason::MaxLength);
        assert_eq!(out[0].speech_frames, 20);
    }

    #[test]
    fn test_reconfigure_shrinks_pre_roll() {
        let (seg, _) = segmenter(SegConfig::default());
        feed(&seg, &quiet(), 5);
        seg.reconfigure(SegConfig {
            pre_roll_frames: 1,
            ..SegConfig::default()
        })
        .unwrap();
        feed(&seg, &loud(), 10);
        let out = feed(&seg, &quiet(), 26);
        assert_eq!(out[0].pre_roll_frames, 1);
        assert!(seg
            .reconfigure(SegConfig {
                aggressiveness: 7,
                ..SegConfig::default()
            })
            .is_err());
    }

    #[test]
    fn test_frame_rms() {
        assert_eq!(frame_rms(&[]), 0.0);
        assert!((frame_rms(&[3000, -3000, 3000, -3000]) - 3000.0).abs() < 1e-3);
    }

    #[test]
    fn test_i16_u8_conversion() {
        let samples = vec![0i16, 100, -100, i16::MAX, i16::MIN];
        let bytes = i16_slice_to_u8(&samples);
        let samples2 = u8_to_i16_slice(&bytes);
        assert_eq!(samples, samples2);
    }
}
