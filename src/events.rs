//! Pipeline events
//!
//! Every stage publishes typed events on one broadcast bus. Observers that
//! want a wire form get it from [`PipelineEvent::to_observer_json`].

use crate::lip_sync::Timeline;
use crate::output_seg::TextUnit;
use crate::turn::{GenerationOutcome, TurnId};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    UtteranceDetected {
        pcm: Arc<Vec<i16>>,
        duration_ms: u64,
    },
    RecognitionResult {
        text: String,
        emotion: String,
    },
    /// Raw generation fragment
    TextDelta {
        turn: TurnId,
        text: String,
    },
    /// Spoken text outside the JSON envelope, for live captions
    StreamText {
        turn: TurnId,
        text: String,
    },
    SentenceReady {
        turn: TurnId,
        unit: TextUnit,
    },
    GenerationDone {
        turn: TurnId,
        outcome: GenerationOutcome,
    },
    SubtitleReady {
        text: String,
        emotion: String,
    },
    LipSyncReady {
        timeline: Timeline,
    },
    PlaybackStarted {
        started_at_ms: u64,
    },
    PlaybackDone,
    InterruptRequested {
        turn: Option<TurnId>,
    },
    QueueDrained {
        epoch: u64,
    },
}

impl PipelineEvent {
    /// Compact JSON form for external observers (captions, avatar renderer).
    /// Internal bookkeeping events map to `None`.
    pub fn to_observer_json(&self) -> Option<Value> {
        let value = match self {
            PipelineEvent::RecognitionResult { text, emotion } => {
                json!({ "type": "asr_result", "text": text, "emotion": emotion })
            }
            PipelineEvent::StreamText { turn, text } => {
                json!({ "type": "llm_stream", "turn": turn, "text": text })
            }
            PipelineEvent::SubtitleReady { text, emotion } => {
                json!({ "type": "subtitle", "text": text, "emotion": emotion })
            }
            PipelineEvent::LipSyncReady { timeline } => {
                json!({ "type": "lip_sync", "data": timeline })
            }
            PipelineEvent::PlaybackDone => json!({ "type": "playback_done" }),
            PipelineEvent::InterruptRequested { turn } => {
                json!({ "type": "interrupt", "turn": turn })
            }
            _ => return None,
        };
        Some(value)
    }
}

/// Fan-out bus for pipeline events. Cloning shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: PipelineEvent) {
        // It's ok if there are no subscribers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}
