//! Mouth-movement timelines for synthesized clips.
//!
//! When the synthesis provider reports per-character timestamps those are
//! used as-is. Otherwise an energy envelope of the PCM is turned into
//! "mouth open" intervals.

use serde::{Deserialize, Serialize};

/// Analysis window for the energy fallback
pub const WINDOW_MS: u64 = 30;

/// Normalized RMS below which a window counts as closed-mouth
pub const SILENCE_THRESHOLD: f32 = 0.02;

/// Placeholder glyph for intervals derived from audio energy
pub const ENERGY_MARK: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouthInterval {
    #[serde(rename = "char")]
    pub text: String,
    #[serde(rename = "beginTime")]
    pub begin_ms: u64,
    #[serde(rename = "endTime")]
    pub end_ms: u64,
}

/// Intervals relative to clip start, plus the wall-clock instant playback is
/// scheduled to begin.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Timeline {
    #[serde(rename = "timeline")]
    pub intervals: Vec<MouthInterval>,
    /// Unix epoch milliseconds
    #[serde(rename = "t0")]
    pub start_at_ms: u64,
    #[serde(rename = "audioDelay")]
    pub audio_delay_ms: u64,
}

impl Timeline {
    pub fn from_timestamps(intervals: Vec<MouthInterval>) -> Self {
        Self {
            intervals,
            ..Self::default()
        }
    }

    pub fn from_audio(pcm: &[i16], sample_rate: u32) -> Self {
        let window = (sample_rate as u64 * WINDOW_MS / 1000) as usize;
        let mut intervals: Vec<MouthInterval> = Vec::new();
        if window == 0 {
            return Self::default();
        }

        for (i, chunk) in pcm.chunks_exact(window).enumerate() {
            if normalized_rms(chunk) < SILENCE_THRESHOLD {
                continue;
            }
            let begin = i as u64 * WINDOW_MS;
            let end = begin + WINDOW_MS;
            match intervals.last_mut() {
                // Bridge single-window dips so syllables don't flicker
                Some(last) if last.end_ms + WINDOW_MS >= begin => last.end_ms = end,
                _ => intervals.push(MouthInterval {
                    text: ENERGY_MARK.to_string(),
                    begin_ms: begin,
                    end_ms: end,
                }),
            }
        }

        Self::from_timestamps(intervals)
    }

    pub fn schedule(mut self, start_at_ms: u64, audio_delay_ms: u64) -> Self {
        self.start_at_ms = start_at_ms;
        self.audio_delay_ms = audio_delay_ms;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

fn normalized_rms(chunk: &[i16]) -> f32 {
    crate::audio_seg::frame_rms(chunk) / 32768.0
}
