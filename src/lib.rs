//! rhotalk - streaming voice conversation pipeline
//!
//! Microphone audio is segmented into utterances, recognized, answered by a
//! streaming generation model, split into sentences, synthesized and played
//! back with a lip-sync timeline. A new utterance or explicit stop barges in
//! on whatever is currently being generated or spoken.

pub mod asr;
pub mod audio;
pub mod audio_seg;
pub mod config;
pub mod events;
pub mod history;
pub mod lip_sync;
pub mod llm;
pub mod output_seg;
pub mod synth_queue;
pub mod tts;
pub mod turn;
