//! Configuration management for rhotalk
//!
//! Loaded from a TOML file; every section and field has a default so a
//! missing or partial file is fine. Secrets can come from the environment.

use crate::audio_seg::SegConfig;
use crate::output_seg::{WireShape, NEUTRAL_EMOTION};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub character: CharacterConfig,
    pub llm: LlmConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterConfig {
    pub name: String,
    pub persona: String,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            name: "小零".to_string(),
            persona: "你是一个活泼开朗的虚拟主播。".to_string(),
        }
    }
}

/// OpenAI-compatible chat completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub wire_shape: WireShape,
    /// Completed exchanges kept as prompt context
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            temperature: 0.8,
            max_tokens: 512,
            wire_shape: WireShape::JsonReply,
            history_turns: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Transcription endpoint accepting a multipart WAV upload
    pub url: String,
    pub api_key: String,
    pub model: String,
    /// Capture device; `None` uses the system default
    pub device: Option<String>,
    pub vad_sensitivity: u8,
    pub silence_duration_ms: u64,
    pub min_speech_duration_ms: u64,
    pub vad_rms_threshold: f32,
    pub vad_pre_roll_frames: usize,
    pub max_utterance_ms: Option<u64>,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8001/v1/audio/transcriptions".to_string(),
            api_key: String::new(),
            model: "sensevoice-small".to_string(),
            device: None,
            vad_sensitivity: 3,
            silence_duration_ms: 800,
            min_speech_duration_ms: 300,
            vad_rms_threshold: 2200.0,
            vad_pre_roll_frames: 3,
            max_utterance_ms: None,
        }
    }
}

impl AsrConfig {
    pub fn seg_config(&self) -> SegConfig {
        SegConfig {
            rms_threshold: self.vad_rms_threshold,
            hangover_ms: self.silence_duration_ms,
            min_speech_ms: self.min_speech_duration_ms,
            pre_roll_frames: self.vad_pre_roll_frames,
            aggressiveness: self.vad_sensitivity,
            max_utterance_ms: self.max_utterance_ms,
        }
    }
}

/// Streaming synthesis provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub url: String,
    pub api_key: String,
    pub voice_type: i64,
    pub codec: String,
    pub sample_rate: u32,
    /// Gap with no provider frames after which a clip is considered done
    pub idle_timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8002/stream".to_string(),
            api_key: String::new(),
            voice_type: 603004,
            codec: "pcm".to_string(),
            sample_rate: 16_000,
            idle_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// A generation stream quiet for this long is finished as if complete
    pub stream_idle_timeout_ms: u64,
    /// Lead time between announcing a lip-sync timeline and audio start
    pub playback_offset_ms: u64,
    pub playback_poll_ms: u64,
    /// How long an interrupted generation gets to wind down before abort
    pub cancel_grace_ms: u64,
    pub event_capacity: usize,
    pub neutral_emotion: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream_idle_timeout_ms: 60_000,
            playback_offset_ms: 50,
            playback_poll_ms: 20,
            cancel_grace_ms: 2_000,
            event_capacity: 256,
            neutral_emotion: NEUTRAL_EMOTION.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay secrets and endpoints from the environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("RHOTALK_LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(url) = var("RHOTALK_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(key) = var("RHOTALK_ASR_API_KEY") {
            self.asr.api_key = key;
        }
        if let Some(key) = var("RHOTALK_TTS_API_KEY") {
            self.tts.api_key = key;
        }
        if let Some(url) = var("RHOTALK_TTS_URL") {
            self.tts.url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.asr
            .seg_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.tts.sample_rate == 0 {
            return Err(ConfigError::Invalid("tts.sample_rate must be positive".into()));
        }
        if self.pipeline.playback_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.playback_poll_ms must be positive".into(),
            ));
        }
        url::Url::parse(&self.tts.url)
            .map_err(|e| ConfigError::Invalid(format!("tts.url: {e}")))?;
        url::Url::parse(&self.llm.base_url)
            .map_err(|e| ConfigError::Invalid(format!("llm.base_url: {e}")))?;
        Ok(())
    }
}
