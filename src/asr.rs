//! Speech recognition for committed utterances

use crate::audio_seg::SAMPLE_RATE;
use crate::config::AsrConfig;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum AsrError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Recognizer returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AsrError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
    pub text: String,
    /// Lower-case emotion tag, `neutral` when none was detected
    pub emotion: String,
}

impl Recognition {
    /// Whether the text carries any word content at all. Punctuation-only
    /// and empty results do not start a turn.
    pub fn is_meaningful(&self) -> bool {
        is_meaningful(&self.text)
    }
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn transcribe(&self, pcm: &[i16]) -> Result<Recognition>;
}

static EMOTION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\|([A-Z_]+)\|>").expect("static pattern"));
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\|[^|]+\|>").expect("static pattern"));

/// Split a tagged transcript such as `<|zh|><|HAPPY|><|Speech|>你好` into
/// plain text and an emotion tag.
pub fn parse_tagged_transcript(raw: &str) -> Recognition {
    let emotion = EMOTION_TAG
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| match m.as_str() {
            "HAPPY" => "happy",
            "SAD" => "sad",
            "ANGRY" => "angry",
            "DISGUSTED" => "disgusted",
            "FEARFUL" => "fearful",
            "SURPRISED" => "surprised",
            _ => "neutral",
        })
        .unwrap_or("neutral");

    Recognition {
        text: ANY_TAG.replace_all(raw, "").trim().to_string(),
        emotion: emotion.to_string(),
    }
}

pub fn is_meaningful(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

/// Wrap 16-bit mono PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in pcm {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Recognizer behind an OpenAI-style `/audio/transcriptions` endpoint
pub struct HttpRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl HttpRecognizer {
    pub fn new(config: &AsrConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(AsrError::Config("asr.url is empty".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SpeechRecognizer for HttpRecognizer {
    async fn transcribe(&self, pcm: &[i16]) -> Result<Recognition> {
        let wav = pcm_to_wav(pcm, SAMPLE_RATE)?;
        debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")?,
            )
            .text("model", self.model.clone());

        let mut request = self.client.post(&self.url).multipart(form);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "recognizer error");
            return Err(AsrError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: TranscriptionResponse = response.json().await?;
        let recognition = parse_tagged_transcript(&result.text);
        info!(text = %recognition.text, emotion = %recognition.emotion, "transcription complete");
        Ok(recognition)
    }
}
