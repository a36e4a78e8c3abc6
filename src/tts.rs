//! Streaming speech synthesis over WebSocket
//!
//! One connection per clip: wait for the provider's ready frame, send the
//! text followed by a completion action, then collect binary PCM frames and
//! subtitle timestamps until the provider marks the stream final.

use crate::audio_seg::u8_to_i16_slice;
use crate::config::TtsConfig;
use crate::lip_sync::MouthInterval;
use crate::output_seg::NEUTRAL_EMOTION;
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provider error {code}: {message}")]
    Provider { code: i64, message: String },

    #[error("Timed out waiting for the synthesis provider")]
    Timeout,

    #[error("Connection closed before the provider was ready")]
    ClosedEarly,
}

pub type Result<T> = std::result::Result<T, TtsError>;

/// Voice parameters applied for an emotion label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmotionProfile {
    pub category: &'static str,
    pub intensity: u32,
    pub speed: i32,
    pub volume: i32,
}

const PROFILES: [(&str, EmotionProfile); 5] = [
    ("开心", EmotionProfile { category: "happy", intensity: 150, speed: 1, volume: 2 }),
    ("悲伤", EmotionProfile { category: "sad", intensity: 120, speed: -1, volume: -2 }),
    ("愤怒", EmotionProfile { category: "angry", intensity: 150, speed: 2, volume: 4 }),
    ("平静", EmotionProfile { category: "neutral", intensity: 100, speed: 0, volume: 0 }),
    ("惊讶", EmotionProfile { category: "fear", intensity: 130, speed: 1, volume: 2 }),
];

impl EmotionProfile {
    /// Unknown labels get the neutral profile.
    pub fn for_label(label: &str) -> Self {
        let lookup = |l: &str| PROFILES.iter().find(|(k, _)| *k == l).map(|(_, p)| *p);
        lookup(label)
            .or_else(|| lookup(NEUTRAL_EMOTION))
            .unwrap_or(PROFILES[3].1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
    pub emotion: String,
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOutput {
    pub pcm: Vec<i16>,
    pub subtitles: Vec<MouthInterval>,
}

#[async_trait]
pub trait SynthesisTransport: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutput>;

    fn sample_rate(&self) -> u32;
}

#[derive(Debug, Default, Deserialize)]
struct ServerFrame {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    ready: Option<i64>,
    #[serde(rename = "final")]
    is_final: Option<i64>,
    result: Option<FrameResult>,
    /// Some providers ship audio inline instead of as binary frames
    audio: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FrameResult {
    subtitles: Option<Vec<Subtitle>>,
}

#[derive(Debug, Deserialize)]
struct Subtitle {
    #[serde(rename = "Text", default)]
    text: String,
    #[serde(rename = "BeginTime", default)]
    begin_time: u64,
    #[serde(rename = "EndTime", default)]
    end_time: u64,
}

impl From<Subtitle> for MouthInterval {
    fn from(s: Subtitle) -> Self {
        MouthInterval {
            text: s.text,
            begin_ms: s.begin_time,
            end_ms: s.end_time,
        }
    }
}

pub struct WsSynthesisTransport {
    config: TtsConfig,
    idle: Duration,
}

impl WsSynthesisTransport {
    pub fn new(config: TtsConfig) -> Self {
        let idle = Duration::from_millis(config.idle_timeout_ms);
        Self { config, idle }
    }

    fn request_url(&self, request: &SynthesisRequest, session_id: &str) -> Result<Url> {
        let profile = EmotionProfile::for_label(&request.emotion);
        let mut url = Url::parse(&self.config.url)?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("SessionId", session_id)
                .append_pair("VoiceType", &self.config.voice_type.to_string())
                .append_pair("Codec", &self.config.codec)
                .append_pair("SampleRate", &self.config.sample_rate.to_string())
                .append_pair("Speed", &profile.speed.to_string())
                .append_pair("Volume", &profile.volume.to_string())
                .append_pair("EmotionCategory", profile.category)
                .append_pair("EmotionIntensity", &profile.intensity.to_string())
                .append_pair("SubtitleType", "1");
            if !self.config.api_key.is_empty() {
                q.append_pair("Token", &self.config.api_key);
            }
        }
        Ok(url)
    }
}

fn new_id() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

fn action(session_id: &str, action: &str, data: &str) -> Message {
    let body = json!({
        "session_id": session_id,
        "message_id": new_id(),
        "action": action,
        "data": data,
    });
    Message::Text(body.to_string().into())
}

#[async_trait]
impl SynthesisTransport for WsSynthesisTransport {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisOutput> {
        let session_id = new_id();
        let url = self.request_url(request, &session_id)?;
        debug!(session = %session_id, chars = request.text.chars().count(), "connecting to synthesis provider");

        let (ws_stream, _resp) = timeout(self.idle, connect_async(url.as_str()))
            .await
            .map_err(|_| TtsError::Timeout)??;
        let (mut sink, mut stream) = ws_stream.split();

        // 1. Wait for ready
        loop {
            let msg = match timeout(self.idle, stream.next()).await {
                Err(_) => return Err(TtsError::Timeout),
                Ok(None) => return Err(TtsError::ClosedEarly),
                Ok(Some(msg)) => msg?,
            };
            let Message::Text(text) = msg else {
                continue;
            };
            let frame: ServerFrame = serde_json::from_str(&text)?;
            if frame.code != 0 {
                return Err(TtsError::Provider {
                    code: frame.code,
                    message: frame.message,
                });
            }
            if frame.ready == Some(1) {
                break;
            }
        }

        // 2. Text, then completion
        sink.send(action(&session_id, "ACTION_SYNTHESIS", &request.text))
            .await?;
        sink.send(action(&session_id, "ACTION_COMPLETE", "")).await?;

        // 3. Audio and subtitles until final
        let mut bytes: Vec<u8> = Vec::new();
        let mut subtitles = Vec::new();
        loop {
            let msg = match timeout(self.idle, stream.next()).await {
                Err(_) => {
                    warn!(session = %session_id, "synthesis stream idle, finishing clip");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    // Providers commonly drop the TCP connection right after
                    // the last frame instead of sending a close frame.
                    if bytes.is_empty() {
                        return Err(e.into());
                    }
                    debug!(error = %e, "synthesis connection ended without close frame");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Binary(data) => bytes.extend_from_slice(&data),
                Message::Text(text) => {
                    let frame: ServerFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(e) => {
                            debug!(error = %e, "ignoring unparseable provider frame");
                            continue;
                        }
                    };
                    if frame.code != 0 {
                        if bytes.is_empty() {
                            return Err(TtsError::Provider {
                                code: frame.code,
                                message: frame.message,
                            });
                        }
                        warn!(code = frame.code, message = %frame.message, "provider error mid-clip");
                        break;
                    }
                    if let Some(audio) = frame.audio.as_deref() {
                        match general_purpose::STANDARD.decode(audio) {
                            Ok(decoded) => bytes.extend_from_slice(&decoded),
                            Err(e) => warn!(error = %e, "invalid inline audio"),
                        }
                    }
                    if let Some(subs) = frame.result.and_then(|r| r.subtitles) {
                        subtitles.extend(subs.into_iter().map(MouthInterval::from));
                    }
                    if frame.is_final == Some(1) {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        let _ = sink.close().await;
        let pcm = u8_to_i16_slice(&bytes);
        info!(
            session = %session_id,
            samples = pcm.len(),
            subtitles = subtitles.len(),
            "clip synthesized"
        );
        Ok(SynthesisOutput { pcm, subtitles })
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}
