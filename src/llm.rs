//! Streaming text generation
//!
//! Requests are built from the character config, the bounded conversation
//! history and the user's utterance. Replies are consumed as a stream of
//! text fragments from any OpenAI-compatible `/chat/completions` endpoint.

use crate::config::{CharacterConfig, LlmConfig};
use crate::history::HistoryEntry;
use crate::output_seg::WireShape;
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Generation endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// Ordered fragments of generated text
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Open a streaming generation. Fragments arrive in order; the stream
    /// ends when the endpoint signals completion.
    async fn stream(&self, request: GenerationRequest) -> Result<DeltaStream>;
}

fn system_prompt(character: &CharacterConfig, shape: WireShape) -> String {
    let format = match shape {
        WireShape::JsonReply => {
            "每次回复必须严格使用 JSON 格式，不要输出任何其他内容：\n\
             {\"emotion\": \"<开心|悲伤|愤怒|平静|惊讶>\", \"text\": \"<回复内容>\"}\n"
        }
        WireShape::EmotionPrefix => {
            "每次回复先单独输出一行情感标记，然后换行输出回复正文：\n\
             {\"emotion\": \"<开心|悲伤|愤怒|平静|惊讶>\"}\n"
        }
    };
    format!("你的名字是{}。{}\n\n{}", character.name, character.persona, format)
}

/// Chinese label appended as a tone hint for a recognizer emotion tag
fn tone_label(emotion: &str) -> Option<&str> {
    match emotion {
        "" | "neutral" => None,
        "happy" => Some("开心"),
        "sad" => Some("悲伤"),
        "angry" => Some("愤怒"),
        "surprised" => Some("惊讶"),
        "fearful" => Some("恐惧"),
        "disgusted" => Some("厌恶"),
        other => Some(other),
    }
}

fn user_content(text: &str, emotion: &str, shape: WireShape) -> String {
    match shape {
        // Same envelope as the reply format
        WireShape::JsonReply => json!({ "emotion": emotion, "text": text }).to_string(),
        WireShape::EmotionPrefix => match tone_label(emotion) {
            Some(label) => format!("{text}[用户语气：{label}]"),
            None => text.to_string(),
        },
    }
}

/// Assemble the message list for one turn.
pub fn build_request(
    character: &CharacterConfig,
    shape: WireShape,
    history: &[HistoryEntry],
    user_text: &str,
    user_emotion: &str,
) -> GenerationRequest {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new("system", system_prompt(character, shape)));
    messages.extend(
        history
            .iter()
            .filter(|e| !e.content.trim().is_empty())
            .map(|e| ChatMessage::new(e.role.as_str(), e.content.clone())),
    );
    messages.push(ChatMessage::new(
        "user",
        user_content(user_text, user_emotion, shape),
    ));
    GenerationRequest { messages }
}

/// Client for OpenAI-compatible streaming chat completions
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl GenerationClient for OpenAiCompatClient {
    async fn stream(&self, request: GenerationRequest) -> Result<DeltaStream> {
        let body = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        debug!(messages = request.messages.len(), "opening generation stream");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "generation endpoint error");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(sse_deltas(Box::pin(response.bytes_stream()))))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseItem {
    Delta(String),
    Done,
}

/// Line-oriented server-sent-events decoder. Bytes are buffered until a full
/// line is present, so multi-byte characters split across chunks survive.
#[derive(Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.pending.extend_from_slice(chunk);
        let mut items = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(item) = parse_line(&String::from_utf8_lossy(&line)) {
                items.push(item);
            }
        }
        items
    }

    fn finish(&mut self) -> Option<SseItem> {
        let line = std::mem::take(&mut self.pending);
        parse_line(&String::from_utf8_lossy(&line))
    }
}

fn parse_line(line: &str) -> Option<SseItem> {
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseItem::Done);
    }
    let chunk: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping malformed stream payload");
            return None;
        }
    };
    chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| SseItem::Delta(s.to_string()))
}

struct SseState<S> {
    inner: S,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    done: bool,
}

/// Adapt a raw byte stream into generated-text fragments.
fn sse_deltas<S, B, E>(inner: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<LlmError> + Send,
{
    let state = SseState {
        inner,
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.ready.pop_front() {
                return Some((Ok(delta), st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    for item in st.decoder.push(chunk.as_ref()) {
                        match item {
                            SseItem::Delta(d) => st.ready.push_back(d),
                            SseItem::Done => {
                                st.done = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e.into()), st));
                }
                None => {
                    st.done = true;
                    if let Some(SseItem::Delta(d)) = st.decoder.finish() {
                        st.ready.push_back(d);
                    }
                }
            }
        }
    })
}
