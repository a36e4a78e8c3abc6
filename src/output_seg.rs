//! Incremental segmentation of generated text into speakable units.
//!
//! Generation output arrives as small fragments that may split multi-byte
//! characters' neighbours, JSON tokens, and sentences at arbitrary points.
//! [`OutputSegmenter`] accumulates the fragments, resolves the reply's emotion
//! label, and releases a [`TextUnit`] as soon as a complete sentence of spoken
//! text is available.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Emotion assumed until the reply states one
pub const NEUTRAL_EMOTION: &str = "平静";

const SENTENCE_ENDINGS: [char; 7] = ['.', '!', '?', '。', '！', '？', '\n'];

/// How the generation endpoint has been asked to format its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireShape {
    /// One JSON object per reply: `{"emotion": "...", "text": "..."}`
    #[default]
    JsonReply,
    /// A leading `{"emotion": "..."}` header followed by plain text
    EmotionPrefix,
}

/// A sentence-sized piece of spoken text with its emotion label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextUnit {
    pub emotion: String,
    pub text: String,
}

/// Output of one [`OutputSegmenter::push`] or [`OutputSegmenter::finish`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// The raw fragment as received
    Delta(String),
    /// Spoken text outside of the JSON envelope, echoed for live display
    Text(String),
    /// A complete unit ready for synthesis
    Unit(TextUnit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    Pending,
    Resolved,
}

pub struct OutputSegmenter {
    shape: WireShape,
    /// Raw input not yet consumed
    raw: String,
    /// Spoken text waiting for a sentence boundary
    tail: String,
    emotion: String,
    header: Header,
    spoken: String,
}

impl OutputSegmenter {
    pub fn new(shape: WireShape) -> Self {
        Self {
            shape,
            raw: String::new(),
            tail: String::new(),
            emotion: NEUTRAL_EMOTION.to_string(),
            header: Header::Pending,
            spoken: String::new(),
        }
    }

    /// Last emotion label seen in the reply
    pub fn emotion(&self) -> &str {
        &self.emotion
    }

    /// Concatenation of every unit emitted so far
    pub fn spoken_text(&self) -> &str {
        &self.spoken
    }

    /// Feed one fragment of generated output.
    pub fn push(&mut self, delta: &str) -> Vec<SegmentEvent> {
        if delta.is_empty() {
            return Vec::new();
        }
        let mut out = vec![SegmentEvent::Delta(delta.to_string())];
        self.raw.push_str(delta);

        match self.shape {
            WireShape::JsonReply => self.advance_json(&mut out),
            WireShape::EmotionPrefix => self.advance_prefixed(delta, &mut out),
        }
        out
    }

    /// Flush everything still buffered. Called once, when the stream ends for
    /// any reason.
    pub fn finish(&mut self) -> Vec<SegmentEvent> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.raw);

        match self.shape {
            WireShape::JsonReply => {
                if !rest.trim().is_empty() {
                    match lenient_object(&rest) {
                        Some(reply) => self.accept_reply(reply, &mut out),
                        None => {
                            debug!("unparsed generation output, speaking it as plain text");
                            self.tail.push_str(rest.trim());
                        }
                    }
                }
            }
            WireShape::EmotionPrefix => {
                if self.header == Header::Pending {
                    self.header = Header::Resolved;
                    let body = match rest.find('}') {
                        Some(close) if rest.trim_start().starts_with('{') => {
                            match header_emotion(&rest[..=close]) {
                                Some(emotion) => {
                                    self.set_emotion(emotion);
                                    rest[close + 1..].trim_start_matches('\n').to_string()
                                }
                                None => rest,
                            }
                        }
                        _ => rest,
                    };
                    self.tail.push_str(&body);
                } else {
                    self.tail.push_str(&rest);
                }
            }
        }

        self.drain_sentences(&mut out);
        let residual = std::mem::take(&mut self.tail);
        if !residual.trim().is_empty() {
            self.emit(residual, &mut out);
        }
        out
    }

    fn advance_json(&mut self, out: &mut Vec<SegmentEvent>) {
        while let Some((reply, consumed)) = first_object(&self.raw) {
            self.raw.drain(..consumed);
            self.accept_reply(reply, out);
        }
    }

    fn accept_reply(&mut self, reply: Reply, out: &mut Vec<SegmentEvent>) {
        // A new object starts a new reply; whatever the previous one left
        // unterminated belongs to the previous emotion.
        let carried = std::mem::take(&mut self.tail);
        if !carried.trim().is_empty() {
            self.emit(carried, out);
        }
        if let Some(emotion) = reply.emotion {
            self.set_emotion(emotion);
        }
        if !reply.text.is_empty() {
            out.push(SegmentEvent::Text(reply.text.clone()));
        }
        self.tail.push_str(&reply.text);
        self.drain_sentences(out);
    }

    fn advance_prefixed(&mut self, delta: &str, out: &mut Vec<SegmentEvent>) {
        if self.header == Header::Resolved {
            out.push(SegmentEvent::Text(delta.to_string()));
            self.tail.push_str(&std::mem::take(&mut self.raw));
            self.drain_sentences(out);
            return;
        }

        let trimmed = self.raw.trim_start();
        if trimmed.is_empty() {
            return;
        }

        if trimmed.starts_with('{') {
            let Some(close) = self.raw.find('}') else {
                return;
            };
            match header_emotion(&self.raw[..=close]) {
                Some(emotion) => {
                    self.set_emotion(emotion);
                    let body = self.raw[close + 1..].trim_start_matches('\n').to_string();
                    self.raw = body;
                }
                None => debug!("malformed emotion header, treating reply as plain text"),
            }
        }

        self.header = Header::Resolved;
        let body = std::mem::take(&mut self.raw);
        if !body.is_empty() {
            out.push(SegmentEvent::Text(body.clone()));
        }
        self.tail.push_str(&body);
        self.drain_sentences(out);
    }

    fn set_emotion(&mut self, emotion: String) {
        if !emotion.trim().is_empty() {
            self.emotion = emotion;
        }
    }

    fn drain_sentences(&mut self, out: &mut Vec<SegmentEvent>) {
        while let Some((idx, ch)) = self
            .tail
            .char_indices()
            .find(|(_, c)| SENTENCE_ENDINGS.contains(c))
        {
            let end = idx + ch.len_utf8();
            let sentence: String = self.tail.drain(..end).collect();
            if sentence[..idx].trim().is_empty() {
                continue;
            }
            self.emit(sentence, out);
        }
    }

    fn emit(&mut self, text: String, out: &mut Vec<SegmentEvent>) {
        self.spoken.push_str(&text);
        out.push(SegmentEvent::Unit(TextUnit {
            emotion: self.emotion.clone(),
            text,
        }));
    }
}

#[derive(Debug)]
struct Reply {
    emotion: Option<String>,
    text: String,
}

impl Reply {
    fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            emotion: map
                .get("emotion")
                .and_then(Value::as_str)
                .map(str::to_string),
            text: map
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// Find the first complete JSON object in `buf`, returning it together with
/// the byte offset just past its closing brace. Candidates that cannot be a
/// valid object are skipped; an object that is merely incomplete stops the
/// scan so more input can arrive.
fn first_object(buf: &str) -> Option<(Reply, usize)> {
    let mut from = 0;
    while let Some(rel) = buf[from..].find('{') {
        let start = from + rel;
        let mut stream =
            serde_json::Deserializer::from_str(&buf[start..]).into_iter::<Map<String, Value>>();
        match stream.next() {
            Some(Ok(map)) => return Some((Reply::from_map(&map), start + stream.byte_offset())),
            Some(Err(e)) if e.is_eof() => return None,
            _ => {}
        }
        from = start + 1;
    }
    None
}

/// Last-chance parse of everything between the first `{` and the last `}`.
fn lenient_object(buf: &str) -> Option<Reply> {
    let start = buf.find('{')?;
    let end = buf.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Map<String, Value>>(&buf[start..=end])
        .ok()
        .map(|map| Reply::from_map(&map))
}

fn header_emotion(fragment: &str) -> Option<String> {
    serde_json::from_str::<Map<String, Value>>(fragment.trim())
        .ok()
        .map(|map| {
            map.get("emotion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
}
