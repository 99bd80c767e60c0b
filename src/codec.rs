//! Wire framing shared by the relay, the upstream adapter and the client.
//!
//! A frame is one SSE event: `data: <json>\n\n`, where the JSON carries one
//! choice per delta, indexed by channel. `data: [DONE]\n\n` terminates a turn.

use crate::specs::openai::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use crate::types::{Delta, DeltaKind, ObservedError, RelayError, Result};
use bytes::{Buf, BytesMut};
use serde::Deserialize;
use tokio_util::codec::Decoder;

pub const DONE_SENTINEL: &str = "[DONE]";
pub const SENTINEL_FRAME: &str = "data: [DONE]\n\n";
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One or more deltas emitted together, in relay order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireFrame {
    pub deltas: Vec<Delta>,
}

#[derive(Deserialize)]
struct FrameBody {
    choices: Vec<ChunkChoice>,
}

impl WireFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(delta: Delta) -> Self {
        Self {
            deltas: vec![delta],
        }
    }

    pub fn push(&mut self, delta: Delta) {
        self.deltas.push(delta);
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn to_chunk(&self) -> ChatCompletionChunk {
        let choices = self
            .deltas
            .iter()
            .map(|d| ChunkChoice {
                index: d.channel,
                delta: match d.text.as_deref() {
                    Some(text) => ChunkDelta::with_text(d.kind, text),
                    None => ChunkDelta::default(),
                },
                finish_reason: d.finish_reason.clone(),
            })
            .collect();
        ChatCompletionChunk {
            choices,
            error: None,
        }
    }

    /// Canonical text form, boundary included.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(&self.to_chunk())?;
        Ok(format!("data: {}\n\n", json))
    }

    /// Parses the `data` payload of one frame. Channels come from choice indexes.
    pub fn parse(data: &str) -> Result<WireFrame> {
        let body: FrameBody = serde_json::from_str(data)
            .map_err(|e| RelayError::MalformedFrame(format!("{}: {}", e, crate::str_utils::prefix_chars(data, 80))))?;

        let mut frame = WireFrame::new();
        for choice in &body.choices {
            for delta in choice_deltas(choice, |_| choice.index, choice.index) {
                frame.push(delta);
            }
        }
        Ok(frame)
    }
}

/// Normalizes one choice into deltas: text fragments first, then the finish.
pub fn choice_deltas(
    choice: &ChunkChoice,
    text_channel: impl Fn(DeltaKind) -> u32,
    finish_channel: u32,
) -> Vec<Delta> {
    let mut out: Vec<Delta> = choice
        .delta
        .fragments()
        .into_iter()
        .map(|(kind, text)| Delta::text(text_channel(kind), kind, text))
        .collect();
    if let Some(reason) = &choice.finish_reason {
        out.push(Delta::finish(finish_channel, reason.clone()));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
    /// A complete event that could not be read; dropped by consumers.
    Malformed(String),
}

/// Incremental SSE event decoder.
///
/// Bytes stay in the buffer until a blank-line boundary is seen, so a frame
/// split across any number of reads decodes exactly as if delivered whole.
#[derive(Debug)]
pub struct SseFrameCodec {
    scanned: usize,
    discarding: bool,
    max_frame_bytes: usize,
}

impl Default for SseFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SseFrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            scanned: 0,
            discarding: false,
            max_frame_bytes,
        }
    }
}

/// Finds the first blank line at or after `from`.
/// Returns (end of event block, bytes to consume).
fn find_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, i + 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Reads the data field of one event block. `None` for comment-only blocks.
fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = match std::str::from_utf8(block) {
        Ok(t) => t,
        Err(e) => return Some(SseEvent::Malformed(format!("invalid utf-8: {}", e))),
    };

    let mut data: Option<String> = None;
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        if field != "data" {
            continue;
        }
        match data.as_mut() {
            Some(d) => {
                d.push('\n');
                d.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }

    data.map(|d| {
        if d.trim() == DONE_SENTINEL {
            SseEvent::Done
        } else {
            SseEvent::Data(d)
        }
    })
}

impl Decoder for SseFrameCodec {
    type Item = SseEvent;
    type Error = ObservedError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>> {
        loop {
            match find_boundary(src, self.scanned) {
                Some((end, consumed)) => {
                    let block = src.split_to(consumed);
                    self.scanned = 0;
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    match parse_block(&block[..end]) {
                        Some(event) => return Ok(Some(event)),
                        None => continue,
                    }
                }
                None => {
                    // A boundary may start in the last two bytes.
                    if src.len() > self.max_frame_bytes {
                        let keep = src.len().min(2);
                        src.advance(src.len() - keep);
                        self.scanned = 0;
                        if !self.discarding {
                            self.discarding = true;
                            return Ok(Some(SseEvent::Malformed(format!(
                                "frame exceeds {} bytes",
                                self.max_frame_bytes
                            ))));
                        }
                        return Ok(None);
                    }
                    self.scanned = src.len().saturating_sub(2);
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SseEvent>> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if !src.is_empty() {
            if !self.discarding && src.iter().any(|b| !b.is_ascii_whitespace()) {
                tracing::warn!(
                    "Discarding {} trailing bytes of an unterminated frame",
                    src.len()
                );
            }
            src.clear();
        }
        self.scanned = 0;
        self.discarding = false;
        Ok(None)
    }
}
