use crate::budget::{ReasoningEffort, ThinkingConfig};
use crate::types::{ChatMessage, DeltaKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// --- OPENAI-COMPATIBLE CHAT COMPLETIONS SCHEMA (streaming subset) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

/// One `data:` payload of a provider stream, or one frame of our own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,

    /// Providers report mid-stream failures as an error object in place of choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_blocks: Option<Vec<ThinkingBlock>>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ChunkDelta {
    /// Text fragments carried by this delta, in emission order.
    ///
    /// `thinking` wins over `thinking_blocks` and `reasoning` over
    /// `reasoning_content`: providers that send both repeat the same text.
    pub fn fragments(&self) -> Vec<(DeltaKind, String)> {
        let mut out = Vec::new();

        let thinking = match non_empty(&self.thinking) {
            Some(t) => Some(t.to_string()),
            None => self.thinking_blocks.as_ref().and_then(|blocks| {
                let joined: String = blocks
                    .iter()
                    .filter_map(|b| b.thinking.as_deref())
                    .collect();
                if joined.is_empty() {
                    None
                } else {
                    Some(joined)
                }
            }),
        };
        if let Some(t) = thinking {
            out.push((DeltaKind::Thinking, t));
        }

        if let Some(r) = non_empty(&self.reasoning).or_else(|| non_empty(&self.reasoning_content)) {
            out.push((DeltaKind::Reasoning, r.to_string()));
        }

        if let Some(c) = non_empty(&self.content) {
            out.push((DeltaKind::Content, c.to_string()));
        }

        out
    }

    pub fn with_text(kind: DeltaKind, text: &str) -> Self {
        let mut delta = Self::default();
        match kind {
            DeltaKind::Content => delta.content = Some(text.to_string()),
            DeltaKind::Thinking => delta.thinking = Some(text.to_string()),
            DeltaKind::Reasoning => delta.reasoning = Some(text.to_string()),
            DeltaKind::Finish => {}
        }
        delta
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_cover_provider_field_variants() {
        let delta: ChunkDelta = match serde_json::from_str(
            r#"{"reasoning_content":"step","thinking_blocks":[{"type":"thinking","thinking":"a"},{"thinking":"b"}],"content":"x"}"#,
        ) {
            Ok(d) => d,
            Err(e) => panic!("parse failed: {}", e),
        };

        assert_eq!(
            delta.fragments(),
            vec![
                (DeltaKind::Thinking, "ab".to_string()),
                (DeltaKind::Reasoning, "step".to_string()),
                (DeltaKind::Content, "x".to_string()),
            ]
        );
    }

    #[test]
    fn duplicated_reasoning_fields_yield_one_fragment() {
        let delta = ChunkDelta {
            reasoning: Some("same".into()),
            reasoning_content: Some("same".into()),
            ..Default::default()
        };
        assert_eq!(delta.fragments(), vec![(DeltaKind::Reasoning, "same".to_string())]);
    }

    #[test]
    fn empty_strings_are_not_fragments() {
        let delta = ChunkDelta {
            content: Some(String::new()),
            ..Default::default()
        };
        assert!(delta.fragments().is_empty());
    }

    #[test]
    fn request_omits_absent_reasoning_fields() {
        let req = UpstreamRequest {
            model: "m".into(),
            messages: vec![],
            stream: true,
            temperature: 0.7,
            max_tokens: 4096,
            reasoning_effort: None,
            thinking: None,
        };
        let value = match serde_json::to_value(&req) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {}", e),
        };
        assert!(value.get("thinking").is_none());
        assert!(value.get("reasoning_effort").is_none());
        assert_eq!(value["stream"], true);
    }
}
