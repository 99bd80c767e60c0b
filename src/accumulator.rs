use crate::types::{AssistantMessage, ChannelMap, Delta, DeltaKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Append-only text for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelAccumulator {
    text: String,
    kind: Option<DeltaKind>,
    finish_reason: Option<String>,
}

impl ChannelAccumulator {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Kind of the first text delta seen on this channel.
    pub fn kind(&self) -> Option<DeltaKind> {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    fn push_text(&mut self, kind: DeltaKind, text: &str) {
        if self.kind.is_none() {
            self.kind = Some(kind);
        }
        self.text.push_str(text);
    }

    fn finish(&mut self, reason: &str) {
        if self.finish_reason.is_none() {
            self.finish_reason = Some(reason.to_string());
        }
    }
}

/// Per-channel accumulators, created on first sight of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSet {
    channels: BTreeMap<u32, ChannelAccumulator>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &Delta) {
        let acc = self.channels.entry(delta.channel).or_default();
        match delta.kind {
            DeltaKind::Finish => {
                if let Some(reason) = &delta.finish_reason {
                    acc.finish(reason);
                }
            }
            kind => {
                if let Some(text) = &delta.text {
                    acc.push_text(kind, text);
                }
            }
        }
    }

    pub fn get(&self, channel: u32) -> Option<&ChannelAccumulator> {
        self.channels.get(&channel)
    }

    pub fn text(&self, channel: u32) -> &str {
        self.get(channel).map(ChannelAccumulator::text).unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ChannelAccumulator)> {
        self.channels.iter().map(|(ch, acc)| (*ch, acc))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Per-channel character counts, for turn summaries.
    pub fn char_counts(&self) -> BTreeMap<u32, usize> {
        self.iter().map(|(ch, acc)| (ch, acc.text.chars().count())).collect()
    }

    /// Folds the channels into the persisted message shape.
    ///
    /// The content channel becomes `content`. The thinking and reasoning
    /// channels land in `thinking` or `reasoning` by the kind their text
    /// arrived as. Any other channel is kept verbatim under `channels`.
    pub fn to_assistant_message(&self, map: &ChannelMap, timestamp: DateTime<Utc>) -> AssistantMessage {
        let mut message = AssistantMessage {
            content: String::new(),
            thinking: None,
            reasoning: None,
            channels: BTreeMap::new(),
            timestamp,
        };

        for (channel, acc) in self.iter() {
            if acc.text.is_empty() {
                continue;
            }
            if channel == map.content {
                message.content = acc.text.clone();
            } else if channel == map.thinking || channel == map.reasoning {
                let slot = match acc.kind {
                    Some(DeltaKind::Reasoning) => &mut message.reasoning,
                    _ => &mut message.thinking,
                };
                slot.get_or_insert_with(String::new).push_str(&acc.text);
            } else {
                message.channels.insert(channel, acc.text.clone());
            }
        }

        message
    }
}
