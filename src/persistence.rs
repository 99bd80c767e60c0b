use crate::accumulator::ChannelSet;
use crate::types::{
    ChannelMap, Conversation, ConversationSummary, MessageRecord, NewMessage, Result,
    SessionContext,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_TITLE: &str = "New conversation";

/// Everything needed to create a conversation if it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub id: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub agent_profile_id: Option<String>,
    pub title: String,
    pub started_at: DateTime<Utc>,
}

impl NewConversation {
    pub fn for_session(session: &SessionContext, id: String, first_message: &str, title_max_chars: usize) -> Self {
        Self {
            id,
            project_id: session.project_id.clone(),
            user_id: session.user_id.clone(),
            agent_profile_id: session.agent_profile_id.clone(),
            title: derive_title(first_message, title_max_chars),
            started_at: Utc::now(),
        }
    }
}

/// First line of the message, cut to `max_chars` characters.
pub fn derive_title(message: &str, max_chars: usize) -> String {
    let first_line = message.trim().lines().next().unwrap_or("").trim();
    if first_line.is_empty() || max_chars == 0 {
        return DEFAULT_TITLE.to_string();
    }
    let prefix = crate::str_utils::prefix_chars(first_line, max_chars);
    if prefix.len() < first_line.len() {
        format!("{}…", prefix.trim_end())
    } else {
        prefix.to_string()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub pages: i64,
}

/// The message store the relay writes through.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Appends to an existing conversation; `NotFound` otherwise.
    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<MessageRecord>;

    /// Creates the conversation if needed and appends, as one transaction.
    async fn append_to_conversation(
        &self,
        conversation: &NewConversation,
        message: NewMessage,
    ) -> Result<MessageRecord>;

    async fn get_conversation(&self, project_id: &str, conversation_id: &str) -> Result<Option<Conversation>>;

    async fn list_conversations(
        &self,
        project_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ConversationSummary>, Page)>;

    async fn message_count(&self, conversation_id: &str) -> Result<i64>;

    /// Instructions of an agent profile, None if the profile is unknown.
    async fn profile_instructions(&self, profile_id: &str) -> Result<Option<Vec<String>>>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistenceStatus {
    Persisted { message_id: String },
    /// Every channel was empty.
    Skipped,
    Failed { reason: String },
}

/// Commits the finished assistant message of one turn.
#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn ConversationStore>,
    target: NewConversation,
    channel_map: ChannelMap,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn ConversationStore>, target: NewConversation, channel_map: ChannelMap) -> Self {
        Self {
            store,
            target,
            channel_map,
        }
    }

    pub async fn commit(&self, channels: &ChannelSet) -> PersistenceStatus {
        let message = channels.to_assistant_message(&self.channel_map, Utc::now());
        if message.is_empty() {
            tracing::warn!(
                "[⚙️  -> 💾] Nothing to persist for conversation {}",
                crate::str_utils::short_id(&self.target.id)
            );
            return PersistenceStatus::Skipped;
        }

        match self.store.append_to_conversation(&self.target, message.into()).await {
            Ok(record) => {
                tracing::info!(
                    "[⚙️  -> 💾] Assistant message {} appended to {}",
                    crate::str_utils::short_id(&record.id),
                    crate::str_utils::short_id(&self.target.id)
                );
                PersistenceStatus::Persisted { message_id: record.id }
            }
            Err(e) => {
                tracing::error!(
                    "[⚙️  -> 💾] Persisting assistant message for {} failed: {}",
                    self.target.id,
                    e
                );
                PersistenceStatus::Failed { reason: e.to_string() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_bounded_first_line() {
        assert_eq!(derive_title("  Hello there\nsecond line", 50), "Hello there");
        assert_eq!(derive_title("abcdefghij", 4), "abcd…");
        assert_eq!(derive_title("ééééé", 5), "ééééé");
        assert_eq!(derive_title("   \n ", 50), DEFAULT_TITLE);
    }

    #[test]
    fn status_serializes_tagged() {
        let json = match serde_json::to_value(PersistenceStatus::Failed { reason: "db".into() }) {
            Ok(v) => v,
            Err(e) => panic!("serialize failed: {}", e),
        };
        assert_eq!(json, serde_json::json!({"status": "failed", "reason": "db"}));
    }
}
