use crate::db::DbPool;
use crate::persistence::{ConversationStore, NewConversation, Page};
use crate::types::{
    Conversation, ConversationSummary, MessageRecord, NewMessage, RelayError, Result, Role,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

/// SQLite-backed conversation store. Every append runs in its own transaction.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces an agent profile.
    pub async fn upsert_profile(&self, id: &str, name: &str, instructions: &[String]) -> Result<()> {
        let json = serde_json::to_string(instructions)?;
        sqlx::query(
            "INSERT INTO agent_profiles (id, name, instructions_json) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, instructions_json = excluded.instructions_json",
        )
        .bind(id)
        .bind(name)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RelayError::internal(format!("bad timestamp {:?}: {}", raw, e)).into())
}

async fn insert_conversation(tx: &mut Transaction<'_, Sqlite>, c: &NewConversation) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO conversations (id, project_id, user_id, agent_profile_id, title, started_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&c.id)
    .bind(&c.project_id)
    .bind(&c.user_id)
    .bind(&c.agent_profile_id)
    .bind(&c.title)
    .bind(c.started_at.to_rfc3339_opts(SecondsFormat::Micros, true))
    .execute(&mut **tx)
    .await?;
    Ok(inserted.rows_affected() > 0)
}

async fn insert_message(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
    message: NewMessage,
) -> Result<MessageRecord> {
    let record = MessageRecord {
        id: Uuid::new_v4().to_string(),
        role: message.role,
        content: message.content,
        thinking: message.thinking,
        reasoning: message.reasoning,
        channels: message.channels,
        timestamp: message.timestamp.unwrap_or_else(Utc::now),
    };
    let channels_json = if record.channels.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&record.channels)?)
    };

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, thinking, reasoning, channels_json, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(conversation_id)
    .bind(record.role.as_str())
    .bind(&record.content)
    .bind(&record.thinking)
    .bind(&record.reasoning)
    .bind(channels_json)
    .bind(record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
    .execute(&mut **tx)
    .await?;

    Ok(record)
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let role: String = row.try_get("role")?;
    let channels_json: Option<String> = row.try_get("channels_json")?;
    let channels: BTreeMap<u32, String> = match channels_json {
        Some(raw) => serde_json::from_str(&raw)?,
        None => BTreeMap::new(),
    };
    let timestamp: String = row.try_get("timestamp")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        role: role.parse::<Role>()?,
        content: row.try_get("content")?,
        thinking: row.try_get("thinking")?,
        reasoning: row.try_get("reasoning")?,
        channels,
        timestamp: parse_timestamp(&timestamp)?,
    })
}

fn summary_from_row(row: &SqliteRow) -> Result<ConversationSummary> {
    let started_at: String = row.try_get("started_at")?;
    Ok(ConversationSummary {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        project_id: row.try_get("project_id")?,
        user_id: row.try_get("user_id")?,
        agent_profile_id: row.try_get("agent_profile_id")?,
        started_at: parse_timestamp(&started_at)?,
        message_count: row.try_get("message_count")?,
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<MessageRecord> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(RelayError::NotFound("Conversation not found".to_string()).into());
        }
        let record = insert_message(&mut tx, conversation_id, message).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn append_to_conversation(
        &self,
        conversation: &NewConversation,
        message: NewMessage,
    ) -> Result<MessageRecord> {
        let mut tx = self.pool.begin().await?;
        let created = insert_conversation(&mut tx, conversation).await?;
        let record = insert_message(&mut tx, &conversation.id, message).await?;
        tx.commit().await?;
        if created {
            tracing::info!(
                "[⚙️  -> 💾] Created conversation {} ({:?})",
                crate::str_utils::short_id(&conversation.id),
                conversation.title
            );
        }
        Ok(record)
    }

    async fn get_conversation(&self, project_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT c.*, 0 AS message_count FROM conversations c WHERE c.id = ? AND c.project_id = ?",
        )
        .bind(conversation_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        let summary = match row {
            Some(r) => summary_from_row(&r)?,
            None => return Ok(None),
        };

        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq ASC")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        let messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>>>()?;

        Ok(Some(Conversation {
            id: summary.id,
            title: summary.title,
            project_id: summary.project_id,
            user_id: summary.user_id,
            agent_profile_id: summary.agent_profile_id,
            started_at: summary.started_at,
            messages,
        }))
    }

    async fn list_conversations(
        &self,
        project_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<ConversationSummary>, Page)> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT c.*, (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
             FROM conversations c WHERE c.project_id = ?
             ORDER BY c.started_at DESC, c.id ASC LIMIT ? OFFSET ?",
        )
        .bind(project_id)
        .bind(i64::from(limit))
        .bind(i64::from(page - 1) * i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let conversations = rows.iter().map(summary_from_row).collect::<Result<Vec<_>>>()?;

        let pages = (total + i64::from(limit) - 1) / i64::from(limit);
        Ok((
            conversations,
            Page {
                page,
                limit,
                total,
                pages,
            },
        ))
    }

    async fn message_count(&self, conversation_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn profile_instructions(&self, profile_id: &str) -> Result<Option<Vec<String>>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT instructions_json FROM agent_profiles WHERE id = ?")
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
