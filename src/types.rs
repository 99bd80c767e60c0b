use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing_error::SpanTrace;

/// finish_reason used when the upstream fails after streaming has begun.
pub const FINISH_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Content,
    Thinking,
    Reasoning,
    Finish,
}

impl DeltaKind {
    /// Field name carrying this kind's text inside a wire `delta` object.
    pub fn wire_field(self) -> Option<&'static str> {
        match self {
            DeltaKind::Content => Some("content"),
            DeltaKind::Thinking => Some("thinking"),
            DeltaKind::Reasoning => Some("reasoning"),
            DeltaKind::Finish => None,
        }
    }
}

/// One incremental unit of a streaming turn, tagged with its logical channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delta {
    pub channel: u32,
    pub kind: DeltaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Delta {
    pub fn text(channel: u32, kind: DeltaKind, text: impl Into<String>) -> Self {
        Self {
            channel,
            kind,
            text: Some(text.into()),
            finish_reason: None,
        }
    }

    pub fn content(channel: u32, text: impl Into<String>) -> Self {
        Self::text(channel, DeltaKind::Content, text)
    }

    pub fn thinking(channel: u32, text: impl Into<String>) -> Self {
        Self::text(channel, DeltaKind::Thinking, text)
    }

    pub fn reasoning(channel: u32, text: impl Into<String>) -> Self {
        Self::text(channel, DeltaKind::Reasoning, text)
    }

    pub fn finish(channel: u32, reason: impl Into<String>) -> Self {
        Self {
            channel,
            kind: DeltaKind::Finish,
            text: None,
            finish_reason: Some(reason.into()),
        }
    }

    pub fn upstream_error(channel: u32) -> Self {
        Self::finish(channel, FINISH_ERROR)
    }

    /// A Finish delta with a non-null reason ends the turn.
    pub fn is_terminal(&self) -> bool {
        self.kind == DeltaKind::Finish && self.finish_reason.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.finish_reason.as_deref() == Some(FINISH_ERROR)
    }
}

/// Routing table from delta kind to channel number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMap {
    pub thinking: u32,
    pub reasoning: u32,
    pub content: u32,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            thinking: 0,
            reasoning: 0,
            content: 1,
        }
    }
}

impl ChannelMap {
    pub fn channel_for(&self, kind: DeltaKind) -> u32 {
        match kind {
            DeltaKind::Thinking => self.thinking,
            DeltaKind::Reasoning => self.reasoning,
            DeltaKind::Content | DeltaKind::Finish => self.content,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(RelayError::InvalidRequest(format!("unknown role: {}", other))),
        }
    }
}

/// A message as sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The assistant message committed at the end of a finished turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Text of channels outside the configured channel map, keyed by channel.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<u32, String>,
    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.thinking.is_none()
            && self.reasoning.is_none()
            && self.channels.is_empty()
    }
}

/// Input for appending a message to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<u32, String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            thinking: None,
            reasoning: None,
            channels: BTreeMap::new(),
            timestamp: None,
        }
    }
}

impl From<AssistantMessage> for NewMessage {
    fn from(msg: AssistantMessage) -> Self {
        Self {
            role: Role::Assistant,
            content: msg.content,
            thinking: msg.thinking,
            reasoning: msg.reasoning,
            channels: msg.channels,
            timestamp: Some(msg.timestamp),
        }
    }
}

/// A message as stored: the appended fields plus an identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<u32, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub agent_profile_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub agent_profile_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub messages: Vec<MessageRecord>,
}

/// Caller identity and target conversation for one relay call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub project_id: String,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub agent_profile_id: Option<String>,
}

pub struct UpstreamHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub last_success: std::sync::RwLock<Option<Instant>>,
    pub last_failure: std::sync::RwLock<Option<Instant>>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_success: std::sync::RwLock::new(None),
            last_failure: std::sync::RwLock::new(None),
        }
    }
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_failure.write() {
            *last = Some(Instant::now());
        }
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream unavailable (status {0}): {1}")]
    UpstreamUnavailable(axum::http::StatusCode, String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into(), SpanTrace::capture())
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, code) = match &self.inner {
            RelayError::UpstreamUnavailable(s, m) => {
                let status = if s.is_client_error() || s.is_server_error() {
                    *s
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, m.clone(), "UPSTREAM_UNAVAILABLE")
            }
            RelayError::InvalidRequest(m) => (StatusCode::BAD_REQUEST, m.clone(), "INVALID_REQUEST"),
            RelayError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            RelayError::MalformedFrame(m) => (StatusCode::BAD_GATEWAY, m.clone(), "MALFORMED_FRAME"),
            RelayError::Cancelled => (StatusCode::CONFLICT, self.inner.to_string(), "CANCELLED"),
            RelayError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR"),
            RelayError::Persistence(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "PERSISTENCE_ERROR",
            ),
            RelayError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            RelayError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            RelayError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "IO_ERROR"),
            RelayError::Internal(m, _) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
