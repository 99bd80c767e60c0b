use crate::budget::{ReasoningEffort, ThinkingConfig};
use crate::cancel::{CancelSource, CancellationCoordinator};
use crate::health;
use crate::logging::turn_id_middleware;
use crate::multiplexer::ChannelMultiplexer;
use crate::persistence::{NewConversation, PersistenceWriter};
use crate::transport::{event_stream_response, TransportWriter, CONVERSATION_ID_HEADER, TURN_ID_HEADER};
use crate::types::*;
use crate::upstream::CompletionRequest;
use crate::AppState;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const AGENT_PROFILE_HEADER: &str = "x-agent-profile-id";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_PAGE_LIMIT: u32 = 20;
/// Frames the relay may run ahead of a slow client.
const TRANSPORT_CAPACITY: usize = 64;

pub fn router(state: Arc<AppState>) -> Router {
    let max_body_size = state.args.max_body_size;
    Router::new()
        .route(
            "/v1/projects/:project_id/chat/completions",
            post(chat_completions),
        )
        .route(
            "/v1/projects/:project_id/conversations",
            get(list_conversations),
        )
        .route(
            "/v1/projects/:project_id/conversations/:conversation_id",
            get(get_conversation),
        )
        .route(
            "/v1/projects/:project_id/conversations/:conversation_id/messages",
            post(append_message),
        )
        .route("/v1/turns/:turn_id/cancel", post(cancel_turn))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(turn_id_middleware))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default)]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn session_from(project_id: String, headers: &HeaderMap) -> SessionContext {
    SessionContext {
        project_id,
        user_id: header_value(headers, USER_ID_HEADER),
        conversation_id: header_value(headers, CONVERSATION_ID_HEADER),
        agent_profile_id: header_value(headers, AGENT_PROFILE_HEADER),
    }
}

/// Prepends the agent profile's instructions unless the caller sent a system message.
async fn with_system_prompt(
    state: &AppState,
    session: &SessionContext,
    mut messages: Vec<ChatMessage>,
) -> Result<Vec<ChatMessage>> {
    let profile_id = match &session.agent_profile_id {
        Some(id) => id,
        None => return Ok(messages),
    };
    if messages.iter().any(|m| m.role == Role::System) {
        return Ok(messages);
    }

    let prompt = match state.store.profile_instructions(profile_id).await? {
        Some(instructions) if !instructions.is_empty() => instructions.join("\n\n"),
        Some(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
        None => {
            tracing::warn!("[⚙️ ] Unknown agent profile {}, using default prompt", profile_id);
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    };
    messages.insert(0, ChatMessage::new(Role::System, prompt));
    Ok(messages)
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ChatCompletionRequest>,
) -> Result<Response> {
    if payload.stream == Some(false) {
        return Err(RelayError::InvalidRequest("only streaming completions are supported".into()).into());
    }
    let trigger = match payload.messages.iter().rev().find(|m| m.role == Role::User) {
        Some(m) => m.content.clone(),
        None => return Err(RelayError::InvalidRequest("messages must contain a user message".into()).into()),
    };

    let session = session_from(project_id, &headers);
    let turn_id = header_value(&headers, TURN_ID_HEADER).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Resolve the target without writing, so a turn that never starts leaves no rows behind.
    let (target, existing) = match &session.conversation_id {
        Some(id) => match state.store.get_conversation(&session.project_id, id).await? {
            Some(c) => (
                NewConversation {
                    id: c.id,
                    project_id: c.project_id,
                    user_id: c.user_id,
                    agent_profile_id: c.agent_profile_id,
                    title: c.title,
                    started_at: c.started_at,
                },
                true,
            ),
            None => return Err(RelayError::NotFound("Conversation not found".into()).into()),
        },
        None => (
            NewConversation::for_session(
                &session,
                uuid::Uuid::new_v4().to_string(),
                &trigger,
                state.args.title_max_chars,
            ),
            false,
        ),
    };

    let model = payload.model.unwrap_or_else(|| state.args.default_model.clone());
    let messages = with_system_prompt(&state, &session, payload.messages).await?;
    let request = CompletionRequest {
        messages,
        model: model.clone(),
        reasoning_effort: payload.reasoning_effort,
        thinking: payload.thinking,
        temperature: payload.temperature,
        max_tokens: payload.max_tokens,
    };

    let cancel = CancellationCoordinator::new();
    let deltas = state.upstream.open(request, cancel.token()).await?;

    // The conversation and its triggering message exist before any frame is sent.
    if existing {
        state.store.append_message(&target.id, NewMessage::user(trigger)).await?;
    } else {
        state
            .store
            .append_to_conversation(&target, NewMessage::user(trigger))
            .await?;
    }

    let (turn_id, registration) = match state.turns.register(&turn_id, cancel.clone()) {
        Some(registration) => (turn_id, registration),
        None => {
            let fresh = uuid::Uuid::new_v4().to_string();
            tracing::warn!(
                "[🖥️  -> ⚙️ ] Turn id {} is already active, relaying as {}",
                crate::str_utils::short_id(&turn_id),
                crate::str_utils::short_id(&fresh)
            );
            match state.turns.register(&fresh, cancel.clone()) {
                Some(registration) => (fresh, registration),
                None => return Err(RelayError::internal("could not register turn").into()),
            }
        }
    };

    tracing::info!(
        "[🖥️  -> ⚙️ ] Turn {} on conversation {} via {} ({})",
        crate::str_utils::short_id(&turn_id),
        crate::str_utils::short_id(&target.id),
        state.upstream.name(),
        model
    );

    let (writer, body) = TransportWriter::channel(cancel.clone(), TRANSPORT_CAPACITY);
    let channel_map = state.args.channel_map();
    let persistence = PersistenceWriter::new(Arc::clone(&state.store), target.clone(), channel_map);
    let multiplexer = ChannelMultiplexer::new(turn_id.clone(), channel_map, state.args.frame_batch);

    let relay_span = tracing::info_span!(
        "relay",
        turn_id = %turn_id,
        conversation_id = %crate::str_utils::short_id(&target.id),
        model = %model
    );
    tokio::spawn(
        async move {
            let report = multiplexer.run(deltas, writer, cancel, Some(persistence)).await;
            tracing::debug!("[⚙️ ] Turn report: {:?} after {} frames", report.outcome, report.frames);
            drop(registration);
        }
        .instrument(relay_span),
    );

    Ok(event_stream_response(body, &turn_id, &target.id))
}

pub async fn cancel_turn(State(state): State<Arc<AppState>>, Path(turn_id): Path<String>) -> Result<Response> {
    match state.turns.cancel(&turn_id, CancelSource::ClientAbort) {
        Some(first) => {
            tracing::info!(
                "[🖥️  -x ⚙️ ] Cancel requested for turn {} (effective: {})",
                crate::str_utils::short_id(&turn_id),
                first
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "turn_id": turn_id, "cancelled": first })),
            )
                .into_response())
        }
        None => Err(RelayError::NotFound("Turn not found".into()).into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>> {
    let (conversations, pagination) = state
        .store
        .list_conversations(
            &project_id,
            params.page.unwrap_or(1),
            params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
        .await?;
    Ok(Json(serde_json::json!({
        "conversations": conversations,
        "pagination": pagination,
    })))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path((project_id, conversation_id)): Path<(String, String)>,
) -> Result<Json<Conversation>> {
    match state.store.get_conversation(&project_id, &conversation_id).await? {
        Some(c) => Ok(Json(c)),
        None => Err(RelayError::NotFound("Conversation not found".into()).into()),
    }
}

pub async fn append_message(
    State(state): State<Arc<AppState>>,
    Path((project_id, conversation_id)): Path<(String, String)>,
    Json(message): Json<NewMessage>,
) -> Result<(StatusCode, Json<MessageRecord>)> {
    if message.role != Role::User {
        return Err(RelayError::InvalidRequest("only user messages can be appended".into()).into());
    }
    if state.store.get_conversation(&project_id, &conversation_id).await?.is_none() {
        return Err(RelayError::NotFound("Conversation not found".into()).into());
    }
    let record = state.store.append_message(&conversation_id, message).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_reads_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "u1".parse().unwrap_or_else(|_| panic!("header")));
        headers.insert(CONVERSATION_ID_HEADER, "  ".parse().unwrap_or_else(|_| panic!("header")));

        let session = session_from("p1".into(), &headers);
        assert_eq!(session.project_id, "p1");
        assert_eq!(session.user_id.as_deref(), Some("u1"));
        assert_eq!(session.conversation_id, None);
        assert_eq!(session.agent_profile_id, None);
    }

    #[test]
    fn request_accepts_minimal_body() {
        let req: ChatCompletionRequest = match serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"hi"}],"reasoning_effort":"high"}"#,
        ) {
            Ok(r) => r,
            Err(e) => panic!("parse failed: {}", e),
        };
        assert_eq!(req.reasoning_effort, Some(ReasoningEffort::High));
        assert!(req.model.is_none());
    }
}
