use crate::budget::{self, ReasoningEffort, ThinkingConfig};
use crate::codec::{choice_deltas, SseEvent, SseFrameCodec};
use crate::hardening::{CircuitBreaker, RetryPolicy};
use crate::specs::openai::{ChatCompletionChunk, UpstreamRequest};
use crate::types::{ChannelMap, ChatMessage, Delta, RelayError, Result, UpstreamHealth};
use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Lazy, finite, non-restartable sequence of deltas for one turn.
/// Ends after its first terminal Finish delta.
pub type DeltaStream = BoxStream<'static, Delta>;

/// What the relay asks of the upstream for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub thinking: Option<ThinkingConfig>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn to_upstream(&self, answer_tokens: u32) -> UpstreamRequest {
        let plan = budget::plan(
            self.reasoning_effort,
            self.thinking.as_ref(),
            self.max_tokens,
            self.temperature,
            answer_tokens,
        );
        UpstreamRequest {
            model: self.model.clone(),
            messages: self.messages.clone(),
            stream: true,
            temperature: plan.temperature,
            max_tokens: plan.max_tokens,
            reasoning_effort: plan.budget_tokens.and(self.reasoning_effort),
            thinking: plan.thinking(),
        }
    }
}

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establishes the provider stream.
    ///
    /// Fails with `UpstreamUnavailable` (or `Cancelled`) before anything is
    /// produced. Later failures arrive as a Finish delta with reason "error".
    /// The stream ends early once `cancel` fires.
    async fn open(&self, request: CompletionRequest, cancel: CancellationToken) -> Result<DeltaStream>;
}

/// OpenAI-compatible chat completions endpoint, streamed over SSE.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    channels: ChannelMap,
    answer_tokens: u32,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    health: Arc<UpstreamHealth>,
}

impl HttpUpstream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        channels: ChannelMap,
        answer_tokens: u32,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
        health: Arc<UpstreamHealth>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            channels,
            answer_tokens,
            retry,
            breaker,
            health,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn send_once(&self, url: &str, body: &UpstreamRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_body = match response.text().await {
            Ok(text) => text,
            Err(_) => "Unknown error".to_string(),
        };
        Err(RelayError::UpstreamUnavailable(status, error_body).into())
    }

    async fn connect(&self, body: &UpstreamRequest) -> Result<reqwest::Response> {
        let url = self.completions_url();
        self.retry.execute_with_retry(|| self.send_once(&url, body)).await
    }
}

#[async_trait]
impl UpstreamAdapter for HttpUpstream {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn open(&self, request: CompletionRequest, cancel: CancellationToken) -> Result<DeltaStream> {
        self.breaker.check().await?;

        let body = request.to_upstream(self.answer_tokens);
        tracing::info!(
            "[⚙️  -> ☁️ ] Opening stream: model={} budget={:?} max_tokens={} messages={}",
            body.model,
            body.thinking.as_ref().and_then(|t| t.budget_tokens),
            body.max_tokens,
            body.messages.len()
        );

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled.into()),
            r = self.connect(&body) => r,
        };

        let response = match connected {
            Ok(r) => r,
            Err(e) => {
                self.breaker.record_failure().await;
                self.health.record_failure();
                tracing::error!("[☁️  -> ⚙️ ] Upstream unavailable: {}", e);
                if matches!(e.inner, RelayError::UpstreamUnavailable(..)) {
                    return Err(e);
                }
                return Err(RelayError::UpstreamUnavailable(StatusCode::BAD_GATEWAY, e.to_string()).into());
            }
        };
        self.breaker.record_success().await;
        self.health.record_success();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", response.status());

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let events = FramedRead::new(StreamReader::new(bytes), SseFrameCodec::new());
        Ok(normalize_events(events, self.channels, cancel))
    }
}

/// Turns one provider `data:` payload into deltas.
pub fn parse_provider_chunk(data: &str, channels: &ChannelMap) -> Result<Vec<Delta>> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        tracing::error!("[☁️  -> ⚙️ ] Provider reported mid-stream error: {}", error);
        return Ok(vec![Delta::upstream_error(channels.content)]);
    }
    Ok(chunk
        .choices
        .iter()
        .flat_map(|choice| choice_deltas(choice, |kind| channels.channel_for(kind), channels.content))
        .collect())
}

struct Normalizer {
    events: BoxStream<'static, Result<SseEvent>>,
    pending: VecDeque<Delta>,
    channels: ChannelMap,
    finished: bool,
}

impl Normalizer {
    fn finish_with_error(&mut self, why: &str) {
        tracing::warn!("[☁️  -> ⚙️ ] Stream ended without finish: {}", why);
        self.pending.push_back(Delta::upstream_error(self.channels.content));
        self.finished = true;
    }

    fn accept(&mut self, deltas: Vec<Delta>) {
        for delta in deltas {
            let terminal = delta.is_terminal();
            self.pending.push_back(delta);
            if terminal {
                self.finished = true;
                break;
            }
        }
    }
}

/// Normalizes a provider SSE event stream into the relay's delta contract.
pub fn normalize_events<S>(events: S, channels: ChannelMap, cancel: CancellationToken) -> DeltaStream
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    let state = Normalizer {
        events: events.boxed(),
        pending: VecDeque::new(),
        channels,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.pending.pop_front() {
                return Some((delta, st));
            }
            if st.finished {
                return None;
            }
            match st.events.next().await {
                Some(Ok(SseEvent::Data(data))) => match parse_provider_chunk(&data, &st.channels) {
                    Ok(deltas) => st.accept(deltas),
                    Err(e) => tracing::warn!(
                        "[☁️  -> ⚙️ ] Skipping unreadable chunk ({}): {}",
                        e,
                        crate::str_utils::prefix_chars(&data, 120)
                    ),
                },
                Some(Ok(SseEvent::Malformed(why))) => {
                    tracing::warn!("[☁️  -> ⚙️ ] Skipping malformed event: {}", why)
                }
                Some(Ok(SseEvent::Done)) => st.finish_with_error("sentinel before finish_reason"),
                Some(Err(e)) => st.finish_with_error(&e.to_string()),
                None => st.finish_with_error("connection closed"),
            }
        }
    })
    .take_until(cancel.cancelled_owned())
    .boxed()
}

/// Test double that plays back scripted deltas.
///
/// `fixed` yields a whole script at once. `live` yields whatever is sent on
/// the returned sender, so a test can pace the turn. Either way the produced
/// stream records when it is dropped.
pub struct ScriptedUpstream {
    script: Mutex<Option<Script>>,
    opened: AtomicUsize,
    torn_down: Arc<AtomicBool>,
    requests: Mutex<Vec<CompletionRequest>>,
}

enum Script {
    Fixed(Vec<Delta>),
    Live(mpsc::Receiver<Delta>),
    Unavailable(StatusCode, String),
}

impl ScriptedUpstream {
    fn with_script(script: Script) -> Self {
        Self {
            script: Mutex::new(Some(script)),
            opened: AtomicUsize::new(0),
            torn_down: Arc::new(AtomicBool::new(false)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(deltas: Vec<Delta>) -> Self {
        Self::with_script(Script::Fixed(deltas))
    }

    pub fn live(capacity: usize) -> (Self, mpsc::Sender<Delta>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::with_script(Script::Live(rx)), tx)
    }

    pub fn unavailable(status: StatusCode, body: impl Into<String>) -> Self {
        Self::with_script(Script::Unavailable(status, body.into()))
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// True once the stream handed out by `open` has been dropped.
    pub fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        match self.requests.lock() {
            Ok(r) => r.clone(),
            Err(_) => Vec::new(),
        }
    }
}

struct Teardown {
    inner: DeltaStream,
    flag: Arc<AtomicBool>,
}

impl Stream for Teardown {
    type Item = Delta;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delta>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpstreamAdapter for ScriptedUpstream {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(&self, request: CompletionRequest, cancel: CancellationToken) -> Result<DeltaStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled.into());
        }

        let script = match self.script.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let inner: DeltaStream = match script {
            Some(Script::Fixed(deltas)) => stream::iter(deltas).boxed(),
            Some(Script::Live(rx)) => ReceiverStream::new(rx).boxed(),
            Some(Script::Unavailable(status, body)) => {
                return Err(RelayError::UpstreamUnavailable(status, body).into())
            }
            None => {
                return Err(RelayError::UpstreamUnavailable(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "script already consumed".to_string(),
                )
                .into())
            }
        };
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Teardown {
            inner: inner.take_until(cancel.cancelled_owned()).boxed(),
            flag: Arc::clone(&self.torn_down),
        }
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeltaKind;

    fn events(items: Vec<Result<SseEvent>>) -> impl Stream<Item = Result<SseEvent>> + Send + 'static {
        stream::iter(items)
    }

    fn data(json: &str) -> Result<SseEvent> {
        Ok(SseEvent::Data(json.to_string()))
    }

    #[tokio::test]
    async fn provider_fields_map_to_channels() {
        let source = events(vec![
            data(r#"{"choices":[{"index":0,"delta":{"reasoning_content":"hmm"}}]}"#),
            data(r#"{"choices":[{"index":0,"delta":{"thinking_blocks":[{"thinking":"plan"}]}}]}"#),
            data(r#"{"choices":[{"index":0,"delta":{"content":"ok"},"finish_reason":null}]}"#),
            data(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#),
            data(r#"{"choices":[{"index":0,"delta":{"content":"after"}}]}"#),
        ]);
        let out: Vec<Delta> = normalize_events(source, ChannelMap::default(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(
            out,
            vec![
                Delta::reasoning(0, "hmm"),
                Delta::thinking(0, "plan"),
                Delta::content(1, "ok"),
                Delta::finish(1, "stop"),
            ]
        );
    }

    #[tokio::test]
    async fn closed_stream_without_finish_is_an_error_finish() {
        let source = events(vec![data(r#"{"choices":[{"delta":{"content":"par"}}]}"#)]);
        let out: Vec<Delta> = normalize_events(source, ChannelMap::default(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_error());
    }

    #[tokio::test]
    async fn provider_error_object_ends_stream() {
        let source = events(vec![
            data(r#"{"choices":[{"delta":{"content":"a"}}]}"#),
            data(r#"{"error":{"message":"overloaded","code":529}}"#),
            data(r#"{"choices":[{"delta":{"content":"b"}}]}"#),
        ]);
        let out: Vec<Delta> = normalize_events(source, ChannelMap::default(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(out, vec![Delta::content(1, "a"), Delta::upstream_error(1)]);
    }

    #[tokio::test]
    async fn garbage_chunks_are_skipped() {
        let source = events(vec![
            data("not json"),
            Ok(SseEvent::Malformed("bad utf-8".into())),
            data(r#"{"choices":[{"delta":{"content":"x"},"finish_reason":"stop"}]}"#),
        ]);
        let out: Vec<Delta> = normalize_events(source, ChannelMap::default(), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(out, vec![Delta::content(1, "x"), Delta::finish(1, "stop")]);
    }

    #[tokio::test]
    async fn cancellation_ends_the_sequence() {
        let cancel = CancellationToken::new();
        let source = stream::iter(vec![data(r#"{"choices":[{"delta":{"content":"a"}}]}"#)])
            .chain(stream::pending());
        let mut deltas = normalize_events(source, ChannelMap::default(), cancel.clone());

        assert_eq!(deltas.next().await.map(|d| d.kind), Some(DeltaKind::Content));
        cancel.cancel();
        assert!(deltas.next().await.is_none());
    }

    #[test]
    fn request_carries_budget_and_forced_temperature() {
        let req = CompletionRequest {
            messages: vec![ChatMessage::new(crate::types::Role::User, "hi")],
            model: "m".into(),
            reasoning_effort: Some(ReasoningEffort::Low),
            thinking: None,
            temperature: Some(0.2),
            max_tokens: None,
        };
        let body = req.to_upstream(4096);
        assert_eq!(body.thinking.and_then(|t| t.budget_tokens), Some(1024));
        assert_eq!(body.max_tokens, 1024 + 4096);
        assert_eq!(body.temperature, 1.0);
        assert_eq!(body.reasoning_effort, Some(ReasoningEffort::Low));
    }

    #[tokio::test]
    async fn scripted_stream_reports_teardown() {
        let upstream = ScriptedUpstream::fixed(vec![Delta::content(1, "a"), Delta::finish(1, "stop")]);
        let req = CompletionRequest {
            messages: vec![],
            model: "m".into(),
            reasoning_effort: None,
            thinking: None,
            temperature: None,
            max_tokens: None,
        };
        let stream = match upstream.open(req.clone(), CancellationToken::new()).await {
            Ok(s) => s,
            Err(e) => panic!("open failed: {}", e),
        };
        assert!(!upstream.torn_down());
        drop(stream);
        assert!(upstream.torn_down());
        assert!(upstream.open(req, CancellationToken::new()).await.is_err());
    }
}
