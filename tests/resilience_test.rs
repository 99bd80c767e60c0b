use axum::http::{header, StatusCode};
use axum::routing::post;
use axum::Router;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thinkwire::hardening::*;
use thinkwire::types::*;
use thinkwire::upstream::{CompletionRequest, HttpUpstream, UpstreamAdapter};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: thinkwire::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_retry_policy_eventual_success() {
    let policy = RetryPolicy::new(3, 1);
    let mut attempts = 0;

    let result: thinkwire::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            let a = attempts;
            async move {
                if a < 3 {
                    Err(ObservedError::from(RelayError::UpstreamUnavailable(
                        StatusCode::BAD_GATEWAY,
                        "fail".to_string(),
                    )))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_retry_policy_gives_up_on_client_errors() {
    let policy = RetryPolicy::new(5, 1);
    let mut attempts = 0;

    let result: thinkwire::types::Result<i32> = policy
        .execute_with_retry(|| {
            attempts += 1;
            async move { Err(ObservedError::from(RelayError::InvalidRequest("bad".to_string()))) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_circuit_breaker_trips() {
    let cb = CircuitBreaker::new(2, Duration::from_secs(1));

    cb.record_failure().await;
    assert!(cb.check().await.is_ok());

    cb.record_failure().await;
    assert!(cb.check().await.is_err());
    assert_eq!(cb.state().await, CircuitState::Open);
}

#[tokio::test]
async fn test_circuit_breaker_recovery() {
    let cb = CircuitBreaker::new(1, Duration::from_millis(50));

    cb.record_failure().await;
    assert!(cb.check().await.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Half-open lets one attempt through; its failure reopens immediately.
    assert!(cb.check().await.is_ok());
    assert_eq!(cb.state().await, CircuitState::HalfOpen);
    cb.record_failure().await;
    assert_eq!(cb.state().await, CircuitState::Open);
}

async fn spawn_upstream(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn sse_upstream(body: &'static str) -> Router {
    Router::new().route(
        "/chat/completions",
        post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
    )
}

fn failing_upstream(status: StatusCode, hits: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/chat/completions",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (status, "upstream says no")
            }
        }),
    )
}

fn adapter(base_url: String, breaker_threshold: u32, health: Arc<UpstreamHealth>) -> HttpUpstream {
    HttpUpstream::new(
        reqwest::Client::new(),
        base_url,
        "sk-test",
        ChannelMap::default(),
        4096,
        RetryPolicy::new(3, 1),
        CircuitBreaker::new(breaker_threshold, Duration::from_secs(30)),
        health,
    )
}

fn request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![ChatMessage::new(Role::User, "hi")],
        model: "test-model".to_string(),
        reasoning_effort: None,
        thinking: None,
        temperature: None,
        max_tokens: None,
    }
}

#[tokio::test]
async fn test_http_upstream_normalizes_provider_stream() {
    let body = concat!(
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"reasoning_content\":\"Let me\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"reasoning_content\":\" think\"}}]}\r\n\r\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let base = spawn_upstream(sse_upstream(body)).await;
    let health = Arc::new(UpstreamHealth::default());
    let upstream = adapter(base, 5, health.clone());

    let deltas = match upstream.open(request(), CancellationToken::new()).await {
        Ok(s) => s,
        Err(e) => panic!("open failed: {}", e),
    };
    let out: Vec<Delta> = deltas.collect().await;

    assert_eq!(
        out,
        vec![
            Delta::reasoning(0, "Let me"),
            Delta::reasoning(0, " think"),
            Delta::content(1, "Hi"),
            Delta::finish(1, "stop"),
        ]
    );
    assert_eq!(health.consecutive_failures.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_http_upstream_truncated_stream_ends_in_error() {
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\ndata: {\"choices\":[{\"del";
    let base = spawn_upstream(sse_upstream(body)).await;
    let upstream = adapter(base, 5, Arc::new(UpstreamHealth::default()));

    let deltas = match upstream.open(request(), CancellationToken::new()).await {
        Ok(s) => s,
        Err(e) => panic!("open failed: {}", e),
    };
    let out: Vec<Delta> = deltas.collect().await;
    assert_eq!(out, vec![Delta::content(1, "par"), Delta::upstream_error(1)]);
}

#[tokio::test]
async fn test_http_upstream_retries_server_errors_before_streaming() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_upstream(failing_upstream(StatusCode::SERVICE_UNAVAILABLE, hits.clone())).await;
    let health = Arc::new(UpstreamHealth::default());
    let upstream = adapter(base, 5, health.clone());

    match upstream.open(request(), CancellationToken::new()).await {
        Err(e) => match e.inner {
            RelayError::UpstreamUnavailable(status, _) => assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE),
            other => panic!("expected UpstreamUnavailable, got {:?}", other),
        },
        Ok(_) => panic!("expected failure"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(health.failed_requests.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_http_upstream_does_not_retry_auth_failures() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_upstream(failing_upstream(StatusCode::UNAUTHORIZED, hits.clone())).await;
    let upstream = adapter(base, 5, Arc::new(UpstreamHealth::default()));

    match upstream.open(request(), CancellationToken::new()).await {
        Err(e) => assert!(matches!(e.inner, RelayError::UpstreamUnavailable(StatusCode::UNAUTHORIZED, _))),
        Ok(_) => panic!("expected failure"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_breaker_fails_fast() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_upstream(failing_upstream(StatusCode::UNAUTHORIZED, hits.clone())).await;
    let upstream = adapter(base, 1, Arc::new(UpstreamHealth::default()));

    assert!(upstream.open(request(), CancellationToken::new()).await.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    match upstream.open(request(), CancellationToken::new()).await {
        Err(e) => assert!(matches!(
            e.inner,
            RelayError::UpstreamUnavailable(StatusCode::SERVICE_UNAVAILABLE, _)
        )),
        Ok(_) => panic!("expected breaker to refuse"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_token_aborts_establishment() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_upstream(failing_upstream(StatusCode::SERVICE_UNAVAILABLE, hits)).await;
    let upstream = adapter(base, 5, Arc::new(UpstreamHealth::default()));

    let cancel = CancellationToken::new();
    cancel.cancel();
    match upstream.open(request(), cancel).await {
        Err(e) => assert!(matches!(e.inner, RelayError::Cancelled)),
        Ok(_) => panic!("expected cancellation"),
    }
}
