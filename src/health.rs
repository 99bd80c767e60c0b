use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub upstream: String,
    pub active_turns: usize,
    pub upstream_consecutive_failures: u32,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready when the conversation store answers. Upstream trouble is reported
/// but does not fail the check; the circuit breaker handles it per turn.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let db_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Readiness check: store error: {}", e);
            false
        }
    };

    let failures = state.health.consecutive_failures.load(Ordering::Relaxed);
    let status_code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if db_ok { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            upstream: if failures == 0 { "ok" } else { "degraded" }.to_string(),
            active_turns: state.turns.active(),
            upstream_consecutive_failures: failures,
        }),
    )
}
