//! Guards around upstream connection establishment. Nothing here runs once a
//! turn has started streaming.

use crate::types::{ObservedError, RelayError, Result};
use axum::http::StatusCode;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const MAX_BACKOFF_MS: u64 = 30_000;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && Self::is_retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    tracing::warn!(
                        "[⚙️  -> ☁️ ] Connect attempt {} failed: {}. Retrying in {:?}",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exponential backoff with ±25% jitter, capped at `MAX_BACKOFF_MS`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_BACKOFF_MS);
        let jitter_range = base / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base as i64 + jitter).max(1) as u64)
    }

    pub fn is_retryable(err: &ObservedError) -> bool {
        match &err.inner {
            RelayError::Network(_) | RelayError::Io(_) => true,
            RelayError::UpstreamUnavailable(status, _) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            consecutive_failures: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Fails fast with `UpstreamUnavailable` while open.
    pub async fn check(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != CircuitState::Open {
            return Ok(());
        }

        let recovered = match *self.last_failure_time.read().await {
            Some(last) => last.elapsed() > self.recovery_timeout,
            None => true,
        };
        if recovered {
            tracing::info!("Circuit breaker transitioning to HALF-OPEN");
            *state = CircuitState::HalfOpen;
            return Ok(());
        }

        Err(RelayError::UpstreamUnavailable(
            StatusCode::SERVICE_UNAVAILABLE,
            "Upstream circuit breaker is open".to_string(),
        )
        .into())
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if *state != CircuitState::Closed {
            tracing::info!("Circuit breaker transitioning to CLOSED");
            *state = CircuitState::Closed;
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure_time.write().await = Some(Instant::now());

        let trip = *state == CircuitState::HalfOpen
            || (failures >= self.failure_threshold && *state == CircuitState::Closed);
        if trip {
            tracing::error!(
                "Circuit breaker transitioning to OPEN ({} consecutive failures)",
                failures
            );
            *state = CircuitState::Open;
        }
    }
}
