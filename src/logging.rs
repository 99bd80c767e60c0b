use crate::transport::TURN_ID_HEADER;
use crate::types::{Delta, DeltaKind};
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::panic;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

pub const DEFAULT_FILTER: &str = "thinkwire=debug,tower_http=info";

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r#"(?i)(sk-[A-Za-z0-9_\-]{16,}|Bearer\s+[^\s"]+|x-api-key:\s*[^\s"]+)"#
    )
    .expect("redaction regex is valid");
    static ref TURN_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_\-]{1,64}$").expect("turn id regex is valid");
}

/// Masks credentials before log lines reach disk.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = REDACTION_REGEX.replace_all(&input, "[REDACTED]");
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Human-readable logs on stderr plus daily-rolled JSON lines under `log_dir`.
/// Keep the guard alive for the life of the process.
pub fn init_tracing(log_dir: &Path, file_prefix: &str) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(move || RedactingWriter::new(non_blocking.clone())),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Logs panics through tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Accepts a well-formed client turn id or mints one, and echoes it back.
pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let supplied = req
        .headers()
        .get(TURN_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| TURN_ID_PATTERN.is_match(s))
        .map(str::to_string);
    let turn_id = supplied.unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&turn_id).ok();
    if let Some(val) = header.clone() {
        req.headers_mut().insert(TURN_ID_HEADER, val);
    }

    let span = info_span!("request", turn_id = %turn_id);
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().entry(TURN_ID_HEADER).or_insert(val);
    }
    response
}

/// Per-turn counters, logged once when the relay terminates.
#[derive(Debug)]
pub struct StreamMetric {
    started: Instant,
    first_delta: Option<Duration>,
    pub frames: usize,
    pub deltas: usize,
    pub chars_by_kind: BTreeMap<&'static str, usize>,
}

impl Default for StreamMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetric {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            first_delta: None,
            frames: 0,
            deltas: 0,
            chars_by_kind: BTreeMap::new(),
        }
    }

    pub fn record_delta(&mut self, delta: &Delta) {
        if self.first_delta.is_none() {
            self.first_delta = Some(self.started.elapsed());
        }
        self.deltas += 1;
        if let (Some(field), Some(text)) = (delta.kind.wire_field(), &delta.text) {
            *self.chars_by_kind.entry(field).or_default() += text.chars().count();
        }
        if delta.kind == DeltaKind::Finish {
            tracing::debug!(
                "[☁️  -> ⚙️ ] Finish on channel {}: {:?}",
                delta.channel,
                delta.finish_reason
            );
        }
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn log_summary(&self, turn_id: &str, outcome: &str) {
        let first_ms = self.first_delta.map(|d| d.as_millis()).unwrap_or(0);
        info!(
            target: "relay",
            "[STREAM END] Turn: {} | Outcome: {} | Frames: {} | Deltas: {} | Chars: {:?} | First delta: {}ms | Total: {}ms",
            crate::str_utils::short_id(turn_id),
            outcome,
            self.frames,
            self.deltas,
            self.chars_by_kind,
            first_ms,
            self.started.elapsed().as_millis()
        );
    }
}
