use crate::cancel::{CancelSource, CancellationCoordinator};
use crate::codec::{WireFrame, HEARTBEAT_FRAME, SENTINEL_FRAME};
use crate::types::{RelayError, Result};
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type BodyChunk = std::result::Result<Bytes, std::io::Error>;

pub const TURN_ID_HEADER: &str = "x-turn-id";
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Writes frames to one response body, in order, one chunk per frame.
pub struct TransportWriter {
    tx: Option<mpsc::Sender<BodyChunk>>,
    cancel: CancellationCoordinator,
    frames_written: usize,
}

impl TransportWriter {
    /// Capacity bounds how far the relay can run ahead of the socket.
    pub fn channel(cancel: CancellationCoordinator, capacity: usize) -> (Self, RelayBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let body = RelayBody {
            inner: ReceiverStream::new(rx),
            cancel: cancel.clone(),
        };
        (
            Self {
                tx: Some(tx),
                cancel,
                frames_written: 0,
            },
            body,
        )
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub async fn write_heartbeat(&mut self) -> Result<()> {
        self.send(HEARTBEAT_FRAME.to_string()).await
    }

    pub async fn write_frame(&mut self, frame: &WireFrame) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        let text = frame.encode()?;
        self.send(text).await?;
        self.frames_written += 1;
        Ok(())
    }

    pub async fn write_sentinel(&mut self) -> Result<()> {
        self.send(SENTINEL_FRAME.to_string()).await
    }

    /// Ends the response. Whatever was last written is what the peer sees.
    pub fn close(&mut self) {
        self.tx = None;
    }

    async fn send(&mut self, text: String) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Cancelled.into());
        }
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return Err(RelayError::internal("write after transport close").into()),
        };

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled.into()),
            sent = tx.send(Ok(Bytes::from(text))) => sent,
        };

        if sent.is_err() {
            self.cancel.cancel(CancelSource::TransportClosed);
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "client disconnected",
            ))
            .into());
        }
        Ok(())
    }
}

/// Response body fed by a [`TransportWriter`]. Dropping it, which is what
/// the server does when the client goes away, cancels the turn.
pub struct RelayBody {
    inner: ReceiverStream<BodyChunk>,
    cancel: CancellationCoordinator,
}

impl Stream for RelayBody {
    type Item = BodyChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if self.cancel.cancel(CancelSource::TransportClosed) {
            tracing::info!("[🖥️  -x ⚙️ ] Response stream dropped by client");
        }
    }
}

/// Streaming response with the headers intermediaries need to pass frames through unbuffered.
pub fn event_stream_response(body: RelayBody, turn_id: &str, conversation_id: &str) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(v) = HeaderValue::from_str(turn_id) {
        headers.insert(TURN_ID_HEADER, v);
    }
    if let Ok(v) = HeaderValue::from_str(conversation_id) {
        headers.insert(CONVERSATION_ID_HEADER, v);
    }
    response
}
