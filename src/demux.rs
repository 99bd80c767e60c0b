//! Client side of the relay: turns response bytes back into per-channel text.
//!
//! Reads may cut a frame anywhere, including inside a multibyte character.
//! Bytes are held until the frame boundary arrives, so the result never
//! depends on how the transport fragmented the stream.

pub use crate::accumulator::{ChannelAccumulator, ChannelSet};
use crate::codec::{SseEvent, SseFrameCodec, WireFrame};
use crate::types::DeltaKind;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

/// What a renderer needs to know after each read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxUpdate {
    Text {
        channel: u32,
        kind: DeltaKind,
        text: String,
    },
    ChannelFinished {
        channel: u32,
        finish_reason: String,
    },
    /// The first finish of the turn. Authoritative even if no sentinel follows.
    TurnFinished { finish_reason: String },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEnd {
    Finished { finish_reason: String },
    /// `[DONE]` arrived before any finish.
    Sentinel,
    /// The server closed the stream before either.
    TransportClosed,
    /// Reading was stopped locally.
    Aborted,
}

#[derive(Debug)]
pub struct StreamDemultiplexer {
    codec: SseFrameCodec,
    buffer: BytesMut,
    channels: ChannelSet,
    end: Option<TurnEnd>,
    saw_sentinel: bool,
    malformed: usize,
    frames: usize,
}

impl Default for StreamDemultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDemultiplexer {
    pub fn new() -> Self {
        Self {
            codec: SseFrameCodec::new(),
            buffer: BytesMut::new(),
            channels: ChannelSet::new(),
            end: None,
            saw_sentinel: false,
            malformed: 0,
            frames: 0,
        }
    }

    /// Consumes one read. Only complete frames are processed; the remainder
    /// waits for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DemuxUpdate> {
        self.buffer.extend_from_slice(bytes);
        let mut updates = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(event)) => self.handle(event, &mut updates),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("[🖥️ ] Frame decoder error: {}", e);
                    break;
                }
            }
        }
        updates
    }

    /// Signals that the transport closed. Any unterminated tail is dropped.
    pub fn close(&mut self) -> Vec<DemuxUpdate> {
        let mut updates = Vec::new();
        loop {
            match self.codec.decode_eof(&mut self.buffer) {
                Ok(Some(event)) => self.handle(event, &mut updates),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("[🖥️ ] Frame decoder error at close: {}", e);
                    break;
                }
            }
        }
        if self.end.is_none() {
            tracing::warn!("[🖥️ ] Stream closed before the turn finished");
            self.end = Some(TurnEnd::TransportClosed);
        }
        updates
    }

    /// Stops the turn from the client side.
    pub fn abort(&mut self) {
        if self.end.is_none() {
            self.end = Some(TurnEnd::Aborted);
        }
    }

    fn handle(&mut self, event: SseEvent, updates: &mut Vec<DemuxUpdate>) {
        match event {
            SseEvent::Data(data) => {
                if self.end.is_some() {
                    tracing::debug!("[🖥️ ] Ignoring frame after end of turn");
                    return;
                }
                match WireFrame::parse(&data) {
                    Ok(frame) => {
                        self.frames += 1;
                        self.apply(frame, updates);
                    }
                    Err(e) => {
                        self.malformed += 1;
                        tracing::warn!("[🖥️ ] Dropping malformed frame: {}", e);
                    }
                }
            }
            SseEvent::Malformed(why) => {
                self.malformed += 1;
                tracing::warn!("[🖥️ ] Dropping malformed frame: {}", why);
            }
            SseEvent::Done => {
                if self.saw_sentinel {
                    return;
                }
                self.saw_sentinel = true;
                if self.end.is_none() {
                    self.end = Some(TurnEnd::Sentinel);
                }
                updates.push(DemuxUpdate::Done);
            }
        }
    }

    fn apply(&mut self, frame: WireFrame, updates: &mut Vec<DemuxUpdate>) {
        for delta in frame.deltas {
            self.channels.apply(&delta);
            match (&delta.text, &delta.finish_reason) {
                (Some(text), _) if delta.kind != DeltaKind::Finish => updates.push(DemuxUpdate::Text {
                    channel: delta.channel,
                    kind: delta.kind,
                    text: text.clone(),
                }),
                (_, Some(reason)) => {
                    updates.push(DemuxUpdate::ChannelFinished {
                        channel: delta.channel,
                        finish_reason: reason.clone(),
                    });
                    updates.push(DemuxUpdate::TurnFinished {
                        finish_reason: reason.clone(),
                    });
                    self.end = Some(TurnEnd::Finished {
                        finish_reason: reason.clone(),
                    });
                    return;
                }
                _ => {}
            }
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn channel(&self, channel: u32) -> Option<&ChannelAccumulator> {
        self.channels.get(channel)
    }

    pub fn end(&self) -> Option<&TurnEnd> {
        self.end.as_ref()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        match &self.end {
            Some(TurnEnd::Finished { finish_reason }) => Some(finish_reason),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    pub fn saw_sentinel(&self) -> bool {
        self.saw_sentinel
    }

    pub fn malformed_frames(&self) -> usize {
        self.malformed
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// Reads a response body to its end, or until `cancel` fires, reporting
/// every update with the accumulated state so far.
///
/// Returning drops `body`, which closes the connection and lets the server
/// tear the turn down.
pub async fn consume<S, E, F>(mut body: S, cancel: CancellationToken, mut on_update: F) -> StreamDemultiplexer
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Display,
    F: FnMut(&DemuxUpdate, &ChannelSet),
{
    let mut demux = StreamDemultiplexer::new();
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                demux.abort();
                break;
            }
            read = body.next() => read,
        };

        let updates = match read {
            Some(Ok(bytes)) => demux.feed(&bytes),
            Some(Err(e)) => {
                tracing::warn!("[🖥️ ] Read failed: {}", e);
                demux.close()
            }
            None => demux.close(),
        };
        for update in &updates {
            on_update(update, demux.channels());
        }
        if demux.saw_sentinel() || matches!(demux.end(), Some(TurnEnd::TransportClosed)) {
            break;
        }
    }
    demux
}
