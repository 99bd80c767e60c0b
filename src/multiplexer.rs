use crate::accumulator::ChannelSet;
use crate::cancel::{CancelSource, CancellationCoordinator};
use crate::codec::WireFrame;
use crate::logging::StreamMetric;
use crate::persistence::{PersistenceStatus, PersistenceWriter};
use crate::transport::TransportWriter;
use crate::types::{ChannelMap, Delta, RelayError};
use crate::upstream::DeltaStream;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelayState {
    Idle,
    Streaming,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The turn reached a Finish delta and the sentinel went out.
    Completed {
        finish_reason: String,
        persistence: PersistenceStatus,
    },
    /// The upstream failed after streaming began. Nothing is persisted.
    UpstreamFailed { finish_reason: String },
    Cancelled,
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TurnOutcome::Completed { .. } => "completed",
            TurnOutcome::UpstreamFailed { .. } => "upstream_failed",
            TurnOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct TurnReport {
    pub turn_id: String,
    pub outcome: TurnOutcome,
    /// Data frames written, sentinel and heartbeats excluded.
    pub frames: usize,
    pub channels: ChannelSet,
    /// Every state the relay passed through, in order.
    pub states: Vec<RelayState>,
}

enum Step {
    Cancelled,
    Next(Option<Delta>),
}

/// Relays one turn's deltas to one response stream.
pub struct ChannelMultiplexer {
    turn_id: String,
    channel_map: ChannelMap,
    frame_batch: usize,
    state: RelayState,
    states: Vec<RelayState>,
    channels: ChannelSet,
    metric: StreamMetric,
}

impl ChannelMultiplexer {
    pub fn new(turn_id: impl Into<String>, channel_map: ChannelMap, frame_batch: usize) -> Self {
        Self {
            turn_id: turn_id.into(),
            channel_map,
            frame_batch: frame_batch.max(1),
            state: RelayState::Idle,
            states: vec![RelayState::Idle],
            channels: ChannelSet::new(),
            metric: StreamMetric::new(),
        }
    }

    fn transition(&mut self, next: RelayState) {
        tracing::debug!(
            "[⚙️ ] Turn {}: {:?} -> {:?}",
            crate::str_utils::short_id(&self.turn_id),
            self.state,
            next
        );
        self.state = next;
        self.states.push(next);
    }

    fn accept(&mut self, frame: &mut WireFrame, delta: Delta) {
        self.metric.record_delta(&delta);
        self.channels.apply(&delta);
        frame.push(delta);
    }

    /// Runs the turn to completion.
    ///
    /// The first terminal Finish delta, by arrival, ends the turn. If the
    /// stream runs dry without one, the turn ends as an upstream error.
    /// Once a Finish is observed the turn can no longer be cancelled.
    pub async fn run(
        mut self,
        mut deltas: DeltaStream,
        mut writer: TransportWriter,
        cancel: CancellationCoordinator,
        persistence: Option<PersistenceWriter>,
    ) -> TurnReport {
        self.transition(RelayState::Streaming);

        if writer.write_heartbeat().await.is_err() {
            drop(deltas);
            return self.abort(writer, &cancel);
        }

        let finish = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                next = deltas.next() => Step::Next(next),
            };

            let first = match step {
                Step::Cancelled => {
                    drop(deltas);
                    return self.abort(writer, &cancel);
                }
                Step::Next(Some(delta)) => delta,
                Step::Next(None) => {
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] Delta stream ended without a finish for turn {}",
                        self.turn_id
                    );
                    Delta::upstream_error(self.channel_map.content)
                }
            };

            let mut frame = WireFrame::new();
            let mut terminal = first.is_terminal().then(|| first.clone());
            self.accept(&mut frame, first);

            // Coalesce whatever is already buffered, without waiting.
            while terminal.is_none() && frame.len() < self.frame_batch {
                match deltas.next().now_or_never() {
                    Some(Some(delta)) => {
                        if delta.is_terminal() {
                            terminal = Some(delta.clone());
                        }
                        self.accept(&mut frame, delta);
                    }
                    Some(None) => {
                        let delta = Delta::upstream_error(self.channel_map.content);
                        terminal = Some(delta.clone());
                        self.accept(&mut frame, delta);
                    }
                    None => break,
                }
            }

            if let Some(finish) = terminal {
                if !cancel.complete() {
                    drop(deltas);
                    return self.abort(writer, &cancel);
                }
                break (finish, frame);
            }

            if cancel.is_cancelled() {
                drop(deltas);
                return self.abort(writer, &cancel);
            }
            match writer.write_frame(&frame).await {
                Ok(()) => self.metric.record_frame(),
                Err(e) => {
                    if !matches!(e.inner, RelayError::Cancelled) {
                        tracing::warn!("[⚙️  -> 🖥️ ] Frame write failed: {}", e);
                    }
                    cancel.cancel(CancelSource::TransportClosed);
                    drop(deltas);
                    return self.abort(writer, &cancel);
                }
            }
        };

        // Past the commit point: the upstream has nothing more to give this turn.
        drop(deltas);
        let (finish, frame) = finish;
        self.transition(RelayState::Draining);

        match writer.write_frame(&frame).await {
            Ok(()) => {
                self.metric.record_frame();
                if let Err(e) = writer.write_sentinel().await {
                    tracing::warn!("[⚙️  -> 🖥️ ] Sentinel not delivered: {}", e);
                }
            }
            Err(e) => tracing::warn!("[⚙️  -> 🖥️ ] Final frame not delivered: {}", e),
        }
        writer.close();

        let finish_reason = finish
            .finish_reason
            .clone()
            .unwrap_or_else(|| crate::types::FINISH_ERROR.to_string());

        let outcome = if finish.is_error() {
            TurnOutcome::UpstreamFailed { finish_reason }
        } else {
            let persistence = match &persistence {
                Some(p) => p.commit(&self.channels).await,
                None => PersistenceStatus::Skipped,
            };
            TurnOutcome::Completed {
                finish_reason,
                persistence,
            }
        };

        self.transition(RelayState::Terminated);
        self.finish(writer.frames_written(), outcome)
    }

    fn abort(mut self, mut writer: TransportWriter, cancel: &CancellationCoordinator) -> TurnReport {
        writer.close();
        tracing::info!(
            "[🖥️  -x ⚙️ ] Turn {} cancelled ({:?}); upstream released, nothing persisted",
            crate::str_utils::short_id(&self.turn_id),
            cancel.source()
        );
        self.transition(RelayState::Terminated);
        self.finish(writer.frames_written(), TurnOutcome::Cancelled)
    }

    fn finish(self, frames: usize, outcome: TurnOutcome) -> TurnReport {
        self.metric.log_summary(&self.turn_id, outcome.label());
        TurnReport {
            turn_id: self.turn_id,
            outcome,
            frames,
            channels: self.channels,
            states: self.states,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SENTINEL_FRAME;
    use crate::transport::RelayBody;
    use futures_util::stream;

    fn deltas(items: Vec<Delta>) -> DeltaStream {
        stream::iter(items).boxed()
    }

    async fn drain(mut body: RelayBody) -> String {
        let mut out = String::new();
        while let Some(Ok(chunk)) = body.next().await {
            out.push_str(&String::from_utf8_lossy(&chunk));
        }
        out
    }

    async fn relay(items: Vec<Delta>, batch: usize) -> (TurnReport, String) {
        let cancel = CancellationCoordinator::new();
        let (writer, body) = TransportWriter::channel(cancel.clone(), 64);
        let reader = tokio::spawn(drain(body));
        let report = ChannelMultiplexer::new("t1", ChannelMap::default(), batch)
            .run(deltas(items), writer, cancel, None)
            .await;
        let out = match reader.await {
            Ok(s) => s,
            Err(e) => panic!("reader panicked: {}", e),
        };
        (report, out)
    }

    #[tokio::test]
    async fn interleaved_channels_stay_separate() {
        let (report, out) = relay(
            vec![
                Delta::thinking(0, "Let"),
                Delta::content(1, "Hi"),
                Delta::thinking(0, " me think"),
                Delta::content(1, " there"),
                Delta::finish(1, "stop"),
            ],
            1,
        )
        .await;

        assert_eq!(report.channels.text(0), "Let me think");
        assert_eq!(report.channels.text(1), "Hi there");
        assert_eq!(report.frames, 5);
        assert!(out.ends_with(SENTINEL_FRAME));
        assert_eq!(
            report.states,
            vec![
                RelayState::Idle,
                RelayState::Streaming,
                RelayState::Draining,
                RelayState::Terminated
            ]
        );
        assert!(matches!(
            report.outcome,
            TurnOutcome::Completed { ref finish_reason, persistence: PersistenceStatus::Skipped } if finish_reason == "stop"
        ));
    }

    #[tokio::test]
    async fn buffered_deltas_are_coalesced() {
        let (report, out) = relay(
            vec![
                Delta::content(1, "a"),
                Delta::content(1, "b"),
                Delta::content(1, "c"),
                Delta::finish(1, "stop"),
            ],
            8,
        )
        .await;
        assert_eq!(report.frames, 1);
        assert_eq!(out.matches("data: {").count(), 1);
        assert_eq!(report.channels.text(1), "abc");
    }

    #[tokio::test]
    async fn first_finish_ends_the_turn() {
        let (report, out) = relay(
            vec![
                Delta::thinking(0, "x"),
                Delta::finish(0, "stop"),
                Delta::content(1, "never relayed"),
                Delta::finish(1, "length"),
            ],
            1,
        )
        .await;
        assert!(!out.contains("never relayed"));
        assert!(matches!(report.outcome, TurnOutcome::Completed { ref finish_reason, .. } if finish_reason == "stop"));
    }

    #[tokio::test]
    async fn mid_stream_error_still_sends_sentinel() {
        let (report, out) = relay(vec![Delta::content(1, "partial"), Delta::upstream_error(1)], 1).await;
        assert!(out.ends_with(SENTINEL_FRAME));
        assert!(out.contains(r#""finish_reason":"error""#));
        assert!(matches!(report.outcome, TurnOutcome::UpstreamFailed { .. }));
    }

    #[tokio::test]
    async fn exhausted_stream_counts_as_error() {
        let (report, _) = relay(vec![Delta::content(1, "cut")], 1).await;
        assert!(matches!(report.outcome, TurnOutcome::UpstreamFailed { .. }));
        assert_eq!(report.channels.text(1), "cut");
    }

    #[tokio::test]
    async fn cancelled_turn_ends_without_sentinel() {
        let cancel = CancellationCoordinator::new();
        let (writer, body) = TransportWriter::channel(cancel.clone(), 64);
        let reader = tokio::spawn(drain(body));
        let source = stream::iter(vec![Delta::content(1, "a")]).chain(stream::pending()).boxed();

        let run = tokio::spawn(ChannelMultiplexer::new("t2", ChannelMap::default(), 1).run(
            source,
            writer,
            cancel.clone(),
            None,
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(cancel.cancel(CancelSource::ClientAbort));

        let report = match run.await {
            Ok(r) => r,
            Err(e) => panic!("relay panicked: {}", e),
        };
        let out = match reader.await {
            Ok(s) => s,
            Err(e) => panic!("reader panicked: {}", e),
        };
        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert!(!out.contains("[DONE]"));
        assert_eq!(report.states.last(), Some(&RelayState::Terminated));
        assert!(!report.states.contains(&RelayState::Draining));
    }
}
