//! Fan-in of direct writes and merged sub-streams onto one sink.
//!
//! Every producer talks to a single task through a bounded channel. That
//! task is the only writer of the sink, so frames from different sources
//! are never interleaved mid-frame and each source keeps its own order.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use partstream_core::{ProtocolEncodingError, StreamEvent};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::FrameEncoder;
use crate::error::{StreamError, StreamResult};
use crate::settings::WriterSettings;
use crate::sink::OutboundSink;
use crate::writer::{StreamOutcome, StreamSummary};

/// How the merger treats an encoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Marker {
    Start,
    Finish,
    /// `error` or `abort` written by a producer.
    Terminal,
    Other,
}

/// An encoded event on its way to the sink.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) frame: Bytes,
    pub(crate) marker: Marker,
}

#[derive(Debug)]
pub(crate) enum Command {
    Event(Envelope),
    SubStreamDone(u64),
    Fail {
        sub_stream: Option<u64>,
        error: StreamError,
    },
    Close,
    Abort(Option<String>),
}

/// Writer state shared between handles and the merger task.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    /// No more direct writes or merges are accepted.
    pub(crate) closed: bool,
    /// A failure or abort is queued.
    pub(crate) terminating: bool,
    /// The merger has begun or completed finalization.
    pub(crate) finalized: bool,
    /// Merged sub-streams that have not reported completion.
    pub(crate) outstanding: usize,
    pub(crate) next_sub_stream: u64,
}

impl Lifecycle {
    pub(crate) fn accepts_writes(&self) -> bool {
        !self.closed && !self.terminating && !self.finalized
    }
}

pub(crate) struct Shared {
    pub(crate) message_id: String,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) token: CancellationToken,
    pub(crate) encoder: FrameEncoder,
    pub(crate) summary: watch::Sender<Option<StreamSummary>>,
}

impl Shared {
    pub(crate) fn new(message_id: String, encoder: FrameEncoder) -> Self {
        let (summary, _) = watch::channel(None);
        Self {
            message_id,
            lifecycle: Mutex::new(Lifecycle::default()),
            token: CancellationToken::new(),
            encoder,
            summary,
        }
    }

    /// Validate and encode an event.
    pub(crate) fn envelope(&self, event: &StreamEvent) -> Result<Envelope, ProtocolEncodingError> {
        let frame = self.encoder.encode(event)?;
        let marker = match event {
            StreamEvent::Start { .. } => Marker::Start,
            StreamEvent::Finish { .. } => Marker::Finish,
            StreamEvent::Error { .. } | StreamEvent::Abort { .. } => Marker::Terminal,
            _ => Marker::Other,
        };
        Ok(Envelope { frame, marker })
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("message_id", &self.message_id)
            .field("lifecycle", &*self.lifecycle.lock())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The task that owns the sink.
pub(crate) struct Merger<S> {
    sink: S,
    rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    settings: WriterSettings,
    started: bool,
    finish_sent: bool,
    terminated: bool,
    frames_written: usize,
}

impl<S: OutboundSink> Merger<S> {
    pub(crate) fn new(
        sink: S,
        rx: mpsc::Receiver<Command>,
        shared: Arc<Shared>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            sink,
            rx,
            shared,
            settings,
            started: false,
            finish_sent: false,
            terminated: false,
            frames_written: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(message_id = %self.shared.message_id, "Stream writer started");

        let outcome = loop {
            let next = tokio::select! {
                biased;
                command = self.rx.recv() => command,
                () = self.sink.closed() => {
                    break self.disconnected(&StreamError::ConnectionClosed);
                }
            };
            let Some(command) = next else {
                debug!("All writer handles dropped");
                self.shared.lifecycle.lock().closed = true;
                break self.complete().await;
            };

            match command {
                Command::Event(envelope) => {
                    if let Err(err) = self.emit(envelope).await {
                        break self.disconnected(&err);
                    }
                }
                Command::SubStreamDone(id) => {
                    trace!(sub_stream = id, "Sub-stream completed");
                    let ready = {
                        let mut lifecycle = self.shared.lifecycle.lock();
                        lifecycle.outstanding = lifecycle.outstanding.saturating_sub(1);
                        Self::claim_finalization(&mut lifecycle)
                    };
                    if ready {
                        break self.complete().await;
                    }
                }
                Command::Close => {
                    let ready = Self::claim_finalization(&mut self.shared.lifecycle.lock());
                    if ready {
                        break self.complete().await;
                    }
                    debug!("Close requested, waiting for merged sub-streams");
                }
                Command::Fail { sub_stream, error } => break self.fail(sub_stream, error).await,
                Command::Abort(reason) => break self.abort(reason).await,
            }
        };

        self.finalize(outcome).await;
    }

    fn claim_finalization(lifecycle: &mut Lifecycle) -> bool {
        if lifecycle.closed && lifecycle.outstanding == 0 && !lifecycle.finalized {
            lifecycle.finalized = true;
            true
        } else {
            false
        }
    }

    /// Stop accepting input and cancel every merged sub-stream.
    fn terminate(&self) {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            lifecycle.closed = true;
            lifecycle.finalized = true;
        }
        self.shared.token.cancel();
    }

    async fn emit(&mut self, envelope: Envelope) -> StreamResult<()> {
        match envelope.marker {
            Marker::Start => {
                self.started = true;
                self.finish_sent = false;
                self.terminated = false;
            }
            Marker::Finish if self.finish_sent => {
                warn!(message_id = %self.shared.message_id, "Dropping duplicate finish");
                return Ok(());
            }
            Marker::Finish => {
                self.ensure_started().await?;
                self.finish_sent = true;
            }
            Marker::Terminal => {
                self.ensure_started().await?;
                self.terminated = true;
            }
            Marker::Other => self.ensure_started().await?,
        }
        self.send(envelope.frame).await
    }

    async fn emit_event(&mut self, event: &StreamEvent) -> StreamResult<()> {
        let envelope = self.shared.envelope(event)?;
        self.emit(envelope).await
    }

    async fn ensure_started(&mut self) -> StreamResult<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        if self.settings.send_start {
            let start = StreamEvent::start(self.shared.message_id.clone());
            let frame = self.shared.encoder.encode(&start)?;
            self.send(frame).await?;
        }
        Ok(())
    }

    async fn send(&mut self, frame: Bytes) -> StreamResult<()> {
        self.sink.send(frame).await?;
        self.frames_written += 1;
        Ok(())
    }

    async fn complete(&mut self) -> StreamOutcome {
        if self.settings.send_finish && !self.finish_sent && !self.terminated {
            if let Err(err) = self.emit_event(&StreamEvent::finish()).await {
                return self.disconnected(&err);
            }
        }
        StreamOutcome::Completed
    }

    async fn fail(&mut self, sub_stream: Option<u64>, error: StreamError) -> StreamOutcome {
        warn!(
            message_id = %self.shared.message_id,
            sub_stream = ?sub_stream,
            error = %error,
            "Stream failed"
        );
        self.terminate();
        let text = self.settings.error_text(&error);
        match self.emit_event(&StreamEvent::error(text)).await {
            Ok(()) => StreamOutcome::Errored(error.to_string()),
            Err(err) => self.disconnected(&err),
        }
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamOutcome {
        info!(message_id = %self.shared.message_id, reason = ?reason, "Stream aborted");
        self.terminate();
        let abort = StreamEvent::Abort { reason };
        match self.emit_event(&abort).await {
            Ok(()) => StreamOutcome::Aborted,
            Err(err) => self.disconnected(&err),
        }
    }

    fn disconnected(&self, err: &StreamError) -> StreamOutcome {
        warn!(message_id = %self.shared.message_id, error = %err, "Consumer disconnected");
        self.terminate();
        StreamOutcome::Disconnected
    }

    async fn finalize(mut self, mut outcome: StreamOutcome) {
        if outcome != StreamOutcome::Disconnected && self.settings.send_done {
            let done = self.shared.encoder.encode_done();
            if let Err(err) = self.send(done).await {
                outcome = self.disconnected(&err);
            }
        }
        if let Err(err) = self.sink.close().await {
            debug!(error = %err, "Sink close failed");
        }

        self.terminate();
        self.rx.close();
        let mut discarded = 0;
        while let Ok(command) = self.rx.try_recv() {
            if matches!(command, Command::Event(_)) {
                discarded += 1;
            }
        }
        if discarded > 0 {
            debug!(discarded, "Discarded events queued after finalization");
        }

        let summary = StreamSummary {
            message_id: self.shared.message_id.clone(),
            frames_written: self.frames_written,
            discarded,
            outcome,
        };
        info!(
            message_id = %summary.message_id,
            frames = summary.frames_written,
            outcome = ?summary.outcome,
            "Stream finalized"
        );
        self.shared.summary.send_replace(Some(summary));
    }
}

/// Forward one merged sub-stream into the merger.
///
/// Cancellation ends the sub-stream normally; an error item ends it and
/// fails the whole stream.
pub(crate) async fn forward_sub_stream<St, E>(
    id: u64,
    stream: St,
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    token: CancellationToken,
) where
    St: Stream<Item = Result<StreamEvent, E>>,
    E: fmt::Display,
{
    futures::pin_mut!(stream);
    debug!(sub_stream = id, "Sub-stream started");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(sub_stream = id, "Sub-stream cancelled");
                break;
            }
            next = stream.next() => next,
        };

        let command = match next {
            Some(Ok(event)) => match shared.envelope(&event) {
                Ok(envelope) => Command::Event(envelope),
                Err(err) => {
                    let _ = tx
                        .send(Command::Fail {
                            sub_stream: Some(id),
                            error: err.into(),
                        })
                        .await;
                    return;
                }
            },
            Some(Err(err)) => {
                let _ = tx
                    .send(Command::Fail {
                        sub_stream: Some(id),
                        error: StreamError::SubStream(err.to_string()),
                    })
                    .await;
                return;
            }
            None => break,
        };

        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            result = tx.send(command) => result.is_ok(),
        };
        if !sent {
            break;
        }
    }

    let _ = tx.send(Command::SubStreamDone(id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use partstream_core::DataEvent;
    use serde_json::json;

    fn shared() -> Shared {
        Shared::new("m1".into(), FrameEncoder::new())
    }

    #[test]
    fn test_envelope_markers() {
        let shared = shared();
        let marker = |event: StreamEvent| shared.envelope(&event).unwrap().marker;
        assert_eq!(marker(StreamEvent::start("m2")), Marker::Start);
        assert_eq!(marker(StreamEvent::finish()), Marker::Finish);
        assert_eq!(marker(StreamEvent::error("boom")), Marker::Terminal);
        assert_eq!(
            marker(DataEvent::new("weather", "w1", json!({})).into()),
            Marker::Other
        );
    }

    #[test]
    fn test_envelope_rejects_invalid_event() {
        assert!(shared().envelope(&StreamEvent::text_start("")).is_err());
    }

    #[test]
    fn test_claim_finalization() {
        let mut lifecycle = Lifecycle {
            closed: true,
            outstanding: 1,
            ..Lifecycle::default()
        };
        assert!(!Merger::<crate::sink::MemorySink>::claim_finalization(&mut lifecycle));
        lifecycle.outstanding = 0;
        assert!(Merger::<crate::sink::MemorySink>::claim_finalization(&mut lifecycle));
        assert!(!Merger::<crate::sink::MemorySink>::claim_finalization(&mut lifecycle));
        assert!(!lifecycle.accepts_writes());
    }

    #[tokio::test]
    async fn test_forward_reports_done() {
        let (tx, mut rx) = mpsc::channel(8);
        let events = vec![
            Ok::<_, std::convert::Infallible>(StreamEvent::text_start("t1")),
            Ok(StreamEvent::text_end("t1")),
        ];
        forward_sub_stream(
            7,
            futures::stream::iter(events),
            tx,
            Arc::new(shared()),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(rx.recv().await, Some(Command::Event(_))));
        assert!(matches!(rx.recv().await, Some(Command::Event(_))));
        assert!(matches!(rx.recv().await, Some(Command::SubStreamDone(7))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_reports_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let events = vec![
            Ok(StreamEvent::text_start("t1")),
            Err("model overloaded"),
        ];
        forward_sub_stream(
            1,
            futures::stream::iter(events),
            tx,
            Arc::new(shared()),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(rx.recv().await, Some(Command::Event(_))));
        match rx.recv().await {
            Some(Command::Fail { sub_stream, error }) => {
                assert_eq!(sub_stream, Some(1));
                assert_eq!(error.to_string(), "Sub-stream error: model overloaded");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forward_cancelled_before_start() {
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        token.cancel();
        forward_sub_stream(
            2,
            futures::stream::iter(vec![Ok::<_, String>(StreamEvent::StartStep)]),
            tx,
            Arc::new(shared()),
            token,
        )
        .await;

        assert!(matches!(rx.recv().await, Some(Command::SubStreamDone(2))));
    }
}
