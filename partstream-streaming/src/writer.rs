//! The producer-side stream writer.
//!
//! A [`StreamWriter`] is a cheap, cloneable handle. Producers call
//! [`write`](StreamWriter::write) for individual events and
//! [`merge`](StreamWriter::merge) to splice whole event streams in
//! concurrently. A background task owns the sink and serializes everything
//! into one ordered sequence of frames.
//!
//! # Example
//!
//! ```ignore
//! use partstream_streaming::{MemorySink, StreamWriter, WriterSettings};
//! use partstream_core::StreamEvent;
//!
//! let sink = MemorySink::new();
//! let writer = StreamWriter::spawn(sink.clone(), WriterSettings::new().with_message_id("m1"));
//!
//! writer.write(StreamEvent::text_start("t1")).await?;
//! writer.write(StreamEvent::text_delta("t1", "Hello")).await?;
//! writer.write(StreamEvent::text_end("t1")).await?;
//! writer.close().await;
//!
//! let summary = writer.finished().await;
//! ```

use futures::Stream;
use partstream_core::identifier::generate_message_id;
use partstream_core::StreamEvent;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::FrameEncoder;
use crate::error::{StreamError, StreamResult};
use crate::generation::{GenerationEventStream, GenerationFragment, GenerationOptions};
use crate::merger::{forward_sub_stream, Command, Merger, Shared};
use crate::settings::WriterSettings;
use crate::sink::{ChannelSink, FrameReceiver, OutboundSink};

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Closed normally after all sources completed.
    Completed,
    /// Terminated by a failure; carries the internal error text.
    Errored(String),
    /// Terminated by [`StreamWriter::abort`].
    Aborted,
    /// The sink stopped accepting frames.
    Disconnected,
}

impl StreamOutcome {
    /// Whether the stream completed normally.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Final report of a writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Message id used for the automatic `start` frame.
    pub message_id: String,
    /// Frames delivered to the sink, including the terminator.
    pub frames_written: usize,
    /// Events accepted but dropped because the stream had already ended.
    pub discarded: usize,
    /// How the stream ended.
    pub outcome: StreamOutcome,
}

/// Handle to a merged sub-stream.
#[derive(Debug, Clone)]
pub struct MergeHandle {
    id: u64,
    token: CancellationToken,
}

impl MergeHandle {
    /// Sub-stream id, unique per writer.
    #[must_use]
    pub fn sub_stream_id(&self) -> u64 {
        self.id
    }

    /// Stop forwarding this sub-stream.
    ///
    /// Events already forwarded are kept; the writer treats the sub-stream
    /// as completed.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the sub-stream has been cancelled, directly or by the writer.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Cloneable handle for producing one outbound UI message stream.
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl StreamWriter {
    /// Start a writer that delivers frames to `sink`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn<S>(sink: S, settings: WriterSettings) -> Self
    where
        S: OutboundSink + 'static,
    {
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let encoder = match settings.schemas.clone() {
            Some(registry) => FrameEncoder::new().with_schemas(registry),
            None => FrameEncoder::new(),
        };
        let message_id = settings
            .message_id
            .clone()
            .unwrap_or_else(generate_message_id);
        let shared = Arc::new(Shared::new(message_id, encoder));

        tokio::spawn(Merger::new(sink, rx, Arc::clone(&shared), settings).run());

        Self { tx, shared }
    }

    /// Id announced by the automatic `start` frame.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.shared.message_id
    }

    /// Queue one event.
    ///
    /// Waits while the outbound channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Encoding`] immediately if the event is invalid
    /// or rejected by a registered schema, and [`StreamError::Closed`] once
    /// the writer has been closed or has finalized.
    pub async fn write(&self, event: StreamEvent) -> StreamResult<()> {
        let envelope = self.shared.envelope(&event)?;
        let permit = self.tx.reserve().await.map_err(|_| StreamError::Closed)?;
        let lifecycle = self.shared.lifecycle.lock();
        if !lifecycle.accepts_writes() {
            return Err(StreamError::Closed);
        }
        // Enqueued under the lock so nothing lands behind a `Close`.
        permit.send(Command::Event(envelope));
        drop(lifecycle);
        Ok(())
    }

    /// Queue a `data-<kind>` event.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn write_data(
        &self,
        kind: impl AsRef<str>,
        id: impl Into<String>,
        data: Value,
    ) -> StreamResult<()> {
        self.write(StreamEvent::data(kind, id, data)).await
    }

    /// Forward every event of `stream` into this writer concurrently.
    ///
    /// Events of one sub-stream keep their relative order. An error item
    /// ends the sub-stream and terminates the whole writer with an `error`
    /// frame.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] if the writer no longer accepts input.
    pub fn merge<St, E>(&self, stream: St) -> StreamResult<MergeHandle>
    where
        St: Stream<Item = Result<StreamEvent, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (id, token) = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if !lifecycle.accepts_writes() {
                return Err(StreamError::Closed);
            }
            lifecycle.outstanding += 1;
            lifecycle.next_sub_stream += 1;
            (lifecycle.next_sub_stream, self.shared.token.child_token())
        };

        debug!(message_id = %self.shared.message_id, sub_stream = id, "Merging sub-stream");
        tokio::spawn(forward_sub_stream(
            id,
            stream,
            self.tx.clone(),
            Arc::clone(&self.shared),
            token.clone(),
        ));

        Ok(MergeHandle { id, token })
    }

    /// Merge a model generation, translating fragments into block events.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] if the writer no longer accepts input.
    pub fn merge_generation<St, E>(
        &self,
        fragments: St,
        options: GenerationOptions,
    ) -> StreamResult<MergeHandle>
    where
        St: Stream<Item = Result<GenerationFragment, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.merge(GenerationEventStream::new(fragments, options))
    }

    /// Stop accepting direct writes and merges.
    ///
    /// The stream finalizes once every merged sub-stream has completed.
    /// Calling this more than once has no further effect.
    pub async fn close(&self) {
        let Ok(permit) = self.tx.reserve().await else {
            return;
        };
        let mut lifecycle = self.shared.lifecycle.lock();
        if !lifecycle.accepts_writes() {
            return;
        }
        lifecycle.closed = true;
        permit.send(Command::Close);
    }

    /// Terminate the stream with an `error` frame.
    ///
    /// Pending sub-streams are cancelled. No-op once the stream has ended.
    pub async fn fail(&self, error: StreamError) {
        self.terminal_command(Command::Fail {
            sub_stream: None,
            error,
        })
        .await;
    }

    /// Terminate the stream with an `abort` frame.
    ///
    /// Pending sub-streams are cancelled. No-op once the stream has ended.
    pub async fn abort(&self, reason: Option<String>) {
        self.terminal_command(Command::Abort(reason)).await;
        self.shared.token.cancel();
    }

    async fn terminal_command(&self, command: Command) {
        let Ok(permit) = self.tx.reserve().await else {
            return;
        };
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.finalized || lifecycle.terminating {
            return;
        }
        lifecycle.terminating = true;
        permit.send(command);
    }

    /// Whether the writer still accepts direct writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.lifecycle.lock().accepts_writes()
    }

    /// Wait for the stream to finalize.
    pub async fn finished(&self) -> StreamSummary {
        let mut rx = self.shared.summary.subscribe();
        let summary = match rx.wait_for(Option::is_some).await {
            Ok(summary) => summary.clone(),
            Err(_) => None,
        };
        summary.unwrap_or_else(|| StreamSummary {
            message_id: self.shared.message_id.clone(),
            frames_written: 0,
            discarded: 0,
            outcome: StreamOutcome::Disconnected,
        })
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

/// Run `execute` against a fresh writer and return the outbound frames.
///
/// The writer closes when `execute` returns `Ok` and all merged
/// sub-streams have completed. An `Err` from `execute` terminates the
/// stream with an `error` frame.
pub fn ui_message_stream<F, Fut>(settings: WriterSettings, execute: F) -> FrameReceiver
where
    F: FnOnce(StreamWriter) -> Fut,
    Fut: Future<Output = StreamResult<()>> + Send + 'static,
{
    let (sink, receiver) = ChannelSink::new(settings.channel_capacity);
    let writer = StreamWriter::spawn(sink, settings);
    let task = execute(writer.clone());

    tokio::spawn(async move {
        match task.await {
            Ok(()) => writer.close().await,
            Err(err) => writer.fail(err).await,
        }
    });

    receiver
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Frame, FrameDecoder};
    use crate::sink::{ChannelSink, MemorySink};
    use futures::stream;
    use partstream_core::{RequiredFields, SchemaRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn decode(bytes: &[u8]) -> Vec<Frame> {
        FrameDecoder::new().decode_all(bytes).unwrap()
    }

    fn event_types(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .map(|f| match f {
                Frame::Event(e) => e.event_type().to_string(),
                Frame::Done => "[DONE]".to_string(),
            })
            .collect()
    }

    fn settings() -> WriterSettings {
        WriterSettings::new().with_message_id("m1")
    }

    #[tokio::test]
    async fn test_write_brackets_with_start_and_finish() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(sink.clone(), settings());

        writer.write(StreamEvent::text_start("t1")).await.unwrap();
        writer.write(StreamEvent::text_delta("t1", "Hello")).await.unwrap();
        writer.write(StreamEvent::text_end("t1")).await.unwrap();
        writer.close().await;

        let summary = writer.finished().await;
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(summary.frames_written, 6);
        assert!(sink.is_closed());

        let frames = decode(&sink.contents());
        assert_eq!(
            event_types(&frames),
            vec!["start", "text-start", "text-delta", "text-end", "finish", "[DONE]"]
        );
        assert_eq!(frames[0], Frame::Event(StreamEvent::start("m1")));
    }

    #[tokio::test]
    async fn test_explicit_start_and_finish_are_not_duplicated() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(sink.clone(), settings());

        writer.write(StreamEvent::start("custom")).await.unwrap();
        writer.write(StreamEvent::finish()).await.unwrap();
        writer.write(StreamEvent::finish()).await.unwrap();
        writer.close().await;
        writer.finished().await;

        let frames = decode(&sink.contents());
        assert_eq!(event_types(&frames), vec!["start", "finish", "[DONE]"]);
        assert_eq!(frames[0], Frame::Event(StreamEvent::start("custom")));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(sink.clone(), settings());

        writer.close().await;
        writer.close().await;
        let summary = writer.finished().await;
        writer.close().await;

        assert_eq!(summary.outcome, StreamOutcome::Completed);
        let frames = decode(&sink.contents());
        assert_eq!(event_types(&frames), vec!["start", "finish", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let writer = StreamWriter::spawn(MemorySink::new(), settings());
        writer.close().await;
        let err = writer.write(StreamEvent::StartStep).await.unwrap_err();
        assert!(err.is_closed());

        writer.finished().await;
        let err = writer.write(StreamEvent::StartStep).await.unwrap_err();
        assert!(err.is_closed());
        assert!(!writer.is_open());
    }

    #[tokio::test]
    async fn test_invalid_event_fails_synchronously() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(
            sink.clone(),
            settings().with_schemas(
                SchemaRegistry::new().register("weather", RequiredFields::new(["city"])),
            ),
        );

        let err = writer
            .write_data("weather", "w1", json!({"temp": 20}))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Encoding(_)));
        assert!(writer.write(StreamEvent::text_delta("", "x")).await.is_err());

        writer
            .write_data("weather", "w1", json!({"city": "SF"}))
            .await
            .unwrap();
        writer.close().await;
        writer.finished().await;

        let frames = decode(&sink.contents());
        assert_eq!(
            event_types(&frames),
            vec!["start", "data-weather", "finish", "[DONE]"]
        );
    }

    #[tokio::test]
    async fn test_close_waits_for_merged_streams() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(sink.clone(), settings());

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<StreamEvent, String>>();
        writer.merge(rx).unwrap();
        writer.close().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sink.is_closed());

        tx.unbounded_send(Ok(StreamEvent::data("progress", "p1", json!(50))))
            .unwrap();
        drop(tx);

        let summary = writer.finished().await;
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        let frames = decode(&sink.contents());
        assert_eq!(
            event_types(&frames),
            vec!["start", "data-progress", "finish", "[DONE]"]
        );
    }

    #[tokio::test]
    async fn test_merge_after_close_fails() {
        let writer = StreamWriter::spawn(MemorySink::new(), settings());
        writer.close().await;
        let result = writer.merge(stream::empty::<Result<StreamEvent, String>>());
        assert!(matches!(result, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_sub_stream_error_terminates_with_error_frame() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(
            sink.clone(),
            settings().with_on_error(|e| format!("oops: {e}")),
        );

        let events = vec![
            Ok(StreamEvent::data("step", "s1", json!(1))),
            Ok(StreamEvent::data("step", "s2", json!(2))),
            Err("model overloaded".to_string()),
            Ok(StreamEvent::data("step", "s3", json!(3))),
        ];
        writer.merge(stream::iter(events)).unwrap();

        let summary = writer.finished().await;
        assert_eq!(
            summary.outcome,
            StreamOutcome::Errored("Sub-stream error: model overloaded".into())
        );

        let frames = decode(&sink.contents());
        assert_eq!(
            event_types(&frames),
            vec!["start", "data-step", "data-step", "error", "[DONE]"]
        );
        assert_eq!(
            frames[3],
            Frame::Event(StreamEvent::error("oops: Sub-stream error: model overloaded"))
        );
        assert!(writer.write(StreamEvent::StartStep).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_one_sub_stream() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(sink.clone(), settings());

        let handle = writer.merge(stream::pending::<Result<StreamEvent, String>>()).unwrap();
        writer.write(StreamEvent::StartStep).await.unwrap();
        writer.close().await;

        handle.cancel();
        assert!(handle.is_cancelled());

        let summary = writer.finished().await;
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        let frames = decode(&sink.contents());
        assert_eq!(
            event_types(&frames),
            vec!["start", "start-step", "finish", "[DONE]"]
        );
    }

    #[tokio::test]
    async fn test_abort_cancels_sub_streams() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(sink.clone(), settings());

        let handle = writer.merge(stream::pending::<Result<StreamEvent, String>>()).unwrap();
        writer.abort(Some("user stopped".into())).await;

        let summary = writer.finished().await;
        assert_eq!(summary.outcome, StreamOutcome::Aborted);
        assert!(handle.is_cancelled());

        let frames = decode(&sink.contents());
        assert_eq!(event_types(&frames), vec!["start", "abort", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_everything() {
        let sink = MemorySink::failing_after(2);
        let writer = StreamWriter::spawn(sink.clone(), settings());
        let handle = writer.merge(stream::pending::<Result<StreamEvent, String>>()).unwrap();

        writer.write(StreamEvent::StartStep).await.unwrap();
        writer.write(StreamEvent::FinishStep).await.unwrap();

        let summary = writer.finished().await;
        assert_eq!(summary.outcome, StreamOutcome::Disconnected);
        assert_eq!(summary.frames_written, 2);
        assert!(handle.is_cancelled());
        assert!(writer.write(StreamEvent::StartStep).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_disconnect_cancels_sub_streams() {
        let (sink, receiver) = ChannelSink::new(4);
        let writer = StreamWriter::spawn(sink, settings());
        let handle = writer.merge(stream::pending::<Result<StreamEvent, String>>()).unwrap();
        drop(receiver);

        let summary = tokio::time::timeout(Duration::from_secs(1), writer.finished())
            .await
            .expect("merger should notice the dropped receiver");
        assert_eq!(summary.outcome, StreamOutcome::Disconnected);
        assert_eq!(summary.frames_written, 0);
        assert!(handle.is_cancelled());
        assert!(writer.write(StreamEvent::StartStep).await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_all_handles_finalizes() {
        let sink = MemorySink::new();
        let writer = StreamWriter::spawn(sink.clone(), settings().with_send_done(false));
        writer.write(StreamEvent::StartStep).await.unwrap();
        drop(writer);

        for _ in 0..50 {
            if sink.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sink.is_closed());
        let frames = decode(&sink.contents());
        assert_eq!(event_types(&frames), vec!["start", "start-step", "finish"]);
    }

    #[tokio::test]
    async fn test_slow_sink_applies_backpressure() {
        let (sink, frames) = ChannelSink::new(1);
        let writer = StreamWriter::spawn(sink, settings().with_channel_capacity(1));

        let mut written = 0;
        let mut blocked = false;
        for i in 0..16 {
            let write = writer.write(StreamEvent::data("step", format!("s{i}"), json!(i)));
            match tokio::time::timeout(Duration::from_millis(50), write).await {
                Ok(result) => {
                    result.unwrap();
                    written += 1;
                }
                Err(_) => {
                    blocked = true;
                    break;
                }
            }
        }
        assert!(blocked);

        let closer = tokio::spawn({
            let writer = writer.clone();
            async move { writer.close().await }
        });
        let frames = decode(&frames.collect_bytes().await);
        closer.await.unwrap();

        // start + accepted data events + finish + [DONE]
        assert_eq!(frames.len(), written + 3);
        assert_eq!(writer.finished().await.outcome, StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn test_ui_message_stream() {
        let receiver = ui_message_stream(settings(), |writer| async move {
            writer.write(StreamEvent::text_start("t1")).await?;
            writer.write(StreamEvent::text_delta("t1", "hi")).await?;
            writer.write(StreamEvent::text_end("t1")).await?;
            Ok(())
        });

        let frames = decode(&receiver.collect_bytes().await);
        assert_eq!(
            event_types(&frames),
            vec!["start", "text-start", "text-delta", "text-end", "finish", "[DONE]"]
        );
    }

    #[tokio::test]
    async fn test_ui_message_stream_execute_error() {
        let receiver = ui_message_stream(settings(), |writer| async move {
            writer.write(StreamEvent::StartStep).await?;
            Err(StreamError::Other("tool crashed".into()))
        });

        let frames = decode(&receiver.collect_bytes().await);
        assert_eq!(
            event_types(&frames),
            vec!["start", "start-step", "error", "[DONE]"]
        );
        assert_eq!(
            frames[2],
            Frame::Event(StreamEvent::error(crate::settings::DEFAULT_ERROR_TEXT))
        );
    }
}
