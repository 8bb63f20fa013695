//! In-process pipeline from a [`StreamWriter`] to a [`UiMessageClient`].
//!
//! Frames travel through a bounded channel exactly as they would over a
//! transport, so both sides run their real code paths. Useful for tests,
//! previews, and replaying producers without a network.

use std::future::Future;

use bytes::Bytes;
use futures::{stream, StreamExt};
use partstream_core::Message;
use partstream_streaming::{
    ChannelSink, FrameReceiver, StreamResult, StreamSummary, StreamWriter, WriterSettings,
};
use partstream_ui::{ClientSettings, UiMessageClient};
use tracing::debug;

/// Result of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Messages as the client reconstructed them.
    pub messages: Vec<Message>,
    /// Writer-side report.
    pub summary: StreamSummary,
}

impl PipelineOutput {
    /// The first message, which is usually the only one.
    #[must_use]
    pub fn message(&self) -> Option<&Message> {
        self.messages.first()
    }
}

/// Connects a writer and a client in memory.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    writer: WriterSettings,
    client: ClientSettings,
    chunk_size: Option<usize>,
}

impl Pipeline {
    /// Create a pipeline with default settings on both ends.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the writer settings.
    #[must_use]
    pub fn with_writer_settings(mut self, settings: WriterSettings) -> Self {
        self.writer = settings;
        self
    }

    /// Set the client settings.
    #[must_use]
    pub fn with_client_settings(mut self, settings: ClientSettings) -> Self {
        self.client = settings;
        self
    }

    /// Re-split the byte stream into chunks of at most `size` bytes.
    ///
    /// Frames otherwise arrive whole.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Run `execute` as the producer and return what the client saw.
    ///
    /// The writer closes when `execute` returns `Ok`; an `Err` terminates the
    /// stream with an `error` frame, which the client records on the message.
    ///
    /// # Errors
    ///
    /// Returns the client's decoding error, if any.
    pub async fn run<F, Fut>(self, execute: F) -> StreamResult<PipelineOutput>
    where
        F: FnOnce(StreamWriter) -> Fut,
        Fut: Future<Output = StreamResult<()>> + Send + 'static,
    {
        let (sink, frames) = ChannelSink::new(self.writer.channel_capacity);
        let writer = StreamWriter::spawn(sink, self.writer);
        let task = execute(writer.clone());
        let producer = writer.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(()) => producer.close().await,
                Err(err) => producer.fail(err).await,
            }
        });

        let chunk_size = self.chunk_size;
        let body = frames.flat_map(move |frame| stream::iter(rechunk(frame, chunk_size)));
        let mut client = UiMessageClient::new(self.client);
        let consumed = client.consume(body).await;
        let summary = writer.finished().await;
        consumed?;

        debug!(
            message_id = %summary.message_id,
            frames = summary.frames_written,
            outcome = ?summary.outcome,
            "Pipeline finished"
        );
        Ok(PipelineOutput {
            messages: client.into_messages(),
            summary,
        })
    }
}

/// Decode every frame from `frames` into messages.
///
/// Pairs with [`ui_message_stream`](partstream_streaming::ui_message_stream).
///
/// # Errors
///
/// Returns the first decoding error.
pub async fn collect_messages(
    frames: FrameReceiver,
    settings: ClientSettings,
) -> StreamResult<Vec<Message>> {
    let mut client = UiMessageClient::new(settings);
    client
        .consume(frames.map(Ok::<_, std::io::Error>))
        .await?;
    Ok(client.into_messages())
}

fn rechunk(frame: Bytes, size: Option<usize>) -> Vec<Result<Bytes, std::io::Error>> {
    let Some(size) = size else {
        return vec![Ok(frame)];
    };
    (0..frame.len())
        .step_by(size)
        .map(|start| Ok(frame.slice(start..(start + size).min(frame.len()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use partstream_core::{
        DataPart, FinishReason, MessageStatus, Part, SchemaRegistry, StreamEvent, TextPart,
        ToolState,
    };
    use partstream_streaming::{
        ui_message_stream, GenerationFragment, GenerationOptions, StreamError, StreamOutcome,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    fn writer_settings() -> WriterSettings {
        WriterSettings::new().with_message_id("m1")
    }

    #[rstest]
    #[case::whole_frames(None)]
    #[case::one_byte(Some(1))]
    #[case::odd_chunks(Some(7))]
    #[tokio::test]
    async fn test_round_trip(#[case] chunk_size: Option<usize>) {
        let mut pipeline = Pipeline::new().with_writer_settings(writer_settings());
        if let Some(size) = chunk_size {
            pipeline = pipeline.with_chunk_size(size);
        }

        let output = pipeline
            .run(|writer| async move {
                writer
                    .write_data("weather", "w1", json!({"status": "loading"}))
                    .await?;
                writer.write(StreamEvent::text_start("t1")).await?;
                writer.write(StreamEvent::text_delta("t1", "Grüße ")).await?;
                writer.write(StreamEvent::text_delta("t1", "🌤️ 21°C")).await?;
                writer.write(StreamEvent::text_end("t1")).await?;
                writer
                    .write_data("weather", "w1", json!({"status": "done", "temp": 21}))
                    .await?;
                Ok(())
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.id, "m1");
        assert_eq!(message.status, MessageStatus::Finalized);
        assert_eq!(
            message.parts,
            vec![
                Part::Data(DataPart::new("weather", "w1", json!({"status": "done", "temp": 21}))),
                Part::Text(TextPart::done("Grüße 🌤️ 21°C")),
            ]
        );
        assert!(output.summary.outcome.is_completed());
    }

    #[tokio::test]
    async fn test_concurrent_merges_lose_and_duplicate_nothing() {
        let output = Pipeline::new()
            .with_writer_settings(writer_settings().with_channel_capacity(2))
            .run(|writer| async move {
                for source in 0..4 {
                    let events = (0..25).map(move |i| {
                        Ok::<_, StreamError>(StreamEvent::data(
                            "step",
                            format!("s{source}-{i}"),
                            json!({"source": source, "seq": i}),
                        ))
                    });
                    writer.merge(stream::iter(events))?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.status, MessageStatus::Finalized);
        let ids: Vec<&str> = message.data_parts("step").map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 100);

        // Order within each source is preserved.
        for source in 0..4 {
            let seqs: Vec<i64> = message
                .data_parts("step")
                .filter(|p| p.data["source"] == json!(source))
                .filter_map(|p| p.data["seq"].as_i64())
                .collect();
            assert_eq!(seqs, (0..25).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_repeated_close_yields_one_terminator() {
        let frames = ui_message_stream(writer_settings(), |writer| async move {
            writer.write(StreamEvent::StartStep).await?;
            writer.close().await;
            writer.close().await;
            Ok(())
        });
        let bytes = frames.collect_bytes().await;
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(text.matches("[DONE]").count(), 1);
        assert_eq!(text.matches("\"type\":\"finish\"").count(), 1);
    }

    #[tokio::test]
    async fn test_sub_stream_error_marks_message_errored() {
        let output = Pipeline::new()
            .with_writer_settings(writer_settings())
            .run(|writer| async move {
                let events = vec![
                    Ok(StreamEvent::data("step", "a", json!(1))),
                    Ok(StreamEvent::data("step", "b", json!(2))),
                    Err(StreamError::SubStream("model overloaded".into())),
                    Ok(StreamEvent::data("step", "c", json!(3))),
                ];
                writer.merge(stream::iter(events))?;
                Ok(())
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.status, MessageStatus::Errored);
        assert_eq!(message.data_parts("step").count(), 2);
        assert!(matches!(output.summary.outcome, StreamOutcome::Errored(_)));
    }

    #[tokio::test]
    async fn test_producer_error_reaches_client() {
        let output = Pipeline::new()
            .with_writer_settings(writer_settings().with_on_error(|err| format!("failed: {err}")))
            .run(|writer| async move {
                writer.write(StreamEvent::text_start("t1")).await?;
                Err(StreamError::Other("no quota".into()))
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.status, MessageStatus::Errored);
        assert_eq!(message.error.as_deref(), Some("failed: no quota"));
    }

    #[tokio::test]
    async fn test_abort_cancels_pending_sources() {
        let (tx, rx) = mpsc::unbounded::<Result<StreamEvent, StreamError>>();
        let output = Pipeline::new()
            .with_writer_settings(writer_settings())
            .run(|writer| async move {
                tx.unbounded_send(Ok(StreamEvent::data("step", "a", json!(1))))
                    .map_err(StreamError::from_err)?;
                let handle = writer.merge(rx)?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                writer.abort(Some("user stopped".into())).await;
                assert!(handle.is_cancelled());
                drop(tx);
                Ok(())
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.status, MessageStatus::Aborted);
        assert_eq!(message.data_parts("step").count(), 1);
        assert_eq!(output.summary.outcome, StreamOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_generation_fragments_become_parts() {
        let fragments = vec![
            Ok::<_, StreamError>(GenerationFragment::ReasoningDelta("Look up weather.".into())),
            Ok(GenerationFragment::ToolCallComplete {
                tool_call_id: "call_1".into(),
                tool_name: "weather".into(),
                args: json!({"city": "Berlin"}),
            }),
            Ok(GenerationFragment::ToolResult {
                tool_call_id: "call_1".into(),
                output: json!({"temp": 12}),
                success: true,
            }),
            Ok(GenerationFragment::NewStep),
            Ok(GenerationFragment::TextDelta("It is ".into())),
            Ok(GenerationFragment::TextDelta("12°C.".into())),
            Ok(GenerationFragment::Finish(FinishReason::Stop)),
        ];

        let output = Pipeline::new()
            .with_writer_settings(writer_settings())
            .with_chunk_size(3)
            .run(|writer| async move {
                writer.merge_generation(
                    stream::iter(fragments),
                    GenerationOptions::default(),
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.status, MessageStatus::Finalized);
        assert_eq!(message.text(), "It is 12°C.");
        let tool = message
            .parts
            .iter()
            .find_map(|part| match part {
                Part::DynamicTool(tool) => Some(tool),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool.state, ToolState::OutputAvailable);
        assert_eq!(tool.output, Some(json!({"temp": 12})));
    }

    fn paced_text(
        deltas: &[&str],
        delay: Duration,
    ) -> impl futures::Stream<Item = Result<GenerationFragment, StreamError>> + Send + Unpin + 'static
    {
        let fragments: Vec<_> = deltas
            .iter()
            .map(|delta| Ok(GenerationFragment::TextDelta((*delta).to_string())))
            .collect();
        Box::pin(stream::iter(fragments).then(move |fragment| async move {
            tokio::time::sleep(delay).await;
            fragment
        }))
    }

    #[tokio::test]
    async fn test_concurrent_generations_keep_their_text() {
        let output = Pipeline::new()
            .with_writer_settings(writer_settings())
            .run(|writer| async move {
                writer.merge_generation(
                    paced_text(&["alpha ", "beta ", "gamma"], Duration::from_millis(5)),
                    GenerationOptions::default(),
                )?;
                writer.merge_generation(
                    paced_text(&["one ", "two ", "three ", "four"], Duration::from_millis(9)),
                    GenerationOptions::default(),
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.status, MessageStatus::Finalized);
        let texts: HashSet<&str> = message.parts.iter().filter_map(Part::as_text).collect();
        assert_eq!(texts, HashSet::from(["alpha beta gamma", "one two three four"]));
        assert!(message.parts.iter().all(|part| !part.is_streaming()));
    }

    #[tokio::test]
    async fn test_schema_registry_on_both_ends() {
        let schemas = SchemaRegistry::new().register_fn("score", |data| {
            data.as_u64()
                .filter(|n| *n <= 10)
                .map(|_| ())
                .ok_or_else(|| "expected a number up to 10".to_string())
        });

        let output = Pipeline::new()
            .with_writer_settings(writer_settings().with_schemas(schemas))
            .run(|writer| async move {
                let rejected = writer.write_data("score", "s1", json!(11)).await;
                assert!(matches!(rejected, Err(StreamError::Encoding(_))));
                writer.write_data("score", "s1", json!(7)).await
            })
            .await
            .unwrap();

        let message = output.message().unwrap();
        assert_eq!(message.data_parts("score").next().unwrap().data, json!(7));
    }

    #[tokio::test]
    async fn test_collect_messages() {
        let frames = ui_message_stream(writer_settings(), |writer| async move {
            writer.write(StreamEvent::text_start("t1")).await?;
            writer.write(StreamEvent::text_delta("t1", "hi")).await?;
            writer.write(StreamEvent::text_end("t1")).await
        });

        let messages = collect_messages(frames, ClientSettings::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "hi");
    }

    #[test]
    fn test_rechunk() {
        let frame = Bytes::from_static(b"abcdefg");
        let chunks: Vec<Bytes> = rechunk(frame.clone(), Some(3))
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(chunks, vec!["abc", "def", "g"]);
        assert_eq!(rechunk(frame, None).len(), 1);
    }
}
