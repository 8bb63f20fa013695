//! Folding stream events into messages.
//!
//! [`MessageReducer`] owns every message seen on a stream. Each message
//! moves `open → finalized`, or to `errored`/`aborted`; once terminal it
//! ignores further events. Content events go to the message opened by the
//! most recent `start`.

use indexmap::IndexMap;
use partstream_core::{DataEvent, Message, MessageStatus, Role, SchemaRegistry, StreamEvent};
use std::fmt;
use tracing::{debug, warn};

use crate::accumulator::MessageAccumulator;

/// Callback invoked for every accepted data event, transient or not.
pub type DataCallback = Box<dyn FnMut(&DataEvent) + Send>;

/// Configuration for a [`MessageReducer`].
#[derive(Debug, Clone, Default)]
pub struct ReducerSettings {
    /// Schemas checked for every inbound data event.
    pub schemas: Option<SchemaRegistry>,
    /// Role assigned to messages created by `start`.
    pub role: Role,
}

impl ReducerSettings {
    /// Create default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate data events against `registry`.
    #[must_use]
    pub fn with_schemas(mut self, registry: SchemaRegistry) -> Self {
        self.schemas = Some(registry);
        self
    }

    /// Set the role of new messages.
    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

/// Accumulates stream events into ordered [`Message`]s.
pub struct MessageReducer {
    settings: ReducerSettings,
    messages: IndexMap<String, MessageAccumulator>,
    current: Option<String>,
    generated_ids: usize,
    dropped: usize,
    on_data: Option<DataCallback>,
}

impl Default for MessageReducer {
    fn default() -> Self {
        Self::new(ReducerSettings::default())
    }
}

impl MessageReducer {
    /// Create a reducer.
    #[must_use]
    pub fn new(settings: ReducerSettings) -> Self {
        Self {
            settings,
            messages: IndexMap::new(),
            current: None,
            generated_ids: 0,
            dropped: 0,
            on_data: None,
        }
    }

    /// Register a callback for data events.
    #[must_use]
    pub fn with_on_data<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&DataEvent) + Send + 'static,
    {
        self.on_data = Some(Box::new(callback));
        self
    }

    /// Seed the reducer with existing messages, for example chat history.
    ///
    /// A message with the same id as a later `start` continues to receive
    /// events while it is open.
    pub fn insert(&mut self, message: Message) {
        self.messages
            .insert(message.id.clone(), MessageAccumulator::new(message));
    }

    /// Apply one event.
    ///
    /// Returns a snapshot of the message the event changed, or `None` when
    /// the event was dropped or left no trace in the message (a transient
    /// data event).
    pub fn apply(&mut self, event: &StreamEvent) -> Option<Message> {
        if let StreamEvent::Start {
            message_id,
            message_metadata,
        } = event
        {
            return self.start(message_id.as_deref(), message_metadata.clone());
        }

        let Some(id) = self.current.clone() else {
            return self.drop_event(event, "no open message");
        };
        let Some(acc) = self.messages.get_mut(&id) else {
            return self.drop_event(event, "no open message");
        };
        if acc.message().status.is_terminal() {
            return self.drop_event(event, "message already ended");
        }

        match event {
            StreamEvent::Finish {
                finish_reason,
                message_metadata,
            } => {
                acc.close_open_blocks();
                let message = acc.message_mut();
                message.status = MessageStatus::Finalized;
                message.finish_reason = *finish_reason;
                if let Some(metadata) = message_metadata {
                    message.merge_metadata(metadata.clone());
                }
                debug!(message_id = %id, "Message finalized");
            }
            StreamEvent::Error { error_text } => {
                let message = acc.message_mut();
                message.status = MessageStatus::Errored;
                message.error = Some(error_text.clone()).filter(|text| !text.is_empty());
                warn!(message_id = %id, error = %error_text, "Message errored");
            }
            StreamEvent::Abort { reason } => {
                acc.message_mut().status = MessageStatus::Aborted;
                debug!(message_id = %id, reason = ?reason, "Message aborted");
            }
            StreamEvent::MessageMetadata { message_metadata } => {
                acc.message_mut().merge_metadata(message_metadata.clone());
            }
            // Blocks end with their own `*-end` events. Another merged
            // generation may still be streaming into its step.
            StreamEvent::FinishStep => {}
            StreamEvent::Data(data) => return self.apply_data(&id, data, event),
            content => {
                if !acc.apply(content).is_applied() {
                    return self.drop_event(event, "invalid transition");
                }
            }
        }

        self.snapshot(&id)
    }

    /// Apply a batch of events in order.
    pub fn apply_all<'a, I>(&mut self, events: I)
    where
        I: IntoIterator<Item = &'a StreamEvent>,
    {
        for event in events {
            self.apply(event);
        }
    }

    /// Mark the current message as errored.
    ///
    /// Used when the stream itself fails, for example on undecodable bytes.
    pub fn fail_current(&mut self, error_text: impl Into<String>) -> Option<Message> {
        let id = self.current.clone()?;
        let acc = self.messages.get_mut(&id)?;
        if acc.message().status.is_terminal() {
            return None;
        }
        let message = acc.message_mut();
        message.status = MessageStatus::Errored;
        message.error = Some(error_text.into());
        self.snapshot(&id)
    }

    /// Messages in first-seen order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values().map(MessageAccumulator::message)
    }

    /// Message by id.
    #[must_use]
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id).map(MessageAccumulator::message)
    }

    /// The message receiving content events.
    #[must_use]
    pub fn current_message(&self) -> Option<&Message> {
        self.current.as_deref().and_then(|id| self.message(id))
    }

    /// Number of events dropped so far.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Consume the reducer, returning all messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
            .into_values()
            .map(MessageAccumulator::into_message)
            .collect()
    }

    fn start(&mut self, message_id: Option<&str>, metadata: Option<serde_json::Value>) -> Option<Message> {
        let id = match message_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                self.generated_ids += 1;
                format!("msg-{}", self.generated_ids)
            }
        };

        let ended = self
            .messages
            .get(&id)
            .map(|acc| acc.message().status.is_terminal());
        match ended {
            Some(true) => {
                self.dropped += 1;
                warn!(message_id = %id, "Dropping start for a message that already ended");
                return None;
            }
            Some(false) => debug!(message_id = %id, "Continuing open message"),
            None => {
                debug!(message_id = %id, "Message started");
                self.messages.insert(
                    id.clone(),
                    MessageAccumulator::new(Message::new(id.clone(), self.settings.role)),
                );
            }
        }

        if let (Some(metadata), Some(acc)) = (metadata, self.messages.get_mut(&id)) {
            acc.message_mut().merge_metadata(metadata);
        }
        self.current = Some(id.clone());
        self.snapshot(&id)
    }

    fn apply_data(&mut self, id: &str, data: &DataEvent, event: &StreamEvent) -> Option<Message> {
        if let Some(registry) = &self.settings.schemas {
            if let Err(err) = registry.validate(data.kind(), &data.data) {
                self.dropped += 1;
                warn!(message_id = %id, error = %err, "Dropping data part that fails its schema");
                return None;
            }
        }

        if data.transient {
            self.notify_data(data);
            return None;
        }

        let applied = self
            .messages
            .get_mut(id)
            .is_some_and(|acc| acc.apply(event).is_applied());
        if !applied {
            return self.drop_event(event, "invalid transition");
        }
        self.notify_data(data);
        self.snapshot(id)
    }

    fn notify_data(&mut self, data: &DataEvent) {
        if let Some(callback) = self.on_data.as_mut() {
            callback(data);
        }
    }

    fn drop_event(&mut self, event: &StreamEvent, reason: &str) -> Option<Message> {
        self.dropped += 1;
        warn!(
            event_type = event.event_type(),
            message_id = ?self.current,
            reason,
            "Dropping event"
        );
        None
    }

    fn snapshot(&self, id: &str) -> Option<Message> {
        self.message(id).cloned()
    }
}

impl fmt::Debug for MessageReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReducer")
            .field("settings", &self.settings)
            .field("messages", &self.messages.len())
            .field("current", &self.current)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partstream_core::{DataPart, FinishReason, Part, PartState, RequiredFields, TextPart};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn reducer() -> MessageReducer {
        MessageReducer::default()
    }

    #[test]
    fn test_text_accumulation() {
        let mut reducer = reducer();
        reducer.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::text_start("t1"),
            StreamEvent::text_delta("t1", "Hel"),
            StreamEvent::text_delta("t1", "lo "),
            StreamEvent::text_delta("t1", "world"),
            StreamEvent::text_end("t1"),
            StreamEvent::finish(),
        ]);

        let message = reducer.message("m1").unwrap();
        assert_eq!(message.text(), "Hello world");
        assert_eq!(message.status, MessageStatus::Finalized);
        assert_eq!(message.parts, vec![Part::Text(TextPart::done("Hello world"))]);
    }

    #[test]
    fn test_data_upsert() {
        let mut reducer = reducer();
        reducer.apply(&StreamEvent::start("m1"));
        reducer.apply(&StreamEvent::data("weather", "w1", json!({"status": "loading"})));
        let snapshot = reducer
            .apply(&StreamEvent::data("weather", "w1", json!({"status": "done", "temp": 21})))
            .unwrap();

        assert_eq!(
            snapshot.parts,
            vec![Part::Data(DataPart::new(
                "weather",
                "w1",
                json!({"status": "done", "temp": 21})
            ))]
        );
    }

    #[test]
    fn test_error_keeps_partial_content() {
        let mut reducer = reducer();
        reducer.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::text_start("t1"),
            StreamEvent::text_delta("t1", "partial"),
            StreamEvent::error("model overloaded"),
        ]);

        let message = reducer.message("m1").unwrap();
        assert_eq!(message.status, MessageStatus::Errored);
        assert_eq!(message.error.as_deref(), Some("model overloaded"));
        assert_eq!(message.text(), "partial");
    }

    #[test]
    fn test_late_events_are_dropped() {
        let mut reducer = reducer();
        reducer.apply_all(&[StreamEvent::start("m1"), StreamEvent::finish()]);

        assert!(reducer.apply(&StreamEvent::text_start("t1")).is_none());
        assert!(reducer.apply(&StreamEvent::finish()).is_none());
        assert!(reducer.apply(&StreamEvent::start("m1")).is_none());
        assert_eq!(reducer.dropped(), 3);
        assert!(reducer.message("m1").unwrap().parts.is_empty());
    }

    #[test]
    fn test_content_without_start_is_dropped() {
        let mut reducer = reducer();
        assert!(reducer.apply(&StreamEvent::text_start("t1")).is_none());
        assert_eq!(reducer.messages().count(), 0);
    }

    #[test]
    fn test_invalid_transition_dropped() {
        let mut reducer = reducer();
        reducer.apply(&StreamEvent::start("m1"));
        assert!(reducer.apply(&StreamEvent::text_delta("ghost", "x")).is_none());
        assert_eq!(reducer.dropped(), 1);
        assert_eq!(reducer.message("m1").unwrap().status, MessageStatus::Open);
    }

    #[test]
    fn test_generated_ids_are_deterministic() {
        let events = vec![
            StreamEvent::Start {
                message_id: None,
                message_metadata: None,
            },
            StreamEvent::finish(),
            StreamEvent::Start {
                message_id: None,
                message_metadata: None,
            },
        ];

        let ids = |events: &[StreamEvent]| {
            let mut reducer = reducer();
            reducer.apply_all(events);
            reducer.messages().map(|m| m.id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&events), vec!["msg-1", "msg-2"]);
        assert_eq!(ids(&events), ids(&events));
    }

    #[test]
    fn test_multiple_messages_stay_independent() {
        let mut reducer = reducer();
        reducer.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::data("weather", "w1", json!(1)),
            StreamEvent::finish(),
            StreamEvent::start("m2"),
            StreamEvent::data("weather", "w1", json!(2)),
            StreamEvent::error("boom"),
        ]);

        let m1 = reducer.message("m1").unwrap();
        assert_eq!(m1.status, MessageStatus::Finalized);
        assert_eq!(m1.data_parts("weather").next().unwrap().data, json!(1));
        assert_eq!(reducer.message("m2").unwrap().status, MessageStatus::Errored);
    }

    #[test]
    fn test_transient_data_goes_to_callback_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut reducer = reducer().with_on_data(move |data| {
            sink.lock().unwrap().push((data.kind().to_string(), data.transient));
        });

        reducer.apply(&StreamEvent::start("m1"));
        let notification = StreamEvent::Data(DataEvent::new("toast", "n1", json!("saved")).transient());
        assert!(reducer.apply(&notification).is_none());
        reducer.apply(&StreamEvent::data("weather", "w1", json!({})));

        assert_eq!(reducer.message("m1").unwrap().parts.len(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("toast".to_string(), true), ("weather".to_string(), false)]
        );
    }

    #[test]
    fn test_schema_rejection() {
        let mut reducer = MessageReducer::new(ReducerSettings::new().with_schemas(
            SchemaRegistry::new().register("weather", RequiredFields::new(["city"])),
        ));
        reducer.apply(&StreamEvent::start("m1"));

        assert!(reducer
            .apply(&StreamEvent::data("weather", "w1", json!({"temp": 3})))
            .is_none());
        assert!(reducer
            .apply(&StreamEvent::data("weather", "w1", json!({"city": "SF"})))
            .is_some());
        assert_eq!(reducer.message("m1").unwrap().parts.len(), 1);
        assert_eq!(reducer.dropped(), 1);
    }

    #[test]
    fn test_block_ids_reused_across_steps() {
        let mut reducer = reducer();
        reducer.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::text_start("0"),
            StreamEvent::text_delta("0", "first"),
            StreamEvent::text_end("0"),
            StreamEvent::StartStep,
            StreamEvent::text_start("0"),
            StreamEvent::text_delta("0", "second"),
            StreamEvent::text_end("0"),
            StreamEvent::finish(),
        ]);

        let message = reducer.message("m1").unwrap();
        assert_eq!(
            message.parts,
            vec![
                Part::Text(TextPart::done("first")),
                Part::StepStart,
                Part::Text(TextPart::done("second")),
            ]
        );
        assert_eq!(reducer.dropped(), 0);
    }

    #[test]
    fn test_finish_step_leaves_concurrent_blocks_open() {
        let mut reducer = reducer();
        reducer.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::StartStep,
            StreamEvent::StartStep,
            StreamEvent::text_start("a"),
            StreamEvent::text_start("b"),
            StreamEvent::text_delta("a", "A"),
            StreamEvent::text_end("a"),
            StreamEvent::FinishStep,
            StreamEvent::text_delta("b", "B"),
            StreamEvent::text_end("b"),
            StreamEvent::FinishStep,
        ]);

        let message = reducer.message("m1").unwrap();
        let texts: Vec<_> = message.parts.iter().filter_map(Part::as_text).collect();
        assert_eq!(texts, vec!["A", "B"]);
        assert_eq!(reducer.dropped(), 0);
    }

    #[test]
    fn test_finish_closes_blocks_and_records_reason() {
        let mut reducer = reducer();
        reducer.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::StartStep,
            StreamEvent::reasoning_start("r1"),
            StreamEvent::reasoning_delta("r1", "hmm"),
            StreamEvent::FinishStep,
        ]);
        assert!(reducer.current_message().unwrap().parts[1].is_streaming());
        reducer.apply(&StreamEvent::finish_with_reason(FinishReason::Length));

        let message = reducer.message("m1").unwrap();
        assert_eq!(message.parts[0], Part::StepStart);
        assert!(matches!(
            &message.parts[1],
            Part::Reasoning(p) if p.state == PartState::Done && p.text == "hmm"
        ));
        assert_eq!(message.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_metadata_and_abort() {
        let mut reducer = reducer();
        reducer.apply(&StreamEvent::Start {
            message_id: Some("m1".into()),
            message_metadata: Some(json!({"model": "small"})),
        });
        reducer.apply(&StreamEvent::MessageMetadata {
            message_metadata: json!({"tokens": 7}),
        });
        reducer.apply(&StreamEvent::Abort { reason: None });

        let message = reducer.message("m1").unwrap();
        assert_eq!(message.metadata, Some(json!({"model": "small", "tokens": 7})));
        assert_eq!(message.status, MessageStatus::Aborted);
    }

    #[test]
    fn test_fail_current() {
        let mut reducer = reducer();
        assert!(reducer.fail_current("nothing open").is_none());
        reducer.apply(&StreamEvent::start("m1"));
        let message = reducer.fail_current("bad frame").unwrap();
        assert_eq!(message.status, MessageStatus::Errored);
        assert!(reducer.fail_current("again").is_none());
    }

    #[test]
    fn test_message_round_trip_through_events() {
        let mut source = reducer();
        source.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::text_start("t1"),
            StreamEvent::text_delta("t1", "Hi"),
            StreamEvent::text_end("t1"),
            StreamEvent::data("weather", "w1", json!({"city": "SF"})),
            StreamEvent::source_url("s1", "https://example.com", Some("Example".into())),
            StreamEvent::finish(),
        ]);
        let original = source.message("m1").unwrap().clone();

        let mut replay = reducer();
        replay.apply_all(&original.to_events());
        assert_eq!(replay.message("m1"), Some(&original));
    }

    #[test]
    fn test_round_trip_tool_without_input_and_bare_error() {
        let mut source = reducer();
        source.apply_all(&[
            StreamEvent::start("m1"),
            StreamEvent::ToolInputStart {
                tool_call_id: "call-1".into(),
                tool_name: "search".into(),
            },
            StreamEvent::ToolOutputAvailable {
                tool_call_id: "call-1".into(),
                output: json!({"hits": 3}),
            },
            StreamEvent::error(""),
        ]);
        let original = source.message("m1").unwrap().clone();
        assert_eq!(original.status, MessageStatus::Errored);
        assert_eq!(original.error, None);

        let mut replay = reducer();
        replay.apply_all(&original.to_events());
        assert_eq!(replay.message("m1"), Some(&original));
        assert_eq!(replay.dropped(), 0);
    }
}
