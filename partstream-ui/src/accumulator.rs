//! Per-message part accumulation.
//!
//! Maps part identities to positions in the message so that updates land on
//! the part they belong to and parts keep first-appearance order.

use partstream_core::{
    is_valid_transition, DataPart, FilePart, Message, Part, PartKey, PartState, ReasoningPart,
    SourceDocumentPart, SourceUrlPart, StreamEvent, TextPart, ToolPart, ToolState,
};
use serde_json::Value;
use std::collections::HashMap;

/// Result of applying a content event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new part was appended.
    Appended,
    /// An existing part changed.
    Updated,
    /// The event does not fit the current part state.
    Rejected,
}

impl Applied {
    /// Whether the message changed.
    #[must_use]
    pub fn is_applied(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Accumulates events into one [`Message`].
#[derive(Debug, Clone)]
pub struct MessageAccumulator {
    message: Message,
    index: HashMap<PartKey, usize>,
    /// Raw tool input text by tool call id, until the call leaves `input-streaming`.
    tool_inputs: HashMap<String, String>,
}

impl MessageAccumulator {
    /// Start accumulating into `message`.
    ///
    /// Existing keyed parts are indexed so later events update them.
    #[must_use]
    pub fn new(message: Message) -> Self {
        let index = message
            .parts
            .iter()
            .enumerate()
            .filter_map(|(i, part)| part_key(part).map(|key| (key, i)))
            .collect();
        Self {
            message,
            index,
            tool_inputs: HashMap::new(),
        }
    }

    /// The message so far.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Mutable access to the message envelope.
    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Consume the accumulator.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Part with the given identity.
    #[must_use]
    pub fn part(&self, key: &PartKey) -> Option<&Part> {
        self.index.get(key).and_then(|&i| self.message.parts.get(i))
    }

    /// Apply a content event.
    ///
    /// Lifecycle events are not content and are rejected here.
    pub fn apply(&mut self, event: &StreamEvent) -> Applied {
        let key = event.part_key();
        let current = key.as_ref().and_then(|k| self.part(k));
        if event.is_lifecycle() || !is_valid_transition(current, event) {
            return Applied::Rejected;
        }

        if let Some(existing) = key.as_ref().filter(|k| self.index.contains_key(*k)) {
            self.update_part(existing, event);
            return Applied::Updated;
        }
        match self.create_part(event) {
            Some(part) => {
                self.push(key, part);
                Applied::Appended
            }
            None => Applied::Rejected,
        }
    }

    /// Mark every streaming text and reasoning block as done.
    ///
    /// Their block ids are released, so a later `*-start` reusing an id
    /// opens a new part.
    pub fn close_open_blocks(&mut self) {
        for part in &mut self.message.parts {
            match part {
                Part::Text(p) => p.state = PartState::Done,
                Part::Reasoning(p) => p.state = PartState::Done,
                _ => {}
            }
        }
        self.index
            .retain(|key, _| !matches!(key, PartKey::Text(_) | PartKey::Reasoning(_)));
    }

    fn push(&mut self, key: Option<PartKey>, part: Part) {
        if let Some(key) = key {
            self.index.insert(key, self.message.parts.len());
        }
        self.message.parts.push(part);
    }

    /// Part created by an event that targets no existing part.
    fn create_part(&mut self, event: &StreamEvent) -> Option<Part> {
        let part = match event {
            StreamEvent::TextStart { .. } => Part::Text(TextPart::streaming()),
            StreamEvent::ReasoningStart { .. } => Part::Reasoning(ReasoningPart {
                text: String::new(),
                state: PartState::Streaming,
            }),
            StreamEvent::Data(data) => Part::Data(DataPart {
                data_type: data.data_type.clone(),
                id: data.id.clone().unwrap_or_default(),
                data: data.data.clone(),
            }),
            StreamEvent::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                self.tool_inputs.insert(tool_call_id.clone(), String::new());
                Part::DynamicTool(ToolPart {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    state: ToolState::InputStreaming,
                    input: None,
                    output: None,
                    error_text: None,
                })
            }
            StreamEvent::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => Part::DynamicTool(ToolPart {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                state: ToolState::InputAvailable,
                input: Some(input.clone()),
                output: None,
                error_text: None,
            }),
            StreamEvent::SourceUrl {
                source_id,
                url,
                title,
            } => Part::SourceUrl(SourceUrlPart {
                source_id: source_id.clone(),
                url: url.clone(),
                title: title.clone(),
            }),
            StreamEvent::SourceDocument {
                source_id,
                media_type,
                title,
                filename,
            } => Part::SourceDocument(SourceDocumentPart {
                source_id: source_id.clone(),
                media_type: media_type.clone(),
                title: title.clone(),
                filename: filename.clone(),
            }),
            StreamEvent::File { url, media_type } => Part::File(FilePart {
                url: url.clone(),
                media_type: media_type.clone(),
            }),
            StreamEvent::StartStep => Part::StepStart,
            _ => return None,
        };
        Some(part)
    }

    fn update_part(&mut self, key: &PartKey, event: &StreamEvent) {
        let Some(&i) = self.index.get(key) else {
            return;
        };
        let Some(part) = self.message.parts.get_mut(i) else {
            return;
        };

        match (part, event) {
            (Part::Text(p), StreamEvent::TextDelta { delta, .. }) => p.text.push_str(delta),
            (Part::Text(p), StreamEvent::TextEnd { .. }) => p.state = PartState::Done,
            (Part::Reasoning(p), StreamEvent::ReasoningDelta { delta, .. }) => {
                p.text.push_str(delta);
            }
            (Part::Reasoning(p), StreamEvent::ReasoningEnd { .. }) => p.state = PartState::Done,
            (Part::Data(p), StreamEvent::Data(data)) => p.data = data.data.clone(),
            (
                Part::DynamicTool(p),
                StreamEvent::ToolInputDelta {
                    tool_call_id,
                    input_text_delta,
                },
            ) => {
                let raw = self.tool_inputs.entry(tool_call_id.clone()).or_default();
                raw.push_str(input_text_delta);
                if let Ok(input) = serde_json::from_str::<Value>(raw) {
                    p.input = Some(input);
                }
            }
            (
                Part::DynamicTool(p),
                StreamEvent::ToolInputAvailable {
                    tool_call_id,
                    tool_name,
                    input,
                },
            ) => {
                self.tool_inputs.remove(tool_call_id);
                p.tool_name.clone_from(tool_name);
                p.input = Some(input.clone());
                p.state = ToolState::InputAvailable;
            }
            (Part::DynamicTool(p), StreamEvent::ToolOutputAvailable { tool_call_id, output }) => {
                self.tool_inputs.remove(tool_call_id);
                p.output = Some(output.clone());
                p.state = ToolState::OutputAvailable;
            }
            (
                Part::DynamicTool(p),
                StreamEvent::ToolOutputError {
                    tool_call_id,
                    error_text,
                },
            ) => {
                self.tool_inputs.remove(tool_call_id);
                p.error_text = Some(error_text.clone());
                p.state = ToolState::OutputError;
            }
            _ => {}
        }

        if matches!(event, StreamEvent::TextEnd { .. } | StreamEvent::ReasoningEnd { .. }) {
            self.index.remove(key);
        }
    }
}

/// Identity of an existing part, if it is keyed.
///
/// Text and reasoning blocks are keyed by the block id of their events,
/// which a finished part does not retain, so they are only indexed while
/// being accumulated.
fn part_key(part: &Part) -> Option<PartKey> {
    match part {
        Part::Data(p) => Some(PartKey::Data {
            kind: p.kind().to_string(),
            id: p.id.clone(),
        }),
        Part::DynamicTool(p) => Some(PartKey::Tool(p.tool_call_id.clone())),
        _ => None,
    }
}
