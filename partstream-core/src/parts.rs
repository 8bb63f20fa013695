//! Message part types.
//!
//! A message is an ordered list of parts. Text and reasoning parts grow by
//! delta, data parts are upserted by `(kind, id)`, and sources and files
//! are append-only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{DataEvent, StreamEvent, DATA_TYPE_PREFIX};

/// Streaming state of a text or reasoning part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartState {
    /// Deltas are still being appended.
    Streaming,
    /// The block has ended.
    Done,
}

/// State of a tool invocation part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    /// Input JSON is still arriving.
    InputStreaming,
    /// Input is complete.
    InputAvailable,
    /// The tool produced output.
    OutputAvailable,
    /// The tool failed.
    OutputError,
}

impl ToolState {
    /// Whether the tool invocation has reached a final state.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::OutputAvailable | Self::OutputError)
    }
}

/// Identity of a keyed part inside a message.
///
/// Sources, files and step separators have no identity and are only ever
/// appended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartKey {
    /// Text block id.
    Text(String),
    /// Reasoning block id.
    Reasoning(String),
    /// Tool call id.
    Tool(String),
    /// Data part `(kind, id)` pair.
    Data {
        /// Data kind (suffix of `data-`).
        kind: String,
        /// Part id within the kind.
        id: String,
    },
}

/// Text content of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    /// Accumulated text.
    pub text: String,
    /// Whether the block is still open.
    pub state: PartState,
}

impl TextPart {
    /// Create an open, empty text part.
    #[must_use]
    pub fn streaming() -> Self {
        Self {
            text: String::new(),
            state: PartState::Streaming,
        }
    }

    /// Create a finished text part.
    pub fn done(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            state: PartState::Done,
        }
    }
}

/// Reasoning content of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningPart {
    /// Accumulated reasoning text.
    pub text: String,
    /// Whether the block is still open.
    pub state: PartState,
}

/// Application-defined data part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPart {
    /// Full type, e.g. `data-weather`.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Stable id within the kind.
    pub id: String,
    /// Latest payload.
    pub data: Value,
}

impl DataPart {
    /// Create a data part.
    pub fn new(kind: impl AsRef<str>, id: impl Into<String>, data: Value) -> Self {
        Self {
            data_type: format!("{DATA_TYPE_PREFIX}{}", kind.as_ref()),
            id: id.into(),
            data,
        }
    }

    /// The kind suffix.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.data_type
            .strip_prefix(DATA_TYPE_PREFIX)
            .unwrap_or(&self.data_type)
    }
}

/// URL source reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUrlPart {
    /// Source identifier.
    pub source_id: String,
    /// Referenced URL.
    pub url: String,
    /// Optional title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Document source reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocumentPart {
    /// Source identifier.
    pub source_id: String,
    /// IANA media type.
    pub media_type: String,
    /// Document title.
    pub title: String,
    /// Optional filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// File attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    /// File URL (may be a data URL).
    pub url: String,
    /// IANA media type.
    pub media_type: String,
}

/// A tool invocation tracked through its states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    /// Tool call identifier.
    pub tool_call_id: String,
    /// Name of the tool.
    pub tool_name: String,
    /// Current state.
    pub state: ToolState,
    /// Tool input, once it parses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Tool output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error text when the tool failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

/// One renderable unit of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    /// Text content.
    Text(TextPart),
    /// Reasoning content.
    Reasoning(ReasoningPart),
    /// URL source.
    SourceUrl(SourceUrlPart),
    /// Document source.
    SourceDocument(SourceDocumentPart),
    /// File attachment.
    File(FilePart),
    /// Separator left at the start of each generation step.
    StepStart,
    /// Tool invocation.
    DynamicTool(ToolPart),
    /// Application-defined data.
    #[serde(untagged)]
    Data(DataPart),
}

impl Part {
    /// Wire type string of this part.
    #[must_use]
    pub fn part_type(&self) -> &str {
        match self {
            Self::Text(_) => "text",
            Self::Reasoning(_) => "reasoning",
            Self::SourceUrl(_) => "source-url",
            Self::SourceDocument(_) => "source-document",
            Self::File(_) => "file",
            Self::StepStart => "step-start",
            Self::DynamicTool(_) => "dynamic-tool",
            Self::Data(data) => &data.data_type,
        }
    }

    /// Whether this part still accepts deltas.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        match self {
            Self::Text(p) => p.state == PartState::Streaming,
            Self::Reasoning(p) => p.state == PartState::Streaming,
            Self::DynamicTool(p) => p.state == ToolState::InputStreaming,
            _ => false,
        }
    }

    /// Text of a text part.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(p) => Some(&p.text),
            _ => None,
        }
    }

    /// Data part view.
    #[must_use]
    pub fn as_data(&self) -> Option<&DataPart> {
        match self {
            Self::Data(p) => Some(p),
            _ => None,
        }
    }

    /// Render this part as the ordered events that rebuild it.
    ///
    /// `block_id` names the text/reasoning block; keyed parts use their own id.
    #[must_use]
    pub fn to_events(&self, block_id: &str) -> Vec<StreamEvent> {
        match self {
            Self::Text(p) => {
                let mut events = vec![StreamEvent::text_start(block_id)];
                if !p.text.is_empty() {
                    events.push(StreamEvent::text_delta(block_id, p.text.clone()));
                }
                if p.state == PartState::Done {
                    events.push(StreamEvent::text_end(block_id));
                }
                events
            }
            Self::Reasoning(p) => {
                let mut events = vec![StreamEvent::reasoning_start(block_id)];
                if !p.text.is_empty() {
                    events.push(StreamEvent::reasoning_delta(block_id, p.text.clone()));
                }
                if p.state == PartState::Done {
                    events.push(StreamEvent::reasoning_end(block_id));
                }
                events
            }
            Self::SourceUrl(p) => vec![StreamEvent::SourceUrl {
                source_id: p.source_id.clone(),
                url: p.url.clone(),
                title: p.title.clone(),
            }],
            Self::SourceDocument(p) => vec![StreamEvent::SourceDocument {
                source_id: p.source_id.clone(),
                media_type: p.media_type.clone(),
                title: p.title.clone(),
                filename: p.filename.clone(),
            }],
            Self::File(p) => vec![StreamEvent::file(p.url.clone(), p.media_type.clone())],
            Self::StepStart => vec![StreamEvent::StartStep],
            Self::DynamicTool(p) => tool_events(p),
            Self::Data(p) => vec![StreamEvent::Data(DataEvent {
                data_type: p.data_type.clone(),
                id: Some(p.id.clone()),
                data: p.data.clone(),
                transient: false,
            })],
        }
    }
}

fn tool_events(p: &ToolPart) -> Vec<StreamEvent> {
    let id = p.tool_call_id.clone();
    let mut events = Vec::new();

    if p.state == ToolState::InputStreaming {
        events.push(StreamEvent::ToolInputStart {
            tool_call_id: id.clone(),
            tool_name: p.tool_name.clone(),
        });
        if let Some(input) = &p.input {
            events.push(StreamEvent::ToolInputDelta {
                tool_call_id: id,
                input_text_delta: input.to_string(),
            });
        }
        return events;
    }

    // A call can jump from input-start straight to its output.
    match &p.input {
        Some(input) => events.push(StreamEvent::ToolInputAvailable {
            tool_call_id: id.clone(),
            tool_name: p.tool_name.clone(),
            input: input.clone(),
        }),
        None => events.push(StreamEvent::ToolInputStart {
            tool_call_id: id.clone(),
            tool_name: p.tool_name.clone(),
        }),
    }
    match p.state {
        ToolState::OutputAvailable => events.push(StreamEvent::ToolOutputAvailable {
            tool_call_id: id,
            output: p.output.clone().unwrap_or(Value::Null),
        }),
        ToolState::OutputError => events.push(StreamEvent::ToolOutputError {
            tool_call_id: id,
            error_text: p.error_text.clone().unwrap_or_default(),
        }),
        ToolState::InputStreaming | ToolState::InputAvailable => {}
    }
    events
}

/// Check whether `incoming` may be applied to the part it targets.
///
/// `current` is the existing part with the same identity as the event
/// (see [`StreamEvent::part_key`]), or `None` when no such part exists.
/// Lifecycle markers never target a part and are valid only with `None`.
#[must_use]
pub fn is_valid_transition(current: Option<&Part>, incoming: &StreamEvent) -> bool {
    use StreamEvent as E;

    match (current, incoming) {
        (None, E::TextStart { .. } | E::ReasoningStart { .. }) => true,
        (Some(Part::Text(p)), E::TextDelta { .. } | E::TextEnd { .. }) => {
            p.state == PartState::Streaming
        }
        (Some(Part::Reasoning(p)), E::ReasoningDelta { .. } | E::ReasoningEnd { .. }) => {
            p.state == PartState::Streaming
        }

        (None, E::Data(_)) => true,
        (Some(Part::Data(p)), E::Data(event)) => p.kind() == event.kind(),

        (None, E::ToolInputStart { .. } | E::ToolInputAvailable { .. }) => true,
        (Some(Part::DynamicTool(p)), E::ToolInputDelta { .. }) => {
            p.state == ToolState::InputStreaming
        }
        (Some(Part::DynamicTool(p)), E::ToolInputAvailable { .. }) => {
            p.state == ToolState::InputStreaming
        }
        (
            Some(Part::DynamicTool(p)),
            E::ToolOutputAvailable { .. } | E::ToolOutputError { .. },
        ) => matches!(
            p.state,
            ToolState::InputStreaming | ToolState::InputAvailable
        ),

        (
            None,
            E::SourceUrl { .. } | E::SourceDocument { .. } | E::File { .. } | E::StartStep,
        ) => true,

        (None, event) if event.is_lifecycle() => true,
        _ => false,
    }
}
