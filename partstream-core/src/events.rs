//! Wire-level stream events.
//!
//! A [`StreamEvent`] is one unit of the UI message stream. Every event
//! serializes to a JSON object with a `type` discriminant; custom data
//! events use the open-ended `data-<kind>` family.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolEncodingError;
use crate::parts::PartKey;

/// Prefix shared by all custom data event types.
pub const DATA_TYPE_PREFIX: &str = "data-";

/// Finish reason reported with the `finish` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Normal stop (end of response).
    Stop,
    /// Maximum token length reached.
    Length,
    /// Content filter triggered.
    ContentFilter,
    /// Tool calls need to be executed.
    ToolCalls,
    /// Error occurred.
    Error,
    /// Other/custom reason.
    Other,
    /// Unknown reason.
    #[default]
    Unknown,
}

/// A custom `data-<kind>` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Full wire type, e.g. `data-weather`.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Stable identifier of the data part inside its kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Application-defined payload.
    pub data: Value,
    /// Transient parts reach the client callback but are not kept in the message.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

impl DataEvent {
    /// Create a data event for `kind` with the given id.
    pub fn new(kind: impl AsRef<str>, id: impl Into<String>, data: Value) -> Self {
        Self {
            data_type: format!("{DATA_TYPE_PREFIX}{}", kind.as_ref()),
            id: Some(id.into()),
            data,
            transient: false,
        }
    }

    /// Mark the event as transient.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// The kind suffix (`weather` for `data-weather`).
    #[must_use]
    pub fn kind(&self) -> &str {
        self.data_type
            .strip_prefix(DATA_TYPE_PREFIX)
            .unwrap_or(&self.data_type)
    }
}

/// Stream event types of the UI message stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    // ========================================================================
    // Message Lifecycle
    // ========================================================================
    /// Beginning of a message.
    #[serde(rename_all = "camelCase")]
    Start {
        /// Identifier of the message being streamed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        /// Optional message metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },

    /// Message completion.
    #[serde(rename_all = "camelCase")]
    Finish {
        /// Why the message finished.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        /// Optional message metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },

    /// Stream aborted by the producer.
    Abort {
        /// Optional reason for the abort.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Error reported to the client.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error text.
        error_text: String,
    },

    /// Metadata update for the current message.
    #[serde(rename_all = "camelCase")]
    MessageMetadata {
        /// Metadata object merged into the message metadata.
        message_metadata: Value,
    },

    /// Beginning of a generation step.
    StartStep,

    /// End of a generation step.
    FinishStep,

    // ========================================================================
    // Text and Reasoning (start/delta/end)
    // ========================================================================
    /// Beginning of a text block.
    TextStart {
        /// Block identifier.
        id: String,
    },

    /// Incremental text for an open block.
    TextDelta {
        /// Block identifier.
        id: String,
        /// Text fragment.
        delta: String,
    },

    /// End of a text block.
    TextEnd {
        /// Block identifier.
        id: String,
    },

    /// Beginning of a reasoning block.
    ReasoningStart {
        /// Block identifier.
        id: String,
    },

    /// Incremental reasoning text.
    ReasoningDelta {
        /// Block identifier.
        id: String,
        /// Reasoning fragment.
        delta: String,
    },

    /// End of a reasoning block.
    ReasoningEnd {
        /// Block identifier.
        id: String,
    },

    // ========================================================================
    // Tools
    // ========================================================================
    /// Tool input streaming begins.
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        /// Tool call identifier.
        tool_call_id: String,
        /// Name of the tool.
        tool_name: String,
    },

    /// Fragment of the tool input JSON.
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        /// Tool call identifier.
        tool_call_id: String,
        /// Raw JSON text fragment.
        input_text_delta: String,
    },

    /// Tool input is complete.
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        /// Tool call identifier.
        tool_call_id: String,
        /// Name of the tool.
        tool_name: String,
        /// Parsed input.
        input: Value,
    },

    /// Tool execution result.
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        /// Tool call identifier.
        tool_call_id: String,
        /// Tool output.
        output: Value,
    },

    /// Tool execution failed.
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        /// Tool call identifier.
        tool_call_id: String,
        /// Error text.
        error_text: String,
    },

    // ========================================================================
    // Sources and Files
    // ========================================================================
    /// Reference to an external URL.
    #[serde(rename_all = "camelCase")]
    SourceUrl {
        /// Source identifier.
        source_id: String,
        /// Referenced URL.
        url: String,
        /// Optional title.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// Reference to a document.
    #[serde(rename_all = "camelCase")]
    SourceDocument {
        /// Source identifier.
        source_id: String,
        /// IANA media type of the document.
        media_type: String,
        /// Document title.
        title: String,
        /// Optional filename.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },

    /// File reference.
    #[serde(rename_all = "camelCase")]
    File {
        /// File URL (may be a data URL).
        url: String,
        /// IANA media type.
        media_type: String,
    },

    // ========================================================================
    // Custom Data
    // ========================================================================
    /// Custom `data-<kind>` event.
    #[serde(untagged)]
    Data(DataEvent),
}

impl StreamEvent {
    /// Create a start event for a message.
    pub fn start(message_id: impl Into<String>) -> Self {
        Self::Start {
            message_id: Some(message_id.into()),
            message_metadata: None,
        }
    }

    /// Create a finish event without a reason.
    pub fn finish() -> Self {
        Self::Finish {
            finish_reason: None,
            message_metadata: None,
        }
    }

    /// Create a finish event with a reason.
    pub fn finish_with_reason(reason: FinishReason) -> Self {
        Self::Finish {
            finish_reason: Some(reason),
            message_metadata: None,
        }
    }

    /// Create an abort event.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: Some(reason.into()),
        }
    }

    /// Create an error event.
    pub fn error(error_text: impl Into<String>) -> Self {
        Self::Error {
            error_text: error_text.into(),
        }
    }

    /// Create a text-start event.
    pub fn text_start(id: impl Into<String>) -> Self {
        Self::TextStart { id: id.into() }
    }

    /// Create a text-delta event.
    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    /// Create a text-end event.
    pub fn text_end(id: impl Into<String>) -> Self {
        Self::TextEnd { id: id.into() }
    }

    /// Create a reasoning-start event.
    pub fn reasoning_start(id: impl Into<String>) -> Self {
        Self::ReasoningStart { id: id.into() }
    }

    /// Create a reasoning-delta event.
    pub fn reasoning_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::ReasoningDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    /// Create a reasoning-end event.
    pub fn reasoning_end(id: impl Into<String>) -> Self {
        Self::ReasoningEnd { id: id.into() }
    }

    /// Create a `data-<kind>` event.
    pub fn data(kind: impl AsRef<str>, id: impl Into<String>, data: Value) -> Self {
        Self::Data(DataEvent::new(kind, id, data))
    }

    /// Create a source-url event.
    pub fn source_url(
        source_id: impl Into<String>,
        url: impl Into<String>,
        title: Option<String>,
    ) -> Self {
        Self::SourceUrl {
            source_id: source_id.into(),
            url: url.into(),
            title,
        }
    }

    /// Create a file event.
    pub fn file(url: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self::File {
            url: url.into(),
            media_type: media_type.into(),
        }
    }

    /// Wire type string of this event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::Start { .. } => "start",
            Self::Finish { .. } => "finish",
            Self::Abort { .. } => "abort",
            Self::Error { .. } => "error",
            Self::MessageMetadata { .. } => "message-metadata",
            Self::StartStep => "start-step",
            Self::FinishStep => "finish-step",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolOutputError { .. } => "tool-output-error",
            Self::SourceUrl { .. } => "source-url",
            Self::SourceDocument { .. } => "source-document",
            Self::File { .. } => "file",
            Self::Data(data) => &data.data_type,
        }
    }

    /// Whether this event controls the message boundary rather than content.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Start { .. }
                | Self::Finish { .. }
                | Self::Abort { .. }
                | Self::Error { .. }
                | Self::MessageMetadata { .. }
                | Self::FinishStep
        )
    }

    /// Whether this event ends the message it belongs to.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finish { .. } | Self::Abort { .. } | Self::Error { .. }
        )
    }

    /// Identity of the part this event creates or updates, if the part is keyed.
    #[must_use]
    pub fn part_key(&self) -> Option<PartKey> {
        match self {
            Self::TextStart { id } | Self::TextDelta { id, .. } | Self::TextEnd { id } => {
                Some(PartKey::Text(id.clone()))
            }
            Self::ReasoningStart { id }
            | Self::ReasoningDelta { id, .. }
            | Self::ReasoningEnd { id } => Some(PartKey::Reasoning(id.clone())),
            Self::ToolInputStart { tool_call_id, .. }
            | Self::ToolInputDelta { tool_call_id, .. }
            | Self::ToolInputAvailable { tool_call_id, .. }
            | Self::ToolOutputAvailable { tool_call_id, .. }
            | Self::ToolOutputError { tool_call_id, .. } => {
                Some(PartKey::Tool(tool_call_id.clone()))
            }
            Self::Data(data) => Some(PartKey::Data {
                kind: data.kind().to_string(),
                id: data.id.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    /// Check the structural rules that every encodable event must satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolEncodingError`] when a keyed event lacks its
    /// identifier or a data event has a malformed type.
    pub fn validate(&self) -> Result<(), ProtocolEncodingError> {
        let require = |value: &str, field: &'static str| {
            if value.is_empty() {
                Err(ProtocolEncodingError::MissingId {
                    event_type: self.event_type().to_string(),
                    field,
                })
            } else {
                Ok(())
            }
        };

        match self {
            Self::TextStart { id }
            | Self::TextDelta { id, .. }
            | Self::TextEnd { id }
            | Self::ReasoningStart { id }
            | Self::ReasoningDelta { id, .. }
            | Self::ReasoningEnd { id } => require(id, "id"),
            Self::ToolInputStart {
                tool_call_id,
                tool_name,
            }
            | Self::ToolInputAvailable {
                tool_call_id,
                tool_name,
                ..
            } => {
                require(tool_call_id, "toolCallId")?;
                require(tool_name, "toolName")
            }
            Self::ToolInputDelta { tool_call_id, .. }
            | Self::ToolOutputAvailable { tool_call_id, .. }
            | Self::ToolOutputError { tool_call_id, .. } => require(tool_call_id, "toolCallId"),
            Self::SourceUrl { source_id, .. } | Self::SourceDocument { source_id, .. } => {
                require(source_id, "sourceId")
            }
            Self::Data(data) => {
                if !data.data_type.starts_with(DATA_TYPE_PREFIX) {
                    return Err(ProtocolEncodingError::InvalidDataType(data.data_type.clone()));
                }
                if data.kind().is_empty() {
                    return Err(ProtocolEncodingError::EmptyDataKind(data.data_type.clone()));
                }
                require(data.id.as_deref().unwrap_or_default(), "id")
            }
            _ => Ok(()),
        }
    }
}

impl From<DataEvent> for StreamEvent {
    fn from(event: DataEvent) -> Self {
        Self::Data(event)
    }
}
