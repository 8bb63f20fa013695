//! UI message type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{FinishReason, StreamEvent};
use crate::parts::{DataPart, Part};

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End user.
    User,
    /// Model response.
    #[default]
    Assistant,
}

/// Lifecycle state of a message on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepting events.
    #[default]
    Open,
    /// Finished normally.
    Finalized,
    /// Ended by an error; partial content is kept.
    Errored,
    /// Ended by a producer abort.
    Aborted,
}

impl MessageStatus {
    /// Whether no further events are accepted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// A message made of ordered parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Stable message id.
    pub id: String,
    /// Author role.
    pub role: Role,
    /// Parts in first-appearance order.
    pub parts: Vec<Part>,
    /// Metadata object accumulated from lifecycle events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Lifecycle state.
    #[serde(default)]
    pub status: MessageStatus,
    /// Reason reported by the `finish` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Error text reported by the `error` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Create an empty, open message.
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
            metadata: None,
            status: MessageStatus::Open,
            finish_reason: None,
            error: None,
        }
    }

    /// Create an empty assistant message.
    pub fn assistant(id: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant)
    }

    /// Concatenated text of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    /// Data parts of the given kind, in order.
    pub fn data_parts<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a DataPart> + 'a {
        self.parts
            .iter()
            .filter_map(Part::as_data)
            .filter(move |p| p.kind() == kind)
    }

    /// Merge a metadata object into the message metadata.
    ///
    /// Object keys are merged shallowly; any other value replaces the
    /// current metadata.
    pub fn merge_metadata(&mut self, incoming: Value) {
        match (&mut self.metadata, incoming) {
            (Some(Value::Object(current)), Value::Object(update)) => {
                current.extend(update);
            }
            (slot, value) => *slot = Some(value),
        }
    }

    /// Render the whole message as an event sequence.
    ///
    /// Text and reasoning blocks get positional ids (`block-<index>`). An
    /// errored message without error text replays as an empty `error`.
    #[must_use]
    pub fn to_events(&self) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::Start {
            message_id: Some(self.id.clone()),
            message_metadata: self.metadata.clone(),
        }];
        for (index, part) in self.parts.iter().enumerate() {
            events.extend(part.to_events(&format!("block-{index}")));
        }
        match self.status {
            MessageStatus::Open => {}
            MessageStatus::Finalized => events.push(StreamEvent::Finish {
                finish_reason: self.finish_reason,
                message_metadata: None,
            }),
            MessageStatus::Errored => {
                events.push(StreamEvent::error(self.error.clone().unwrap_or_default()));
            }
            MessageStatus::Aborted => events.push(StreamEvent::Abort { reason: None }),
        }
        events
    }
}
