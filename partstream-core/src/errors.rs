//! Error types for the message-part protocol.
//!
//! Encoding errors are raised on the producer side when an event is
//! structurally invalid; decoding errors are raised on the consumer side
//! when bytes on the wire cannot be turned back into an event.

use thiserror::Error;

/// The umbrella error type for protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A producer supplied an event that cannot be encoded.
    #[error(transparent)]
    Encoding(#[from] ProtocolEncodingError),

    /// Bytes received from the wire could not be decoded.
    #[error(transparent)]
    Decoding(#[from] ProtocolDecodingError),
}

/// Result type alias using [`ProtocolError`].
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A structurally invalid event was handed to the encoder.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolEncodingError {
    /// A keyed event type was missing its identifier.
    #[error("event `{event_type}` requires a non-empty `{field}`")]
    MissingId {
        /// Wire type of the offending event.
        event_type: String,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A `data-` event carried no kind suffix.
    #[error("data event type `{0}` has an empty kind")]
    EmptyDataKind(String),

    /// A data event type did not use the `data-` prefix.
    #[error("data event type `{0}` must start with `data-`")]
    InvalidDataType(String),

    /// The payload was rejected by the registered schema for its kind.
    #[error("payload for `data-{kind}` rejected: {reason}")]
    SchemaViolation {
        /// Data part kind.
        kind: String,
        /// Validator message.
        reason: String,
    },

    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolEncodingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Malformed bytes were received on the wire.
///
/// Every variant carries the raw frame text that caused it so the consumer
/// can log or report it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolDecodingError {
    /// The frame payload was not valid JSON or did not match any event shape.
    #[error("invalid frame payload: {reason}")]
    InvalidJson {
        /// Parser message.
        reason: String,
        /// The offending frame.
        frame: String,
    },

    /// The frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8 {
        /// Lossy rendering of the offending frame.
        frame: String,
    },

    /// The frame parsed but violates the protocol rules.
    #[error("invalid event: {reason}")]
    InvalidEvent {
        /// Why the event was rejected.
        reason: String,
        /// The offending frame.
        frame: String,
    },

    /// The pending buffer grew beyond the configured limit without a frame boundary.
    #[error("frame buffer exceeded {limit} bytes")]
    BufferOverflow {
        /// Configured limit in bytes.
        limit: usize,
        /// Prefix of the buffered data.
        frame: String,
    },
}

impl ProtocolDecodingError {
    /// The raw frame that triggered this error.
    #[must_use]
    pub fn frame(&self) -> &str {
        match self {
            Self::InvalidJson { frame, .. }
            | Self::InvalidUtf8 { frame }
            | Self::InvalidEvent { frame, .. }
            | Self::BufferOverflow { frame, .. } => frame,
        }
    }
}
