//! Streaming errors.

use partstream_core::{ProtocolDecodingError, ProtocolEncodingError};
use thiserror::Error;

/// Errors that can occur while writing or reading a UI message stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The producer supplied an event that cannot be encoded.
    #[error(transparent)]
    Encoding(#[from] ProtocolEncodingError),

    /// Malformed bytes were received.
    #[error(transparent)]
    Decoding(#[from] ProtocolDecodingError),

    /// Write attempted after the stream was closed or finalized.
    #[error("Stream is closed")]
    Closed,

    /// A merged sub-stream failed.
    #[error("Sub-stream error: {0}")]
    SubStream(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Whether this error reports a write against a closed stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the peer went away.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }

    /// Create from any error.
    pub fn from_err<E: std::fmt::Display>(err: E) -> Self {
        Self::Other(err.to_string())
    }
}

/// Result type for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;
