//! # partstream - Streaming UI Message Protocol for Rust
//!
//! partstream carries incremental model output from a server to a client
//! as one ordered stream of typed events. The server merges any number of
//! concurrent producers into the stream; the client folds it back into
//! messages made of text, reasoning, tool, source, and data parts.
//!
//! ## Quick Start
//!
//! ```ignore
//! use partstream::prelude::*;
//! use serde_json::json;
//!
//! // Server: produce frames for an HTTP body.
//! let frames = ui_message_stream(WriterSettings::new(), |writer| async move {
//!     writer.write_data("weather", "w1", json!({"status": "loading"})).await?;
//!     writer.merge_generation(model_fragments, GenerationOptions::default())?;
//!     Ok(())
//! });
//!
//! // Client: rebuild messages from the body.
//! let mut client = UiMessageClient::default();
//! client.consume(body).await?;
//! ```
//!
//! ## Architecture
//!
//! - [`partstream_core`] - Parts, events, messages, and data schemas
//! - [`partstream_streaming`] - Frame codec, stream writer, and merger
//! - [`partstream_ui`] - Message reducer and client
//!
//! The [`pipeline`] module wires a writer straight into a client without a
//! transport.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod pipeline;

// ============================================================================
// Crate Re-exports
// ============================================================================

/// Parts, events, and messages.
pub use partstream_core as core;

/// Producer side and wire codec.
pub use partstream_streaming as streaming;

/// Consumer side.
pub use partstream_ui as ui;

// ============================================================================
// Type Re-exports (Flat)
// ============================================================================

// Model
pub use partstream_core::{
    is_valid_transition, DataEvent, DataPart, FinishReason, Message, MessageStatus, Part,
    PartKey, PartState, Role, StreamEvent, TextPart, ToolPart, ToolState,
};

// Schemas
pub use partstream_core::{DataValidator, RequiredFields, SchemaRegistry};

// Errors
pub use partstream_core::{ProtocolDecodingError, ProtocolEncodingError};
pub use partstream_streaming::{StreamError, StreamResult};

// Writing
pub use partstream_streaming::{
    ui_message_stream, ChannelSink, FrameReceiver, GenerationFragment, GenerationOptions, IoSink,
    MergeHandle, OutboundSink, StreamOutcome, StreamSummary, StreamWriter, WriterSettings,
};

// Codec
pub use partstream_streaming::{
    DecodePolicy, DecoderSettings, Frame, FrameDecoder, FrameEncoder, FrameStream,
    UI_MESSAGE_STREAM_HEADERS,
};

// Reading
pub use partstream_ui::{ClientSettings, MessageReducer, ReducerSettings, UiMessageClient};

// Pipeline
pub use pipeline::{collect_messages, Pipeline, PipelineOutput};

// ============================================================================
// Prelude Module
// ============================================================================

/// Convenient prelude for common imports.
///
/// ```ignore
/// use partstream::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{
        DataEvent, FinishReason, Message, MessageStatus, Part, SchemaRegistry, StreamEvent,
    };

    pub use crate::streaming::{
        ui_message_stream, GenerationFragment, GenerationOptions, StreamError, StreamResult,
        StreamWriter, WriterSettings,
    };

    pub use crate::ui::{ClientSettings, MessageReducer, UiMessageClient};

    pub use crate::pipeline::Pipeline;
}

/// Returns the current version of partstream.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_headers_name_the_protocol() {
        assert!(UI_MESSAGE_STREAM_HEADERS
            .iter()
            .any(|(name, value)| *name == "x-vercel-ai-ui-message-stream" && *value == "v1"));
    }
}
