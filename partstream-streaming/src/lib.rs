//! # partstream-streaming
//!
//! Producer-side streaming and the wire codec for partstream.
//!
//! ## Core Concepts
//!
//! - **[`FrameEncoder`] / [`FrameDecoder`]**: `data: <json>\n\n` frames,
//!   terminated by `data: [DONE]`
//! - **[`StreamWriter`]**: Cloneable handle that writes events and merges
//!   concurrent sub-streams into one ordered outbound stream
//! - **[`OutboundSink`]**: Where frames go (channel, any `AsyncWrite`, memory)
//! - **[`GenerationAdapter`]**: Turns flat model deltas into bracketed blocks
//!
//! ## Example - Writing
//!
//! ```ignore
//! use partstream_streaming::{ui_message_stream, WriterSettings};
//! use partstream_core::StreamEvent;
//!
//! let frames = ui_message_stream(WriterSettings::new(), |writer| async move {
//!     writer.write_data("weather", "w1", json!({"status": "loading"})).await?;
//!     writer.merge(model_events)?;
//!     Ok(())
//! });
//! ```
//!
//! ## Example - Decoding
//!
//! ```ignore
//! use partstream_streaming::{Frame, FrameDecoder};
//!
//! let mut decoder = FrameDecoder::new();
//! for frame in decoder.feed(&chunk) {
//!     match frame? {
//!         Frame::Event(event) => println!("{}", event.event_type()),
//!         Frame::Done => break,
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod generation;
mod merger;
pub mod settings;
pub mod sink;
pub mod writer;

// Re-exports
pub use codec::{
    Frame, FrameDecoder, FrameEncoder, FrameStream, Frames, DONE_MARKER, UI_MESSAGE_STREAM_HEADERS,
};
pub use error::{StreamError, StreamResult};
pub use generation::{GenerationAdapter, GenerationEventStream, GenerationFragment, GenerationOptions};
pub use settings::{DecodePolicy, DecoderSettings, ErrorMapper, WriterSettings};
pub use sink::{ChannelSink, FrameReceiver, IoSink, MemorySink, OutboundSink};
pub use writer::{ui_message_stream, MergeHandle, StreamOutcome, StreamSummary, StreamWriter};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::codec::{Frame, FrameDecoder, FrameEncoder};
    pub use crate::error::{StreamError, StreamResult};
    pub use crate::generation::{GenerationFragment, GenerationOptions};
    pub use crate::settings::{DecodePolicy, DecoderSettings, WriterSettings};
    pub use crate::sink::{MemorySink, OutboundSink};
    pub use crate::writer::{ui_message_stream, StreamWriter};
}
