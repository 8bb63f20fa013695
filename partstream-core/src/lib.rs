//! # partstream-core
//!
//! Core types for the partstream UI message protocol.
//!
//! This crate defines the data model shared by producers and consumers of
//! a UI message stream:
//!
//! - **Parts**: text, reasoning, keyed data parts, sources, files, tools
//! - **Events**: the wire-level [`StreamEvent`] vocabulary
//! - **Messages**: ordered parts plus role, metadata, and status
//! - **Schemas**: an explicit registry of validators for data kinds
//! - **Errors**: encoding and decoding error taxonomy
//!
//! ## Example
//!
//! ```rust
//! use partstream_core::{is_valid_transition, Part, StreamEvent, TextPart};
//! use serde_json::json;
//!
//! let event = StreamEvent::data("weather", "weather-1", json!({"city": "SF"}));
//! assert!(event.validate().is_ok());
//!
//! let open = Part::Text(TextPart::streaming());
//! assert!(is_valid_transition(Some(&open), &StreamEvent::text_delta("t", "Hel")));
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod identifier;
pub mod message;
pub mod parts;
pub mod schema;

pub use errors::{ProtocolDecodingError, ProtocolEncodingError, ProtocolError, Result};
pub use events::{DataEvent, FinishReason, StreamEvent, DATA_TYPE_PREFIX};
pub use message::{Message, MessageStatus, Role};
pub use parts::{
    is_valid_transition, DataPart, FilePart, Part, PartKey, PartState, ReasoningPart,
    SourceDocumentPart, SourceUrlPart, TextPart, ToolPart, ToolState,
};
pub use schema::{DataValidator, FnValidator, RequiredFields, SchemaRegistry};

/// Prelude module for common imports.
///
/// ```rust
/// use partstream_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::errors::{ProtocolDecodingError, ProtocolEncodingError};
    pub use crate::events::{DataEvent, FinishReason, StreamEvent};
    pub use crate::identifier::{generate_message_id, generate_reasoning_id, generate_text_id};
    pub use crate::message::{Message, MessageStatus, Role};
    pub use crate::parts::{is_valid_transition, DataPart, Part, PartState, TextPart};
    pub use crate::schema::{RequiredFields, SchemaRegistry};
}
