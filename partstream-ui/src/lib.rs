//! # partstream-ui
//!
//! Client side of the partstream UI message protocol: decoded events are
//! folded into [`Message`](partstream_core::Message)s that a rendering layer
//! can read after every update.
//!
//! ## Core Concepts
//!
//! - **[`MessageReducer`]**: Applies events to ordered, per-id messages and
//!   enforces the `open → finalized | errored | aborted` lifecycle
//! - **[`MessageAccumulator`]**: Keeps one message's parts in
//!   first-appearance order and patches them in place
//! - **[`UiMessageClient`]**: Drives the frame decoder and the reducer over
//!   raw bytes or a body stream
//!
//! ## Example
//!
//! ```ignore
//! use partstream_ui::UiMessageClient;
//!
//! let mut client = UiMessageClient::default()
//!     .with_on_data(|data| println!("{}: {}", data.kind(), data.data));
//! client.consume(response_body).await?;
//!
//! for message in client.messages() {
//!     println!("{} [{:?}]: {}", message.id, message.status, message.text());
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod accumulator;
pub mod client;
pub mod reducer;

// Re-exports
pub use accumulator::{Applied, MessageAccumulator};
pub use client::{ClientSettings, UiMessageClient};
pub use reducer::{DataCallback, MessageReducer, ReducerSettings};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::client::{ClientSettings, UiMessageClient};
    pub use crate::reducer::{MessageReducer, ReducerSettings};
}
