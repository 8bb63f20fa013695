//! ID generation utilities.
//!
//! Producers need stable identifiers for messages and for the blocks that
//! make up a message (text and reasoning blocks). This module generates
//! them in the prefixed form used on the wire.

use uuid::Uuid;

/// Generate a unique message ID.
///
/// # Example
///
/// ```rust
/// use partstream_core::identifier::generate_message_id;
///
/// let id = generate_message_id();
/// assert!(id.starts_with("msg_"));
/// assert_eq!(id.len(), 36); // "msg_" + 32 hex chars
/// ```
#[must_use]
pub fn generate_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Generate a unique text block ID.
#[must_use]
pub fn generate_text_id() -> String {
    format!("txt_{}", Uuid::new_v4().simple())
}

/// Generate a unique reasoning block ID.
#[must_use]
pub fn generate_reasoning_id() -> String {
    format!("rsn_{}", Uuid::new_v4().simple())
}
