//! Writer and decoder configuration.

use partstream_core::SchemaRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::StreamError;

/// Default capacity of the writer's internal channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default maximum number of buffered bytes without a frame boundary.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Text sent in the `error` frame when no mapper is configured.
pub const DEFAULT_ERROR_TEXT: &str = "An error occurred.";

/// Maps a failure to the `errorText` sent to the consumer.
pub type ErrorMapper = Arc<dyn Fn(&StreamError) -> String + Send + Sync>;

/// Configuration for a [`StreamWriter`](crate::StreamWriter).
#[derive(Clone)]
pub struct WriterSettings {
    /// Message id used for the automatic `start` frame.
    pub message_id: Option<String>,
    /// Emit a `start` frame before the first event if the producer did not.
    pub send_start: bool,
    /// Emit a `finish` frame on normal completion if the producer did not.
    pub send_finish: bool,
    /// Terminate the outbound stream with `data: [DONE]`.
    pub send_done: bool,
    /// Capacity of the channel between producers and the sink.
    pub channel_capacity: usize,
    /// Schemas checked for every outbound data event.
    pub schemas: Option<SchemaRegistry>,
    /// Maps failures to consumer-facing error text.
    pub on_error: Option<ErrorMapper>,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            message_id: None,
            send_start: true,
            send_finish: true,
            send_done: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            schemas: None,
            on_error: None,
        }
    }
}

impl WriterSettings {
    /// Create default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message id for the automatic `start` frame.
    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Enable or disable the automatic `start` frame.
    #[must_use]
    pub fn with_send_start(mut self, send: bool) -> Self {
        self.send_start = send;
        self
    }

    /// Enable or disable the automatic `finish` frame.
    #[must_use]
    pub fn with_send_finish(mut self, send: bool) -> Self {
        self.send_finish = send;
        self
    }

    /// Enable or disable the `[DONE]` terminator.
    #[must_use]
    pub fn with_send_done(mut self, send: bool) -> Self {
        self.send_done = send;
        self
    }

    /// Set the internal channel capacity (minimum 1).
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Validate data events against `registry`.
    #[must_use]
    pub fn with_schemas(mut self, registry: SchemaRegistry) -> Self {
        self.schemas = Some(registry);
        self
    }

    /// Set the error text mapper.
    #[must_use]
    pub fn with_on_error<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&StreamError) -> String + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(mapper));
        self
    }

    /// Error text to send for `error`.
    pub(crate) fn error_text(&self, error: &StreamError) -> String {
        match &self.on_error {
            Some(mapper) => mapper(error),
            None => DEFAULT_ERROR_TEXT.to_string(),
        }
    }
}

impl fmt::Debug for WriterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSettings")
            .field("message_id", &self.message_id)
            .field("send_start", &self.send_start)
            .field("send_finish", &self.send_finish)
            .field("send_done", &self.send_done)
            .field("channel_capacity", &self.channel_capacity)
            .field("schemas", &self.schemas)
            .field("on_error", &self.on_error.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// What the decoder does with a malformed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodePolicy {
    /// Surface the error to the caller.
    #[default]
    FailFast,
    /// Log the error and continue with the next frame.
    SkipInvalid,
}

/// Configuration for a [`FrameDecoder`](crate::FrameDecoder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderSettings {
    /// Malformed frame handling.
    #[serde(default)]
    pub policy: DecodePolicy,
    /// Maximum buffered bytes without a frame boundary.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
}

fn default_max_buffer_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            policy: DecodePolicy::default(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

impl DecoderSettings {
    /// Create default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the malformed frame policy.
    #[must_use]
    pub fn with_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the buffer limit.
    #[must_use]
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }
}
