//! Client that turns an inbound byte stream into messages.

use futures::{Stream, StreamExt};
use partstream_core::{DataEvent, Message};
use partstream_streaming::{
    DecoderSettings, Frame, FrameDecoder, FrameStream, StreamError, StreamResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::reducer::{MessageReducer, ReducerSettings};

/// Configuration for a [`UiMessageClient`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Frame decoder settings.
    #[serde(default)]
    pub decoder: DecoderSettings,
    /// Reducer settings.
    #[serde(skip)]
    pub reducer: ReducerSettings,
}

impl ClientSettings {
    /// Create default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set decoder settings.
    #[must_use]
    pub fn with_decoder(mut self, decoder: DecoderSettings) -> Self {
        self.decoder = decoder;
        self
    }

    /// Set reducer settings.
    #[must_use]
    pub fn with_reducer(mut self, reducer: ReducerSettings) -> Self {
        self.reducer = reducer;
        self
    }
}

/// Decodes frames and folds them into messages.
///
/// Bytes can be pushed synchronously with [`feed`](Self::feed) or pulled
/// from a body stream with [`consume`](Self::consume).
#[derive(Debug)]
pub struct UiMessageClient {
    decoder: FrameDecoder,
    decoder_settings: DecoderSettings,
    reducer: MessageReducer,
    done: bool,
}

impl Default for UiMessageClient {
    fn default() -> Self {
        Self::new(ClientSettings::default())
    }
}

impl UiMessageClient {
    /// Create a client.
    #[must_use]
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            decoder: FrameDecoder::with_settings(settings.decoder),
            decoder_settings: settings.decoder,
            reducer: MessageReducer::new(settings.reducer),
            done: false,
        }
    }

    /// Register a callback for data events, including transient ones.
    #[must_use]
    pub fn with_on_data<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&DataEvent) + Send + 'static,
    {
        self.reducer = self.reducer.with_on_data(callback);
        self
    }

    /// Push raw bytes, returning snapshots of the messages they changed.
    ///
    /// # Errors
    ///
    /// Returns the decoding error under fail-fast decoding. The current
    /// message is marked errored first.
    pub fn feed(&mut self, bytes: &[u8]) -> StreamResult<Vec<Message>> {
        let mut updates = Vec::new();
        let mut failure = None;
        for frame in self.decoder.feed(bytes) {
            match frame {
                Ok(frame) => {
                    if let Some(message) = Self::dispatch(&mut self.reducer, &mut self.done, frame) {
                        updates.push(message);
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        match failure {
            Some(err) => Err(self.fail(err.into())),
            None => Ok(updates),
        }
    }

    /// Flush a trailing unterminated frame once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the decoding error for a malformed trailing frame.
    pub fn finish(&mut self) -> StreamResult<Option<Message>> {
        match self.decoder.finish() {
            Some(Ok(frame)) => Ok(Self::dispatch(&mut self.reducer, &mut self.done, frame)),
            Some(Err(err)) => Err(self.fail(err.into())),
            None => Ok(None),
        }
    }

    /// Read `body` to its end or to the `[DONE]` marker.
    ///
    /// # Errors
    ///
    /// Returns the first decoding or transport error; the current message
    /// is marked errored and earlier messages keep their state.
    pub async fn consume<S, B>(&mut self, body: S) -> StreamResult<()>
    where
        S: Stream<Item = Result<B, std::io::Error>> + Unpin,
        B: AsRef<[u8]>,
    {
        let mut frames = FrameStream::with_settings(body, self.decoder_settings);
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail(err)),
            };
            Self::dispatch(&mut self.reducer, &mut self.done, frame);
            if self.done {
                break;
            }
        }
        if !self.done {
            debug!("Stream ended without a done marker");
        }
        Ok(())
    }

    /// Whether the `[DONE]` marker was received.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The underlying reducer.
    #[must_use]
    pub fn reducer(&self) -> &MessageReducer {
        &self.reducer
    }

    /// Messages received so far.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.reducer.messages()
    }

    /// Consume the client, returning all messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.reducer.into_messages()
    }

    fn dispatch(reducer: &mut MessageReducer, done: &mut bool, frame: Frame) -> Option<Message> {
        match frame {
            Frame::Event(event) => {
                if *done {
                    warn!(event_type = event.event_type(), "Event after done marker");
                }
                reducer.apply(&event)
            }
            Frame::Done => {
                *done = true;
                None
            }
        }
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        warn!(error = %err, "Inbound stream failed");
        self.reducer.fail_current(err.to_string());
        err
    }
}
