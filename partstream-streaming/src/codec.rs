//! Frame codec for the UI message stream.
//!
//! Every event travels as one server-sent-events frame:
//!
//! ```text
//! data: {"type":"text-delta","id":"t1","delta":"Hel"}\n\n
//! ```
//!
//! and the stream ends with `data: [DONE]\n\n`. The encoder turns
//! [`StreamEvent`]s into frames; the decoder reassembles frames from bytes
//! that may be split at arbitrary positions, including inside a multi-byte
//! UTF-8 character.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use partstream_core::{ProtocolDecodingError, ProtocolEncodingError, SchemaRegistry, StreamEvent};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::warn;

use crate::error::{StreamError, StreamResult};
use crate::settings::{DecodePolicy, DecoderSettings};

/// Payload of the terminating frame.
pub const DONE_MARKER: &str = "[DONE]";

/// HTTP response headers for a UI message stream.
pub const UI_MESSAGE_STREAM_HEADERS: &[(&str, &str)] = &[
    ("content-type", "text/event-stream"),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
    ("x-vercel-ai-ui-message-stream", "v1"),
    ("x-accel-buffering", "no"),
];

const DATA_FIELD: &[u8] = b"data: ";
const FRAME_END: &[u8] = b"\n\n";

/// Longest frame prefix kept in an overflow error.
const OVERFLOW_PREVIEW: usize = 256;

/// Encodes events into wire frames.
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder {
    schemas: Option<SchemaRegistry>,
}

impl FrameEncoder {
    /// Create an encoder without schema checks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check data payloads against `registry` before encoding.
    #[must_use]
    pub fn with_schemas(mut self, registry: SchemaRegistry) -> Self {
        self.schemas = Some(registry);
        self
    }

    /// Encode one event as a `data:` frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolEncodingError`] if the event is structurally invalid
    /// or its data payload is rejected by the registered schema.
    pub fn encode(&self, event: &StreamEvent) -> Result<Bytes, ProtocolEncodingError> {
        event.validate()?;
        if let (Some(registry), StreamEvent::Data(data)) = (&self.schemas, event) {
            registry.validate(data.kind(), &data.data)?;
        }
        let json = serde_json::to_vec(event)?;
        Ok(frame(&json))
    }

    /// The terminating `data: [DONE]` frame.
    #[must_use]
    pub fn encode_done(&self) -> Bytes {
        frame(DONE_MARKER.as_bytes())
    }

    /// Encode a sequence of events followed by the terminator.
    ///
    /// # Errors
    ///
    /// Fails on the first event that cannot be encoded.
    pub fn encode_all<'a, I>(&self, events: I) -> Result<Bytes, ProtocolEncodingError>
    where
        I: IntoIterator<Item = &'a StreamEvent>,
    {
        let mut buf = BytesMut::new();
        for event in events {
            buf.put(self.encode(event)?);
        }
        buf.put(self.encode_done());
        Ok(buf.freeze())
    }
}

fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATA_FIELD.len() + payload.len() + FRAME_END.len());
    buf.put_slice(DATA_FIELD);
    buf.put_slice(payload);
    buf.put_slice(FRAME_END);
    buf.freeze()
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// An event frame.
    Event(StreamEvent),
    /// The `[DONE]` terminator.
    Done,
}

impl Frame {
    /// The event, if this is an event frame.
    #[must_use]
    pub fn into_event(self) -> Option<StreamEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Done => None,
        }
    }
}

/// Incremental frame decoder.
///
/// Bytes are buffered raw and only decoded once a whole frame is present,
/// so chunk boundaries never corrupt multi-byte characters.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Offset up to which the buffer holds no frame boundary.
    scanned: usize,
    settings: DecoderSettings,
    skipped: usize,
}

impl FrameDecoder {
    /// Create a decoder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder with the given settings.
    #[must_use]
    pub fn with_settings(settings: DecoderSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Decoder settings.
    #[must_use]
    pub fn settings(&self) -> &DecoderSettings {
        &self.settings
    }

    /// Buffer `bytes` and iterate over the frames completed so far.
    ///
    /// Frames are decoded lazily; anything not pulled from the iterator
    /// stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.extend(bytes);
        Frames { decoder: self }
    }

    /// Decode the next complete frame, if any.
    ///
    /// Comments and keep-alive frames are skipped. Under
    /// [`DecodePolicy::SkipInvalid`] malformed frames are logged and skipped
    /// as well.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolDecodingError>> {
        loop {
            let outcome = match find_frame_boundary(&self.buffer, self.scanned) {
                Some((end, delimiter)) => {
                    let raw = self.buffer.split_to(end);
                    self.buffer.advance(delimiter);
                    self.scanned = 0;
                    parse_frame(&raw)
                }
                None if self.buffer.len() > self.settings.max_buffer_size => {
                    let preview = &self.buffer[..self.buffer.len().min(OVERFLOW_PREVIEW)];
                    let frame = String::from_utf8_lossy(preview).into_owned();
                    self.buffer.clear();
                    self.scanned = 0;
                    Err(ProtocolDecodingError::BufferOverflow {
                        limit: self.settings.max_buffer_size,
                        frame,
                    })
                }
                None => {
                    self.scanned = self.buffer.len().saturating_sub(2);
                    return None;
                }
            };

            match outcome {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => continue,
                Err(err) => {
                    if let Some(err) = self.apply_policy(err) {
                        return Some(Err(err));
                    }
                }
            }
        }
    }

    /// Flush a trailing frame that was not followed by a blank line.
    ///
    /// Call once the byte source is exhausted.
    pub fn finish(&mut self) -> Option<Result<Frame, ProtocolDecodingError>> {
        if let Some(frame) = self.next_frame() {
            return Some(frame);
        }
        let raw = self.buffer.split();
        self.scanned = 0;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match parse_frame(&raw) {
            Ok(frame) => frame.map(Ok),
            Err(err) => self.apply_policy(err).map(Err),
        }
    }

    /// Decode a complete byte buffer into frames.
    ///
    /// # Errors
    ///
    /// Returns the first decoding error under [`DecodePolicy::FailFast`].
    pub fn decode_all(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, ProtocolDecodingError> {
        let mut frames = self.feed(bytes).collect::<Result<Vec<_>, _>>()?;
        if let Some(last) = self.finish() {
            frames.push(last?);
        }
        Ok(frames)
    }

    /// Number of malformed frames skipped so far.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn apply_policy(&mut self, err: ProtocolDecodingError) -> Option<ProtocolDecodingError> {
        match self.settings.policy {
            DecodePolicy::FailFast => Some(err),
            DecodePolicy::SkipInvalid => {
                self.skipped += 1;
                warn!(error = %err, frame = err.frame(), "Skipping malformed frame");
                None
            }
        }
    }
}

/// Iterator over the frames completed by one [`FrameDecoder::feed`] call.
#[derive(Debug)]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, ProtocolDecodingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

/// Locate the first blank line at or after `from`.
///
/// Returns the frame length and the delimiter length. Both `\n\n` and
/// `\r\n\r\n` separate frames.
fn find_frame_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1] == b'\n' {
                return Some((i, 2));
            }
            if buf[i + 1] == b'\r' && buf.get(i + 2) == Some(&b'\n') {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

/// Parse one raw frame. `Ok(None)` means the frame carried no data.
fn parse_frame(raw: &[u8]) -> Result<Option<Frame>, ProtocolDecodingError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolDecodingError::InvalidUtf8 {
        frame: String::from_utf8_lossy(raw).into_owned(),
    })?;

    let mut data_lines = Vec::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        // Empty lines and comments carry nothing.
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if line == "data" {
            data_lines.push("");
        }
        // `event:`, `id:` and `retry:` fields are not used by this protocol.
    }

    if data_lines.is_empty() {
        return Ok(None);
    }

    let payload = data_lines.join("\n");
    if payload.trim() == DONE_MARKER {
        return Ok(Some(Frame::Done));
    }

    let event: StreamEvent =
        serde_json::from_str(&payload).map_err(|e| ProtocolDecodingError::InvalidJson {
            reason: e.to_string(),
            frame: text.to_string(),
        })?;
    event
        .validate()
        .map_err(|e| ProtocolDecodingError::InvalidEvent {
            reason: e.to_string(),
            frame: text.to_string(),
        })?;

    Ok(Some(Frame::Event(event)))
}

pin_project! {
    /// Stream adapter that decodes frames from a byte stream.
    pub struct FrameStream<S> {
        #[pin]
        inner: S,
        decoder: FrameDecoder,
        finished: bool,
    }
}

impl<S> FrameStream<S> {
    /// Create a frame stream with default decoder settings.
    pub fn new(inner: S) -> Self {
        Self::with_settings(inner, DecoderSettings::default())
    }

    /// Create a frame stream with the given decoder settings.
    pub fn with_settings(inner: S, settings: DecoderSettings) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::with_settings(settings),
            finished: false,
        }
    }
}

impl<S, B> Stream for FrameStream<S>
where
    S: Stream<Item = Result<B, std::io::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = StreamResult<Frame>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(frame) = this.decoder.next_frame() {
                return Poll::Ready(Some(frame.map_err(StreamError::from)));
            }

            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.decoder.extend(bytes.as_ref()),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(StreamError::Io(e)))),
                Poll::Ready(None) => {
                    *this.finished = true;
                    return Poll::Ready(
                        this.decoder
                            .finish()
                            .map(|frame| frame.map_err(StreamError::from)),
                    );
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
