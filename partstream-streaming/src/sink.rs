//! Outbound byte sinks.
//!
//! A [`StreamWriter`](crate::StreamWriter) owns exactly one sink and is the
//! only task that writes to it.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{StreamError, StreamResult};

/// Destination for encoded frames.
#[async_trait]
pub trait OutboundSink: Send {
    /// Deliver one frame.
    ///
    /// An error means the consumer is gone; no further frames are sent.
    async fn send(&mut self, frame: Bytes) -> StreamResult<()>;

    /// Flush and release the sink after the last frame.
    async fn close(&mut self) -> StreamResult<()> {
        Ok(())
    }

    /// Resolves once the consumer has gone away.
    ///
    /// Sinks that only learn about a disconnect from a failed `send` never
    /// resolve.
    async fn closed(&mut self) {
        futures::future::pending::<()>().await;
    }
}

/// Sink that forwards frames to a [`FrameReceiver`].
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, FrameReceiver { rx })
    }
}

#[async_trait]
impl OutboundSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> StreamResult<()> {
        let tx = self.tx.as_ref().ok_or(StreamError::Closed)?;
        tx.send(frame)
            .await
            .map_err(|_| StreamError::ConnectionClosed)
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.tx.take();
        Ok(())
    }

    async fn closed(&mut self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => futures::future::pending::<()>().await,
        }
    }
}

/// Receiving end of a [`ChannelSink`].
///
/// Yields encoded frames and ends once the writer has finalized.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl FrameReceiver {
    /// Receive the next frame.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Collect every remaining frame into one buffer.
    pub async fn collect_bytes(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(frame) = self.rx.recv().await {
            out.extend_from_slice(&frame);
        }
        out
    }
}

impl Stream for FrameReceiver {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Sink writing frames to any [`AsyncWrite`].
#[derive(Debug)]
pub struct IoSink<W> {
    writer: W,
}

impl<W> IoSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> OutboundSink for IoSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> StreamResult<()> {
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    frames: Vec<Bytes>,
    closed: bool,
    fail_after: Option<usize>,
}

/// In-memory sink that records frames.
///
/// Clones share the same buffer, so one clone can be handed to a writer
/// while another inspects the output.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every frame after the first `n`, as a disconnected peer would.
    #[must_use]
    pub fn failing_after(n: usize) -> Self {
        let sink = Self::default();
        sink.state.lock().fail_after = Some(n);
        sink
    }

    /// Frames recorded so far.
    #[must_use]
    pub fn frames(&self) -> Vec<Bytes> {
        self.state.lock().frames.clone()
    }

    /// All recorded bytes concatenated.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.state
            .lock()
            .frames
            .iter()
            .flat_map(|f| f.iter().copied())
            .collect()
    }

    /// Whether the writer closed the sink.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl OutboundSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> StreamResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        if state.fail_after.is_some_and(|n| state.frames.len() >= n) {
            return Err(StreamError::ConnectionClosed);
        }
        state.frames.push(frame);
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_channel_sink() {
        let (mut sink, receiver) = ChannelSink::new(4);
        sink.send(Bytes::from_static(b"data: a\n\n")).await.unwrap();
        sink.close().await.unwrap();
        assert!(sink.send(Bytes::from_static(b"x")).await.is_err());

        let frames: Vec<Bytes> = receiver.collect().await;
        assert_eq!(frames, vec![Bytes::from_static(b"data: a\n\n")]);
    }

    #[tokio::test]
    async fn test_channel_sink_receiver_dropped() {
        let (mut sink, receiver) = ChannelSink::new(1);
        drop(receiver);
        sink.closed().await;
        let err = sink.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_io_sink() {
        let mut sink = IoSink::new(Vec::new());
        sink.send(Bytes::from_static(b"data: a\n\n")).await.unwrap();
        sink.send(Bytes::from_static(b"data: b\n\n")).await.unwrap();
        assert_eq!(sink.into_inner(), b"data: a\n\ndata: b\n\n");
    }

    #[tokio::test]
    async fn test_memory_sink_shared_and_failing() {
        let sink = MemorySink::failing_after(1);
        let mut handle = sink.clone();
        handle.send(Bytes::from_static(b"one")).await.unwrap();
        assert!(handle.send(Bytes::from_static(b"two")).await.is_err());
        handle.close().await.unwrap();

        assert_eq!(sink.contents(), b"one");
        assert!(sink.is_closed());
    }
}
