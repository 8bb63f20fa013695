//! Translation of model generation fragments into block events.
//!
//! A model produces a flat sequence of deltas. The UI message stream needs
//! them bracketed: each run of text becomes `text-start`, `text-delta`...,
//! `text-end` with a fresh block id, reasoning likewise, and tool calls go
//! through the tool input/output events. [`GenerationAdapter`] keeps that
//! bookkeeping; [`GenerationEventStream`] applies it to a stream.

use futures::{Stream, StreamExt};
use partstream_core::identifier::{generate_reasoning_id, generate_text_id};
use partstream_core::{FinishReason, StreamEvent};
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::warn;

/// One increment from a model generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationFragment {
    /// Visible text.
    TextDelta(String),
    /// Reasoning text.
    ReasoningDelta(String),
    /// The model began a tool call.
    ToolCallStart {
        /// Tool call id.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
    },
    /// Partial JSON arguments of a tool call.
    ToolCallDelta {
        /// Tool call id.
        tool_call_id: String,
        /// Raw argument text.
        args_delta: String,
    },
    /// The tool call arguments are complete.
    ToolCallComplete {
        /// Tool call id.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Parsed arguments.
        args: Value,
    },
    /// A tool finished executing.
    ToolResult {
        /// Tool call id.
        tool_call_id: String,
        /// Output, or the error message when `success` is false.
        output: Value,
        /// Whether the tool succeeded.
        success: bool,
    },
    /// A cited web source.
    Source {
        /// Source id.
        source_id: String,
        /// Source URL.
        url: String,
        /// Optional title.
        title: Option<String>,
    },
    /// The model started a new step (for example after tool results).
    NewStep,
    /// The model stopped.
    Finish(FinishReason),
}

/// Options for [`GenerationAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Wrap each step in `start-step` / `finish-step`.
    pub send_steps: bool,
    /// Emit a `finish` event when the generation ends.
    pub send_finish: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            send_steps: true,
            send_finish: false,
        }
    }
}

impl GenerationOptions {
    /// Create default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable step events.
    #[must_use]
    pub fn with_send_steps(mut self, send: bool) -> Self {
        self.send_steps = send;
        self
    }

    /// Enable or disable the trailing `finish` event.
    #[must_use]
    pub fn with_send_finish(mut self, send: bool) -> Self {
        self.send_finish = send;
        self
    }
}

#[derive(Debug)]
struct ToolCallState {
    tool_name: String,
    args_buffer: String,
}

/// Stateful fragment-to-event translator.
#[derive(Debug, Default)]
pub struct GenerationAdapter {
    options: GenerationOptions,
    text_id: Option<String>,
    reasoning_id: Option<String>,
    tool_calls: HashMap<String, ToolCallState>,
    step_started: bool,
    finish_reason: Option<FinishReason>,
    finished: bool,
}

impl GenerationAdapter {
    /// Create an adapter.
    #[must_use]
    pub fn new(options: GenerationOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Translate one fragment.
    pub fn transform(&mut self, fragment: GenerationFragment) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            warn!(?fragment, "Fragment after generation finished");
            return events;
        }
        if !matches!(fragment, GenerationFragment::Finish(_)) {
            self.ensure_step(&mut events);
        }

        match fragment {
            GenerationFragment::TextDelta(delta) => {
                self.close_reasoning(&mut events);
                let id = match &self.text_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = generate_text_id();
                        events.push(StreamEvent::text_start(id.clone()));
                        self.text_id = Some(id.clone());
                        id
                    }
                };
                events.push(StreamEvent::text_delta(id, delta));
            }

            GenerationFragment::ReasoningDelta(delta) => {
                self.close_text(&mut events);
                let id = match &self.reasoning_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = generate_reasoning_id();
                        events.push(StreamEvent::reasoning_start(id.clone()));
                        self.reasoning_id = Some(id.clone());
                        id
                    }
                };
                events.push(StreamEvent::reasoning_delta(id, delta));
            }

            GenerationFragment::ToolCallStart {
                tool_call_id,
                tool_name,
            } => {
                self.close_blocks(&mut events);
                self.tool_calls.insert(
                    tool_call_id.clone(),
                    ToolCallState {
                        tool_name: tool_name.clone(),
                        args_buffer: String::new(),
                    },
                );
                events.push(StreamEvent::ToolInputStart {
                    tool_call_id,
                    tool_name,
                });
            }

            GenerationFragment::ToolCallDelta {
                tool_call_id,
                args_delta,
            } => match self.tool_calls.get_mut(&tool_call_id) {
                Some(state) => {
                    state.args_buffer.push_str(&args_delta);
                    events.push(StreamEvent::ToolInputDelta {
                        tool_call_id,
                        input_text_delta: args_delta,
                    });
                }
                None => warn!(%tool_call_id, "Argument delta for unknown tool call"),
            },

            GenerationFragment::ToolCallComplete {
                tool_call_id,
                tool_name,
                args,
            } => {
                self.close_blocks(&mut events);
                let (tool_name, input) = match self.tool_calls.remove(&tool_call_id) {
                    Some(state) => {
                        let name = if tool_name.is_empty() {
                            state.tool_name
                        } else {
                            tool_name
                        };
                        // Null args means "use what was streamed".
                        let input = if args.is_null() {
                            serde_json::from_str(&state.args_buffer).unwrap_or(Value::Null)
                        } else {
                            args
                        };
                        (name, input)
                    }
                    None => (tool_name, args),
                };
                events.push(StreamEvent::ToolInputAvailable {
                    tool_call_id,
                    tool_name,
                    input,
                });
            }

            GenerationFragment::ToolResult {
                tool_call_id,
                output,
                success,
            } => {
                if success {
                    events.push(StreamEvent::ToolOutputAvailable {
                        tool_call_id,
                        output,
                    });
                } else {
                    let error_text = output
                        .as_str()
                        .unwrap_or("Tool execution failed")
                        .to_string();
                    events.push(StreamEvent::ToolOutputError {
                        tool_call_id,
                        error_text,
                    });
                }
            }

            GenerationFragment::Source {
                source_id,
                url,
                title,
            } => events.push(StreamEvent::source_url(source_id, url, title)),

            GenerationFragment::NewStep => {
                if self.step_started {
                    self.finish_step(&mut events);
                    self.ensure_step(&mut events);
                }
            }

            GenerationFragment::Finish(reason) => {
                self.finish_reason = Some(reason);
            }
        }

        events
    }

    /// Close everything still open. Further fragments are ignored.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.finished = true;

        if !self.tool_calls.is_empty() {
            warn!(pending = self.tool_calls.len(), "Generation ended with incomplete tool calls");
            self.tool_calls.clear();
        }
        self.finish_step(&mut events);
        if self.options.send_finish {
            events.push(StreamEvent::finish_with_reason(
                self.finish_reason.unwrap_or(FinishReason::Stop),
            ));
        }
        events
    }

    /// Reason reported by the last [`GenerationFragment::Finish`].
    #[must_use]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    fn ensure_step(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.step_started {
            self.step_started = true;
            if self.options.send_steps {
                events.push(StreamEvent::StartStep);
            }
        }
    }

    fn finish_step(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_blocks(events);
        if self.step_started {
            self.step_started = false;
            if self.options.send_steps {
                events.push(StreamEvent::FinishStep);
            }
        }
    }

    fn close_text(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(id) = self.text_id.take() {
            events.push(StreamEvent::text_end(id));
        }
    }

    fn close_reasoning(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(id) = self.reasoning_id.take() {
            events.push(StreamEvent::reasoning_end(id));
        }
    }

    fn close_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_text(events);
        self.close_reasoning(events);
    }
}

pin_project! {
    /// Stream adapter applying a [`GenerationAdapter`] to fragments.
    ///
    /// An error item is passed through and ends the stream without closing
    /// events.
    pub struct GenerationEventStream<S> {
        #[pin]
        inner: S,
        adapter: GenerationAdapter,
        pending: VecDeque<StreamEvent>,
        done: bool,
    }
}

impl<S> GenerationEventStream<S> {
    /// Wrap a fragment stream.
    pub fn new(inner: S, options: GenerationOptions) -> Self {
        Self {
            inner,
            adapter: GenerationAdapter::new(options),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for GenerationEventStream<S>
where
    S: Stream<Item = Result<GenerationFragment, E>> + Unpin,
{
    type Item = Result<StreamEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(fragment))) => {
                    this.pending.extend(this.adapter.transform(fragment));
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    this.pending.extend(this.adapter.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
