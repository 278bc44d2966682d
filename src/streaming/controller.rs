//! Drives one assistant message through the event pipeline.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use super::tool_buffer::{FinalizedCall, ToolCallBuffer};
use crate::error::{TurnError, UpstreamError};
use crate::persistence::SaveCoalescer;
use crate::pipeline::EventStream;
use crate::tools::ToolCallManager;
use crate::transcript::TranscriptAssembler;
use crate::types::{ChatMessage, MessagePart, StreamEvent, ToolCall, ToolCallPhase};

/// Meta keys that carry the upstream stop reason.
const STOP_REASON_KEYS: &[&str] = &["stop_reason", "finish_reason", "stopReason", "finishReason"];

/// Update pushed to the host renderer. Delivery must not block.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderUpdate {
    Parts {
        message_id: String,
        parts: Vec<MessagePart>,
    },
    ToolCall {
        message_id: String,
        call: ToolCall,
    },
    Footnote {
        message_id: String,
        text: String,
    },
}

pub type RenderSink = Arc<dyn Fn(RenderUpdate) + Send + Sync>;

/// Result of one stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub message_id: String,
    pub message: ChatMessage,
    /// `false` when the stream was cancelled; nothing was committed.
    pub completed: bool,
    pub stop_reason: Option<String>,
    /// Tool calls registered during this stream, in creation order.
    pub tool_call_ids: Vec<String>,
}

/// Stateless driver; one instance serves every stream of a conversation.
#[derive(Clone)]
pub struct StreamingController {
    tools: Option<ToolCallManager>,
    coalescer: SaveCoalescer,
    render: Option<RenderSink>,
    idle_timeout: Option<Duration>,
}

impl std::fmt::Debug for StreamingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingController")
            .field("tools", &self.tools.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Mutable state for one stream.
struct StreamState {
    message: ChatMessage,
    assembler: TranscriptAssembler,
    buffer: ToolCallBuffer,
    tool_call_ids: Vec<String>,
    produced: bool,
}

async fn idle_elapsed(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

impl StreamingController {
    pub fn new(tools: Option<ToolCallManager>, coalescer: SaveCoalescer) -> Self {
        Self {
            tools,
            coalescer,
            render: None,
            idle_timeout: None,
        }
    }

    pub fn with_render_sink(mut self, sink: RenderSink) -> Self {
        self.render = Some(sink);
        self
    }

    /// Fail a stream that goes quiet for this long.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn tools(&self) -> Option<&ToolCallManager> {
        self.tools.as_ref()
    }

    pub fn coalescer(&self) -> &SaveCoalescer {
        &self.coalescer
    }

    fn render(&self, update: RenderUpdate) {
        if let Some(sink) = &self.render {
            sink(update);
        }
    }

    /// Push a footnote that was attached outside the event stream.
    pub fn render_footnote(&self, message_id: &str, text: &str) {
        self.render(RenderUpdate::Footnote {
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
    }

    fn render_parts(&self, state: &StreamState) {
        self.render(RenderUpdate::Parts {
            message_id: state.message.id.clone(),
            parts: state.assembler.parts().to_vec(),
        });
    }

    /// Stream `events` into `message`, continuing after `seed_parts`.
    ///
    /// Cancellation returns `completed: false` without committing. An empty
    /// natural completion is an [`TurnError::EmptyResponse`]. A failure after
    /// output was produced is wrapped in [`TurnError::PartialOutput`].
    pub async fn stream(
        &self,
        mut events: EventStream,
        message: ChatMessage,
        cancel: &CancellationToken,
        seed_parts: Option<Vec<MessagePart>>,
    ) -> Result<StreamOutcome, TurnError> {
        let mut assembler = TranscriptAssembler::new();
        assembler.begin(seed_parts);
        let mut state = StreamState {
            message,
            assembler,
            buffer: ToolCallBuffer::new(),
            tool_call_ids: Vec::new(),
            produced: false,
        };
        let message_id = state.message.id.clone();
        tracing::debug!(message_id = %message_id, "stream started");

        let idle_timeout = self.idle_timeout;
        let mut idle_sleep = idle_timeout.map(|d| Box::pin(tokio::time::sleep(d)));
        let mut canceled = false;
        let mut failure: Option<TurnError> = None;

        loop {
            if cancel.is_cancelled() {
                canceled = true;
                break;
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    canceled = true;
                    break;
                }
                _ = idle_elapsed(&mut idle_sleep) => {
                    tracing::warn!(message_id = %message_id, "stream idle timeout");
                    failure = Some(TurnError::upstream(
                        UpstreamError::new(None, "stream idle timeout").with_code("stream_idle_timeout"),
                    ));
                    break;
                }
                next = events.next() => next,
            };
            let Some(next) = next else { break };
            match next {
                Ok(event) => {
                    if let (Some(sleep), Some(timeout)) = (idle_sleep.as_mut(), idle_timeout) {
                        sleep.as_mut().reset(tokio::time::Instant::now() + timeout);
                    }
                    self.apply_event(&mut state, event);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if canceled {
            let finalized = state.assembler.finalize();
            let mut message = state.message;
            message.content = finalized.content;
            message.reasoning = finalized.reasoning;
            message.message_parts = finalized.parts;
            tracing::info!(message_id = %message_id, "stream cancelled; partial output discarded");
            return Ok(StreamOutcome {
                message_id,
                stop_reason: message.stop_reason.clone(),
                message,
                completed: false,
                tool_call_ids: state.tool_call_ids,
            });
        }

        if let Some(err) = failure {
            tracing::warn!(message_id = %message_id, error = %err, produced = state.produced, "stream failed");
            return Err(if state.produced {
                TurnError::PartialOutput(Box::new(err))
            } else {
                err
            });
        }

        for leftover in state.buffer.take_leftovers() {
            tracing::debug!(tool_call_id = %leftover.request.id, "finalizing delta-only tool call");
            self.register_tool_call(&mut state, leftover);
        }

        let finalized = state.assembler.finalize();
        let mut message = state.message;
        message.content = finalized.content;
        message.reasoning = finalized.reasoning;
        message.message_parts = finalized.parts;
        if !message.has_output() {
            tracing::warn!(message_id = %message_id, "stream completed without output");
            return Err(TurnError::EmptyResponse);
        }
        self.render(RenderUpdate::Parts {
            message_id: message_id.clone(),
            parts: message.message_parts.clone(),
        });
        self.coalescer.commit(message.clone()).await;
        tracing::debug!(message_id = %message_id, tool_calls = state.tool_call_ids.len(), "stream committed");

        Ok(StreamOutcome {
            message_id,
            stop_reason: message.stop_reason.clone(),
            message,
            completed: true,
            tool_call_ids: state.tool_call_ids,
        })
    }

    fn apply_event(&self, state: &mut StreamState, event: StreamEvent) {
        match event {
            StreamEvent::Content { ref text } | StreamEvent::Reasoning { ref text } => {
                if text.is_empty() {
                    return;
                }
                state.produced = true;
                state.assembler.apply(&event);
                self.render_parts(state);
            }
            StreamEvent::ReasoningDetails { details } => {
                state.message.reasoning_details.extend(details);
            }
            StreamEvent::ToolCall { phase, ref call } => {
                state.produced = true;
                state.assembler.apply(&event);
                match phase {
                    ToolCallPhase::Delta => {
                        state.buffer.apply_delta(call);
                        self.render_parts(state);
                    }
                    ToolCallPhase::Final => {
                        if let Some(finalized) = state.buffer.finalize(call) {
                            self.register_tool_call(state, finalized);
                        }
                    }
                }
            }
            StreamEvent::Annotations { list } => state.message.extend_annotations(list),
            StreamEvent::Meta { key, value } => {
                if STOP_REASON_KEYS.contains(&key.as_str()) {
                    if let Some(reason) = value.as_str() {
                        state.message.stop_reason = Some(reason.to_string());
                    }
                }
                state.message.meta.insert(key, value);
            }
            StreamEvent::Footnote { text } => {
                state.message.footnotes.push(text.clone());
                self.render(RenderUpdate::Footnote {
                    message_id: state.message.id.clone(),
                    text,
                });
            }
        }
    }

    fn register_tool_call(&self, state: &mut StreamState, finalized: FinalizedCall) {
        let FinalizedCall {
            mut request,
            first_seen,
        } = finalized;
        state.produced = true;
        match &self.tools {
            Some(tools) => {
                let call = tools.create_tool_call(request.clone(), &state.message.id);
                request.id = call.id.clone();
                state.assembler.attach_tool_call(&call.id, first_seen);
                state.tool_call_ids.push(call.id.clone());
                self.render(RenderUpdate::ToolCall {
                    message_id: state.message.id.clone(),
                    call,
                });
            }
            None => {
                tracing::warn!(tool_name = %request.name(), "tool call received with tools disabled");
                state.assembler.attach_tool_call(&request.id, first_seen);
            }
        }
        state.message.push_tool_call(request);
        self.render_parts(state);
    }
}
