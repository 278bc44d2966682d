//! Event pipeline: raw transport chunks to normalized [`StreamEvent`]s.
//!
//! The pipeline only knows about line framing. Each complete line is either
//! an SSE field (`data: {...}`), a bare JSON frame, a comment, or the
//! `[DONE]` sentinel. Partial trailing lines are carried over to the next
//! chunk, so the decoded sequence does not depend on where chunk boundaries
//! fall. Malformed frames are skipped.

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::backend::ByteStream;
use crate::error::TurnError;
use crate::types::StreamEvent;

/// End-of-stream sentinel payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Stream of decoded events.
pub type EventStream = BoxStream<'static, Result<StreamEvent, TurnError>>;

/// Events decoded from one pushed chunk.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PushOutcome {
    pub events: Vec<StreamEvent>,
    /// The sentinel was seen; later input is ignored.
    pub done: bool,
}

/// Stateful per-stream decoder.
#[derive(Debug, Default)]
pub struct EventPipeline {
    buffer: Vec<u8>,
    done: bool,
    skipped_frames: usize,
}

impl EventPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of malformed frames dropped so far.
    pub fn skipped_frames(&self) -> usize {
        self.skipped_frames
    }

    /// Feed one transport chunk.
    pub fn push(&mut self, chunk: &[u8]) -> PushOutcome {
        let mut events = Vec::new();
        if self.done {
            return PushOutcome { events, done: true };
        }
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let line_end = consumed + offset;
            let line = String::from_utf8_lossy(&self.buffer[consumed..line_end]).into_owned();
            consumed = line_end + 1;
            self.handle_line(&line, &mut events);
            if self.done {
                self.buffer.clear();
                return PushOutcome { events, done: true };
            }
        }
        self.buffer.drain(..consumed);

        PushOutcome {
            events,
            done: self.done,
        }
    }

    /// Decode whatever is left in the buffer as a final, unterminated line.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done || self.buffer.is_empty() {
            self.buffer.clear();
            return events;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest).into_owned();
        self.handle_line(&line, &mut events);
        events
    }

    fn handle_line(&mut self, raw: &str, events: &mut Vec<StreamEvent>) {
        let line = raw.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let payload = match line.strip_prefix("data:") {
            Some(data) => data.trim_start(),
            None if line.starts_with('{') => line,
            // Other SSE fields (event:, id:, retry:) carry nothing we use.
            None => return,
        };
        if payload == DONE_SENTINEL {
            self.done = true;
            return;
        }
        match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => events.push(event),
            Err(err) => {
                self.skipped_frames += 1;
                tracing::warn!(error = %err, frame_len = payload.len(), "skipping malformed stream frame");
            }
        }
    }
}

/// Adapt a chunked byte source into an event stream.
///
/// Stops reading from the source once the sentinel is seen. Transport errors
/// are forwarded and end the stream.
pub fn decode_stream(bytes: ByteStream) -> EventStream {
    let stream = async_stream::stream! {
        let mut pipeline = EventPipeline::new();
        let mut inner = bytes;
        while let Some(chunk) = inner.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let outcome = pipeline.push(&chunk);
            for event in outcome.events {
                yield Ok(event);
            }
            if outcome.done {
                return;
            }
        }
        for event in pipeline.flush() {
            yield Ok(event);
        }
    };
    Box::pin(stream)
}
