//! Shared test helpers: scripted backend, in-memory store, recording executor.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use turnloop::backend::{BackendRequest, ByteStream, ModelBackend};
use turnloop::error::{TurnError, UpstreamError};
use turnloop::persistence::{Conversation, PersistenceBackend};
use turnloop::tools::{ExecutionOptions, ToolExecutor};
use turnloop::types::{StreamEvent, ToolCallDelta, ToolCallPhase};

/// Encode one event as an SSE data line.
pub fn frame(event: &StreamEvent) -> String {
    format!("data: {}\n\n", serde_json::to_string(event).unwrap())
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// Frames for `events` followed by the sentinel.
pub fn frames(events: &[StreamEvent]) -> Vec<String> {
    events.iter().map(frame).chain(std::iter::once(done())).collect()
}

pub fn content(text: &str) -> StreamEvent {
    StreamEvent::content(text)
}

pub fn tool_final(index: usize, id: &str, name: &str, args: &str) -> StreamEvent {
    StreamEvent::tool_call(
        ToolCallPhase::Final,
        ToolCallDelta::new(index).with_id(id).with_name(name).with_arguments(args),
    )
}

pub fn tool_delta(index: usize, id: &str, name: &str, args: &str) -> StreamEvent {
    StreamEvent::tool_call(
        ToolCallPhase::Delta,
        ToolCallDelta::new(index).with_id(id).with_name(name).with_arguments(args),
    )
}

/// One scripted reply to a `stream` call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream these chunks, then end.
    Chunks(Vec<String>),
    /// Fail before any byte is produced.
    Reject(UpstreamError),
    /// Stream these chunks, then fail.
    FailAfter(Vec<String>, UpstreamError),
    /// Stream these chunks, then never end.
    Hang(Vec<String>),
}

/// Backend that replays queued replies and records every request.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<BackendRequest>>,
    attempts: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn chunk_stream(chunks: Vec<String>) -> futures::stream::BoxStream<'static, Result<Vec<u8>, TurnError>> {
    futures::stream::iter(chunks.into_iter().map(|c| Ok(c.into_bytes()))).boxed()
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn stream(
        &self,
        request: &BackendRequest,
        _cancel: CancellationToken,
    ) -> Result<ByteStream, TurnError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Chunks(frames(&[content("fallback")])));
        match reply {
            Reply::Chunks(chunks) => Ok(chunk_stream(chunks)),
            Reply::Reject(err) => Err(TurnError::upstream(err)),
            Reply::FailAfter(chunks, err) => Ok(chunk_stream(chunks)
                .chain(futures::stream::once(async move { Err(TurnError::upstream(err)) }))
                .boxed()),
            Reply::Hang(chunks) => Ok(chunk_stream(chunks).chain(futures::stream::pending()).boxed()),
        }
    }
}

/// Persistence backend that keeps every saved snapshot.
#[derive(Default)]
pub struct MemoryStore {
    saves: Mutex<Vec<Conversation>>,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let store = Self::default();
        store.fail.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Conversation> {
        self.saves.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryStore {
    async fn save(&self, conversation: &Conversation) -> turnloop::error::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TurnError::Persistence("disk full".into()));
        }
        self.saves.lock().unwrap().push(conversation.clone());
        Ok(())
    }
}

/// Executor that records calls and answers with a fixed value.
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, Value)>>,
    response: Value,
}

impl RecordingExecutor {
    pub fn new(response: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            response,
        })
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        _options: &ExecutionOptions,
    ) -> Result<Value, TurnError> {
        self.calls.lock().unwrap().push((tool_name.to_string(), args));
        Ok(self.response.clone())
    }
}
