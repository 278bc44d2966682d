//! End-to-end turn tests against a scripted backend.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{content, frame, frames, tool_delta, tool_final, MemoryStore, RecordingExecutor, Reply, ScriptedBackend};
use turnloop::config::RuntimeConfig;
use turnloop::error::{TurnError, UpstreamError};
use turnloop::persistence::ConversationHandle;
use turnloop::prelude::*;
use turnloop::tools::ExecutionOptions;
use turnloop::turn::{Capability, InMemoryIncompatibilityStore, IncompatibilityStore, NoticeSource};
use turnloop::types::{ContextFile, PartKind};

const MODEL: &str = "test-model";

fn agent_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.tools.auto_execute = true;
    config
}

fn registry_with(name: &str, executor: Arc<dyn ToolExecutor>) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register_internal(name, executor);
    registry
}

fn request() -> TurnRequest {
    TurnRequest::builder().model_id(MODEL).build()
}

fn error_log() -> (Arc<Mutex<Vec<String>>>, turnloop::turn::TurnErrorSink) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink_log = log.clone();
    let sink: turnloop::turn::TurnErrorSink = Arc::new(move |err: &TurnError| {
        sink_log.lock().unwrap().push(err.to_string());
    });
    (log, sink)
}

#[tokio::test]
async fn plain_reply_is_one_content_part() {
    let backend = ScriptedBackend::new([Reply::Chunks(frames(&[content("Hello"), content(" world")]))]);
    let store = MemoryStore::new();
    let session = Session::new(backend.clone(), store.clone(), SessionOptions::default());

    let outcome = session
        .send(ChatMessage::user("hi"), request(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.continuations, 0);
    assert_eq!(outcome.message.content, "Hello world");
    assert_eq!(outcome.message.message_parts.len(), 1);
    assert_eq!(outcome.message.message_parts[0].kind, PartKind::Content);
    assert_eq!(backend.attempts(), 1);

    let saved = store.last().expect("commit saves the conversation");
    let assistant = saved.messages.iter().find(|m| m.id == outcome.message_id).unwrap();
    assert_eq!(assistant.content, "Hello world");
}

#[tokio::test]
async fn split_chunks_decode_identically() {
    let whole: String = frames(&[content("Hello"), content(" world")]).concat();
    let bytes = whole.as_bytes();
    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|c| String::from_utf8(c.to_vec()).unwrap())
        .collect();
    let backend = ScriptedBackend::new([Reply::Chunks(chunks)]);
    let session = Session::new(backend, MemoryStore::new(), SessionOptions::default());

    let outcome = session
        .send(ChatMessage::user("hi"), request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.message.content, "Hello world");
}

#[tokio::test]
async fn delta_then_final_runs_tool_once_and_continues() {
    let executor = RecordingExecutor::new(json!({"path": "A", "content": "alpha"}));
    let backend = ScriptedBackend::new([
        Reply::Chunks(frames(&[
            tool_delta(0, "call_A", "read", "{\"path\":\"A\""),
            tool_final(0, "call_A", "read", "{\"path\":\"A\"}"),
        ])),
        Reply::Chunks(frames(&[content("File A says alpha.")])),
    ]);
    let options = SessionOptions::builder()
        .config(agent_config())
        .registry(registry_with("read", executor.clone()))
        .build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);

    let outcome = session
        .send(ChatMessage::user("read A"), request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.calls(), vec![("read".to_string(), json!({"path": "A"}))]);
    let calls = session.tools().calls_for_message(&outcome.message_id);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request.function.arguments, "{\"path\":\"A\"}");
    assert_eq!(calls[0].state, ToolCallState::Completed);

    assert!(outcome.completed);
    assert_eq!(outcome.continuations, 1);
    assert_eq!(outcome.message.content, "File A says alpha.");
    let kinds: Vec<PartKind> = outcome.message.message_parts.iter().map(|p| p.kind).collect();
    assert_eq!(kinds, vec![PartKind::ToolCall, PartKind::Content]);

    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].message_id, outcome.message_id);
    assert_eq!(requests[1].continuation, 1);
    assert_eq!(requests[1].tool_results.len(), 1);
}

#[tokio::test]
async fn continuation_stops_when_no_new_tool_calls() {
    let executor = RecordingExecutor::new(json!({"ok": true}));
    let backend = ScriptedBackend::new([
        Reply::Chunks(frames(&[tool_final(0, "c1", "read", "{\"path\":\"A\"}")])),
        Reply::Chunks(frames(&[tool_final(0, "c2", "read", "{\"path\":\"B\"}")])),
        Reply::Chunks(frames(&[content("done")])),
    ]);
    let options = SessionOptions::builder()
        .config(agent_config())
        .registry(registry_with("read", executor.clone()))
        .build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);

    let outcome = session
        .send(ChatMessage::user("go"), request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.continuations, 2);
    assert_eq!(backend.attempts(), 3);
    assert_eq!(executor.calls().len(), 2);
    assert_eq!(session.orchestrator().active_message_id(), Some(outcome.message_id));
}

#[tokio::test]
async fn continuation_limit_is_enforced() {
    let executor = RecordingExecutor::new(json!({"ok": true}));
    let replies = (0..6).map(|n| {
        Reply::Chunks(frames(&[tool_final(0, &format!("c{n}"), "read", &format!("{{\"path\":\"{n}\"}}"))]))
    });
    let backend = ScriptedBackend::new(replies);
    let mut config = agent_config();
    config.turn.max_continuations = 2;
    let (errors, sink) = error_log();
    let options = SessionOptions::builder()
        .config(config)
        .registry(registry_with("read", executor))
        .on_error(sink)
        .build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);

    let err = session
        .send(ChatMessage::user("loop"), request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TurnError::ContinuationLimit { limit: 2 }));
    assert_eq!(backend.attempts(), 3);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn user_message_during_tools_abandons_continuation() {
    let conversation: Arc<Mutex<Option<ConversationHandle>>> = Arc::new(Mutex::new(None));
    let slot = conversation.clone();
    let executor = FnExecutor::new(move |_name, _args, options: ExecutionOptions| {
        let slot = slot.clone();
        async move {
            let handle = slot.lock().unwrap().clone().unwrap();
            while handle.get(&options.message_id).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle.push(ChatMessage::user("actually, stop"));
            Ok(json!({"ok": true}))
        }
    });
    let backend = ScriptedBackend::new([
        Reply::Chunks(frames(&[tool_final(0, "c1", "read", "{}")])),
        Reply::Chunks(frames(&[content("should not be requested")])),
    ]);
    let options = SessionOptions::builder()
        .config(agent_config())
        .registry(registry_with("read", Arc::new(executor)))
        .build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);
    *conversation.lock().unwrap() = Some(session.conversation().clone());

    let outcome = session
        .send(ChatMessage::user("go"), request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.continuations, 0);
    assert_eq!(backend.attempts(), 1);
}

#[tokio::test]
async fn cancel_during_tool_wait_stops_the_turn() {
    let cancel = CancellationToken::new();
    let conversation: Arc<Mutex<Option<ConversationHandle>>> = Arc::new(Mutex::new(None));
    let slot = conversation.clone();
    let trigger = cancel.clone();
    let executor = FnExecutor::new(move |_name, _args, options: ExecutionOptions| {
        let slot = slot.clone();
        let trigger = trigger.clone();
        async move {
            let handle = slot.lock().unwrap().clone().unwrap();
            while handle.get(&options.message_id).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
            std::future::pending().await
        }
    });
    let backend = ScriptedBackend::new([
        Reply::Chunks(frames(&[tool_final(0, "c1", "read", "{}")])),
        Reply::Chunks(frames(&[content("should not be requested")])),
    ]);
    let options = SessionOptions::builder()
        .config(agent_config())
        .registry(registry_with("read", Arc::new(executor)))
        .build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);
    *conversation.lock().unwrap() = Some(session.conversation().clone());

    let outcome = session.send(ChatMessage::user("go"), request(), &cancel).await.unwrap();

    assert!(!outcome.completed);
    assert_eq!(outcome.continuations, 0);
    assert_eq!(backend.attempts(), 1);
    let committed = session.conversation().get(&outcome.message_id).unwrap();
    assert_eq!(committed.tool_call_requests().len(), 1);
}

#[tokio::test]
async fn tools_rejection_downgrades_once_and_is_remembered() {
    let backend = ScriptedBackend::new([
        Reply::Reject(UpstreamError::tools_unsupported("This model does not support tools")),
        Reply::Chunks(frames(&[content("Plain answer")])),
        Reply::Chunks(frames(&[content("Second answer")])),
    ]);
    let compat = Arc::new(InMemoryIncompatibilityStore::new());
    let notices = Arc::new(Mutex::new(Vec::new()));
    let notice_log = notices.clone();
    let options = SessionOptions::builder()
        .compat(compat.clone() as Arc<dyn IncompatibilityStore>)
        .notices(Arc::new(move |notice: CompatibilityNotice| {
            notice_log.lock().unwrap().push((notice.capability, notice.source));
        }) as turnloop::turn::NoticeSink)
        .build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);

    let outcome = session
        .send(ChatMessage::user("hi"), request(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(backend.attempts(), 2);
    let requests = backend.requests();
    assert!(requests[0].tools_enabled);
    assert!(!requests[1].tools_enabled);
    assert!(compat.is_tool_incompatible(MODEL));
    assert_eq!(
        notices.lock().unwrap().clone(),
        vec![(Capability::Tools, NoticeSource::Runtime)]
    );
    assert_eq!(outcome.message.content, "Plain answer");
    assert_eq!(outcome.message.footnotes.len(), 1);
    assert!(outcome.message.footnotes[0].contains(MODEL));

    session
        .send(ChatMessage::user("again"), request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(backend.attempts(), 3);
    assert!(!backend.requests()[2].tools_enabled);
    assert_eq!(notices.lock().unwrap().last(), Some(&(Capability::Tools, NoticeSource::Cached)));
}

#[tokio::test]
async fn second_capability_rejection_is_not_retried() {
    let backend = ScriptedBackend::new([
        Reply::Reject(UpstreamError::images_unsupported("model does not support image input")),
        Reply::Reject(UpstreamError::images_unsupported("model does not support image input")),
    ]);
    let session = Session::new(backend.clone(), MemoryStore::new(), SessionOptions::default());
    let request = TurnRequest::builder().model_id(MODEL).images_enabled(true).build();

    let err = session
        .send(ChatMessage::user("look").with_images(true), request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(backend.attempts(), 2);
    assert!(err.upstream_error().is_some());
}

#[tokio::test]
async fn flagged_rate_limit_retries_once() {
    let backend = ScriptedBackend::new([
        Reply::Reject(UpstreamError::rate_limited(Some(0))),
        Reply::Chunks(frames(&[content("ok")])),
    ]);
    let (errors, sink) = error_log();
    let options = SessionOptions::builder().on_error(sink).build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);

    let outcome = session
        .send(ChatMessage::user("hi"), request(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(backend.attempts(), 2);
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn quota_errors_are_not_retried() {
    for error in [
        UpstreamError::new(Some(402), "Payment Required").with_retry(true, Some(0)),
        UpstreamError::new(Some(429), "You exceeded your current quota")
            .with_code("insufficient_quota")
            .with_retry(true, Some(0)),
    ] {
        let backend = ScriptedBackend::new([Reply::Reject(error), Reply::Chunks(frames(&[content("never")]))]);
        let (errors, sink) = error_log();
        let options = SessionOptions::builder().on_error(sink).build();
        let session = Session::new(backend.clone(), MemoryStore::new(), options);

        let result = session
            .send(ChatMessage::user("hi"), request(), &CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(backend.attempts(), 1);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn cancel_before_backoff_skips_retry() {
    let backend = ScriptedBackend::new([
        Reply::Reject(UpstreamError::rate_limited(Some(30))),
        Reply::Chunks(frames(&[content("never")])),
    ]);
    let session = Arc::new(Session::new(backend.clone(), MemoryStore::new(), SessionOptions::default()));
    let cancel = CancellationToken::new();

    let task = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.send(ChatMessage::user("hi"), request(), &cancel).await })
    };
    while backend.attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let outcome = task.await.unwrap().unwrap();
    assert!(!outcome.completed);
    assert_eq!(backend.attempts(), 1);
}

#[tokio::test]
async fn cancel_mid_stream_discards_partial_output() {
    let backend = ScriptedBackend::new([Reply::Hang(vec![frame(&content("partial"))])]);
    let store = MemoryStore::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let options = SessionOptions::builder()
        .render(Arc::new(move |update: RenderUpdate| {
            if matches!(update, RenderUpdate::Parts { .. }) {
                trigger.cancel();
            }
        }) as turnloop::streaming::RenderSink)
        .build();
    let session = Session::new(backend, store.clone(), options);

    let outcome = session.send(ChatMessage::user("hi"), request(), &cancel).await.unwrap();

    assert!(!outcome.completed);
    assert!(session.conversation().get(&outcome.message_id).is_none());
    assert_eq!(session.coalescer().completed_saves(), 0);
    assert!(store
        .last()
        .map_or(true, |saved| saved.messages.iter().all(|m| m.id != outcome.message_id)));
}

#[tokio::test]
async fn context_overflow_drops_largest_files() {
    let backend = ScriptedBackend::new([
        Reply::Reject(UpstreamError::context_overflow("prompt is too long")),
        Reply::Chunks(frames(&[content("fits now")])),
    ]);
    let session = Session::new(backend.clone(), MemoryStore::new(), SessionOptions::default());
    let request = TurnRequest::builder()
        .model_id(MODEL)
        .context_files(vec![
            ContextFile::new("big.rs", "x".repeat(1000)),
            ContextFile::new("small.rs", "y".repeat(10)),
        ])
        .build();

    let outcome = session
        .send(ChatMessage::user("review"), request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.message.content, "fits now");
    let requests = backend.requests();
    assert_eq!(requests[0].context_files.len(), 2);
    let kept: Vec<&str> = requests[1].context_files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(kept, vec!["small.rs"]);
}

#[tokio::test]
async fn overflow_after_output_is_surfaced() {
    let backend = ScriptedBackend::new([Reply::FailAfter(
        vec![frame(&content("par"))],
        UpstreamError::context_overflow("prompt is too long"),
    )]);
    let session = Session::new(backend.clone(), MemoryStore::new(), SessionOptions::default());
    let request = TurnRequest::builder()
        .model_id(MODEL)
        .context_files(vec![ContextFile::new("a", "abc")])
        .build();

    let err = session
        .send(ChatMessage::user("hi"), request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.produced_output());
    assert_eq!(backend.attempts(), 1);
}

#[tokio::test]
async fn empty_stream_is_an_upstream_fault() {
    let backend = ScriptedBackend::new([Reply::Chunks(frames(&[]))]);
    let session = Session::new(backend, MemoryStore::new(), SessionOptions::default());

    let err = session
        .send(ChatMessage::user("hi"), request(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TurnError::EmptyResponse));
    assert_eq!(session.conversation().messages().len(), 1);
}

#[tokio::test]
async fn repeated_failing_call_is_loop_blocked() {
    let executor = FnExecutor::new(|_name, _args, _options| async {
        Err(TurnError::Configuration("boom".into()))
    });
    let same = || Reply::Chunks(frames(&[tool_final(0, "c", "write_file", "{\"path\":\"x\"}")]));
    let backend = ScriptedBackend::new([same(), same(), same(), Reply::Chunks(frames(&[content("giving up")]))]);
    let options = SessionOptions::builder()
        .config(agent_config())
        .registry(registry_with("write_file", Arc::new(executor)))
        .build();
    let session = Session::new(backend.clone(), MemoryStore::new(), options);

    let outcome = session
        .send(ChatMessage::user("write"), request(), &CancellationToken::new())
        .await
        .unwrap();

    let codes: Vec<Option<String>> = session
        .tools()
        .calls_for_message(&outcome.message_id)
        .iter()
        .map(|call| call.error_code().map(str::to_string))
        .collect();
    assert_eq!(
        codes,
        vec![
            Some("EXECUTION_ERROR".to_string()),
            Some("EXECUTION_ERROR".to_string()),
            Some("LOOP_BLOCKED".to_string()),
        ]
    );
    assert_eq!(outcome.message.content, "giving up");
}
