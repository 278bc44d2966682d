//! Tool-call lifecycle manager.
//!
//! Owns every [`ToolCall`] and the execution queue. Other components read
//! calls through accessors and react to [`ToolCallEvent`]s; nothing else
//! mutates a call. Executor failures, timeouts and panics are folded into
//! failed results, so no method here returns an execution error.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::events::{ObserverList, Subscription, ToolCallEvent, ToolCallListener};
use super::executor::ExecutionOptions;
use super::loop_guard::{self, SchemaRetryGuard};
use super::policy::ApprovalPolicy;
use super::registry::ToolRegistry;
use super::truncation::truncate_result;
use crate::config::ToolConfig;
use crate::error::{Result, TurnError};
use crate::types::{
    ToolCall, ToolCallRequest, ToolCallState, ToolError, ToolErrorCode, ToolResult, ToolTarget,
};
use crate::util::timeout::with_timeout;

/// How a wait for a message's tool calls ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every call for the message is terminal.
    Settled,
    TimedOut,
    Canceled,
}

#[derive(Debug)]
struct ManagerState {
    calls: HashMap<String, ToolCall>,
    /// Call ids in creation order.
    order: Vec<String>,
    queue: VecDeque<String>,
    running: usize,
    schema_guard: SchemaRetryGuard,
    disposed: bool,
}

struct Inner {
    registry: Arc<ToolRegistry>,
    policy: Arc<ApprovalPolicy>,
    config: ToolConfig,
    state: Mutex<ManagerState>,
    observers: ObserverList,
    changed: Notify,
    shutdown: CancellationToken,
}

/// Cheap-to-clone handle to one conversation's tool calls.
#[derive(Clone)]
pub struct ToolCallManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ToolCallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ToolCallManager")
            .field("calls", &state.calls.len())
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .finish()
    }
}

impl ToolCallManager {
    pub fn new(registry: Arc<ToolRegistry>, policy: Arc<ApprovalPolicy>, config: ToolConfig) -> Self {
        let schema_guard =
            SchemaRetryGuard::new(config.schema_retry_max_attempts, config.schema_retry_window());
        Self {
            inner: Arc::new(Inner {
                registry,
                policy,
                config,
                state: Mutex::new(ManagerState {
                    calls: HashMap::new(),
                    order: Vec::new(),
                    queue: VecDeque::new(),
                    running: 0,
                    schema_guard,
                    disposed: false,
                }),
                observers: ObserverList::default(),
                changed: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn policy(&self) -> &Arc<ApprovalPolicy> {
        &self.inner.policy
    }

    pub fn subscribe(&self, listener: ToolCallListener) -> Subscription {
        self.inner.observers.subscribe(listener)
    }

    fn emit_all(&self, events: Vec<ToolCallEvent>) {
        for event in &events {
            self.inner.observers.emit(event);
        }
    }

    fn is_schema_validated(&self, tool_name: &str) -> bool {
        self.inner
            .config
            .schema_validated_tools
            .iter()
            .any(|name| name == tool_name)
    }

    /// Register a finalized request for `message_id`.
    ///
    /// Unavailable tools and guarded repeats come back already `failed` and
    /// never reach the queue. Must be called inside a Tokio runtime.
    pub fn create_tool_call(&self, request: ToolCallRequest, message_id: &str) -> ToolCall {
        let full_name = request.name().trim().to_string();
        let parsed = request.parsed_arguments();
        let signature = match &parsed {
            Ok(args) => loop_guard::signature(&full_name, args),
            Err(_) => loop_guard::raw_signature(&full_name, &request.function.arguments),
        };
        let raw_arguments = request.function.arguments.clone();
        let resolved = self.inner.registry.resolve(&full_name);

        let mut events = Vec::new();
        let call = {
            let mut state = self.state();
            let id = unique_id(&state.calls, &request.id);
            let mut call = ToolCall {
                id: id.clone(),
                message_id: message_id.to_string(),
                request,
                state: ToolCallState::Pending,
                timestamp: Utc::now(),
                signature,
                target: None,
                server_id: None,
                auto_approved: None,
                approved_at: None,
                execution_started_at: None,
                execution_completed_at: None,
                result: None,
            };

            let admission = if state.disposed {
                Err(ToolError::new(ToolErrorCode::Canceled, "Tool manager was disposed"))
            } else {
                resolved.and_then(|target| {
                    call.server_id = target.server_id().map(str::to_string);
                    call.target = Some(target.clone());
                    if let Some(err) =
                        loop_guard::check_repeated(state.calls.values(), message_id, &call.signature)
                    {
                        return Err(err);
                    }
                    let args = parsed.map_err(|err| {
                        ToolError::new(
                            ToolErrorCode::InvalidArguments,
                            format!("Tool arguments are not valid JSON: {err}"),
                        )
                        .with_details(serde_json::json!({ "arguments": raw_arguments }))
                    })?;
                    if self.is_schema_validated(target.tool_name()) {
                        if let Some(err) = state.schema_guard.check(target.tool_name(), &args) {
                            return Err(err);
                        }
                    }
                    Ok(target)
                })
            };

            match admission {
                Err(error) => {
                    tracing::warn!(
                        tool_call_id = %id,
                        tool_name = %full_name,
                        code = %error.code,
                        "tool call rejected at creation"
                    );
                    transition(&mut call, ToolCallState::Failed);
                    call.execution_completed_at = Some(Utc::now());
                    call.result = Some(ToolResult::err(error));
                }
                Ok(target) => {
                    let trusted = target
                        .server_id()
                        .is_some_and(|server| self.inner.registry.is_server_trusted(server));
                    let auto = self
                        .inner
                        .policy
                        .should_auto_approve(&target, &full_name, trusted);
                    call.auto_approved = Some(auto);
                    if auto {
                        transition(&mut call, ToolCallState::Approved);
                        call.approved_at = Some(Utc::now());
                        state.queue.push_back(id.clone());
                    }
                    tracing::debug!(tool_call_id = %id, tool_name = %full_name, auto, "tool call created");
                }
            }

            state.order.push(id.clone());
            state.calls.insert(id, call.clone());
            call
        };

        events.push(ToolCallEvent::Created { call: call.clone() });
        if call.state == ToolCallState::Pending {
            events.push(ToolCallEvent::ApprovalRequired { call: call.clone() });
        }
        self.emit_all(events);
        self.inner.changed.notify_waiters();
        self.drain();
        self.get(&call.id).unwrap_or(call)
    }

    /// Move a pending call, applying `update`, and emit the change.
    fn settle_pending(
        &self,
        id: &str,
        to: ToolCallState,
        update: impl FnOnce(&mut ToolCall),
    ) -> Result<ToolCall> {
        let call = {
            let mut state = self.state();
            let call = state
                .calls
                .get_mut(id)
                .ok_or_else(|| TurnError::ToolNotFound(id.to_string()))?;
            if call.state != ToolCallState::Pending {
                return Err(TurnError::InvalidState(format!(
                    "tool call {id} is {}, not pending",
                    call.state
                )));
            }
            transition(call, to);
            update(call);
            let call = call.clone();
            if to == ToolCallState::Approved {
                state.queue.push_back(id.to_string());
            }
            call
        };
        self.emit_all(vec![ToolCallEvent::StateChanged {
            call: call.clone(),
            from: ToolCallState::Pending,
            to,
        }]);
        self.inner.changed.notify_waiters();
        Ok(call)
    }

    pub fn approve_tool_call(&self, id: &str) -> Result<ToolCall> {
        let call = self.settle_pending(id, ToolCallState::Approved, |call| {
            call.approved_at = Some(Utc::now());
        })?;
        self.drain();
        Ok(self.get(id).unwrap_or(call))
    }

    pub fn deny_tool_call(&self, id: &str) -> Result<ToolCall> {
        self.settle_pending(id, ToolCallState::Denied, |call| {
            call.execution_completed_at = Some(Utc::now());
            call.result = Some(ToolResult::err(ToolError::new(
                ToolErrorCode::Denied,
                "The user denied this tool call",
            )));
        })
    }

    pub fn cancel_tool_call(&self, id: &str, reason: &str) -> Result<ToolCall> {
        let reason = reason.to_string();
        self.settle_pending(id, ToolCallState::Denied, move |call| {
            call.execution_completed_at = Some(Utc::now());
            call.result = Some(ToolResult::err(ToolError::new(ToolErrorCode::Canceled, reason)));
        })
    }

    /// Start queued calls until the concurrency limit is reached.
    fn drain(&self) {
        let limit = self.inner.config.effective_concurrency();
        loop {
            let call = {
                let mut state = self.state();
                if state.disposed || state.running >= limit {
                    return;
                }
                let Some(id) = state.queue.pop_front() else {
                    return;
                };
                let Some(call) = state.calls.get_mut(&id) else {
                    continue;
                };
                if call.state != ToolCallState::Approved {
                    continue;
                }
                transition(call, ToolCallState::Executing);
                call.execution_started_at = Some(Utc::now());
                let call = call.clone();
                state.running += 1;
                call
            };
            tracing::debug!(tool_call_id = %call.id, tool_name = %call.tool_name(), "executing tool call");
            self.emit_all(vec![ToolCallEvent::StateChanged {
                call: call.clone(),
                from: ToolCallState::Approved,
                to: ToolCallState::Executing,
            }]);
            let manager = self.clone();
            tokio::spawn(async move {
                let result = manager.execute_tool_call(&call).await;
                manager.finish(&call.id, result);
            });
        }
    }

    /// Run one call through its executor with the configured timeout.
    async fn execute_tool_call(&self, call: &ToolCall) -> ToolResult {
        let Some(target) = call.target.clone() else {
            return ToolResult::err(ToolError::new(
                ToolErrorCode::ToolNotFound,
                format!("Tool '{}' is not available", call.tool_name()),
            ));
        };
        let Some(executor) = self.inner.registry.executor_for(&target) else {
            return ToolResult::err(ToolError::new(
                ToolErrorCode::ToolNotFound,
                format!("Tool '{}' is no longer available", call.tool_name()),
            ));
        };
        let timeout = self.inner.config.effective_timeout();
        let options = ExecutionOptions {
            tool_call_id: call.id.clone(),
            message_id: call.message_id.clone(),
            timeout,
            cancel: self.inner.shutdown.child_token(),
        };
        let tool_name = target.tool_name().to_string();
        let args = match call.request.parsed_arguments() {
            Ok(args) => args,
            Err(err) => {
                return ToolResult::err(ToolError::new(
                    ToolErrorCode::InvalidArguments,
                    format!("Tool arguments are not valid JSON: {err}"),
                ))
            }
        };
        let mut handle =
            tokio::spawn(async move { executor.execute(&tool_name, args, &options).await });
        let abort = handle.abort_handle();

        let outcome = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                abort.abort();
                return ToolResult::err(ToolError::new(ToolErrorCode::Canceled, "Tool manager was disposed"));
            }
            outcome = with_timeout(timeout, &mut handle) => outcome,
        };

        let error_code = match target {
            ToolTarget::Internal { .. } => ToolErrorCode::ExecutionError,
            ToolTarget::External { .. } => ToolErrorCode::ToolExecutionError,
        };
        match outcome {
            None => {
                abort.abort();
                let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
                tracing::warn!(tool_call_id = %call.id, timeout_secs = secs, "tool call timed out");
                ToolResult::err(
                    ToolError::new(
                        ToolErrorCode::Timeout,
                        format!("Tool execution timed out after {secs}s"),
                    )
                    .with_details(serde_json::json!({ "timeoutSeconds": secs })),
                )
            }
            Some(Err(join_err)) => ToolResult::err(
                ToolError::new(error_code, format!("Tool execution aborted: {join_err}"))
                    .with_details(serde_json::json!({ "toolName": call.tool_name() })),
            ),
            Some(Ok(Err(err))) => ToolResult::err(
                ToolError::new(error_code, err.to_string())
                    .with_details(serde_json::json!({ "toolName": call.tool_name() })),
            ),
            Some(Ok(Ok(value))) => self.interpret_output(value),
        }
    }

    /// Executors may report a structured failure as `{success: false, error}`.
    fn interpret_output(&self, value: serde_json::Value) -> ToolResult {
        let is_failure = value.get("success").and_then(|s| s.as_bool()) == Some(false);
        if is_failure {
            if let Some(Ok(error)) = value
                .get("error")
                .map(|e| serde_json::from_value::<ToolError>(e.clone()))
            {
                return ToolResult::err(error);
            }
        }
        ToolResult::ok(truncate_result(value, self.inner.config.max_result_bytes))
    }

    fn finish(&self, id: &str, result: ToolResult) {
        let call = {
            let mut state = self.state();
            state.running = state.running.saturating_sub(1);
            let schema_tracked = state
                .calls
                .get(id)
                .and_then(|c| c.target.as_ref())
                .map(|t| t.tool_name().to_string())
                .filter(|name| self.is_schema_validated(name));
            let Some(call) = state.calls.get_mut(id) else {
                return;
            };
            if call.state != ToolCallState::Executing {
                return;
            }
            let to = if result.success {
                ToolCallState::Completed
            } else {
                ToolCallState::Failed
            };
            transition(call, to);
            call.execution_completed_at = Some(Utc::now());
            call.result = Some(result.clone());
            let call = call.clone();
            if let (Some(tool_name), Ok(args)) = (schema_tracked, call.request.parsed_arguments()) {
                let validation_failed = result
                    .error
                    .as_ref()
                    .is_some_and(|e| e.is(ToolErrorCode::ValidationFailed));
                if validation_failed {
                    state.schema_guard.record_failure(&tool_name, &args);
                } else if result.success {
                    state.schema_guard.record_success(&tool_name, &args);
                }
            }
            call
        };
        tracing::debug!(tool_call_id = %call.id, state = %call.state, "tool call settled");
        self.emit_all(vec![ToolCallEvent::StateChanged {
            call: call.clone(),
            from: ToolCallState::Executing,
            to: call.state,
        }]);
        self.inner.changed.notify_waiters();
        self.drain();
    }

    pub fn get(&self, id: &str) -> Option<ToolCall> {
        self.state().calls.get(id).cloned()
    }

    /// Calls for one message, in creation order.
    pub fn calls_for_message(&self, message_id: &str) -> Vec<ToolCall> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.calls.get(id))
            .filter(|call| call.message_id == message_id)
            .cloned()
            .collect()
    }

    pub fn executing_count(&self) -> usize {
        self.state()
            .calls
            .values()
            .filter(|call| call.state == ToolCallState::Executing)
            .count()
    }

    fn all_terminal(&self, message_id: &str) -> bool {
        self.state()
            .calls
            .values()
            .filter(|call| call.message_id == message_id)
            .all(ToolCall::is_terminal)
    }

    /// Wait until every call for `message_id` is terminal.
    pub async fn wait_for_message_tools(
        &self,
        message_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if cancel.is_cancelled() {
                return WaitOutcome::Canceled;
            }
            if self.all_terminal(message_id) {
                return WaitOutcome::Settled;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WaitOutcome::Canceled,
                _ = &mut deadline => {
                    tracing::warn!(message_id, timeout_secs = timeout.as_secs(), "timed out waiting for tool calls");
                    return WaitOutcome::TimedOut;
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Terminal calls, most recent first, capped by `context_result_limit`.
    pub fn get_tool_results_for_context(&self) -> Vec<ToolCall> {
        let state = self.state();
        let mut terminal: Vec<(usize, &ToolCall)> = state
            .order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| state.calls.get(id).map(|call| (pos, call)))
            .filter(|(_, call)| call.is_terminal())
            .collect();
        terminal.sort_by(|(pa, a), (pb, b)| b.settled_at().cmp(&a.settled_at()).then(pb.cmp(pa)));
        let limit = self.inner.config.context_result_limit.unwrap_or(usize::MAX);
        terminal
            .into_iter()
            .take(limit)
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Drop terminal calls and schema-retry history.
    pub fn clear(&self) {
        let mut state = self.state();
        state.calls.retain(|_, call| !call.is_terminal());
        let ManagerState { calls, order, .. } = &mut *state;
        order.retain(|id| calls.contains_key(id));
        state.schema_guard.clear();
    }

    /// Cancel outstanding calls and refuse further work.
    pub fn dispose(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.queue.clear();
            for call in state.calls.values_mut() {
                let to = match call.state {
                    ToolCallState::Pending => ToolCallState::Denied,
                    ToolCallState::Approved => ToolCallState::Failed,
                    _ => continue,
                };
                let from = call.state;
                transition(call, to);
                call.execution_completed_at = Some(Utc::now());
                call.result = Some(ToolResult::err(ToolError::new(
                    ToolErrorCode::Canceled,
                    "Tool manager was disposed",
                )));
                events.push(ToolCallEvent::StateChanged {
                    call: call.clone(),
                    from,
                    to,
                });
            }
        }
        self.inner.shutdown.cancel();
        self.emit_all(events);
        self.inner.observers.clear();
        self.inner.changed.notify_waiters();
    }
}

fn transition(call: &mut ToolCall, to: ToolCallState) {
    debug_assert!(
        call.state.can_transition_to(to),
        "illegal tool call transition {} -> {to}",
        call.state
    );
    call.state = to;
}

fn unique_id(calls: &HashMap<String, ToolCall>, requested: &str) -> String {
    if !calls.contains_key(requested) {
        return requested.to_string();
    }
    (2..)
        .map(|n| format!("{requested}_{n}"))
        .find(|candidate| !calls.contains_key(candidate))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::executor::FnExecutor;
    use crate::tools::ToolExecutor;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ToolConfig {
        ToolConfig::default()
    }

    fn manager_with(executor: Arc<dyn ToolExecutor>, config: ToolConfig) -> ToolCallManager {
        let registry = Arc::new(ToolRegistry::new());
        registry.register_internal("read", executor.clone());
        registry.register_internal("write", executor.clone());
        registry.register_internal("write_canvas", executor);
        let policy = Arc::new(ApprovalPolicy::from_config(&config));
        ToolCallManager::new(registry, policy, config)
    }

    fn echo() -> Arc<dyn ToolExecutor> {
        Arc::new(FnExecutor::new(|name, args, _| async move {
            Ok(serde_json::json!({ "tool": name, "args": args }))
        }))
    }

    fn failing() -> Arc<dyn ToolExecutor> {
        Arc::new(FnExecutor::new(|_, _, _| async {
            Err(TurnError::InvalidState("disk on fire".into()))
        }))
    }

    async fn settle(manager: &ToolCallManager, message_id: &str) {
        let outcome = manager
            .wait_for_message_tools(message_id, Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::Settled);
    }

    #[tokio::test]
    async fn read_only_call_runs_to_completion() {
        let manager = manager_with(echo(), config());
        let call = manager.create_tool_call(ToolCallRequest::new("c1", "read", r#"{"path":"A"}"#), "m1");
        assert_eq!(call.auto_approved, Some(true));
        settle(&manager, "m1").await;

        let call = manager.get("c1").unwrap();
        assert_eq!(call.state, ToolCallState::Completed);
        let result = call.result.unwrap();
        assert!(result.success);
        assert_eq!(result.data.unwrap()["args"]["path"], "A");
    }

    #[tokio::test]
    async fn unknown_tool_fails_immediately() {
        let manager = manager_with(echo(), config());
        let call = manager.create_tool_call(ToolCallRequest::new("c1", "nope", "{}"), "m1");
        assert_eq!(call.state, ToolCallState::Failed);
        assert_eq!(call.error_code(), Some("TOOL_NOT_FOUND"));
    }

    #[tokio::test]
    async fn destructive_call_waits_for_approval() {
        let manager = manager_with(echo(), config());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _sub = manager.subscribe(Arc::new(move |event| {
            if matches!(event, ToolCallEvent::ApprovalRequired { .. }) {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let call = manager.create_tool_call(ToolCallRequest::new("c1", "write", "{}"), "m1");
        assert_eq!(call.state, ToolCallState::Pending);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        manager.approve_tool_call("c1").unwrap();
        settle(&manager, "m1").await;
        assert_eq!(manager.get("c1").unwrap().state, ToolCallState::Completed);
        assert!(matches!(
            manager.approve_tool_call("c1"),
            Err(TurnError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn deny_and_cancel_set_structured_errors() {
        let manager = manager_with(echo(), config());
        manager.create_tool_call(ToolCallRequest::new("c1", "write", r#"{"a":1}"#), "m1");
        manager.create_tool_call(ToolCallRequest::new("c2", "write", r#"{"a":2}"#), "m1");

        let denied = manager.deny_tool_call("c1").unwrap();
        assert_eq!(denied.state, ToolCallState::Denied);
        assert_eq!(denied.error_code(), Some("DENIED"));

        let canceled = manager.cancel_tool_call("c2", "user stopped").unwrap();
        assert_eq!(canceled.state, ToolCallState::Denied);
        assert_eq!(canceled.error_code(), Some("CANCELED"));
        assert!(matches!(manager.deny_tool_call("missing"), Err(TurnError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn repeated_failures_are_loop_blocked() {
        let manager = manager_with(failing(), config());
        for id in ["c1", "c2"] {
            manager.create_tool_call(ToolCallRequest::new(id, "read", r#"{"path":"A"}"#), "m1");
            settle(&manager, "m1").await;
            assert_eq!(manager.get(id).unwrap().error_code(), Some("EXECUTION_ERROR"));
        }
        let third =
            manager.create_tool_call(ToolCallRequest::new("c3", "read", r#"{ "path" : "A" }"#), "m1");
        assert_eq!(third.error_code(), Some("LOOP_BLOCKED"));

        // A different message has its own history.
        let other = manager.create_tool_call(ToolCallRequest::new("c4", "read", r#"{"path":"A"}"#), "m2");
        assert_ne!(other.error_code(), Some("LOOP_BLOCKED"));
    }

    #[tokio::test]
    async fn malformed_arguments_fail_without_running() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let executor: Arc<dyn ToolExecutor> = Arc::new(FnExecutor::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(serde_json::Value::Null) }
        }));
        let manager = manager_with(executor, config());

        let first = manager.create_tool_call(ToolCallRequest::new("c1", "read", r#"{"path":"A""#), "m1");
        let second = manager.create_tool_call(ToolCallRequest::new("c2", "read", r#"{"path":"B""#), "m1");
        settle(&manager, "m1").await;

        for call in [&first, &second] {
            assert_eq!(call.state, ToolCallState::Failed);
            assert_eq!(call.error_code(), Some("INVALID_ARGUMENTS"));
        }
        let details = first.result.as_ref().and_then(|r| r.error.as_ref()).and_then(|e| e.details.clone());
        assert_eq!(details, Some(serde_json::json!({"arguments": r#"{"path":"A""#})));
        assert_ne!(first.signature, second.signature);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denied_signature_is_blocked_on_retry() {
        let manager = manager_with(echo(), config());
        manager.create_tool_call(ToolCallRequest::new("c1", "write", r#"{"p":1}"#), "m1");
        manager.deny_tool_call("c1").unwrap();
        let retry = manager.create_tool_call(ToolCallRequest::new("c2", "write", r#"{"p":1}"#), "m1");
        assert_eq!(retry.state, ToolCallState::Failed);
        assert_eq!(retry.error_code(), Some("LOOP_BLOCKED"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_become_structured_results() {
        let slow: Arc<dyn ToolExecutor> = Arc::new(FnExecutor::new(|_, _, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::Value::Null)
        }));
        let config = ToolConfig {
            timeout_secs: 1,
            ..config()
        };
        let manager = manager_with(slow, config);
        manager.create_tool_call(ToolCallRequest::new("c1", "read", "{}"), "m1");
        settle(&manager, "m1").await;
        let call = manager.get("c1").unwrap();
        assert_eq!(call.state, ToolCallState::Failed);
        assert_eq!(call.error_code(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let executor: Arc<dyn ToolExecutor> = Arc::new(FnExecutor::new(move |_, _, _| {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        }));
        let config = ToolConfig {
            concurrency_limit: 2,
            ..config()
        };
        let manager = manager_with(executor, config);
        for i in 0..7 {
            manager.create_tool_call(
                ToolCallRequest::new(format!("c{i}"), "read", format!(r#"{{"i":{i}}}"#)),
                "m1",
            );
            assert!(manager.executing_count() <= 2);
        }
        settle(&manager, "m1").await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(manager
            .calls_for_message("m1")
            .iter()
            .all(|c| c.state == ToolCallState::Completed));
    }

    #[tokio::test]
    async fn schema_validation_failures_are_bounded() {
        let invalid: Arc<dyn ToolExecutor> = Arc::new(FnExecutor::new(|_, _, _| async {
            Ok(serde_json::json!({
                "success": false,
                "error": { "code": "VALIDATION_FAILED", "message": "bad node" }
            }))
        }));
        let config = ToolConfig {
            auto_execute: true,
            schema_validated_tools: vec!["write_canvas".into()],
            ..config()
        };
        let manager = manager_with(invalid, config);
        // Vary arguments so only the schema guard, not the signature guard, applies.
        for i in 0..3 {
            let msg = format!("m{i}");
            manager.create_tool_call(
                ToolCallRequest::new(format!("c{i}"), "write_canvas", format!(r#"{{"path":"a.canvas","n":{i}}}"#)),
                &msg,
            );
            settle(&manager, &msg).await;
        }
        let blocked = manager.create_tool_call(
            ToolCallRequest::new("c9", "write_canvas", r#"{"path":"a.canvas","n":9}"#),
            "m9",
        );
        assert_eq!(blocked.error_code(), Some("LOOP_BLOCKED"));
        let details = blocked.result.unwrap().error.unwrap().details.unwrap();
        assert_eq!(details["attempts"], 3);
    }

    #[tokio::test]
    async fn context_results_are_most_recent_first_and_capped() {
        let config = ToolConfig {
            context_result_limit: Some(2),
            ..config()
        };
        let manager = manager_with(echo(), config);
        for i in 0..3 {
            manager.create_tool_call(ToolCallRequest::new(format!("c{i}"), "read", format!(r#"{{"i":{i}}}"#)), "m1");
            settle(&manager, "m1").await;
        }
        let ids: Vec<String> = manager
            .get_tool_results_for_context()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c2".to_string(), "c1".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_made_unique() {
        let manager = manager_with(echo(), config());
        manager.create_tool_call(ToolCallRequest::new("call_0", "read", r#"{"a":1}"#), "m1");
        let second = manager.create_tool_call(ToolCallRequest::new("call_0", "read", r#"{"a":2}"#), "m1");
        assert_eq!(second.id, "call_0_2");
    }

    #[tokio::test]
    async fn cancelled_wait_returns_immediately() {
        let manager = manager_with(echo(), config());
        manager.create_tool_call(ToolCallRequest::new("c1", "write", "{}"), "m1");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = manager
            .wait_for_message_tools("m1", Duration::from_secs(120), &cancel)
            .await;
        assert_eq!(outcome, WaitOutcome::Canceled);
    }

    #[tokio::test]
    async fn dispose_cancels_pending_calls() {
        let manager = manager_with(echo(), config());
        manager.create_tool_call(ToolCallRequest::new("c1", "write", "{}"), "m1");
        manager.dispose();
        let call = manager.get("c1").unwrap();
        assert_eq!(call.state, ToolCallState::Denied);
        assert_eq!(call.error_code(), Some("CANCELED"));
        let late = manager.create_tool_call(ToolCallRequest::new("c2", "read", "{}"), "m1");
        assert_eq!(late.error_code(), Some("CANCELED"));

        manager.clear();
        assert!(manager.calls_for_message("m1").is_empty());
    }
}
