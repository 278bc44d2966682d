//! One logical turn: stream, wait for tools, continue, recover.

use std::sync::{Arc, Mutex, MutexGuard};

use bon::Builder;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::compat::{degraded_footnote, Capability, CompatibilityNotice, IncompatibilityStore, NoticeSink, NoticeSource};
use super::continuation::ContinuationState;
use super::recovery::{reduce_context_files, RecoveryAction, RequestShape, RetryBudget};
use crate::backend::{BackendRequest, ModelBackend};
use crate::config::TurnConfig;
use crate::error::{Result, TurnError};
use crate::persistence::ConversationHandle;
use crate::pipeline::decode_stream;
use crate::streaming::{StreamOutcome, StreamingController};
use crate::tools::WaitOutcome;
use crate::types::{ChatMessage, ContextFile, MessagePart, ToolCall};
use crate::util::retry::{wait_cancellable, RetryPolicy};

/// Receives turn-level fatal errors.
pub type TurnErrorSink = Arc<dyn Fn(&TurnError) + Send + Sync>;

/// Parameters for one turn.
#[derive(Debug, Clone, Builder)]
pub struct TurnRequest {
    #[builder(into)]
    pub model_id: String,
    /// Agent mode: offer tools and continue after tool calls settle.
    #[builder(default = true)]
    pub tools_enabled: bool,
    #[builder(default)]
    pub images_enabled: bool,
    #[builder(default)]
    pub context_files: Vec<ContextFile>,
}

/// Result of a turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub message_id: String,
    pub message: ChatMessage,
    /// `false` when the turn was cancelled.
    pub completed: bool,
    pub continuations: usize,
    pub stop_reason: Option<String>,
}

/// Mutable request parameters carried across attempts and continuations.
#[derive(Debug, Clone)]
struct Attempt {
    model_id: String,
    tools_enabled: bool,
    images_enabled: bool,
    context_files: Vec<ContextFile>,
    tool_results: Vec<ToolCall>,
    continuation: usize,
    seed: Option<Vec<MessagePart>>,
}

impl Attempt {
    fn new(request: TurnRequest) -> Self {
        Self {
            model_id: request.model_id,
            tools_enabled: request.tools_enabled,
            images_enabled: request.images_enabled,
            context_files: request.context_files,
            tool_results: Vec::new(),
            continuation: 0,
            seed: None,
        }
    }

    fn shape(&self) -> RequestShape {
        RequestShape {
            tools_enabled: self.tools_enabled,
            images_enabled: self.images_enabled,
            has_context_files: !self.context_files.is_empty(),
        }
    }

    fn enabled(&self, capability: Capability) -> bool {
        match capability {
            Capability::Tools => self.tools_enabled,
            Capability::Images => self.images_enabled,
        }
    }

    fn disable(&mut self, capability: Capability) {
        match capability {
            Capability::Tools => self.tools_enabled = false,
            Capability::Images => self.images_enabled = false,
        }
    }
}

/// Drives turns for one conversation.
pub struct TurnOrchestrator {
    backend: Arc<dyn ModelBackend>,
    controller: StreamingController,
    compat: Arc<dyn IncompatibilityStore>,
    config: TurnConfig,
    retry: RetryPolicy,
    notices: Option<NoticeSink>,
    on_error: Option<TurnErrorSink>,
    active: Mutex<Option<ContinuationState>>,
}

impl std::fmt::Debug for TurnOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOrchestrator")
            .field("controller", &self.controller)
            .field("config", &self.config)
            .field("active", &self.active_message_id())
            .finish()
    }
}

fn canceled_outcome(message: ChatMessage) -> StreamOutcome {
    StreamOutcome {
        message_id: message.id.clone(),
        message,
        completed: false,
        stop_reason: None,
        tool_call_ids: Vec::new(),
    }
}

impl TurnOrchestrator {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        controller: StreamingController,
        compat: Arc<dyn IncompatibilityStore>,
        config: TurnConfig,
    ) -> Self {
        let retry = RetryPolicy::default().with_max_retries(config.rate_limit_max_retries);
        Self {
            backend,
            controller,
            compat,
            config,
            retry,
            notices: None,
            on_error: None,
            active: Mutex::new(None),
        }
    }

    pub fn with_notice_sink(mut self, sink: NoticeSink) -> Self {
        self.notices = Some(sink);
        self
    }

    pub fn with_error_sink(mut self, sink: TurnErrorSink) -> Self {
        self.on_error = Some(sink);
        self
    }

    /// Override the rate-limit backoff. `max_retries` still bounds attempts.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn controller(&self) -> &StreamingController {
        &self.controller
    }

    pub fn conversation(&self) -> &ConversationHandle {
        self.controller.coalescer().conversation()
    }

    fn active(&self) -> MutexGuard<'_, Option<ContinuationState>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Assistant message the current (or last) turn streams into.
    pub fn active_message_id(&self) -> Option<String> {
        self.active().as_ref().map(|state| state.message_id.clone())
    }

    fn notify(&self, model_id: &str, capability: Capability, source: NoticeSource) {
        tracing::info!(model_id, %capability, %source, "running without capability");
        if let Some(sink) = &self.notices {
            sink(CompatibilityNotice {
                model_id: model_id.to_string(),
                capability,
                source,
            });
        }
    }

    fn report(&self, error: TurnError) -> TurnError {
        if !matches!(error, TurnError::Canceled) {
            tracing::error!(error = %error, "turn failed");
            if let Some(sink) = &self.on_error {
                sink(&error);
            }
        }
        error
    }

    /// Run a fresh turn against the current conversation. Always opens a new
    /// assistant message; continuations append to it.
    pub async fn run_turn(&self, request: TurnRequest, cancel: &CancellationToken) -> Result<TurnOutcome> {
        let message_id = Uuid::new_v4().to_string();
        *self.active() = Some(ContinuationState::new(&message_id));
        tracing::info!(message_id = %message_id, model_id = %request.model_id, "turn started");

        let agent_mode = request.tools_enabled;
        let mut attempt = Attempt::new(request);
        let message = ChatMessage::assistant().with_id(&message_id);

        let mut last = self
            .stream_with_recovery(&mut attempt, message, cancel)
            .await
            .map_err(|err| self.report(err))?;

        let tools = match self.controller.tools() {
            Some(tools) if agent_mode && last.completed => tools.clone(),
            _ => return Ok(self.outcome(last, 0)),
        };

        let limit = self.config.max_continuations;
        let mut continuations = 0;
        loop {
            match tools
                .wait_for_message_tools(&message_id, self.config.tool_wait_timeout(), cancel)
                .await
            {
                WaitOutcome::Canceled => {
                    tracing::debug!(message_id = %message_id, "tool wait cancelled; no continuation");
                    last.completed = false;
                    break;
                }
                WaitOutcome::TimedOut | WaitOutcome::Settled => {}
            }

            let terminal: Vec<String> = tools
                .calls_for_message(&message_id)
                .into_iter()
                .filter(ToolCall::is_terminal)
                .map(|call| call.id)
                .collect();
            let fresh = self.take_new(terminal.iter().map(String::as_str));
            if fresh.is_empty() {
                tracing::debug!(message_id = %message_id, "no new tool results; turn done");
                break;
            }
            if self.conversation().has_user_message_after(&message_id) {
                tracing::info!(message_id = %message_id, "user message arrived; abandoning continuation");
                break;
            }
            continuations = match self.advance(limit) {
                Some(count) => count,
                None => {
                    tracing::warn!(message_id = %message_id, limit, "continuation limit reached");
                    return Err(self.report(TurnError::ContinuationLimit { limit }));
                }
            };
            tracing::info!(
                message_id = %message_id,
                continuation = continuations,
                new_results = fresh.len(),
                "continuing after tool results"
            );

            attempt.context_files.clear();
            attempt.tool_results = tools.get_tool_results_for_context();
            attempt.continuation = continuations;
            attempt.seed = Some(last.message.message_parts.clone());
            let mut message = last.message.clone();
            message.stop_reason = None;

            last = self
                .stream_with_recovery(&mut attempt, message, cancel)
                .await
                .map_err(|err| self.report(err))?;
            if !last.completed {
                break;
            }
        }

        Ok(self.outcome(last, continuations))
    }

    fn outcome(&self, last: StreamOutcome, continuations: usize) -> TurnOutcome {
        tracing::info!(
            message_id = %last.message_id,
            completed = last.completed,
            continuations,
            "turn finished"
        );
        TurnOutcome {
            message_id: last.message_id,
            stop_reason: last.stop_reason,
            message: last.message,
            completed: last.completed,
            continuations,
        }
    }

    fn take_new<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        self.active()
            .as_mut()
            .map(|state| state.take_new(ids))
            .unwrap_or_default()
    }

    fn advance(&self, limit: usize) -> Option<usize> {
        let mut active = self.active();
        let state = active.as_mut()?;
        state.advance(limit).then(|| state.count())
    }

    /// Stream once, applying capability downgrades, context reduction and
    /// rate-limit backoff until the attempt succeeds or cannot be recovered.
    async fn stream_with_recovery(
        &self,
        attempt: &mut Attempt,
        message: ChatMessage,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome> {
        let mut budget = RetryBudget::new();
        let mut degraded: Vec<Capability> = Vec::new();
        let mut tries = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(canceled_outcome(message));
            }

            for capability in [Capability::Tools, Capability::Images] {
                if attempt.enabled(capability) && self.compat.is_incompatible(&attempt.model_id, capability) {
                    attempt.disable(capability);
                    self.notify(&attempt.model_id, capability, NoticeSource::Cached);
                    if !degraded.contains(&capability) {
                        degraded.push(capability);
                    }
                }
            }

            let mut target = message.clone();
            for capability in &degraded {
                let footnote = degraded_footnote(&attempt.model_id, *capability);
                if !target.footnotes.contains(&footnote) {
                    target.footnotes.push(footnote);
                }
            }

            tries += 1;
            tracing::debug!(
                message_id = %message.id,
                attempt = tries,
                tools_enabled = attempt.tools_enabled,
                images_enabled = attempt.images_enabled,
                context_files = attempt.context_files.len(),
                "opening upstream stream"
            );
            let request = BackendRequest::builder()
                .model_id(attempt.model_id.clone())
                .messages(self.conversation().messages())
                .message_id(message.id.clone())
                .tools_enabled(attempt.tools_enabled)
                .images_enabled(attempt.images_enabled)
                .context_files(attempt.context_files.clone())
                .tool_results(attempt.tool_results.clone())
                .continuation(attempt.continuation)
                .build();

            let footnotes = target.footnotes.clone();
            let error = match self.stream_once(&request, target, cancel, attempt.seed.clone()).await {
                Ok(outcome) => {
                    if outcome.completed {
                        for footnote in footnotes.iter().filter(|f| !message.footnotes.contains(f)) {
                            self.controller.render_footnote(&outcome.message_id, footnote);
                        }
                    }
                    return Ok(outcome);
                }
                Err(TurnError::Canceled) => return Ok(canceled_outcome(message)),
                Err(error) => error,
            };
            if cancel.is_cancelled() {
                return Ok(canceled_outcome(message));
            }

            match budget.plan(&error, attempt.shape(), &self.retry) {
                RecoveryAction::DisableCapability(capability) => {
                    tracing::warn!(model_id = %attempt.model_id, %capability, error = %error, "capability rejected; retrying without it");
                    self.compat.mark_incompatible(&attempt.model_id, capability);
                    self.notify(&attempt.model_id, capability, NoticeSource::Runtime);
                    attempt.disable(capability);
                    if !degraded.contains(&capability) {
                        degraded.push(capability);
                    }
                }
                RecoveryAction::ReduceContext => {
                    let before = attempt.context_files.len();
                    attempt.context_files = reduce_context_files(&attempt.context_files);
                    tracing::warn!(
                        before,
                        after = attempt.context_files.len(),
                        "context window exceeded; retrying with fewer files"
                    );
                }
                RecoveryAction::Backoff { delay, attempt: retry } => {
                    tracing::warn!(retry, delay_ms = delay.as_millis() as u64, "rate limited; backing off");
                    if !wait_cancellable(delay, cancel).await {
                        return Ok(canceled_outcome(message));
                    }
                }
                RecoveryAction::Fail => return Err(error),
            }
        }
    }

    async fn stream_once(
        &self,
        request: &BackendRequest,
        message: ChatMessage,
        cancel: &CancellationToken,
        seed: Option<Vec<MessagePart>>,
    ) -> Result<StreamOutcome> {
        let bytes = self.backend.stream(request, cancel.clone()).await?;
        self.controller
            .stream(decode_stream(bytes), message, cancel, seed)
            .await
    }
}
