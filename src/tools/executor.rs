//! Tool executor contract and a closure-backed executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TurnError;

/// Context passed to an executor for one call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub tool_call_id: String,
    pub message_id: String,
    /// Deadline the manager races the call against, if any.
    pub timeout: Option<Duration>,
    /// Fired when the manager is disposed; executors may stop early.
    pub cancel: CancellationToken,
}

/// Executes tools by (unprefixed) name. Must be safe to call concurrently.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        options: &ExecutionOptions,
    ) -> Result<serde_json::Value, TurnError>;
}

type ExecutorHandler = dyn Fn(
        String,
        serde_json::Value,
        ExecutionOptions,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, TurnError>> + Send>>
    + Send
    + Sync;

/// Executor backed by an async closure.
#[derive(Clone)]
pub struct FnExecutor {
    handler: Arc<ExecutorHandler>,
}

impl FnExecutor {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(String, serde_json::Value, ExecutionOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TurnError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |name, args, options| Box::pin(handler(name, args, options))),
        }
    }
}

#[async_trait]
impl ToolExecutor for FnExecutor {
    async fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        options: &ExecutionOptions,
    ) -> Result<serde_json::Value, TurnError> {
        (self.handler)(tool_name.to_string(), args, options.clone()).await
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}
