//! Model backend seam: how a turn asks for a byte stream.
//!
//! Provider wire formats live behind this trait; the backend is expected to
//! emit normalized frames (see [`crate::pipeline`]) and to report failures as
//! [`UpstreamError`](crate::error::UpstreamError)s.

use async_trait::async_trait;
use bon::Builder;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::TurnError;
use crate::types::{ChatMessage, ContextFile, ToolCall};

/// Chunked transport bytes.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TurnError>>;

/// One upstream request.
#[derive(Debug, Clone, Builder, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRequest {
    #[builder(into)]
    pub model_id: String,
    /// Conversation so far, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Id of the assistant message being streamed into.
    #[builder(into)]
    pub message_id: String,
    #[builder(default)]
    pub tools_enabled: bool,
    #[builder(default)]
    pub images_enabled: bool,
    #[builder(default)]
    pub context_files: Vec<ContextFile>,
    /// Settled tool calls to re-submit, most recent first.
    #[builder(default)]
    pub tool_results: Vec<ToolCall>,
    /// 0 for the first stream of a turn.
    #[builder(default)]
    pub continuation: usize,
}

/// Upstream model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Open a stream. Errors raised here are classified by the orchestrator
    /// exactly like errors raised mid-stream.
    async fn stream(
        &self,
        request: &BackendRequest,
        cancel: CancellationToken,
    ) -> Result<ByteStream, TurnError>;
}
