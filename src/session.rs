//! Per-conversation wiring of the manager, controller, coalescer and
//! orchestrator.

use std::sync::Arc;

use bon::Builder;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::ModelBackend;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::persistence::{Conversation, ConversationHandle, PersistenceBackend, PersistenceErrorSink, SaveCoalescer};
use crate::streaming::{RenderSink, StreamingController};
use crate::tools::{ApprovalPolicy, ToolCallManager, ToolRegistry};
use crate::turn::{
    InMemoryIncompatibilityStore, IncompatibilityStore, NoticeSink, TurnErrorSink, TurnOrchestrator, TurnOutcome,
    TurnRequest,
};
use crate::types::ChatMessage;

/// Optional collaborators for a [`Session`].
#[derive(Clone, Default, Builder)]
pub struct SessionOptions {
    #[builder(default)]
    pub config: RuntimeConfig,
    /// Resume an existing conversation instead of starting an empty one.
    pub conversation: Option<Conversation>,
    pub registry: Option<Arc<ToolRegistry>>,
    pub compat: Option<Arc<dyn IncompatibilityStore>>,
    pub render: Option<RenderSink>,
    pub notices: Option<NoticeSink>,
    pub on_error: Option<TurnErrorSink>,
    pub on_save_error: Option<PersistenceErrorSink>,
}

/// One live conversation and everything that serves it.
pub struct Session {
    config: RuntimeConfig,
    tools: ToolCallManager,
    coalescer: SaveCoalescer,
    orchestrator: TurnOrchestrator,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conversation_id", &self.conversation().id())
            .field("config", &self.config)
            .finish()
    }
}

impl Session {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        persistence: Arc<dyn PersistenceBackend>,
        options: SessionOptions,
    ) -> Self {
        let SessionOptions {
            config,
            conversation,
            registry,
            compat,
            render,
            notices,
            on_error,
            on_save_error,
        } = options;

        let registry = registry.unwrap_or_else(|| Arc::new(ToolRegistry::new()));
        let policy = Arc::new(ApprovalPolicy::from_config(&config.tools));
        let tools = ToolCallManager::new(registry, policy, config.tools.clone());

        let conversation = ConversationHandle::new(
            conversation.unwrap_or_else(|| Conversation::new(Uuid::new_v4().to_string())),
        );
        let debounce = config.persistence.autosave_debounce();
        let coalescer = match on_save_error {
            Some(sink) => SaveCoalescer::with_error_sink(conversation, persistence, debounce, sink),
            None => SaveCoalescer::new(conversation, persistence, debounce),
        };

        let mut controller = StreamingController::new(Some(tools.clone()), coalescer.clone())
            .with_idle_timeout(config.turn.stream_idle_timeout());
        if let Some(render) = render {
            controller = controller.with_render_sink(render);
        }

        let compat = compat.unwrap_or_else(|| Arc::new(InMemoryIncompatibilityStore::new()));
        let mut orchestrator = TurnOrchestrator::new(backend, controller, compat, config.turn.clone());
        if let Some(sink) = notices {
            orchestrator = orchestrator.with_notice_sink(sink);
        }
        if let Some(sink) = on_error {
            orchestrator = orchestrator.with_error_sink(sink);
        }

        tracing::debug!(conversation_id = %coalescer.conversation().id(), "session created");
        Self {
            config,
            tools,
            coalescer,
            orchestrator,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolCallManager {
        &self.tools
    }

    pub fn coalescer(&self) -> &SaveCoalescer {
        &self.coalescer
    }

    pub fn orchestrator(&self) -> &TurnOrchestrator {
        &self.orchestrator
    }

    pub fn conversation(&self) -> &ConversationHandle {
        self.coalescer.conversation()
    }

    /// Append a user message and schedule a debounced save.
    pub fn push_user_message(&self, message: ChatMessage) {
        self.conversation().push(message);
        self.coalescer.schedule_autosave();
    }

    /// Append `message` and run a turn for it.
    pub async fn send(
        &self,
        message: ChatMessage,
        request: TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.push_user_message(message);
        self.orchestrator.run_turn(request, cancel).await
    }

    /// Run a turn against the conversation as it stands.
    pub async fn run_turn(&self, request: TurnRequest, cancel: &CancellationToken) -> Result<TurnOutcome> {
        self.orchestrator.run_turn(request, cancel).await
    }

    /// Forget settled tool calls.
    pub fn clear(&self) {
        self.tools.clear();
    }

    /// Cancel outstanding tool work and pending autosaves.
    pub fn dispose(&self) {
        tracing::debug!(conversation_id = %self.conversation().id(), "session disposed");
        self.tools.dispose();
        self.coalescer.dispose();
    }
}
