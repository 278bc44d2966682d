//! Convenience re-exports for common use.

pub use crate::backend::{BackendRequest, ByteStream, ModelBackend};
pub use crate::config::RuntimeConfig;
pub use crate::error::{Result, TurnError, UpstreamError};
pub use crate::persistence::{Conversation, PersistenceBackend, SaveCoalescer};
pub use crate::session::{Session, SessionOptions};
pub use crate::streaming::{RenderUpdate, StreamingController};
pub use crate::tools::{FnExecutor, ToolCallEvent, ToolCallManager, ToolExecutor, ToolRegistry};
pub use crate::turn::{CompatibilityNotice, TurnOrchestrator, TurnOutcome, TurnRequest};
pub use crate::types::{ChatMessage, Role, StreamEvent, ToolCall, ToolCallState, ToolResult};
pub use tokio_util::sync::CancellationToken;
