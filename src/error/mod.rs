//! Error types for turnloop.

pub mod upstream;

pub use upstream::{UpstreamError, UpstreamFailure};

use thiserror::Error;

/// Primary error type for all turn-level operations.
///
/// Tool execution failures never surface here; they are folded into
/// [`ToolResult`](crate::types::ToolResult) values and fed back to the model.
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Upstream returned an empty response")]
    EmptyResponse,

    #[error("Stream failed after output was produced: {0}")]
    PartialOutput(Box<TurnError>),

    #[error("Stopped after {limit} continuations to prevent an infinite loop")]
    ContinuationLimit { limit: usize },

    #[error("Tool call not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Canceled")]
    Canceled,
}

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Capability,
    ContextOverflow,
    RateLimit,
    Quota,
    Upstream,
    Network,
    Configuration,
    Serialization,
    Persistence,
    LoopLimit,
    Canceled,
    Unknown,
}

impl TurnError {
    /// Wrap a structured upstream error.
    pub fn upstream(error: UpstreamError) -> Self {
        Self::Upstream(error)
    }

    /// The structured upstream signal, looking through `PartialOutput`.
    pub fn upstream_error(&self) -> Option<&UpstreamError> {
        match self {
            Self::Upstream(err) => Some(err),
            Self::PartialOutput(inner) => inner.upstream_error(),
            _ => None,
        }
    }

    /// Classified upstream failure, if this error came from the backend.
    pub fn upstream_failure(&self) -> Option<UpstreamFailure> {
        self.upstream_error().map(UpstreamError::classify)
    }

    /// Whether output had already streamed when this error was raised.
    pub fn produced_output(&self) -> bool {
        matches!(self, Self::PartialOutput(_))
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::ConfigParse(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Network(_) | Self::Io(_) => ErrorCategory::Network,
            Self::Persistence(_) => ErrorCategory::Persistence,
            Self::ContinuationLimit { .. } => ErrorCategory::LoopLimit,
            Self::Canceled => ErrorCategory::Canceled,
            Self::EmptyResponse => ErrorCategory::Upstream,
            Self::Upstream(err) => match err.classify() {
                UpstreamFailure::ToolsUnsupported | UpstreamFailure::ImagesUnsupported => {
                    ErrorCategory::Capability
                }
                UpstreamFailure::ContextOverflow => ErrorCategory::ContextOverflow,
                UpstreamFailure::RateLimited { .. } => ErrorCategory::RateLimit,
                UpstreamFailure::QuotaExhausted => ErrorCategory::Quota,
                UpstreamFailure::Other => ErrorCategory::Upstream,
            },
            Self::PartialOutput(inner) => inner.category(),
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether the orchestrator may retry after this error.
    ///
    /// Only explicitly flagged rate limiting counts; quota exhaustion and
    /// plain 429s do not.
    pub fn is_retryable(&self) -> bool {
        !self.produced_output() && self.category() == ErrorCategory::RateLimit
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TurnError>;
