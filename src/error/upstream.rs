//! Structured upstream (model backend) errors and their classification.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by a model backend, either when opening a stream or mid-stream.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message} (status {status:?}, code {code:?})")]
#[serde(rename_all = "camelCase")]
pub struct UpstreamError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Set by the backend only for rate limiting it considers safe to retry.
    #[serde(default)]
    pub should_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

/// What an upstream error means for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    ToolsUnsupported,
    ImagesUnsupported,
    ContextOverflow,
    RateLimited { retry_after_seconds: Option<u64> },
    QuotaExhausted,
    Other,
}

pub const CODE_TOOLS_UNSUPPORTED: &str = "tools_unsupported";
pub const CODE_IMAGES_UNSUPPORTED: &str = "images_unsupported";
pub const CODE_CONTEXT_LENGTH_EXCEEDED: &str = "context_length_exceeded";
pub const CODE_INSUFFICIENT_QUOTA: &str = "insufficient_quota";

fn tools_unsupported_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(does not support (tools|tool use|function calling)|tools? (use )?(is|are) not supported|no endpoints found that support tool use)",
        )
        .expect("valid tools regex")
    })
}

fn images_unsupported_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(does not support (images?|image input|vision)|images? (input )?(is|are) not supported|no endpoints found that support image input)",
        )
        .expect("valid images regex")
    })
}

fn context_overflow_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(maximum context length|context (window|length) (exceeded|is too)|prompt is too long|too many (input )?tokens)",
        )
        .expect("valid context regex")
    })
}

fn quota_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(insufficient[_ ]quota|exceeded your current quota|billing|out of credits)")
            .expect("valid quota regex")
    })
}

impl UpstreamError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
            should_retry: false,
            retry_after_seconds: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry(mut self, should_retry: bool, retry_after_seconds: Option<u64>) -> Self {
        self.should_retry = should_retry;
        self.retry_after_seconds = retry_after_seconds;
        self
    }

    /// A retryable rate-limit signal.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::new(Some(429), "rate limited").with_retry(true, retry_after_seconds)
    }

    pub fn tools_unsupported(message: impl Into<String>) -> Self {
        Self::new(Some(400), message).with_code(CODE_TOOLS_UNSUPPORTED)
    }

    pub fn images_unsupported(message: impl Into<String>) -> Self {
        Self::new(Some(400), message).with_code(CODE_IMAGES_UNSUPPORTED)
    }

    pub fn context_overflow(message: impl Into<String>) -> Self {
        Self::new(Some(400), message).with_code(CODE_CONTEXT_LENGTH_EXCEEDED)
    }

    fn code_is(&self, expected: &str) -> bool {
        self.code.as_deref() == Some(expected)
    }

    fn is_quota_exhausted(&self) -> bool {
        if self.status == Some(402) || self.code_is(CODE_INSUFFICIENT_QUOTA) {
            return true;
        }
        let quota_signature = quota_re().is_match(&self.message)
            || self.code.as_deref().is_some_and(|code| quota_re().is_match(code));
        self.status == Some(429) && quota_signature
    }

    /// Classify the error. Quota exhaustion wins over everything else so a
    /// hard billing failure is never retried.
    pub fn classify(&self) -> UpstreamFailure {
        if self.is_quota_exhausted() {
            return UpstreamFailure::QuotaExhausted;
        }
        if self.code_is(CODE_TOOLS_UNSUPPORTED) || tools_unsupported_re().is_match(&self.message) {
            return UpstreamFailure::ToolsUnsupported;
        }
        if self.code_is(CODE_IMAGES_UNSUPPORTED) || images_unsupported_re().is_match(&self.message)
        {
            return UpstreamFailure::ImagesUnsupported;
        }
        if self.code_is(CODE_CONTEXT_LENGTH_EXCEEDED)
            || context_overflow_re().is_match(&self.message)
        {
            return UpstreamFailure::ContextOverflow;
        }
        if self.should_retry {
            return UpstreamFailure::RateLimited {
                retry_after_seconds: self.retry_after_seconds,
            };
        }
        UpstreamFailure::Other
    }
}
