//! Tool-call records, lifecycle states and structured results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// A finalized tool call as requested by the model. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// String-encoded JSON arguments.
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Arguments parsed as JSON. Empty arguments are `{}`.
    pub fn parsed_arguments(&self) -> serde_json::Result<serde_json::Value> {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(raw)
    }
}

/// Lifecycle state of a tool call.
///
/// `pending -> approved -> executing -> completed | failed`, with `denied`
/// reachable only from `pending`, and `pending -> failed` when the tool is
/// unavailable at creation time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Approved,
    Executing,
    Completed,
    Failed,
    Denied,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: ToolCallState) -> bool {
        use ToolCallState::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Executing)
                | (Pending, Denied)
                | (Pending, Failed)
                | (Approved, Executing)
                | (Approved, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }
}

/// Where a tool call is dispatched, resolved once at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolTarget {
    Internal { name: String },
    External { server_id: String, name: String },
}

impl ToolTarget {
    pub fn tool_name(&self) -> &str {
        match self {
            Self::Internal { name } | Self::External { name, .. } => name,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Internal { .. } => None,
            Self::External { server_id, .. } => Some(server_id),
        }
    }
}

/// A tool call owned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub message_id: String,
    pub request: ToolCallRequest,
    pub state: ToolCallState,
    pub timestamp: DateTime<Utc>,
    /// Content-addressed `(tool name, canonical arguments)` signature.
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ToolTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

impl ToolCall {
    pub fn tool_name(&self) -> &str {
        self.request.name()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time the call reached a terminal state, falling back to creation time.
    pub fn settled_at(&self) -> DateTime<Utc> {
        self.execution_completed_at.unwrap_or(self.timestamp)
    }

    pub fn error_code(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|result| result.error.as_ref())
            .map(|error| error.code.as_str())
    }
}

/// Stable error codes reported to the model in failed tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    ToolNotFound,
    InvalidToolName,
    InvalidArguments,
    ServerDisabled,
    Timeout,
    ExecutionError,
    ToolExecutionError,
    Denied,
    Canceled,
    LoopBlocked,
    ValidationFailed,
}

/// Structured tool error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    /// `<SERVER>_DISABLED` for a disabled external tool server.
    pub fn server_disabled(server_id: &str) -> Self {
        let server = server_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect::<String>();
        Self {
            code: format!("{server}_DISABLED"),
            message: format!("Tool server '{server_id}' is disabled"),
            details: Some(serde_json::json!({ "serverId": server_id })),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is(&self, code: ToolErrorCode) -> bool {
        self.code == code.as_ref()
    }
}

/// Result of a tool call, as re-submitted to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ToolError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.success
    }
}
