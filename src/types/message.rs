//! Conversation message types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::tool_call::ToolCallRequest;

/// Conversation role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Kind of a rendered message part.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PartKind {
    Reasoning,
    Content,
    ToolCall,
}

/// Payload of a message part. Tool-call parts only reference the call; the
/// lifecycle manager owns its state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PartData {
    Text { text: String },
    ToolCall { tool_call_id: String },
}

/// One chronologically ordered block of an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePart {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PartKind,
    pub timestamp: DateTime<Utc>,
    pub data: PartData,
}

impl MessagePart {
    pub fn text(kind: PartKind, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp,
            data: PartData::Text { text: text.into() },
        }
    }

    pub fn tool_call(tool_call_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: PartKind::ToolCall,
            timestamp,
            data: PartData::ToolCall {
                tool_call_id: tool_call_id.into(),
            },
        }
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.data {
            PartData::ToolCall { tool_call_id } => Some(tool_call_id),
            PartData::Text { .. } => None,
        }
    }
}

/// A file attached to the prompt as context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextFile {
    pub path: String,
    pub content: String,
}

impl ContextFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// A message in a conversation. Assistant messages are created empty at turn
/// start, mutated while streaming and finalized once at stream end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning_details: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub footnotes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub has_images: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn empty(role: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: String::new(),
            reasoning: None,
            reasoning_details: Vec::new(),
            message_parts: Vec::new(),
            tool_calls: None,
            annotations: None,
            footnotes: Vec::new(),
            meta: BTreeMap::new(),
            stop_reason: None,
            has_images: false,
            timestamp: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        let mut message = Self::empty(Role::System);
        message.content = text.into();
        message
    }

    pub fn user(text: impl Into<String>) -> Self {
        let mut message = Self::empty(Role::User);
        message.content = text.into();
        message
    }

    /// An empty assistant message, ready to be streamed into.
    pub fn assistant() -> Self {
        Self::empty(Role::Assistant)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_images(mut self, has_images: bool) -> Self {
        self.has_images = has_images;
        self
    }

    pub fn tool_call_requests(&self) -> &[ToolCallRequest] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    pub fn push_tool_call(&mut self, request: ToolCallRequest) {
        self.tool_calls.get_or_insert_with(Vec::new).push(request);
    }

    pub fn extend_annotations(&mut self, list: Vec<serde_json::Value>) {
        if list.is_empty() {
            return;
        }
        self.annotations.get_or_insert_with(Vec::new).extend(list);
    }

    /// Whether the message carries anything worth persisting.
    pub fn has_output(&self) -> bool {
        !self.content.is_empty()
            || self.reasoning.as_deref().is_some_and(|r| !r.is_empty())
            || !self.tool_call_requests().is_empty()
    }
}
