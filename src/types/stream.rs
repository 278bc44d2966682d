//! Normalized stream events produced by the event pipeline.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One semantic event decoded from the upstream byte stream.
///
/// The serde representation doubles as the normalized wire frame: each
/// `data:` line carries one of these objects, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Content {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ReasoningDetails {
        #[serde(default)]
        details: Vec<serde_json::Value>,
    },
    ToolCall {
        phase: ToolCallPhase,
        call: ToolCallDelta,
    },
    Annotations {
        #[serde(default)]
        list: Vec<serde_json::Value>,
    },
    Meta {
        key: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    Footnote {
        text: String,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    pub fn tool_call(phase: ToolCallPhase, call: ToolCallDelta) -> Self {
        Self::ToolCall { phase, call }
    }
}

/// Streaming phase of a tool-call event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolCallPhase {
    Delta,
    Final,
}

/// A (possibly partial) tool call as emitted by the model.
///
/// `arguments` is forwarded verbatim; during the delta phase it is usually a
/// fragment of a JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.function.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.function.arguments = Some(arguments.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_frame_uses_kebab_case_tag() {
        let event = StreamEvent::tool_call(
            ToolCallPhase::Delta,
            ToolCallDelta::new(0).with_id("call_1").with_arguments("{\"pa"),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool-call");
        assert_eq!(value["phase"], "delta");
        assert_eq!(value["call"]["function"]["arguments"], "{\"pa");
    }

    #[test]
    fn reasoning_details_frame_parses() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"reasoning-details","details":[{"type":"summary","text":"x"}]}"#,
        )
        .unwrap();
        assert!(matches!(event, StreamEvent::ReasoningDetails { ref details } if details.len() == 1));
    }
}
