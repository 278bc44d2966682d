//! Transcript assembler: ordered message parts for one assistant message.
//!
//! Text deltas extend the trailing part of the same kind while it is open.
//! Any other part-affecting event closes it; a later delta of the same kind
//! opens a fresh part, which keeps reasoning, content and tool calls in the
//! order the model produced them.

use chrono::{DateTime, Utc};

use crate::types::{MessagePart, PartData, PartKind, StreamEvent};

/// Result of [`TranscriptAssembler::finalize`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizedTranscript {
    pub content: String,
    pub reasoning: Option<String>,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    parts: Vec<MessagePart>,
    /// Index of the open trailing text part, if any.
    open: Option<usize>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new stream, optionally continuing after previously rendered
    /// parts. Seed parts are never reopened.
    pub fn begin(&mut self, seed_parts: Option<Vec<MessagePart>>) {
        self.parts = seed_parts.unwrap_or_default();
        self.open = None;
    }

    /// Apply one stream event. Returns whether the part list changed.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Content { text } => self.append_text(PartKind::Content, text),
            StreamEvent::Reasoning { text } => self.append_text(PartKind::Reasoning, text),
            StreamEvent::ToolCall { .. } => {
                self.close();
                false
            }
            _ => false,
        }
    }

    /// Insert a tool-call part at its stream position and close open text.
    pub fn attach_tool_call(&mut self, tool_call_id: &str, timestamp: DateTime<Utc>) {
        self.close();
        if self
            .parts
            .iter()
            .any(|part| part.tool_call_id() == Some(tool_call_id))
        {
            return;
        }
        let position = self
            .parts
            .iter()
            .rposition(|part| part.timestamp <= timestamp)
            .map_or(0, |idx| idx + 1);
        self.parts
            .insert(position, MessagePart::tool_call(tool_call_id, timestamp));
    }

    pub fn parts(&self) -> &[MessagePart] {
        &self.parts
    }

    /// Close open parts and produce the aggregated text. Safe to call more
    /// than once; parts already exposed are not rewritten.
    pub fn finalize(&mut self) -> FinalizedTranscript {
        self.close();
        let mut content = String::new();
        let mut reasoning = String::new();
        for part in &self.parts {
            match (&part.kind, &part.data) {
                (PartKind::Content, PartData::Text { text }) => content.push_str(text),
                (PartKind::Reasoning, PartData::Text { text }) => reasoning.push_str(text),
                _ => {}
            }
        }
        FinalizedTranscript {
            content,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            parts: self.parts.clone(),
        }
    }

    fn append_text(&mut self, kind: PartKind, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        if let Some(idx) = self.open {
            if let Some(part) = self.parts.get_mut(idx) {
                if part.kind == kind {
                    if let PartData::Text { text: existing } = &mut part.data {
                        existing.push_str(text);
                        return true;
                    }
                }
            }
        }
        self.parts.push(MessagePart::text(kind, text, Utc::now()));
        self.open = Some(self.parts.len() - 1);
        true
    }

    fn close(&mut self) {
        self.open = None;
    }
}
