//! Accumulates tool-call deltas and finalizes each logical call once.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::types::{ToolCallDelta, ToolCallRequest};

#[derive(Debug, Clone)]
struct BufferedCall {
    key: String,
    name: String,
    kind: Option<String>,
    arguments: String,
    first_seen: DateTime<Utc>,
    finalized: bool,
}

/// A finalized request plus where it first appeared in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedCall {
    pub request: ToolCallRequest,
    pub first_seen: DateTime<Utc>,
}

/// Per-stream buffer keyed by call index, exposing sanitized stable ids.
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    by_index: BTreeMap<usize, BufferedCall>,
    keys: HashSet<String>,
}

/// Keep `[A-Za-z0-9_-]` from a provider id.
pub fn sanitize_call_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

fn is_json(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw).is_ok()
}

/// Choose the argument string: final payload, buffer + final, buffer, raw.
fn merge_arguments(buffered: &str, final_args: &str) -> String {
    if !final_args.trim().is_empty() && is_json(final_args) {
        return final_args.to_string();
    }
    let combined = format!("{buffered}{final_args}");
    if !combined.trim().is_empty() && is_json(&combined) {
        return combined;
    }
    if !buffered.trim().is_empty() && is_json(buffered) {
        return buffered.to_string();
    }
    if combined.trim().is_empty() {
        return "{}".to_string();
    }
    combined
}

impl ToolCallBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn stable_key(&self, index: usize, provider_id: Option<&str>) -> String {
        let base = provider_id
            .map(sanitize_call_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{index}"));
        if !self.keys.contains(&base) {
            return base;
        }
        let mut candidate = format!("{base}_{index}");
        let mut n = 2;
        while self.keys.contains(&candidate) {
            candidate = format!("{base}_{index}_{n}");
            n += 1;
        }
        candidate
    }

    fn entry(&mut self, delta: &ToolCallDelta) -> &mut BufferedCall {
        let new_key = (!self.by_index.contains_key(&delta.index))
            .then(|| self.stable_key(delta.index, delta.id.as_deref()));
        if let Some(key) = &new_key {
            self.keys.insert(key.clone());
        }
        let call = self
            .by_index
            .entry(delta.index)
            .or_insert_with(|| BufferedCall {
                key: new_key.unwrap_or_default(),
                name: String::new(),
                kind: None,
                arguments: String::new(),
                first_seen: Utc::now(),
                finalized: false,
            });
        if call.name.is_empty() {
            if let Some(name) = delta.function.name.as_deref() {
                call.name = name.to_string();
            }
        }
        if call.kind.is_none() {
            call.kind = delta.kind.clone();
        }
        call
    }

    /// Append a delta. Fragments for one index are concatenated in order.
    pub fn apply_delta(&mut self, delta: &ToolCallDelta) {
        let call = self.entry(delta);
        if call.finalized {
            return;
        }
        if let Some(fragment) = delta.function.arguments.as_deref() {
            call.arguments.push_str(fragment);
        }
    }

    /// Merge a `final` event. Returns `None` if the call was already finalized.
    pub fn finalize(&mut self, delta: &ToolCallDelta) -> Option<FinalizedCall> {
        let call = self.entry(delta);
        if call.finalized {
            tracing::debug!(key = %call.key, "ignoring duplicate final tool call");
            return None;
        }
        call.finalized = true;
        let arguments = merge_arguments(
            &call.arguments,
            delta.function.arguments.as_deref().unwrap_or_default(),
        );
        Some(Self::build(call, arguments))
    }

    fn build(call: &BufferedCall, arguments: String) -> FinalizedCall {
        let mut request = ToolCallRequest::new(call.key.clone(), call.name.clone(), arguments);
        if let Some(kind) = &call.kind {
            request.kind = kind.clone();
        }
        FinalizedCall {
            request,
            first_seen: call.first_seen,
        }
    }

    /// Finalize calls that only ever saw deltas, in index order.
    pub fn take_leftovers(&mut self) -> Vec<FinalizedCall> {
        self.by_index
            .values_mut()
            .filter(|call| !call.finalized && !call.name.is_empty())
            .map(|call| {
                call.finalized = true;
                let arguments = merge_arguments(&call.arguments, "");
                Self::build(call, arguments)
            })
            .collect()
    }
}
