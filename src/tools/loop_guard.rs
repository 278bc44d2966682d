//! Loop prevention: repeated failing calls and repeated schema failures.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::types::{ToolCall, ToolCallState, ToolError, ToolErrorCode};

/// Blocked after this many denials of one signature within a message.
pub const MAX_DENIED: usize = 1;
/// Blocked after this many failures of one signature within a message.
pub const MAX_FAILED: usize = 2;

/// Content address of a call: tool name plus canonical arguments.
pub fn signature(tool_name: &str, args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(args).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Signature of a call whose arguments are not valid JSON, over the raw text.
pub fn raw_signature(tool_name: &str, raw_arguments: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\nraw\n");
    hasher.update(raw_arguments.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// JSON with object keys sorted at every depth.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    let encoded_key =
                        serde_json::to_string(key).unwrap_or_else(|_| format!("\"{key}\""));
                    format!("{encoded_key}:{}", canonical_json(&map[key]))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Check prior calls of the same message for a repeated failing signature.
pub fn check_repeated<'a>(
    prior: impl IntoIterator<Item = &'a ToolCall>,
    message_id: &str,
    signature: &str,
) -> Option<ToolError> {
    let (mut denied, mut failed) = (0usize, 0usize);
    for call in prior {
        if call.message_id != message_id || call.signature != signature {
            continue;
        }
        match call.state {
            ToolCallState::Denied => denied += 1,
            ToolCallState::Failed => failed += 1,
            _ => {}
        }
    }
    if denied >= MAX_DENIED || failed >= MAX_FAILED {
        return Some(
            ToolError::new(
                ToolErrorCode::LoopBlocked,
                "This exact tool call already failed or was denied; repeating it is blocked. \
                 Change the arguments or take a different approach.",
            )
            .with_details(serde_json::json!({ "denied": denied, "failed": failed })),
        );
    }
    None
}

/// Resource a schema-validating tool writes to, taken from common argument keys.
pub fn target_resource(args: &serde_json::Value) -> String {
    ["path", "file", "filePath", "target", "id"]
        .iter()
        .find_map(|key| args.get(*key).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

/// Bounded retries for schema-validated writes to the same resource.
#[derive(Debug)]
pub struct SchemaRetryGuard {
    max_attempts: usize,
    window: Duration,
    attempts: HashMap<(String, String), Vec<Instant>>,
}

impl SchemaRetryGuard {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: HashMap::new(),
        }
    }

    fn prune(&mut self, key: &(String, String)) -> usize {
        let window = self.window;
        let now = Instant::now();
        match self.attempts.get_mut(key) {
            Some(times) => {
                times.retain(|at| now.duration_since(*at) < window);
                times.len()
            }
            None => 0,
        }
    }

    /// Blocking error once the attempt budget for this resource is spent.
    pub fn check(&mut self, tool_name: &str, args: &serde_json::Value) -> Option<ToolError> {
        let target = target_resource(args);
        let key = (tool_name.to_string(), target.clone());
        let attempts = self.prune(&key);
        if attempts < self.max_attempts {
            return None;
        }
        Some(
            ToolError::new(
                ToolErrorCode::LoopBlocked,
                format!(
                    "'{tool_name}' failed validation {attempts} times for this target; fix the payload before retrying."
                ),
            )
            .with_details(serde_json::json!({
                "attempts": attempts,
                "maxAttempts": self.max_attempts,
                "target": target,
            })),
        )
    }

    pub fn record_failure(&mut self, tool_name: &str, args: &serde_json::Value) {
        let key = (tool_name.to_string(), target_resource(args));
        self.prune(&key);
        self.attempts.entry(key).or_default().push(Instant::now());
    }

    pub fn record_success(&mut self, tool_name: &str, args: &serde_json::Value) {
        self.attempts
            .remove(&(tool_name.to_string(), target_resource(args)));
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_ignores_key_order() {
        let a = signature("read", &json!({"path": "a", "opts": {"x": 1, "y": [1, 2]}}));
        let b = signature("read", &json!({"opts": {"y": [1, 2], "x": 1}, "path": "a"}));
        assert_eq!(a, b);
        assert_ne!(a, signature("read", &json!({"path": "b"})));
        assert_ne!(a, signature("list", &json!({"path": "a", "opts": {"x": 1, "y": [1, 2]}})));
    }

    #[tokio::test(start_paused = true)]
    async fn schema_guard_blocks_after_budget_and_expires() {
        let mut guard = SchemaRetryGuard::new(3, Duration::from_secs(300));
        let args = json!({"path": "notes/a.md"});
        for _ in 0..3 {
            assert!(guard.check("write_canvas", &args).is_none());
            guard.record_failure("write_canvas", &args);
        }
        let err = guard.check("write_canvas", &args).unwrap();
        assert!(err.is(ToolErrorCode::LoopBlocked));
        assert_eq!(err.details.unwrap()["attempts"], 3);

        // Other targets have their own budget.
        assert!(guard.check("write_canvas", &json!({"path": "b.md"})).is_none());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(guard.check("write_canvas", &args).is_none());
    }

    #[test]
    fn success_resets_attempts() {
        let mut guard = SchemaRetryGuard::new(1, Duration::from_secs(300));
        let args = json!({"file": "x"});
        guard.record_failure("w", &args);
        assert!(guard.check("w", &args).is_some());
        guard.record_success("w", &args);
        assert!(guard.check("w", &args).is_none());
    }
}
