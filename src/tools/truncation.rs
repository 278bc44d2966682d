//! Size-capping of tool results.
//!
//! A result is classified once, then truncated by the matching strategy.
//! Every strategy returns a `serde_json::Value`, so the output is always
//! valid JSON.

use serde_json::{json, Map, Value};

/// Items kept by list/search strategies before the byte budget is checked.
const DEFAULT_KEEP: usize = 20;
/// Characters shown in the fallback preview.
const PREVIEW_CHARS: usize = 200;

/// Which strategy handles a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    File,
    Search,
    List,
    Generic,
}

trait TruncationStrategy {
    fn truncate(&self, value: &Value, max_bytes: usize, original_bytes: usize) -> Option<Value>;
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(usize::MAX)
}

fn string_field<'a>(map: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a str)> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str).map(|s| (*key, s)))
}

fn array_field<'a>(
    map: &'a Map<String, Value>,
    keys: &[&'static str],
) -> Option<(&'static str, &'a Vec<Value>)> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_array).map(|a| (*key, a)))
}

const CONTENT_KEYS: &[&str] = &["content", "text", "body"];
const MATCH_KEYS: &[&str] = &["matches", "results", "hits"];
const ITEM_KEYS: &[&str] = &["items", "files", "entries", "children"];

/// Pick a strategy. Order: file, search, list, generic.
pub fn classify(value: &Value) -> ResultShape {
    match value {
        Value::Object(map) => {
            let has_path = map.contains_key("path") || map.contains_key("file");
            if has_path && string_field(map, CONTENT_KEYS).is_some() {
                ResultShape::File
            } else if array_field(map, MATCH_KEYS).is_some() {
                ResultShape::Search
            } else if array_field(map, ITEM_KEYS).is_some() {
                ResultShape::List
            } else {
                ResultShape::Generic
            }
        }
        Value::Array(_) => ResultShape::List,
        _ => ResultShape::Generic,
    }
}

/// Cut a string to at most `max_bytes`, on a char boundary.
fn cut_str(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

struct FileStrategy;

impl TruncationStrategy for FileStrategy {
    fn truncate(&self, value: &Value, max_bytes: usize, _original: usize) -> Option<Value> {
        let map = value.as_object()?;
        let (key, content) = string_field(map, CONTENT_KEYS)?;
        let total_length = content.len();
        let mut shell = map.clone();
        shell.insert(key.to_string(), Value::String(String::new()));
        shell.insert("truncated".into(), Value::Bool(true));
        shell.insert("totalLength".into(), json!(total_length));
        let overhead = serialized_len(&Value::Object(shell.clone()));
        // Escaping can grow the content; shrink until it fits.
        let mut budget = max_bytes.saturating_sub(overhead);
        loop {
            shell.insert(key.to_string(), Value::String(cut_str(content, budget).to_string()));
            let candidate = Value::Object(shell.clone());
            if serialized_len(&candidate) <= max_bytes || budget == 0 {
                return (serialized_len(&candidate) <= max_bytes).then_some(candidate);
            }
            budget /= 2;
        }
    }
}

/// Keeps a prefix of an array field and records the total count.
struct PrefixStrategy {
    keys: &'static [&'static str],
    count_key: &'static str,
}

impl PrefixStrategy {
    fn fit(items: &[Value], build: impl Fn(&[Value]) -> Value, max_bytes: usize) -> Option<Value> {
        let mut keep = items.len().min(DEFAULT_KEEP);
        loop {
            let candidate = build(&items[..keep]);
            if serialized_len(&candidate) <= max_bytes {
                return Some(candidate);
            }
            if keep == 0 {
                return None;
            }
            keep /= 2;
        }
    }
}

impl TruncationStrategy for PrefixStrategy {
    fn truncate(&self, value: &Value, max_bytes: usize, _original: usize) -> Option<Value> {
        let count_key = self.count_key;
        match value {
            Value::Array(items) => Self::fit(
                items,
                |kept| {
                    let mut shell = Map::new();
                    shell.insert("items".into(), Value::Array(kept.to_vec()));
                    shell.insert(count_key.to_string(), json!(items.len()));
                    shell.insert("truncated".into(), Value::Bool(true));
                    Value::Object(shell)
                },
                max_bytes,
            ),
            Value::Object(map) => {
                let (key, items) = array_field(map, self.keys)?;
                Self::fit(
                    items,
                    |kept| {
                        let mut shell = map.clone();
                        shell.insert(key.to_string(), Value::Array(kept.to_vec()));
                        shell.insert(count_key.to_string(), json!(items.len()));
                        shell.insert("truncated".into(), Value::Bool(true));
                        Value::Object(shell)
                    },
                    max_bytes,
                )
            }
            _ => None,
        }
    }
}

struct GenericStrategy;

impl GenericStrategy {
    /// Byte offsets of commas outside strings, with the bracket stack at
    /// that point, so a prefix can be closed into valid JSON.
    fn cut_points(serialized: &str) -> Vec<(usize, Vec<u8>)> {
        let mut points = Vec::new();
        let mut stack: Vec<u8> = Vec::new();
        let mut in_string = false;
        let mut escaped = false;
        for (idx, byte) in serialized.bytes().enumerate() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => stack.push(b'}'),
                b'[' => stack.push(b']'),
                b'}' | b']' => {
                    stack.pop();
                }
                b',' => points.push((idx, stack.clone())),
                _ => {}
            }
        }
        points
    }

    fn mark(value: Value, original_bytes: usize) -> Value {
        match value {
            Value::Object(mut map) => {
                map.insert("_truncated".into(), Value::Bool(true));
                map.insert("_originalBytes".into(), json!(original_bytes));
                Value::Object(map)
            }
            other => json!({
                "_truncated": true,
                "_originalBytes": original_bytes,
                "value": other,
            }),
        }
    }
}

impl TruncationStrategy for GenericStrategy {
    fn truncate(&self, value: &Value, max_bytes: usize, original_bytes: usize) -> Option<Value> {
        let serialized = serde_json::to_string(value).ok()?;
        // Reserve room for the marker fields.
        let marker_len = 64;
        let budget = max_bytes.saturating_sub(marker_len);
        for (offset, stack) in Self::cut_points(&serialized).into_iter().rev() {
            if offset + stack.len() > budget {
                continue;
            }
            let mut candidate = serialized[..offset].to_string();
            candidate.extend(stack.iter().rev().map(|b| *b as char));
            let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
                continue;
            };
            let marked = Self::mark(parsed, original_bytes);
            if serialized_len(&marked) <= max_bytes {
                return Some(marked);
            }
        }
        None
    }
}

/// Shape-free marker with a preview cut to fit `max_bytes`. The preview is
/// omitted when the bare marker alone does not fit.
fn fallback(value: &Value, original_bytes: usize, max_bytes: usize) -> Value {
    let marker = json!({
        "_truncated": true,
        "_originalBytes": original_bytes,
        "error": "could not preserve shape",
    });
    let serialized = serde_json::to_string(value).unwrap_or_default();
    let head: String = serialized.chars().take(PREVIEW_CHARS).collect();
    // `"preview":""` plus the separating comma.
    let overhead = serialized_len(&marker) + 13;
    let mut budget = max_bytes.saturating_sub(overhead);
    while budget > 0 {
        let preview = cut_str(&head, budget);
        let mut candidate = marker.clone();
        candidate["preview"] = Value::String(preview.to_string());
        let len = serialized_len(&candidate);
        if len <= max_bytes {
            return candidate;
        }
        // Escaping grew the preview; shrink by the overflow.
        budget = budget.saturating_sub(len - max_bytes).min(preview.len().saturating_sub(1));
    }
    marker
}

fn strategy_for(shape: ResultShape) -> Box<dyn TruncationStrategy> {
    match shape {
        ResultShape::File => Box::new(FileStrategy),
        ResultShape::Search => Box::new(PrefixStrategy {
            keys: MATCH_KEYS,
            count_key: "totalMatches",
        }),
        ResultShape::List => Box::new(PrefixStrategy {
            keys: ITEM_KEYS,
            count_key: "totalCount",
        }),
        ResultShape::Generic => Box::new(GenericStrategy),
    }
}

/// Cap a result at `max_bytes` serialized. Results within the cap are
/// returned unchanged.
pub fn truncate_result(value: Value, max_bytes: usize) -> Value {
    let original_bytes = serialized_len(&value);
    if original_bytes <= max_bytes {
        return value;
    }
    let shape = classify(&value);
    let truncated = strategy_for(shape)
        .truncate(&value, max_bytes, original_bytes)
        .or_else(|| {
            (shape != ResultShape::Generic)
                .then(|| GenericStrategy.truncate(&value, max_bytes, original_bytes))
                .flatten()
        });
    match truncated {
        Some(value) => {
            tracing::debug!(?shape, original_bytes, max_bytes, "truncated tool result");
            value
        }
        None => fallback(&value, original_bytes, max_bytes),
    }
}
