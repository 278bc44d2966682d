//! Per-message continuation bookkeeping.

use std::collections::HashSet;

/// Tool calls already fed back to the model for one assistant message.
#[derive(Debug, Clone, Default)]
pub struct ContinuationState {
    pub message_id: String,
    seen: HashSet<String>,
    count: usize,
}

impl ContinuationState {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            seen: HashSet::new(),
            count: 0,
        }
    }

    /// Continuations issued so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Mark `ids` seen and return the ones that were not, in input order.
    pub fn take_new<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        ids.into_iter()
            .filter(|id| self.seen.insert((*id).to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Count one more continuation and report whether `limit` still allows it.
    pub fn advance(&mut self, limit: usize) -> bool {
        self.count += 1;
        self.count <= limit
    }
}
