//! Deciding how to recover from a failed stream attempt.

use std::time::Duration;

use super::compat::Capability;
use crate::error::{TurnError, UpstreamFailure};
use crate::types::ContextFile;
use crate::util::retry::RetryPolicy;

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Record the incompatibility and retry without the capability.
    DisableCapability(Capability),
    /// Drop the largest context files and retry.
    ReduceContext,
    /// Wait, then retry the same request.
    Backoff { delay: Duration, attempt: usize },
    /// Surface the error.
    Fail,
}

/// What the current request is asking for.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestShape {
    pub tools_enabled: bool,
    pub images_enabled: bool,
    pub has_context_files: bool,
}

/// One-shot recoveries already spent within a single stream call.
#[derive(Debug, Clone, Default)]
pub struct RetryBudget {
    tools_downgraded: bool,
    images_downgraded: bool,
    context_reduced: bool,
    rate_limit_retries: usize,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limit_retries(&self) -> usize {
        self.rate_limit_retries
    }

    /// Choose an action for `error` and spend the matching budget.
    pub fn plan(&mut self, error: &TurnError, shape: RequestShape, policy: &RetryPolicy) -> RecoveryAction {
        let failure = error.upstream_failure();
        match failure {
            Some(UpstreamFailure::ToolsUnsupported) if shape.tools_enabled && !self.tools_downgraded => {
                self.tools_downgraded = true;
                RecoveryAction::DisableCapability(Capability::Tools)
            }
            Some(UpstreamFailure::ImagesUnsupported) if shape.images_enabled && !self.images_downgraded => {
                self.images_downgraded = true;
                RecoveryAction::DisableCapability(Capability::Images)
            }
            Some(UpstreamFailure::ContextOverflow)
                if !error.produced_output() && shape.has_context_files && !self.context_reduced =>
            {
                self.context_reduced = true;
                RecoveryAction::ReduceContext
            }
            Some(UpstreamFailure::RateLimited { retry_after_seconds })
                if error.is_retryable() && self.rate_limit_retries < policy.max_retries =>
            {
                let attempt = self.rate_limit_retries;
                self.rate_limit_retries += 1;
                RecoveryAction::Backoff {
                    delay: policy.delay_for(attempt, retry_after_seconds),
                    attempt: attempt + 1,
                }
            }
            _ => RecoveryAction::Fail,
        }
    }
}

/// Drop the largest files until the remaining total is at most half of the
/// original. At least one file is always dropped.
pub fn reduce_context_files(files: &[ContextFile]) -> Vec<ContextFile> {
    if files.is_empty() {
        return Vec::new();
    }
    let total: usize = files.iter().map(ContextFile::size).sum();
    let target = total / 2;

    let mut by_size: Vec<usize> = (0..files.len()).collect();
    by_size.sort_by(|a, b| files[*b].size().cmp(&files[*a].size()));

    let mut dropped = vec![false; files.len()];
    let mut remaining = total;
    for (n, idx) in by_size.into_iter().enumerate() {
        if n > 0 && remaining <= target {
            break;
        }
        dropped[idx] = true;
        remaining -= files[idx].size();
    }

    files
        .iter()
        .zip(dropped)
        .filter(|(_, dropped)| !dropped)
        .map(|(file, _)| file.clone())
        .collect()
}
