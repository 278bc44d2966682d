//! Approval policy: which tool calls may run without asking.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::config::ToolConfig;
use crate::types::ToolTarget;

/// Verbs that mark a tool as modifying state.
const DESTRUCTIVE_VERBS: &[&str] = &[
    "write", "edit", "move", "rename", "trash", "delete", "remove", "create", "patch", "append",
    "replace",
];

/// Why a call needs (or skips) approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    /// Read-only or internal: runs immediately.
    Safe,
    /// Modifies files or notes.
    Destructive,
    /// Tool on an external server that is not trusted.
    UntrustedServer,
}

/// Classify a resolved tool target.
pub fn approval_kind(target: &ToolTarget, server_trusted: bool) -> ApprovalKind {
    if is_destructive(target.tool_name()) {
        return ApprovalKind::Destructive;
    }
    match target {
        ToolTarget::External { .. } if !server_trusted => ApprovalKind::UntrustedServer,
        _ => ApprovalKind::Safe,
    }
}

/// Whether a tool name reads as a write/edit/move/trash-class operation.
pub fn is_destructive(tool_name: &str) -> bool {
    tool_name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .flat_map(split_camel)
        .any(|token| DESTRUCTIVE_VERBS.contains(&token.as_str()))
}

fn split_camel(word: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in word.chars() {
        if c.is_ascii_uppercase() && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Approval policy with static allowlists and session-scoped trust.
#[derive(Debug, Default)]
pub struct ApprovalPolicy {
    auto_execute: bool,
    allowlist: HashSet<String>,
    trusted_servers: HashSet<String>,
    session_tools: Mutex<HashSet<String>>,
    session_servers: Mutex<HashSet<String>>,
}

impl ApprovalPolicy {
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            auto_execute: config.auto_execute,
            allowlist: config.allowlist.iter().cloned().collect(),
            trusted_servers: config.trusted_servers.iter().cloned().collect(),
            ..Default::default()
        }
    }

    /// Every call runs without approval.
    pub fn auto_execute() -> Self {
        Self {
            auto_execute: true,
            ..Default::default()
        }
    }

    /// Trust a tool name for the rest of the session.
    pub fn trust_tool_for_session(&self, tool_name: impl Into<String>) {
        if let Ok(mut tools) = self.session_tools.lock() {
            tools.insert(tool_name.into());
        }
    }

    /// Trust every tool on a server for the rest of the session.
    pub fn trust_server_for_session(&self, server_id: impl Into<String>) {
        if let Ok(mut servers) = self.session_servers.lock() {
            servers.insert(server_id.into());
        }
    }

    fn is_session_trusted(&self, target: &ToolTarget, full_name: &str) -> bool {
        let tool_trusted = self
            .session_tools
            .lock()
            .map(|tools| tools.contains(full_name) || tools.contains(target.tool_name()))
            .unwrap_or(false);
        let server_trusted = target.server_id().is_some_and(|server_id| {
            self.session_servers
                .lock()
                .map(|servers| servers.contains(server_id))
                .unwrap_or(false)
        });
        tool_trusted || server_trusted
    }

    /// Decide whether a resolved call may skip the pending state.
    ///
    /// `registry_trusted` is the server's registration flag.
    pub fn should_auto_approve(
        &self,
        target: &ToolTarget,
        full_name: &str,
        registry_trusted: bool,
    ) -> bool {
        if self.auto_execute {
            return true;
        }
        if self.allowlist.contains(full_name) || self.allowlist.contains(target.tool_name()) {
            return true;
        }
        if self.is_session_trusted(target, full_name) {
            return true;
        }
        let server_trusted = registry_trusted
            || target
                .server_id()
                .is_some_and(|server_id| self.trusted_servers.contains(server_id));
        approval_kind(target, server_trusted) == ApprovalKind::Safe
    }
}
