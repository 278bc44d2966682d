//! Tool registry: internal tools plus external tool servers.
//!
//! External tools are addressed as `<serverId>__<tool>`; the prefix is parsed
//! once when a call is created and carried as a [`ToolTarget`].

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use super::executor::ToolExecutor;
use crate::types::{ToolError, ToolErrorCode, ToolTarget};

/// Separator between server id and tool name.
pub const SERVER_SEPARATOR: &str = "__";

fn tool_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]{1,128}$").expect("valid tool name regex"))
}

#[derive(Clone)]
struct ToolServer {
    enabled: bool,
    trusted: bool,
    executor: Arc<dyn ToolExecutor>,
}

/// Registered internal tools and external servers.
#[derive(Default)]
pub struct ToolRegistry {
    internal: RwLock<BTreeMap<String, Arc<dyn ToolExecutor>>>,
    servers: RwLock<BTreeMap<String, ToolServer>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_internal(&self, name: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        if let Ok(mut internal) = self.internal.write() {
            internal.insert(name.into(), executor);
        }
    }

    /// Register an external server. `trusted` servers skip approval.
    pub fn register_server(
        &self,
        server_id: impl Into<String>,
        executor: Arc<dyn ToolExecutor>,
        trusted: bool,
    ) {
        if let Ok(mut servers) = self.servers.write() {
            servers.insert(
                server_id.into(),
                ToolServer {
                    enabled: true,
                    trusted,
                    executor,
                },
            );
        }
    }

    pub fn set_server_enabled(&self, server_id: &str, enabled: bool) -> bool {
        let Ok(mut servers) = self.servers.write() else {
            return false;
        };
        match servers.get_mut(server_id) {
            Some(server) => {
                server.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_server_trusted(&self, server_id: &str) -> bool {
        self.servers
            .read()
            .map(|servers| servers.get(server_id).is_some_and(|s| s.trusted))
            .unwrap_or(false)
    }

    /// Resolve a model-supplied tool name into a dispatch target.
    pub fn resolve(&self, raw_name: &str) -> Result<ToolTarget, ToolError> {
        let name = raw_name.trim();
        if name.is_empty() || !tool_name_re().is_match(name) {
            return Err(ToolError::new(
                ToolErrorCode::InvalidToolName,
                format!("Invalid tool name '{raw_name}'"),
            ));
        }
        let is_internal = self
            .internal
            .read()
            .map(|internal| internal.contains_key(name))
            .unwrap_or(false);
        if is_internal {
            return Ok(ToolTarget::Internal {
                name: name.to_string(),
            });
        }
        if let Some((server_id, tool)) = name.split_once(SERVER_SEPARATOR) {
            let enabled = self
                .servers
                .read()
                .ok()
                .and_then(|servers| servers.get(server_id).map(|s| s.enabled));
            match enabled {
                Some(true) if !tool.is_empty() => {
                    return Ok(ToolTarget::External {
                        server_id: server_id.to_string(),
                        name: tool.to_string(),
                    })
                }
                Some(false) => return Err(ToolError::server_disabled(server_id)),
                _ => {}
            }
        }
        Err(ToolError::new(
            ToolErrorCode::ToolNotFound,
            format!("Tool '{name}' is not available"),
        )
        .with_details(serde_json::json!({ "toolName": name })))
    }

    /// Executor for a resolved target. `None` if it was unregistered since.
    pub fn executor_for(&self, target: &ToolTarget) -> Option<Arc<dyn ToolExecutor>> {
        match target {
            ToolTarget::Internal { name } => self.internal.read().ok()?.get(name).cloned(),
            ToolTarget::External { server_id, .. } => {
                let servers = self.servers.read().ok()?;
                servers
                    .get(server_id)
                    .filter(|server| server.enabled)
                    .map(|server| server.executor.clone())
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let internal: Vec<String> = self
            .internal
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let servers: Vec<String> = self
            .servers
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ToolRegistry")
            .field("internal", &internal)
            .field("servers", &servers)
            .finish()
    }
}
