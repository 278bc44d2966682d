//! Runtime configuration (layered: defaults < TOML file < environment).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnError};

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 8;
const MAX_TOOL_TIMEOUT_SECS: u64 = 600;

/// Tool-call lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Maximum simultaneously executing tool calls (clamped to 1..=8).
    pub concurrency_limit: usize,
    /// Per-call timeout in seconds; 0 disables (clamped to 0..=600).
    pub timeout_secs: u64,
    /// Serialized result size cap in bytes.
    pub max_result_bytes: usize,
    /// Keep only the most recent K results when re-submitting context.
    pub context_result_limit: Option<usize>,
    /// Execute every call without approval.
    pub auto_execute: bool,
    /// Tool names that never require approval.
    pub allowlist: Vec<String>,
    /// External servers whose tools are auto-approved.
    pub trusted_servers: Vec<String>,
    /// Tools that validate their payload against a schema before writing.
    pub schema_validated_tools: Vec<String>,
    pub schema_retry_max_attempts: usize,
    pub schema_retry_window_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            timeout_secs: 30,
            max_result_bytes: 10 * 1024,
            context_result_limit: None,
            auto_execute: false,
            allowlist: Vec::new(),
            trusted_servers: Vec::new(),
            schema_validated_tools: Vec::new(),
            schema_retry_max_attempts: 3,
            schema_retry_window_secs: 300,
        }
    }
}

impl ToolConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency_limit.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    /// `None` when timeouts are disabled.
    pub fn effective_timeout(&self) -> Option<Duration> {
        match self.timeout_secs.min(MAX_TOOL_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn schema_retry_window(&self) -> Duration {
        Duration::from_secs(self.schema_retry_window_secs)
    }
}

/// Turn orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub max_continuations: usize,
    pub tool_wait_timeout_secs: u64,
    pub rate_limit_max_retries: usize,
    /// Idle time allowed between stream events; 0 disables.
    pub stream_idle_timeout_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_continuations: 12,
            tool_wait_timeout_secs: 120,
            rate_limit_max_retries: 2,
            stream_idle_timeout_ms: 120_000,
        }
    }
}

impl TurnConfig {
    pub fn tool_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_wait_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_ms > 0).then(|| Duration::from_millis(self.stream_idle_timeout_ms))
    }
}

/// Save-coalescing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub autosave_debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            autosave_debounce_ms: 500,
        }
    }
}

impl PersistenceConfig {
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tools: ToolConfig,
    pub turn: TurnConfig,
    pub persistence: PersistenceConfig,
}

impl RuntimeConfig {
    /// Default config file location (`<config dir>/turnloop/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "turnloop")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load the default file (if present) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `TURNLOOP_*` overrides from a lookup function.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "TURNLOOP_TOOL_CONCURRENCY")? {
            self.tools.concurrency_limit = v;
        }
        if let Some(v) = parse_env(&lookup, "TURNLOOP_TOOL_TIMEOUT_SECS")? {
            self.tools.timeout_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "TURNLOOP_MAX_RESULT_BYTES")? {
            self.tools.max_result_bytes = v;
        }
        if let Some(v) = parse_env(&lookup, "TURNLOOP_AUTO_EXECUTE")? {
            self.tools.auto_execute = v;
        }
        if let Some(v) = parse_env(&lookup, "TURNLOOP_MAX_CONTINUATIONS")? {
            self.turn.max_continuations = v;
        }
        if let Some(v) = parse_env(&lookup, "TURNLOOP_TOOL_WAIT_TIMEOUT_SECS")? {
            self.turn.tool_wait_timeout_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "TURNLOOP_AUTOSAVE_DEBOUNCE_MS")? {
            self.persistence.autosave_debounce_ms = v;
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| TurnError::Configuration(format!("invalid value for {key}: {raw:?}")))
}
