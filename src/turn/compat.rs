//! Per-model capability incompatibility records and compatibility notices.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::Result;

/// A capability a backend may reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Capability {
    Tools,
    Images,
}

/// Where the incompatibility was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NoticeSource {
    /// Known from an earlier request; the probe was skipped.
    Cached,
    /// Learned from a rejection just now.
    Runtime,
}

/// Raised when a request runs without a capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityNotice {
    pub model_id: String,
    pub capability: Capability,
    pub source: NoticeSource,
}

pub type NoticeSink = Arc<dyn Fn(CompatibilityNotice) + Send + Sync>;

/// User-visible footnote for a response produced without `capability`.
pub fn degraded_footnote(model_id: &str, capability: Capability) -> String {
    match capability {
        Capability::Tools => {
            format!("Tools were disabled for this response because {model_id} does not support tool use.")
        }
        Capability::Images => {
            format!("Images were omitted from this response because {model_id} does not accept image input.")
        }
    }
}

/// Persisted flags for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompatibilityRecord {
    #[serde(default)]
    pub tool_incompatible: bool,
    #[serde(default)]
    pub image_incompatible: bool,
}

impl IncompatibilityRecord {
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Tools => self.tool_incompatible,
            Capability::Images => self.image_incompatible,
        }
    }

    fn set(&mut self, capability: Capability) {
        match capability {
            Capability::Tools => self.tool_incompatible = true,
            Capability::Images => self.image_incompatible = true,
        }
    }
}

/// Incompatibility memo consulted before every request. Reads must observe
/// earlier writes from the same process.
pub trait IncompatibilityStore: Send + Sync {
    fn is_incompatible(&self, model_id: &str, capability: Capability) -> bool;
    fn mark_incompatible(&self, model_id: &str, capability: Capability);

    fn is_tool_incompatible(&self, model_id: &str) -> bool {
        self.is_incompatible(model_id, Capability::Tools)
    }

    fn is_image_incompatible(&self, model_id: &str) -> bool {
        self.is_incompatible(model_id, Capability::Images)
    }

    fn mark_tool_incompatible(&self, model_id: &str) {
        self.mark_incompatible(model_id, Capability::Tools);
    }

    fn mark_image_incompatible(&self, model_id: &str) {
        self.mark_incompatible(model_id, Capability::Images);
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryIncompatibilityStore {
    records: Mutex<HashMap<String, IncompatibilityRecord>>,
}

impl InMemoryIncompatibilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, IncompatibilityRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn record(&self, model_id: &str) -> IncompatibilityRecord {
        self.records().get(model_id).copied().unwrap_or_default()
    }
}

impl IncompatibilityStore for InMemoryIncompatibilityStore {
    fn is_incompatible(&self, model_id: &str, capability: Capability) -> bool {
        self.record(model_id).has(capability)
    }

    fn mark_incompatible(&self, model_id: &str, capability: Capability) {
        self.records()
            .entry(model_id.to_string())
            .or_default()
            .set(capability);
    }
}

/// JSON-file store. Records are cached in memory and written through.
#[derive(Debug)]
pub struct FileIncompatibilityStore {
    path: PathBuf,
    cache: InMemoryIncompatibilityStore,
}

impl FileIncompatibilityStore {
    /// Open (or start) a store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = InMemoryIncompatibilityStore::new();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let records: HashMap<String, IncompatibilityRecord> = serde_json::from_str(&raw)?;
                *cache.records() = records;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self { path, cache })
    }

    /// `<data dir>/turnloop/incompatibilities.json`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "turnloop")
            .map(|dirs| dirs.data_dir().join("incompatibilities.json"))
    }

    fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_vec_pretty(&*self.cache.records())?;
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }
}

impl IncompatibilityStore for FileIncompatibilityStore {
    fn is_incompatible(&self, model_id: &str, capability: Capability) -> bool {
        self.cache.is_incompatible(model_id, capability)
    }

    fn mark_incompatible(&self, model_id: &str, capability: Capability) {
        self.cache.mark_incompatible(model_id, capability);
        if let Err(err) = self.write() {
            tracing::error!(path = %self.path.display(), error = %err, "failed to persist incompatibility record");
        }
    }
}
