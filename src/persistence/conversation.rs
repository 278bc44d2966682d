//! Conversation state shared between the turn and the save queue, and the
//! storage backends that persist it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnError};
use crate::types::{ChatMessage, Role};

/// An ordered conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Shared, cheaply cloned handle to the live conversation.
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    inner: Arc<Mutex<Conversation>>,
}

impl ConversationHandle {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conversation)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn push(&self, message: ChatMessage) {
        let mut conversation = self.lock();
        conversation.messages.push(message);
        conversation.updated_at = Utc::now();
    }

    /// Replace the message with the same id, or append it.
    pub fn upsert(&self, message: ChatMessage) {
        let mut conversation = self.lock();
        match conversation.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => conversation.messages.push(message),
        }
        conversation.updated_at = Utc::now();
    }

    pub fn remove(&self, message_id: &str) -> Option<ChatMessage> {
        let mut conversation = self.lock();
        let idx = conversation.messages.iter().position(|m| m.id == message_id)?;
        conversation.updated_at = Utc::now();
        Some(conversation.messages.remove(idx))
    }

    pub fn get(&self, message_id: &str) -> Option<ChatMessage> {
        self.lock().messages.iter().find(|m| m.id == message_id).cloned()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().messages.clone()
    }

    pub fn snapshot(&self) -> Conversation {
        self.lock().clone()
    }

    /// Whether a user message was appended after `message_id`.
    pub fn has_user_message_after(&self, message_id: &str) -> bool {
        let conversation = self.lock();
        conversation
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .is_some_and(|idx| {
                conversation.messages[idx + 1..]
                    .iter()
                    .any(|m| m.role == Role::User)
            })
    }
}

/// Durable storage for conversations. `save` must be idempotent.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn save(&self, conversation: &Conversation) -> Result<()>;
}

/// JSON-file store: one `<id>.json` per conversation.
#[derive(Debug, Clone)]
pub struct FileConversationStore {
    base_dir: PathBuf,
}

impl FileConversationStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `<data dir>/turnloop/conversations`.
    pub fn default_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "turnloop")
            .map(|dirs| dirs.data_dir().join("conversations"))
    }

    fn conversation_path(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_dir.join(format!("{safe}.json"))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Option<Conversation>> {
        let path = self.conversation_path(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(TurnError::Io(err)),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

#[async_trait]
impl PersistenceBackend for FileConversationStore {
    async fn save(&self, conversation: &Conversation) -> Result<()> {
        let path = self.conversation_path(&conversation.id);
        Self::ensure_parent(&path).await?;
        let serialized = serde_json::to_vec_pretty(conversation)?;
        // Readers never observe a partially written file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
