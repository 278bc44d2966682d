//! Conversation persistence: shared conversation state and the save queue.

pub mod coalescer;
pub mod conversation;

pub use coalescer::{PersistenceErrorSink, SaveCoalescer};
pub use conversation::{Conversation, ConversationHandle, FileConversationStore, PersistenceBackend};
