//! Save coalescing.
//!
//! At most one save runs at a time. A request that arrives while a save is
//! in flight sets `flush_requested` and awaits the running save; the runner
//! performs one more save before exiting if the flag was set. Overlapping
//! requests therefore collapse into at most two saves, and the last
//! requested state is always written.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;

use super::conversation::{ConversationHandle, PersistenceBackend};
use crate::error::TurnError;
use crate::types::ChatMessage;

/// Receives save failures. Saves are never retried.
pub type PersistenceErrorSink = Arc<dyn Fn(&TurnError) + Send + Sync>;

type InFlight = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct FlushState {
    in_flight: Option<InFlight>,
    flush_requested: bool,
    autosave: Option<AbortHandle>,
    /// Bumped on every schedule; a fired task only clears its own slot.
    autosave_generation: u64,
    disposed: bool,
    completed_saves: u64,
}

struct Inner {
    conversation: ConversationHandle,
    backend: Arc<dyn PersistenceBackend>,
    debounce: Duration,
    state: Mutex<FlushState>,
    on_error: Option<PersistenceErrorSink>,
}

/// Debounced, coalescing save queue for one conversation.
#[derive(Clone)]
pub struct SaveCoalescer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SaveCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SaveCoalescer")
            .field("in_flight", &state.in_flight.is_some())
            .field("flush_requested", &state.flush_requested)
            .field("completed_saves", &state.completed_saves)
            .finish()
    }
}

impl SaveCoalescer {
    pub fn new(
        conversation: ConversationHandle,
        backend: Arc<dyn PersistenceBackend>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conversation,
                backend,
                debounce,
                state: Mutex::new(FlushState::default()),
                on_error: None,
            }),
        }
    }

    /// Same as `new`, reporting failed saves to `sink`.
    pub fn with_error_sink(
        conversation: ConversationHandle,
        backend: Arc<dyn PersistenceBackend>,
        debounce: Duration,
        sink: PersistenceErrorSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conversation,
                backend,
                debounce,
                state: Mutex::new(FlushState::default()),
                on_error: Some(sink),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FlushState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn conversation(&self) -> &ConversationHandle {
        &self.inner.conversation
    }

    /// Saves that reached the backend successfully.
    pub fn completed_saves(&self) -> u64 {
        self.state().completed_saves
    }

    /// Store the finalized message and save.
    pub async fn commit(&self, message: ChatMessage) {
        self.inner.conversation.upsert(message);
        self.cancel_autosave();
        self.flush().await;
    }

    /// Save now, joining a save already in flight.
    pub async fn flush(&self) {
        let in_flight = {
            let mut state = self.state();
            match &state.in_flight {
                Some(running) => {
                    let running = running.clone();
                    state.flush_requested = true;
                    running
                }
                None => {
                    let runner = tokio::spawn(run_saves(self.inner.clone()));
                    let shared = async move {
                        let _ = runner.await;
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(shared.clone());
                    shared
                }
            }
        };
        in_flight.await;
    }

    /// Save after the debounce interval; a new call restarts the interval.
    pub fn schedule_autosave(&self) {
        let mut state = self.state();
        if state.disposed {
            return;
        }
        if let Some(previous) = state.autosave.take() {
            previous.abort();
        }
        state.autosave_generation += 1;
        let generation = state.autosave_generation;
        let coalescer = self.clone();
        let debounce = self.inner.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            coalescer.release_autosave(generation);
            coalescer.flush().await;
        });
        state.autosave = Some(task.abort_handle());
    }

    fn release_autosave(&self, generation: u64) {
        let mut state = self.state();
        if state.autosave_generation == generation {
            state.autosave = None;
        }
    }

    pub fn cancel_autosave(&self) {
        if let Some(handle) = self.state().autosave.take() {
            handle.abort();
        }
    }

    /// Drop any pending autosave and refuse new ones. Commits still save.
    pub fn dispose(&self) {
        let mut state = self.state();
        state.disposed = true;
        if let Some(handle) = state.autosave.take() {
            handle.abort();
        }
    }
}

async fn run_saves(inner: Arc<Inner>) {
    loop {
        {
            let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
            state.flush_requested = false;
        }
        let snapshot = inner.conversation.snapshot();
        match inner.backend.save(&snapshot).await {
            Ok(()) => {
                tracing::debug!(conversation_id = %snapshot.id, messages = snapshot.messages.len(), "conversation saved");
            }
            Err(err) => {
                tracing::error!(conversation_id = %snapshot.id, error = %err, "conversation save failed");
                if let Some(sink) = &inner.on_error {
                    sink(&err);
                }
                let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
                state.flush_requested = false;
                state.in_flight = None;
                return;
            }
        }
        let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
        state.completed_saves += 1;
        if !state.flush_requested {
            state.in_flight = None;
            return;
        }
    }
}
