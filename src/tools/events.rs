//! Tool-call lifecycle events and the observer list that delivers them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;

use crate::types::{ToolCall, ToolCallState};

/// Event emitted by the tool-call manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallEvent {
    Created {
        call: ToolCall,
    },
    ApprovalRequired {
        call: ToolCall,
    },
    StateChanged {
        call: ToolCall,
        from: ToolCallState,
        to: ToolCallState,
    },
}

impl ToolCallEvent {
    pub fn call(&self) -> &ToolCall {
        match self {
            Self::Created { call } | Self::ApprovalRequired { call } | Self::StateChanged { call, .. } => {
                call
            }
        }
    }
}

/// Listener callback. Must not block.
pub type ToolCallListener = Arc<dyn Fn(&ToolCallEvent) + Send + Sync>;

type Listeners = Mutex<Vec<(u64, ToolCallListener)>>;

/// Registered listeners, each with an independent teardown handle.
#[derive(Default)]
pub struct ObserverList {
    next_id: AtomicU64,
    listeners: Arc<Listeners>,
}

impl ObserverList {
    pub fn subscribe(&self, listener: ToolCallListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver to a snapshot of the listeners, outside the lock, so a
    /// listener may subscribe or unsubscribe while being called.
    pub fn emit(&self, event: &ToolCallEvent) {
        let snapshot: Vec<ToolCallListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the listener for the lifetime of the observer list.
    pub fn detach(mut self) {
        self.listeners = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut listeners) = listeners.lock() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallRequest;
    use std::sync::atomic::AtomicUsize;

    fn event() -> ToolCallEvent {
        ToolCallEvent::Created {
            call: ToolCall {
                id: "c".into(),
                message_id: "m".into(),
                request: ToolCallRequest::new("c", "read", "{}"),
                state: ToolCallState::Pending,
                timestamp: chrono::Utc::now(),
                signature: String::new(),
                target: None,
                server_id: None,
                auto_approved: None,
                approved_at: None,
                execution_started_at: None,
                execution_completed_at: None,
                result: None,
            },
        }
    }

    #[test]
    fn listeners_have_independent_teardown() {
        let observers = ObserverList::default();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let a2 = a.clone();
        let b2 = b.clone();
        let sub_a = observers.subscribe(Arc::new(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        }));
        let _sub_b = observers.subscribe(Arc::new(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        }));

        observers.emit(&event());
        sub_a.unsubscribe();
        observers.emit(&event());

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let observers = ObserverList::default();
        observers.subscribe(Arc::new(|_| {})).detach();
        assert_eq!(observers.len(), 1);
    }
}
