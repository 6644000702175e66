//! Event observer registry
//!
//! Observers are keyed by event kind and invoked in registration order.
//! Registration returns a token for explicit removal; an observer can also
//! remove itself by returning [`ObserverAction::Remove`] from its callback.

use super::events::{ControlEvent, EventKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// What an observer wants after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAction {
    Keep,
    Remove,
}

pub type EventCallback = Box<dyn FnMut(&ControlEvent) -> ObserverAction + Send>;

/// Handle identifying one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

struct Registration {
    token: ObserverToken,
    kind: EventKind,
    callback: Arc<Mutex<EventCallback>>,
}

#[derive(Default)]
pub struct ObserverRegistry {
    next_token: AtomicU64,
    entries: Mutex<Vec<Registration>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: EventKind, callback: EventCallback) -> ObserverToken {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Registration {
            token,
            kind,
            callback: Arc::new(Mutex::new(callback)),
        });
        token
    }

    /// Returns false if the token was not registered
    pub fn remove(&self, token: ObserverToken) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|r| r.token != token);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn contains(&self, token: ObserverToken) -> bool {
        self.lock().iter().any(|r| r.token == token)
    }

    /// Event kinds with at least one observer
    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = Vec::new();
        for r in self.lock().iter() {
            if !kinds.contains(&r.kind) {
                kinds.push(r.kind.clone());
            }
        }
        kinds
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every observer of its kind.
    ///
    /// The registry lock is not held while callbacks run, so callbacks may
    /// add or remove observers. Observers removed by an earlier callback in
    /// the same dispatch are skipped. Returns the number of callbacks run.
    pub fn dispatch(&self, event: &ControlEvent) -> usize {
        let targets: Vec<(ObserverToken, Arc<Mutex<EventCallback>>)> = self
            .lock()
            .iter()
            .filter(|r| r.kind == event.kind)
            .map(|r| (r.token, Arc::clone(&r.callback)))
            .collect();

        let mut invoked = 0;
        for (token, callback) in targets {
            if !self.contains(token) {
                continue;
            }
            let action = {
                let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
                (*callback)(event)
            };
            invoked += 1;
            if action == ObserverAction::Remove {
                self.remove(token);
            }
        }
        invoked
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
