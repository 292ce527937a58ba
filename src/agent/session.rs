use parking_lot::Mutex;
use std::collections::HashSet;

/// Tracks which callers have a live agent conversation to continue.
///
/// A flag is set only after a run exits 0 and survives every failure;
/// the only way back out is an explicit reset. Entries never expire; an
/// idle TTL would slot in here if one is ever wanted.
pub struct SessionStore {
    active: Mutex<HashSet<String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_active(&self, identity: &str) -> bool {
        self.active.lock().contains(identity)
    }

    /// Mark a conversation as continuable after a successful run.
    pub fn mark_active(&self, identity: &str) {
        self.active.lock().insert(identity.to_string());
    }

    /// Explicit reset; returns whether a session existed.
    pub fn reset(&self, identity: &str) -> bool {
        self.active.lock().remove(identity)
    }
}
