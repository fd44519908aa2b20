use std::sync::Arc;

use dashmap::DashSet;
use uuid::Uuid;

/// A set of ids that are currently busy.
///
/// Holding a [`LockGuard`] is the only way to be a member; dropping the guard,
/// including during a panic unwind, releases the id.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    held: Arc<DashSet<Uuid>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when the id is already held.
    pub fn try_acquire(&self, id: Uuid) -> Option<LockGuard> {
        if self.held.insert(id) {
            Some(LockGuard {
                id,
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, id: Uuid) -> bool {
        self.held.contains(&id)
    }
}

#[derive(Debug)]
pub struct LockGuard {
    id: Uuid,
    held: Arc<DashSet<Uuid>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}
