//! Per-identity mutual exclusion for admission decisions.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A set of async mutexes, one per identity currently deciding.
///
/// Entries are created on first use and dropped again when the last holder
/// or waiter releases them.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `identity`.
    pub async fn lock(&self, identity: &str) -> IdentityGuard<'_> {
        // Built before waiting so a cancelled wait still cleans up the entry.
        let mut held = IdentityGuard {
            locks: self,
            identity: identity.to_string(),
            guard: None,
        };

        let mutex = Arc::clone(&self.locks.entry(identity.to_string()).or_default());
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    /// Number of identities with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no identity holds or awaits a lock.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one identity; released on drop.
#[derive(Debug)]
pub struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    identity: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Cloning an entry happens under the shard lock, so a count of one
        // here means nobody else holds or awaits this mutex.
        self.locks
            .locks
            .remove_if(&self.identity, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
