//! Per-session mutual exclusion
//!
//! Every read-modify-write of a stored session runs under that session's
//! lock, so a stream chunk and a final result for the same session can not
//! interleave. Entries are dropped once nobody holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Keyed async mutexes, one per session ID
#[derive(Default)]
pub struct SessionLocks {
    table: LockTable,
}

/// Held while a session is being updated
pub struct SessionGuard {
    id: String,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: &str) -> SessionGuard {
        let lock = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        SessionGuard {
            id: id.to_string(),
            table: self.table.clone(),
            guard: Some(guard),
        }
    }

    /// Sessions currently locked or waited on
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the table's own handle left: no holder, no waiter.
        if table
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.id);
        }
    }
}
