//! Lock - Named mutexes for serializing read-modify-write sequences
//!
//! Some remote objects (e.g. a router whose peer list is patched as a whole)
//! can only be mutated safely by one caller at a time. Callers agree on a
//! string key per object and hold the corresponding lock across the full
//! read-modify-write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of named async locks
///
/// Locks are created on first use and kept for the lifetime of the registry.
/// The guard returned by `lock` releases the named lock when dropped.
#[derive(Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if another holder has it
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}
