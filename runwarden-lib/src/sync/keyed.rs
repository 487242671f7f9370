//! Per-key mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// A table of async mutexes indexed by string key.
///
/// Holders of the same key are strictly serialized; holders of different keys
/// never wait on each other. Entries exist only while at least one caller holds
/// or waits for the key, so the table does not grow with the keyspace.
#[derive(Debug, Default, Clone)]
pub struct KeyedMutex {
    locks: Arc<LockTable>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other caller holds `key`, then take it.
    ///
    /// The key is released when the returned guard drops. tokio mutexes do not
    /// poison, so a holder that is cancelled mid-section still releases it.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let slot = {
            let mut table = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(table.entry(key.to_owned()).or_default())
        };
        let guard = slot.lock_owned().await;
        trace!(key, "acquired keyed lock");
        KeyedGuard {
            key: key.to_owned(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

/// Release handle for a key taken through [`KeyedMutex::acquire`].
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // The guard keeps its own reference to the slot; release it first so a
        // strong count of one means only the table still points at it.
        drop(self.guard.take());
        let mut table = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = table.get(&self.key)
            && Arc::strong_count(slot) == 1
        {
            table.remove(&self.key);
        }
    }
}
