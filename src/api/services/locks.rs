//! Per-connection mutual exclusion between blueprint compilation and scope
//! deletion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type ConnectionKey = (String, i64);

#[derive(Default)]
pub struct ConnectionLocks {
    locks: Mutex<HashMap<ConnectionKey, Arc<AsyncMutex<()>>>>,
}

/// Held locks; released on drop.
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct ConnectionGuard {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl ConnectionGuard {
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl ConnectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &ConnectionKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    pub async fn lock(&self, plugin: &str, connection_id: i64) -> ConnectionGuard {
        self.lock_many([(plugin.to_string(), connection_id)]).await
    }

    /// Acquire every lock in sorted order so overlapping callers cannot deadlock.
    pub async fn lock_many(
        &self,
        keys: impl IntoIterator<Item = ConnectionKey>,
    ) -> ConnectionGuard {
        let mut keys: Vec<ConnectionKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.handle(key).lock_owned().await);
        }
        ConnectionGuard { guards }
    }
}
