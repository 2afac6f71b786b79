//! Keyed mutual exclusion.
//!
//! A table of per-key async mutexes. Keys compare by value, so two equal ids
//! built independently contend for the same lock. Entries are shared handles;
//! an entry nobody holds or waits on is pruned, which keeps the table from
//! growing with every id ever seen.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use quorum_types::ItemId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

/// Per-key lock table.
pub struct KeyedLock<K: Eq + Hash + Clone> {
    table: Table<K>,
}

/// Per-item election lock.
pub type ItemLock = KeyedLock<ItemId>;
/// Per-parcel lock; parcels are identified by the digest of their two items.
pub type ParcelLock = KeyedLock<ItemId>;

/// Exclusive hold on one key. Released (and the entry pruned if idle) on drop.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    table: Table<K>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = self.entry(&key);
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            table: Arc::clone(&self.table),
        }
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<K>> {
        let mutex = self.entry(&key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(KeyedGuard {
                key,
                guard: Some(guard),
                table: Arc::clone(&self.table),
            }),
            Err(_) => {
                prune_key(&self.table, &key);
                None
            }
        }
    }

    /// Run `f` while holding `key`.
    pub async fn synchronize<F, Fut, R>(&self, key: K, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _guard = self.lock(key).await;
        f().await
    }

    /// Whether somebody currently holds `key`.
    pub fn is_locked(&self, key: &K) -> bool {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.get(key).map(|m| m.try_lock().is_err()).unwrap_or(false)
    }

    /// Number of cached lock entries, held or not.
    pub fn size(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        table.retain(|_, m| Arc::strong_count(m) > 1);
        before - table.len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // Release first so our own handle no longer counts.
        self.guard.take();
        prune_key(&self.table, &self.key);
    }
}

fn prune_key<K: Eq + Hash + Clone>(table: &Table<K>, key: &K) {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(m) = table.get(key) {
        if Arc::strong_count(m) == 1 {
            table.remove(key);
        }
    }
}
