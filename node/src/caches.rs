//! Short-lived memoization beside the node.
//!
//! Each cache is a thread-safe map whose entries age out after a fixed
//! maximum. Nothing sweeps a cache by itself; the node's single sweeper
//! calls [`TimedCache::sweep`] on all of them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use quorum_consensus::{Item, ParcelResult};
use quorum_types::{ItemId, ItemResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A map whose entries expire `max_age` after insertion.
pub struct TimedCache<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
    max_age: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TimedCache<K, V> {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, (V, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace; the entry's age restarts.
    pub fn put(&self, key: K, value: V) {
        self.entries().insert(key, (value, Instant::now()));
    }

    /// The live value for `key`. Expired entries read as absent even before
    /// the next sweep.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries();
        entries
            .get(key)
            .filter(|(_, at)| at.elapsed() < self.max_age)
            .map(|(v, _)| v.clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries().remove(key).map(|(v, _)| v)
    }

    /// Drop entries older than `max_age` at `now`. Returns how many went.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, (_, at)| now.saturating_duration_since(*at) < self.max_age);
        before - entries.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

/// Item content seen recently, served to peers and reused by processors.
pub type ItemCache = TimedCache<ItemId, Arc<dyn Item>>;

/// Results of parcels whose processing already finished.
pub type ParcelCache = TimedCache<ItemId, ParcelResult>;

/// Item results kept after their processor is gone.
pub type ResultCache = TimedCache<ItemId, ItemResult>;

/// Per-item execution environment: free-form key/value state a contract
/// keeps between runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub item_id: ItemId,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl Environment {
    pub fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            values: Map::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }
}

/// Environments by item id.
pub type EnvCache = TimedCache<ItemId, Environment>;
