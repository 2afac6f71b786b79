//! Cross-request reservations of names, origins and addresses.
//!
//! Two registrations running at once must not both claim the same
//! human-readable name. Before validating, a registration locks every name
//! (origin, address) it wants; the lock fails as a whole if any one of them
//! is already reserved. Reservations lapse after the cache's max age so a
//! crashed registration cannot hold a name forever.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use quorum_types::ItemId;

struct Reservations<K> {
    held: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> Reservations<K> {
    fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<K, Instant>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All of `keys` or none. On conflict returns the keys already taken.
    fn lock_all(&self, keys: &[K], max_age: Duration) -> Result<(), Vec<K>> {
        let mut held = self.held();
        let now = Instant::now();
        let taken: Vec<K> = keys
            .iter()
            .filter(|k| {
                held.get(*k)
                    .is_some_and(|at| now.saturating_duration_since(*at) < max_age)
            })
            .cloned()
            .collect();
        if !taken.is_empty() {
            return Err(taken);
        }
        for key in keys {
            held.insert(key.clone(), now);
        }
        Ok(())
    }

    fn unlock_all(&self, keys: &[K]) {
        let mut held = self.held();
        for key in keys {
            held.remove(key);
        }
    }

    fn sweep_at(&self, now: Instant, max_age: Duration) -> usize {
        let mut held = self.held();
        let before = held.len();
        held.retain(|_, at| now.saturating_duration_since(*at) < max_age);
        before - held.len()
    }

    fn len(&self) -> usize {
        self.held().len()
    }
}

pub struct NameCache {
    names: Reservations<String>,
    origins: Reservations<ItemId>,
    addresses: Reservations<String>,
    max_age: Duration,
}

impl NameCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            names: Reservations::new(),
            origins: Reservations::new(),
            addresses: Reservations::new(),
            max_age,
        }
    }

    /// Reserve every name in `names`, or none if any is already reserved.
    /// The error lists the conflicting names.
    pub fn lock_names(&self, names: &[String]) -> Result<(), Vec<String>> {
        self.names.lock_all(names, self.max_age)
    }

    pub fn unlock_names(&self, names: &[String]) {
        self.names.unlock_all(names)
    }

    pub fn lock_origins(&self, origins: &[ItemId]) -> Result<(), Vec<ItemId>> {
        self.origins.lock_all(origins, self.max_age)
    }

    pub fn unlock_origins(&self, origins: &[ItemId]) {
        self.origins.unlock_all(origins)
    }

    pub fn lock_addresses(&self, addresses: &[String]) -> Result<(), Vec<String>> {
        self.addresses.lock_all(addresses, self.max_age)
    }

    pub fn unlock_addresses(&self, addresses: &[String]) {
        self.addresses.unlock_all(addresses)
    }

    /// Drop lapsed reservations. Returns how many went.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.names.sweep_at(now, self.max_age)
            + self.origins.sweep_at(now, self.max_age)
            + self.addresses.sweep_at(now, self.max_age)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Reservations currently stored, lapsed ones included until swept.
    pub fn len(&self) -> usize {
        self.names.len() + self.origins.len() + self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
