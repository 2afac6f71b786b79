//! Nullable ledger: thread-safe in-memory records for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use quorum_consensus::Item;
use quorum_store::{Ledger, LedgerTxn, StateRecord, StoreError};
use quorum_types::{ItemId, ItemState, Timestamp};

#[derive(Default)]
struct Inner {
    records: HashMap<ItemId, StateRecord>,
    items: HashMap<ItemId, Arc<dyn Item>>,
}

/// In-memory [`Ledger`].
///
/// One mutex guards all records, so every method is atomic. A transaction
/// runs against a copy of the record map that replaces the live map only
/// when the closure succeeds. The closure must not call back into the
/// ledger.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

struct SnapshotTxn {
    records: HashMap<ItemId, StateRecord>,
}

impl LedgerTxn for SnapshotTxn {
    fn get(&self, id: &ItemId) -> Option<StateRecord> {
        self.records.get(id).cloned()
    }

    fn put(&mut self, record: StateRecord) {
        self.records.insert(record.id, record);
    }

    fn remove(&mut self, id: &ItemId) {
        self.records.remove(id);
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a record in `state`, as if an earlier election had settled it.
    pub fn insert(&self, id: ItemId, state: ItemState, expires_at: Timestamp) -> StateRecord {
        let mut record = StateRecord::pending(id, Timestamp::now(), expires_at);
        record.state = state;
        self.inner().records.insert(id, record.clone());
        record
    }

    pub fn state_of(&self, id: &ItemId) -> Option<ItemState> {
        self.inner().records.get(id).map(|r| r.state)
    }

    pub fn record_count(&self) -> usize {
        self.inner().records.len()
    }
}

impl Ledger for MemoryLedger {
    fn find_or_create(
        &self,
        id: &ItemId,
        expires_at: Timestamp,
    ) -> Result<StateRecord, StoreError> {
        let mut inner = self.inner();
        let record = inner
            .records
            .entry(*id)
            .or_insert_with(|| StateRecord::pending(*id, Timestamp::now(), expires_at));
        Ok(record.clone())
    }

    fn get_record(&self, id: &ItemId) -> Result<Option<StateRecord>, StoreError> {
        Ok(self.inner().records.get(id).cloned())
    }

    fn save(&self, record: &StateRecord) -> Result<(), StoreError> {
        self.inner().records.insert(record.id, record.clone());
        Ok(())
    }

    fn destroy(&self, id: &ItemId) -> Result<(), StoreError> {
        let mut inner = self.inner();
        inner.records.remove(id);
        inner.items.remove(id);
        Ok(())
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn LedgerTxn) -> Result<(), StoreError>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        let mut txn = SnapshotTxn {
            records: inner.records.clone(),
        };
        match f(&mut txn) {
            Ok(()) => {
                inner.records = txn.records;
                Ok(true)
            }
            Err(StoreError::Rollback) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn lock_to_revoke(
        &self,
        locker: &ItemId,
        id: &ItemId,
    ) -> Result<Option<StateRecord>, StoreError> {
        let mut inner = self.inner();
        let Some(record) = inner.records.get_mut(id) else {
            return Ok(None);
        };
        match record.state {
            ItemState::Approved => {
                record.state = ItemState::Locked;
                record.locked_by = Some(*locker);
                Ok(Some(record.clone()))
            }
            ItemState::Locked if record.is_locked_by(locker) => Ok(Some(record.clone())),
            _ => Ok(None),
        }
    }

    fn unlock(&self, locker: &ItemId, id: &ItemId) -> Result<Option<StateRecord>, StoreError> {
        let mut inner = self.inner();
        match inner.records.get_mut(id) {
            Some(record) if record.state == ItemState::Locked && record.is_locked_by(locker) => {
                record.state = ItemState::Approved;
                record.locked_by = None;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    fn create_output_lock_record(
        &self,
        locker: &ItemId,
        id: &ItemId,
        expires_at: Timestamp,
    ) -> Result<Option<StateRecord>, StoreError> {
        let mut inner = self.inner();
        if let Some(existing) = inner.records.get(id) {
            let own = existing.state == ItemState::LockedForCreation && existing.is_locked_by(locker);
            return Ok(own.then(|| existing.clone()));
        }
        let mut record = StateRecord::pending(*id, Timestamp::now(), expires_at);
        record.state = ItemState::LockedForCreation;
        record.locked_by = Some(*locker);
        inner.records.insert(*id, record.clone());
        Ok(Some(record))
    }

    fn put_item(&self, item: Arc<dyn Item>) -> Result<(), StoreError> {
        self.inner().items.insert(item.id(), item);
        Ok(())
    }

    fn get_item(&self, id: &ItemId) -> Result<Option<Arc<dyn Item>>, StoreError> {
        Ok(self.inner().items.get(id).cloned())
    }

    fn cleanup(&self, now: Timestamp) -> Result<usize, StoreError> {
        let mut inner = self.inner();
        let expired: Vec<ItemId> = inner
            .records
            .values()
            .filter(|r| r.locked_by.is_none() && r.is_expired(now))
            .map(|r| r.id)
            .collect();
        for id in &expired {
            inner.records.remove(id);
            inner.items.remove(id);
        }
        Ok(expired.len())
    }
}
