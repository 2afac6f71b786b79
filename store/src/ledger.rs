//! Ledger trait: the single source of truth for committed item state.

use std::sync::Arc;

use quorum_consensus::Item;
use quorum_types::{ItemId, Timestamp};

use crate::{StateRecord, StoreError};

/// Record access inside a [`Ledger::transaction`].
pub trait LedgerTxn {
    fn get(&self, id: &ItemId) -> Option<StateRecord>;
    fn put(&mut self, record: StateRecord);
    fn remove(&mut self, id: &ItemId);
}

/// Storage operations used by the consensus engine.
///
/// Implementations must make every method atomic per record; `transaction`
/// must be atomic across all records it touches.
pub trait Ledger: Send + Sync {
    /// Return the record for `id`, creating a `PENDING` one if absent.
    /// `expires_at` is only used when the record is created.
    fn find_or_create(&self, id: &ItemId, expires_at: Timestamp)
        -> Result<StateRecord, StoreError>;

    fn get_record(&self, id: &ItemId) -> Result<Option<StateRecord>, StoreError>;

    fn save(&self, record: &StateRecord) -> Result<(), StoreError>;

    fn destroy(&self, id: &ItemId) -> Result<(), StoreError>;

    /// Run `f` atomically. Returning [`StoreError::Rollback`] discards every
    /// change and yields `Ok(false)`; other errors discard and propagate.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn LedgerTxn) -> Result<(), StoreError>,
    ) -> Result<bool, StoreError>;

    /// Lock an `APPROVED` record for revocation by `locker`.
    ///
    /// Returns `None` when the record is missing, not approved, or locked by
    /// another item. Locking again by the same locker succeeds.
    fn lock_to_revoke(
        &self,
        locker: &ItemId,
        id: &ItemId,
    ) -> Result<Option<StateRecord>, StoreError>;

    /// Release a revoke lock held by `locker`, restoring `APPROVED`.
    fn unlock(&self, locker: &ItemId, id: &ItemId) -> Result<Option<StateRecord>, StoreError>;

    /// Create a `LOCKED_FOR_CREATION` placeholder owned by `locker`.
    ///
    /// Returns `None` if a record for `id` already exists (other than this
    /// locker's own placeholder).
    fn create_output_lock_record(
        &self,
        locker: &ItemId,
        id: &ItemId,
        expires_at: Timestamp,
    ) -> Result<Option<StateRecord>, StoreError>;

    /// Keep the content of an item so peers can download it.
    fn put_item(&self, item: Arc<dyn Item>) -> Result<(), StoreError>;

    fn get_item(&self, id: &ItemId) -> Result<Option<Arc<dyn Item>>, StoreError>;

    /// Drop records (and their content) expired at `now`. Returns how many went.
    fn cleanup(&self, now: Timestamp) -> Result<usize, StoreError>;
}
