//! The item capability consumed by the consensus engine.
//!
//! What an item *is* (a contract, a transaction) and how it validates itself
//! lives outside this workspace. The engine only needs its id, a bounded
//! `check`, its dependencies, and its expiry.

use std::fmt;

use quorum_types::{ItemError, ItemId, Timestamp};

use crate::{ConsensusError, Quantiser};

pub trait Item: Send + Sync + fmt::Debug {
    fn id(&self) -> ItemId;

    /// Validate the item itself, charging every costly step to `quantiser`.
    ///
    /// `Ok(false)` is a clean negative verdict. A quota failure is returned
    /// as [`ConsensusError::QuantiserExceeded`].
    fn check(&self, quantiser: &mut Quantiser) -> Result<bool, ConsensusError>;

    /// Items this one creates when approved.
    fn new_items(&self) -> Vec<ItemId> {
        Vec::new()
    }

    /// Approved items this one revokes when approved.
    fn revoking_items(&self) -> Vec<ItemId> {
        Vec::new()
    }

    /// Items that must be approved for this one to be valid.
    fn referenced_items(&self) -> Vec<ItemId> {
        Vec::new()
    }

    /// Errors collected by the last `check`.
    fn errors(&self) -> Vec<ItemError> {
        Vec::new()
    }

    fn expires_at(&self) -> Timestamp;
}
