//! Nullable item: verdict, cost and dependencies chosen by the test.

use quorum_consensus::{ConsensusError, Item, Quantiser};
use quorum_types::{ErrorCode, ItemError, ItemId, Timestamp};

/// Default lifetime of an approved test item.
pub const DEFAULT_LIFETIME_SECS: u64 = 3_600;

#[derive(Clone, Debug)]
pub struct TestItem {
    id: ItemId,
    valid: bool,
    cost: u64,
    new_items: Vec<ItemId>,
    revoking: Vec<ItemId>,
    referenced: Vec<ItemId>,
    expires_at: Timestamp,
}

impl TestItem {
    /// A valid item costing one quantum, id derived from `tag`.
    pub fn new(tag: &[u8]) -> Self {
        Self {
            id: ItemId::of(tag),
            valid: true,
            cost: 1,
            new_items: Vec::new(),
            revoking: Vec::new(),
            referenced: Vec::new(),
            expires_at: Timestamp::now().plus_secs(DEFAULT_LIFETIME_SECS),
        }
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    pub fn cost(mut self, units: u64) -> Self {
        self.cost = units;
        self
    }

    pub fn creating(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.new_items.extend(ids);
        self
    }

    pub fn revoking(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.revoking.extend(ids);
        self
    }

    pub fn referencing(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.referenced.extend(ids);
        self
    }

    pub fn expiring_at(mut self, at: Timestamp) -> Self {
        self.expires_at = at;
        self
    }
}

impl Item for TestItem {
    fn id(&self) -> ItemId {
        self.id
    }

    fn check(&self, quantiser: &mut Quantiser) -> Result<bool, ConsensusError> {
        quantiser.add_work_cost_units(self.cost)?;
        Ok(self.valid)
    }

    fn new_items(&self) -> Vec<ItemId> {
        self.new_items.clone()
    }

    fn revoking_items(&self) -> Vec<ItemId> {
        self.revoking.clone()
    }

    fn referenced_items(&self) -> Vec<ItemId> {
        self.referenced.clone()
    }

    fn errors(&self) -> Vec<ItemError> {
        if self.valid {
            Vec::new()
        } else {
            vec![ItemError::new(
                ErrorCode::FailedCheck,
                self.id.short(),
                "rejected by test item",
            )]
        }
    }

    fn expires_at(&self) -> Timestamp {
        self.expires_at
    }
}
