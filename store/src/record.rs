//! Durable state of one item.

use quorum_types::{ItemId, ItemResult, ItemState, Timestamp};
use serde::{Deserialize, Serialize};

/// The ledger's row for one item id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: ItemId,
    pub state: ItemState,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    /// Item whose election currently holds this record
    /// (`LOCKED` or `LOCKED_FOR_CREATION`).
    pub locked_by: Option<ItemId>,
}

impl StateRecord {
    /// A fresh `PENDING` record.
    pub fn pending(id: ItemId, created_at: Timestamp, expires_at: Timestamp) -> Self {
        Self {
            id,
            state: ItemState::Pending,
            created_at,
            expires_at,
            locked_by: None,
        }
    }

    pub fn is_locked_by(&self, locker: &ItemId) -> bool {
        self.locked_by.as_ref() == Some(locker)
    }

    /// Whether an election of its own may run over this record. Final and
    /// approved records are settled; a record held by another item's election
    /// belongs to that election until it lets go.
    pub fn accepts_election(&self) -> bool {
        !self.state.is_consensus_found() && !self.state.is_approved() && self.locked_by.is_none()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_past(now)
    }

    /// The record as a result to report, `have_copy` supplied by the caller.
    pub fn to_result(&self, have_copy: bool) -> ItemResult {
        ItemResult::new(self.state, have_copy, self.created_at, self.expires_at)
    }
}
