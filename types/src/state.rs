//! Item lifecycle states.
//!
//! The enum only classifies; which transitions are legal is decided by the
//! item processor that owns an election.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::QuorumError;

/// Disposition of an item as known to one node.
///
/// The discriminants are the wire ordinals and must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ItemState {
    /// Known, no opinion formed yet.
    Pending = 0,
    /// Local check passed; election in progress.
    PendingPositive = 1,
    /// Local check failed; election in progress.
    PendingNegative = 2,
    /// Approved by quorum.
    Approved = 3,
    /// Declined by quorum.
    Declined = 4,
    /// Approved earlier, then revoked by another approved item.
    Revoked = 5,
    /// Nothing is known, or local validation was inconclusive.
    Undefined = 6,
    /// Approved and locked by an item that wants to revoke it.
    Locked = 7,
    /// Placeholder for an item that an in-flight election wants to create.
    LockedForCreation = 8,
    /// Placeholder created and revoked by the same in-flight election.
    LockedForCreationRevoked = 9,
    /// Dropped without a verdict.
    Discarded = 10,
}

impl ItemState {
    pub const ALL: [ItemState; 11] = [
        ItemState::Pending,
        ItemState::PendingPositive,
        ItemState::PendingNegative,
        ItemState::Approved,
        ItemState::Declined,
        ItemState::Revoked,
        ItemState::Undefined,
        ItemState::Locked,
        ItemState::LockedForCreation,
        ItemState::LockedForCreationRevoked,
        ItemState::Discarded,
    ];

    /// Terminal, quorum-backed disposition.
    pub fn is_consensus_found(self) -> bool {
        matches!(
            self,
            ItemState::Approved | ItemState::Declined | ItemState::Revoked | ItemState::Discarded
        )
    }

    /// An election is (or was) running without a verdict.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ItemState::Pending | ItemState::PendingPositive | ItemState::PendingNegative
        )
    }

    /// Kept only as history; never becomes valid again.
    pub fn is_archived(self) -> bool {
        matches!(
            self,
            ItemState::Declined | ItemState::Revoked | ItemState::Discarded
        )
    }

    /// The record may be dropped by its own processor when an election dies
    /// without a verdict.
    pub fn can_remove_self(self) -> bool {
        self.is_pending() || self == ItemState::Undefined
    }

    /// Approved, possibly locked for revocation by a pending item.
    pub fn is_approved(self) -> bool {
        matches!(self, ItemState::Approved | ItemState::Locked)
    }

    /// States of a dependency that require a resync before they can be trusted.
    pub fn is_ambiguous(self) -> bool {
        self.is_pending() || matches!(self, ItemState::Undefined | ItemState::LockedForCreation)
    }

    /// Counts as a positive vote in a tally.
    pub fn is_positive(self) -> bool {
        matches!(self, ItemState::PendingPositive | ItemState::Approved)
    }

    /// Counts as a negative vote in a tally.
    pub fn is_negative(self) -> bool {
        matches!(self, ItemState::PendingNegative | ItemState::Declined)
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self, QuorumError> {
        Self::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(QuorumError::UnknownState(ordinal))
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::Pending => "PENDING",
            ItemState::PendingPositive => "PENDING_POSITIVE",
            ItemState::PendingNegative => "PENDING_NEGATIVE",
            ItemState::Approved => "APPROVED",
            ItemState::Declined => "DECLINED",
            ItemState::Revoked => "REVOKED",
            ItemState::Undefined => "UNDEFINED",
            ItemState::Locked => "LOCKED",
            ItemState::LockedForCreation => "LOCKED_FOR_CREATION",
            ItemState::LockedForCreationRevoked => "LOCKED_FOR_CREATION_REVOKED",
            ItemState::Discarded => "DISCARDED",
        };
        f.write_str(s)
    }
}
