//! The answer a node gives about an item: its state plus a little metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ItemState, Timestamp};

/// Why an item (or one of its dependencies) failed locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The item's own `check()` returned false.
    FailedCheck,
    /// A referenced item is not approved.
    BadReference,
    /// A revoking item is not approved or is already locked.
    BadRevoke,
    /// An item to be created already exists.
    NewItemExists,
    /// Validation ran out of quota.
    QuantiserExceeded,
    /// Dependency state could not be resolved by peers.
    ResyncFailed,
    /// The item expired before it could be approved.
    Expired,
}

/// One validation error attached to an item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub code: ErrorCode,
    /// What the error is about (usually an item id).
    pub object: String,
    pub message: String,
}

impl ItemError {
    pub fn new(code: ErrorCode, object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            object: object.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{}]: {}", self.code, self.object, self.message)
    }
}

/// Current disposition of an item as reported by a node.
///
/// `errors` stays local: it is never put on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub state: ItemState,
    /// Whether the reporting node holds the item's content.
    pub have_copy: bool,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    #[serde(skip)]
    pub errors: Vec<ItemError>,
}

impl ItemResult {
    pub fn new(
        state: ItemState,
        have_copy: bool,
        created_at: Timestamp,
        expires_at: Timestamp,
    ) -> Self {
        Self {
            state,
            have_copy,
            created_at,
            expires_at,
            errors: Vec::new(),
        }
    }

    /// Result for an id nothing is known about.
    pub fn undefined() -> Self {
        Self::new(ItemState::Undefined, false, Timestamp::EPOCH, Timestamp::EPOCH)
    }

    pub fn with_state(mut self, state: ItemState) -> Self {
        self.state = state;
        self
    }

    pub fn with_errors(mut self, errors: Vec<ItemError>) -> Self {
        self.errors = errors;
        self
    }
}
