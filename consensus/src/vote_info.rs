//! Vote data: one peer's latest opinion on an item.

use quorum_types::{ItemState, NodeId};
use serde::{Deserialize, Serialize};

/// The result of processing a vote in an election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteResult {
    /// First vote from this node.
    Accepted,
    /// Replaced this node's earlier, different opinion.
    Updated,
    /// Duplicate, not a roster member, or the election is already over.
    Ignored,
}

/// Information about the latest vote cast by one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteInfo {
    pub voter: NodeId,
    pub state: ItemState,
    /// How many times this node changed its opinion, starting at 1.
    pub sequence: u64,
}

impl VoteInfo {
    pub fn new(voter: NodeId, state: ItemState, sequence: u64) -> Self {
        Self {
            voter,
            state,
            sequence,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.state.is_positive()
    }

    pub fn is_negative(&self) -> bool {
        self.state.is_negative()
    }
}
