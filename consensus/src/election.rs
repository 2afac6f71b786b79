//! Election tally: the quorum bookkeeping of one item.
//!
//! Each roster node contributes at most one opinion; a new opinion from the
//! same node replaces the old one. The election is decided as soon as the
//! distinct positive voters reach `positive_consensus` (approve) or the
//! distinct negative voters reach `negative_consensus` (decline).

use crate::vote_info::{VoteInfo, VoteResult};
use quorum_types::{ItemId, ItemState, NodeId, Roster};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Phase of an item processor driving one election.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorState {
    Init,
    /// Pulling the item from the peer that announced it.
    Downloading,
    /// Running the item's check and dependency checks.
    Validating,
    /// Asking peers about ambiguous dependencies.
    Resyncing,
    /// Broadcasting the local vote and collecting peers' votes.
    Polling,
    /// Quorum reached; the verdict is about to be committed.
    Deciding,
    Committing,
    Done,
    /// Deadline reached without quorum.
    TimedOut,
    /// Validation ran out of work quota; the item stays `UNDEFINED`.
    Aborted,
}

/// The lifecycle state of an election tally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Collecting votes.
    Active,
    /// Quorum reached with the given terminal state. Terminal.
    Decided(ItemState),
    /// Deadline passed without quorum. Terminal.
    Expired,
}

/// Vote tally of one item on one node.
#[derive(Clone, Debug)]
pub struct Election {
    pub item_id: ItemId,
    pub state: ElectionState,
    /// Latest vote per node.
    last_votes: HashMap<NodeId, VoteInfo>,
    roster: Roster,
    positive_consensus: usize,
    negative_consensus: usize,
}

impl Election {
    pub fn new(
        item_id: ItemId,
        roster: Roster,
        positive_consensus: usize,
        negative_consensus: usize,
    ) -> Self {
        Self {
            item_id,
            state: ElectionState::Active,
            last_votes: HashMap::new(),
            roster,
            positive_consensus,
            negative_consensus,
        }
    }

    /// Record `voter`'s current opinion.
    ///
    /// Votes from nodes outside the roster and votes after the election is
    /// over are ignored. Re-sending the same opinion is a no-op.
    pub fn vote(&mut self, voter: NodeId, state: ItemState) -> VoteResult {
        if self.state != ElectionState::Active {
            return VoteResult::Ignored;
        }
        if !self.roster.contains(voter) {
            return VoteResult::Ignored;
        }

        match self.last_votes.get_mut(&voter) {
            Some(existing) if existing.state == state => VoteResult::Ignored,
            Some(existing) => {
                existing.state = state;
                existing.sequence += 1;
                VoteResult::Updated
            }
            None => {
                self.last_votes.insert(voter, VoteInfo::new(voter, state, 1));
                VoteResult::Accepted
            }
        }
    }

    pub fn positive_count(&self) -> usize {
        self.last_votes.values().filter(|v| v.is_positive()).count()
    }

    pub fn negative_count(&self) -> usize {
        self.last_votes.values().filter(|v| v.is_negative()).count()
    }

    /// Decide if a quorum exists. Approval is checked first.
    ///
    /// Returns the terminal state the first time the election is decided.
    pub fn try_decide(&mut self) -> Option<ItemState> {
        if self.state != ElectionState::Active {
            return None;
        }
        let verdict = if self.positive_count() >= self.positive_consensus {
            ItemState::Approved
        } else if self.negative_count() >= self.negative_consensus {
            ItemState::Declined
        } else {
            return None;
        };
        self.state = ElectionState::Decided(verdict);
        Some(verdict)
    }

    /// Stop collecting votes. Returns the provisional state the tally implies.
    pub fn expire(&mut self) -> ItemState {
        if self.state == ElectionState::Active {
            self.state = ElectionState::Expired;
        }
        self.implied_state()
    }

    /// `PENDING_POSITIVE` / `PENDING_NEGATIVE` by majority of cast votes,
    /// `PENDING` on a tie.
    pub fn implied_state(&self) -> ItemState {
        if let ElectionState::Decided(s) = self.state {
            return s;
        }
        let pos = self.positive_count();
        let neg = self.negative_count();
        if pos > neg {
            ItemState::PendingPositive
        } else if neg > pos {
            ItemState::PendingNegative
        } else {
            ItemState::Pending
        }
    }

    pub fn vote_of(&self, node: NodeId) -> Option<&VoteInfo> {
        self.last_votes.get(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> ItemId {
        ItemId::of(b"item")
    }

    fn election(pos: usize, neg: usize) -> Election {
        Election::new(item(), Roster::numbered(5), pos, neg)
    }

    #[test]
    fn new_election_is_active() {
        let e = election(3, 2);
        assert_eq!(e.state, ElectionState::Active);
        assert_eq!(e.positive_count(), 0);
        assert_eq!(e.implied_state(), ItemState::Pending);
    }

    #[test]
    fn first_vote_accepted_duplicate_ignored() {
        let mut e = election(3, 2);
        assert_eq!(e.vote(NodeId(1), ItemState::PendingPositive), VoteResult::Accepted);
        assert_eq!(e.vote(NodeId(1), ItemState::PendingPositive), VoteResult::Ignored);
        assert_eq!(e.positive_count(), 1);
    }

    #[test]
    fn revote_replaces_not_accumulates() {
        let mut e = election(3, 2);
        e.vote(NodeId(1), ItemState::PendingPositive);
        assert_eq!(e.vote(NodeId(1), ItemState::PendingNegative), VoteResult::Updated);
        assert_eq!(e.positive_count(), 0);
        assert_eq!(e.negative_count(), 1);
        assert_eq!(e.vote_of(NodeId(1)).unwrap().sequence, 2);
    }

    #[test]
    fn approval_needs_distinct_voters() {
        let mut e = election(3, 3);
        e.vote(NodeId(1), ItemState::PendingPositive);
        e.vote(NodeId(1), ItemState::Approved);
        e.vote(NodeId(2), ItemState::PendingPositive);
        assert!(e.try_decide().is_none());
        e.vote(NodeId(3), ItemState::PendingPositive);
        assert_eq!(e.try_decide(), Some(ItemState::Approved));
        assert_eq!(e.state, ElectionState::Decided(ItemState::Approved));
    }

    #[test]
    fn decline_on_negative_quorum() {
        let mut e = election(3, 2);
        e.vote(NodeId(1), ItemState::PendingNegative);
        e.vote(NodeId(2), ItemState::PendingPositive);
        assert!(e.try_decide().is_none());
        e.vote(NodeId(3), ItemState::Declined);
        assert_eq!(e.try_decide(), Some(ItemState::Declined));
    }

    #[test]
    fn undefined_votes_count_for_nothing() {
        let mut e = election(1, 1);
        e.vote(NodeId(1), ItemState::Undefined);
        e.vote(NodeId(2), ItemState::Pending);
        assert!(e.try_decide().is_none());
        assert!(e.vote_of(NodeId(1)).is_some());
    }

    #[test]
    fn non_roster_votes_ignored() {
        let mut e = election(1, 1);
        assert_eq!(e.vote(NodeId(99), ItemState::Approved), VoteResult::Ignored);
        assert!(e.try_decide().is_none());
    }

    #[test]
    fn decided_election_ignores_votes() {
        let mut e = election(1, 1);
        e.vote(NodeId(1), ItemState::PendingPositive);
        e.try_decide();
        assert_eq!(e.vote(NodeId(2), ItemState::PendingNegative), VoteResult::Ignored);
        assert!(e.try_decide().is_none());
        assert_eq!(e.expire(), ItemState::Approved);
    }

    #[test]
    fn expiry_reports_partial_state() {
        let mut e = election(3, 3);
        e.vote(NodeId(1), ItemState::PendingPositive);
        e.vote(NodeId(2), ItemState::PendingPositive);
        e.vote(NodeId(3), ItemState::PendingNegative);
        assert_eq!(e.expire(), ItemState::PendingPositive);
        assert_eq!(e.state, ElectionState::Expired);
        assert_eq!(e.vote(NodeId(4), ItemState::PendingPositive), VoteResult::Ignored);
    }

    #[test]
    fn expiry_tie_is_pending() {
        let mut e = election(3, 3);
        e.vote(NodeId(1), ItemState::PendingPositive);
        e.vote(NodeId(2), ItemState::PendingNegative);
        assert_eq!(e.expire(), ItemState::Pending);
    }

    #[test]
    fn approval_checked_before_decline() {
        let mut e = election(1, 1);
        e.vote(NodeId(1), ItemState::PendingNegative);
        e.vote(NodeId(2), ItemState::PendingPositive);
        assert_eq!(e.try_decide(), Some(ItemState::Approved));
    }
}
