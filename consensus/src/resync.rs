//! Dependency resync: asking peers what they know about an item whose
//! local state is ambiguous.
//!
//! Answers are tallied per dependency. A terminal answer is adopted once
//! enough distinct peers agree on it; enough non-terminal answers (or the
//! resync deadline) break the resync, and the item that depended on it is
//! declined.

use std::collections::{BTreeMap, HashMap};

use quorum_types::{ItemId, ItemState, NodeId};

use crate::ConsensusConfig;

/// Where one dependency's resync stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncOutcome {
    Pending,
    /// Peers agreed on this terminal state.
    Resolved(ItemState),
    /// Peers cannot settle it.
    Broken,
}

/// Where a whole set of dependency resyncs stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncProgress {
    Pending,
    /// Every dependency resolved.
    Complete,
    /// At least one dependency broke.
    Broken,
}

/// Answers collected for one dependency.
#[derive(Clone, Debug)]
pub struct ResyncTally {
    pub item_id: ItemId,
    answers: HashMap<NodeId, ItemState>,
    positive_consensus: usize,
    negative_consensus: usize,
    break_consensus: usize,
}

impl ResyncTally {
    pub fn new(item_id: ItemId, config: &ConsensusConfig) -> Self {
        Self {
            item_id,
            answers: HashMap::new(),
            positive_consensus: config.positive_consensus,
            negative_consensus: config.negative_consensus,
            break_consensus: config.resync_break_consensus,
        }
    }

    /// Record `node`'s answer (latest wins) and return the new outcome.
    pub fn answer(&mut self, node: NodeId, state: ItemState) -> ResyncOutcome {
        // A peer that holds a revoke lock still considers the item approved.
        let state = if state == ItemState::Locked {
            ItemState::Approved
        } else {
            state
        };
        self.answers.insert(node, state);
        self.outcome()
    }

    fn count(&self, state: ItemState) -> usize {
        self.answers.values().filter(|s| **s == state).count()
    }

    pub fn outcome(&self) -> ResyncOutcome {
        if self.count(ItemState::Approved) >= self.positive_consensus {
            return ResyncOutcome::Resolved(ItemState::Approved);
        }
        if self.count(ItemState::Revoked) >= self.positive_consensus {
            return ResyncOutcome::Resolved(ItemState::Revoked);
        }
        if self.count(ItemState::Declined) >= self.negative_consensus {
            return ResyncOutcome::Resolved(ItemState::Declined);
        }
        let inconclusive = self
            .answers
            .values()
            .filter(|s| !s.is_consensus_found())
            .count();
        if inconclusive >= self.break_consensus {
            return ResyncOutcome::Broken;
        }
        ResyncOutcome::Pending
    }

    pub fn answer_count(&self) -> usize {
        self.answers.len()
    }
}

/// All dependencies being resynced for one item.
#[derive(Clone, Debug, Default)]
pub struct ResyncSet {
    tallies: BTreeMap<ItemId, ResyncTally>,
}

impl ResyncSet {
    pub fn new(ids: &[ItemId], config: &ConsensusConfig) -> Self {
        Self {
            tallies: ids
                .iter()
                .map(|id| (*id, ResyncTally::new(*id, config)))
                .collect(),
        }
    }

    /// Feed answers from one peer. Unknown ids are ignored.
    pub fn answer(&mut self, node: NodeId, states: &BTreeMap<ItemId, ItemState>) {
        for (id, state) in states {
            if let Some(tally) = self.tallies.get_mut(id) {
                tally.answer(node, *state);
            }
        }
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.tallies.keys().copied().collect()
    }

    /// Broken if any dependency broke, resolved once every one resolved.
    pub fn progress(&self) -> ResyncProgress {
        let mut all_resolved = true;
        for tally in self.tallies.values() {
            match tally.outcome() {
                ResyncOutcome::Broken => return ResyncProgress::Broken,
                ResyncOutcome::Pending => all_resolved = false,
                ResyncOutcome::Resolved(_) => {}
            }
        }
        if all_resolved {
            ResyncProgress::Complete
        } else {
            ResyncProgress::Pending
        }
    }

    /// Resolved states so far.
    pub fn resolved(&self) -> Vec<(ItemId, ItemState)> {
        self.tallies
            .values()
            .filter_map(|t| match t.outcome() {
                ResyncOutcome::Resolved(s) => Some((t.item_id, s)),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tallies.is_empty()
    }
}

/// Whether a resync is worth trying for an item with `known` clearly settled
/// dependencies and `unknown` ambiguous ones.
///
/// Few unknowns look like a lagging node; many unknowns with nothing known
/// look like an item referencing garbage.
pub fn should_resync(known: usize, unknown: usize, config: &ConsensusConfig) -> bool {
    unknown > 0
        && (unknown <= config.unknown_sub_contracts_to_resync
            || known >= config.known_sub_contracts_to_resync)
}
