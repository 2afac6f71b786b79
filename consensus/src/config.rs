//! Election thresholds and timings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConsensusError;

/// Tunables shared by every election on a node.
///
/// Durations are stored in milliseconds (seconds for record lifetimes) so the
/// struct maps directly onto the `[consensus]` table of the node config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Distinct positive voters needed to approve.
    pub positive_consensus: usize,
    /// Distinct negative voters needed to decline.
    pub negative_consensus: usize,
    /// Non-terminal resync answers that abort a resync.
    pub resync_break_consensus: usize,
    /// Interval between polls of peers that have not voted yet.
    pub poll_time_ms: u64,
    /// Hard deadline of one election.
    pub max_elections_time_ms: u64,
    /// Deadline of one dependency resync round.
    pub max_resync_time_ms: u64,
    /// Timeout of pulling an item from the peer that announced it.
    pub item_download_timeout_ms: u64,
    /// Resync is tried when at most this many dependencies are unknown...
    pub unknown_sub_contracts_to_resync: usize,
    /// ...or when at least this many dependencies are known.
    pub known_sub_contracts_to_resync: usize,
    /// Quanta one validation may spend; `None` disables the limit.
    pub quantiser_limit: Option<u64>,
    /// Lifetime of a record that has no verdict yet.
    pub pending_record_lifetime_secs: u64,
    /// How long a declined record is kept to answer peers.
    pub declined_item_store_time_secs: u64,
}

impl ConsensusConfig {
    /// Thresholds for a roster of `n` nodes: approval by two thirds, decline
    /// by the remainder plus one, so both can never hold together.
    pub fn for_roster_size(n: usize) -> Self {
        let n = n.max(1);
        let positive = (2 * n).div_ceil(3).max(1);
        let negative = (n - positive + 1).max(1);
        Self {
            positive_consensus: positive,
            negative_consensus: negative,
            resync_break_consensus: negative,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.positive_consensus == 0 {
            return Err(ConsensusError::InvalidConfig(
                "positive_consensus must be at least 1".into(),
            ));
        }
        if self.negative_consensus == 0 {
            return Err(ConsensusError::InvalidConfig(
                "negative_consensus must be at least 1".into(),
            ));
        }
        if self.resync_break_consensus == 0 {
            return Err(ConsensusError::InvalidConfig(
                "resync_break_consensus must be at least 1".into(),
            ));
        }
        if self.poll_time_ms == 0 || self.max_elections_time_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "poll_time_ms and max_elections_time_ms must be positive".into(),
            ));
        }
        if self.poll_time_ms > self.max_elections_time_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "poll_time_ms {} exceeds max_elections_time_ms {}",
                self.poll_time_ms, self.max_elections_time_ms
            )));
        }
        Ok(())
    }

    pub fn poll_time(&self) -> Duration {
        Duration::from_millis(self.poll_time_ms)
    }

    pub fn max_elections_time(&self) -> Duration {
        Duration::from_millis(self.max_elections_time_ms)
    }

    pub fn max_resync_time(&self) -> Duration {
        Duration::from_millis(self.max_resync_time_ms)
    }

    pub fn item_download_timeout(&self) -> Duration {
        Duration::from_millis(self.item_download_timeout_ms)
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            positive_consensus: 1,
            negative_consensus: 1,
            resync_break_consensus: 1,
            poll_time_ms: 200,
            max_elections_time_ms: 15_000,
            max_resync_time_ms: 3_000,
            item_download_timeout_ms: 2_000,
            unknown_sub_contracts_to_resync: 3,
            known_sub_contracts_to_resync: 1,
            quantiser_limit: Some(200),
            pending_record_lifetime_secs: 300,
            declined_item_store_time_secs: 3_600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        ConsensusConfig::default().validate().unwrap();
    }

    #[test]
    fn roster_thresholds() {
        let c = ConsensusConfig::for_roster_size(3);
        assert_eq!((c.positive_consensus, c.negative_consensus), (2, 2));
        let c = ConsensusConfig::for_roster_size(10);
        assert_eq!((c.positive_consensus, c.negative_consensus), (7, 4));
        let c = ConsensusConfig::for_roster_size(1);
        assert_eq!((c.positive_consensus, c.negative_consensus), (1, 1));
        assert_eq!(c.resync_break_consensus, c.negative_consensus);
    }

    #[test]
    fn thresholds_never_both_reachable() {
        for n in 1..50 {
            let c = ConsensusConfig::for_roster_size(n);
            assert!(c.positive_consensus + c.negative_consensus > n);
        }
    }

    #[test]
    fn zero_threshold_rejected() {
        let c = ConsensusConfig {
            positive_consensus: 0,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ConsensusError::InvalidConfig(_))));
    }

    #[test]
    fn poll_longer_than_election_rejected() {
        let c = ConsensusConfig {
            poll_time_ms: 20_000,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
