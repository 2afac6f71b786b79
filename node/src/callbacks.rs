//! Follower-callback reports gathered from the roster.
//!
//! When an approved item triggers a callback to an external follower, every
//! node that fires it reports the outcome. A callback counts as completed
//! once `positive_consensus` distinct nodes report completion, and as failed
//! once `negative_consensus` nodes report a failure.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use quorum_consensus::ConsensusConfig;
use quorum_messages::{CallbackNotification, CallbackStatus};
use quorum_types::{ItemId, NodeId};

struct CallbackRecord {
    item_id: ItemId,
    reports: HashMap<NodeId, CallbackStatus>,
    signatures: HashMap<NodeId, Vec<u8>>,
    updated: Instant,
}

pub struct CallbackTracker {
    records: Mutex<HashMap<ItemId, CallbackRecord>>,
    max_age: Duration,
}

impl CallbackTracker {
    pub fn new(max_age: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ItemId, CallbackRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store one node's report; a newer report from the same node replaces it.
    pub fn record(&self, report: &CallbackNotification) {
        let mut records = self.records();
        let record = records
            .entry(report.callback_id)
            .or_insert_with(|| CallbackRecord {
                item_id: report.item_id,
                reports: HashMap::new(),
                signatures: HashMap::new(),
                updated: Instant::now(),
            });
        record.reports.insert(report.from, report.status);
        if !report.signature.is_empty() {
            record.signatures.insert(report.from, report.signature.clone());
        }
        record.updated = Instant::now();
    }

    /// Aggregated status of `callback_id`, `None` if nobody reported it.
    pub fn state(&self, callback_id: &ItemId, config: &ConsensusConfig) -> Option<CallbackStatus> {
        let records = self.records();
        let record = records.get(callback_id)?;
        let count = |pred: fn(&CallbackStatus) -> bool| record.reports.values().filter(|s| pred(s)).count();

        if count(|s| *s == CallbackStatus::Completed) >= config.positive_consensus {
            return Some(CallbackStatus::Completed);
        }
        let failed_check = count(|s| *s == CallbackStatus::FailedCheck);
        let failed_env = count(|s| *s == CallbackStatus::FailedEnvironment);
        if failed_check + failed_env >= config.negative_consensus {
            return Some(if failed_check >= failed_env {
                CallbackStatus::FailedCheck
            } else {
                CallbackStatus::FailedEnvironment
            });
        }
        Some(CallbackStatus::Started)
    }

    /// Item the callback was fired for.
    pub fn item_of(&self, callback_id: &ItemId) -> Option<ItemId> {
        self.records().get(callback_id).map(|r| r.item_id)
    }

    /// Signature a node attached to its report.
    pub fn signature(&self, callback_id: &ItemId, node: NodeId) -> Option<Vec<u8>> {
        self.records()
            .get(callback_id)
            .and_then(|r| r.signatures.get(&node).cloned())
    }

    /// Drop callbacks nobody reported on for `max_age`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, r| now.saturating_duration_since(r.updated) < self.max_age);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
