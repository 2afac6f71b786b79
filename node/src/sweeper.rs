//! The node's single periodic sweep.
//!
//! One task ticks every `sweep_interval` and expires every cache, the name
//! reservations, callback reports and ledger records, and prunes idle
//! entries of both keyed lock tables.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use quorum_types::Timestamp;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::node::NodeShared;

/// What one sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Cache entries, name reservations and callback reports.
    pub cache_entries: usize,
    /// Expired ledger records.
    pub records: usize,
    /// Idle keyed-lock entries.
    pub lock_entries: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.cache_entries + self.records + self.lock_entries
    }
}

pub(crate) fn spawn(shared: &Arc<NodeShared>, period: Duration) -> JoinHandle<()> {
    let weak: Weak<NodeShared> = Arc::downgrade(shared);
    let mut shutdown = shared.shutdown.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    let Some(shared) = weak.upgrade() else { break };
                    let stats = sweep(&shared);
                    if stats.total() > 0 {
                        debug!(?stats, "sweep");
                    }
                }
            }
        }
        debug!("sweeper stopped");
    })
}

pub(crate) fn sweep(shared: &NodeShared) -> SweepStats {
    let now = Instant::now();
    let cache_entries = shared.item_cache.sweep_at(now)
        + shared.parcel_cache.sweep_at(now)
        + shared.aborted.sweep_at(now)
        + shared.env_cache.sweep_at(now)
        + shared.name_cache.sweep_at(now)
        + shared.callbacks.sweep_at(now);

    let records = match shared.ledger.cleanup(Timestamp::now()) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "ledger cleanup failed");
            0
        }
    };

    let lock_entries = shared.item_lock.prune() + shared.parcel_lock.prune();

    SweepStats {
        cache_entries,
        records,
        lock_entries,
    }
}
