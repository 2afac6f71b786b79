//! The quorum node: public API, inbound dispatch and shared state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use quorum_consensus::{
    ConsensusConfig, Item, ItemLock, Parcel, ParcelItemType, ParcelLock, ParcelResult,
};
use quorum_messages::{
    CallbackNotification, CallbackStatus, ItemNotification, Notification, ParcelNotification,
    ResyncNotification,
};
use quorum_network::{BroadcastResult, Broadcaster, Network, NotificationConsumer};
use quorum_store::Ledger;
use quorum_types::{ItemId, ItemResult, ItemState, NodeId, Roster, Timestamp};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::caches::{EnvCache, Environment, ItemCache, ParcelCache, ResultCache};
use crate::callbacks::CallbackTracker;
use crate::config::NodeConfig;
use crate::item_processor::{self, ProcessorEvent, ProcessorHandle, ProcessorStatus};
use crate::metrics::NodeMetrics;
use crate::name_cache::NameCache;
use crate::parcel_processor::{self, lock_result, ParcelIds, ParcelTag, SharedParcelResult};
use crate::shutdown::ShutdownController;
use crate::sweeper::{self, SweepStats};
use crate::tracing_spans::notification_span;
use crate::NodeError;

/// Timeout for waiting on background tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the node handle, its processors and the sweeper.
pub(crate) struct NodeShared {
    pub(crate) local: NodeId,
    pub(crate) roster: Roster,
    consensus: RwLock<Arc<ConsensusConfig>>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) metrics: NodeMetrics,
    pub(crate) item_lock: ItemLock,
    pub(crate) parcel_lock: ParcelLock,
    processors: Mutex<HashMap<ItemId, ProcessorHandle>>,
    parcels: Mutex<HashMap<ItemId, SharedParcelResult>>,
    pub(crate) item_cache: ItemCache,
    pub(crate) parcel_cache: ParcelCache,
    /// Results of elections that ended without a vote (quota exceeded).
    pub(crate) aborted: ResultCache,
    pub(crate) env_cache: EnvCache,
    pub(crate) name_cache: NameCache,
    pub(crate) callbacks: CallbackTracker,
    /// Bumped on every published change; waiters watch it.
    changes: watch::Sender<u64>,
    pub(crate) shutdown: ShutdownController,
    next_generation: AtomicU64,
}

impl NodeShared {
    pub(crate) fn consensus(&self) -> Arc<ConsensusConfig> {
        Arc::clone(&self.consensus.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn processors(&self) -> MutexGuard<'_, HashMap<ItemId, ProcessorHandle>> {
        self.processors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn parcels(&self) -> MutexGuard<'_, HashMap<ItemId, SharedParcelResult>> {
        self.parcels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn notify_changed(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn processor_status(&self, id: &ItemId) -> Option<ProcessorStatus> {
        self.processors().get(id).map(ProcessorHandle::status)
    }

    /// Content from the item cache, falling back to the ledger.
    pub(crate) fn local_item(&self, id: &ItemId) -> Option<Arc<dyn Item>> {
        if let Some(item) = self.item_cache.get(id) {
            return Some(item);
        }
        match self.ledger.get_item(id) {
            Ok(item) => item,
            Err(e) => {
                warn!(item = %id.short(), error = %e, "cannot read item content");
                None
            }
        }
    }

    pub(crate) fn check_item(&self, id: &ItemId) -> Result<ItemResult, NodeError> {
        if let Some(status) = self.processor_status(id) {
            return Ok(status.result);
        }
        Ok(match self.ledger.get_record(id)? {
            Some(record) => record.to_result(self.local_item(id).is_some()),
            None => ItemResult::undefined(),
        })
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        item: Arc<dyn Item>,
        tag: Option<ParcelTag>,
    ) -> Result<ItemResult, NodeError> {
        if self.shutdown.is_triggered() {
            return Err(NodeError::ShuttingDown);
        }
        let id = item.id();
        self.item_cache.put(id, Arc::clone(&item));
        self.ledger.put_item(Arc::clone(&item))?;

        let lifetime = self.consensus().pending_record_lifetime_secs;
        let record = self
            .ledger
            .find_or_create(&id, Timestamp::now().plus_secs(lifetime))?;
        if !record.accepts_election() {
            return Ok(record.to_result(true));
        }
        self.metrics.items_registered.inc();
        debug!(item = %id.short(), "item registered");
        let status = item_processor::start(self, id, Some(item), None, tag, record.to_result(true));
        Ok(status.result)
    }

    pub(crate) async fn wait_item(
        &self,
        id: &ItemId,
        timeout: Duration,
    ) -> Result<ItemResult, NodeError> {
        let deadline = Instant::now() + timeout;
        // Subscribe before checking so no change slips between the two.
        let mut changes = self.changes.subscribe();
        loop {
            let result = self.check_item(id)?;
            if result.state.is_consensus_found() {
                return Ok(result);
            }
            if let Some(aborted) = self.aborted.get(id) {
                return Ok(aborted);
            }
            if self.shutdown.is_triggered() {
                return Err(NodeError::ShuttingDown);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(NodeError::ShuttingDown),
                Err(_) => {
                    return Err(NodeError::Timeout {
                        id: *id,
                        waited: timeout,
                    })
                }
            }
        }
    }

    pub(crate) fn check_parcel(&self, id: &ItemId) -> Option<ParcelResult> {
        if let Some(running) = self.parcels().get(id) {
            return Some(lock_result(running).clone());
        }
        self.parcel_cache.get(id)
    }

    // ── Inbound ────────────────────────────────────────────────────────

    fn handle_notification(self: &Arc<Self>, notification: Notification) -> Result<(), NodeError> {
        let from = notification.from();
        let span = notification_span(self.local, from, notification.type_name());
        let _entered = span.enter();

        if from == self.local || !self.roster.contains(from) {
            self.metrics.notifications_dropped.inc();
            debug!("notification from outside the roster dropped");
            return Ok(());
        }
        match notification {
            Notification::Item(n) => self.notify(n.from, n.item_id, n.result, n.answer_requested),
            Notification::Resync(n) => self.on_resync(n),
            Notification::Parcel(n) => self.on_parcel(n),
            Notification::Callback(n) => {
                trace!(callback = %n.callback_id.short(), status = ?n.status, "callback report");
                self.callbacks.record(&n);
                self.notify_changed();
                Ok(())
            }
        }
    }

    fn notify(
        self: &Arc<Self>,
        from: NodeId,
        id: ItemId,
        result: ItemResult,
        answer_requested: bool,
    ) -> Result<(), NodeError> {
        if from == self.local || !self.roster.contains(from) {
            self.metrics.notifications_dropped.inc();
            return Ok(());
        }
        self.metrics.votes_received.inc();
        self.route_vote(from, id, result, None)?;

        if answer_requested {
            let answer = Notification::Item(ItemNotification {
                from: self.local,
                item_id: id,
                result: self.check_item(&id)?,
                answer_requested: false,
            });
            self.send(from, answer);
        }
        Ok(())
    }

    /// Hand a vote to the item's processor, starting one if the item is not
    /// final here yet.
    fn route_vote(
        self: &Arc<Self>,
        from: NodeId,
        id: ItemId,
        result: ItemResult,
        tag: Option<ParcelTag>,
    ) -> Result<(), NodeError> {
        {
            let processors = self.processors();
            if let Some(handle) = processors.get(&id) {
                handle.send(ProcessorEvent::Vote { from, result });
                return Ok(());
            }
        }
        if result.state == ItemState::Undefined || self.shutdown.is_triggered() {
            return Ok(());
        }

        let initial = match self.ledger.get_record(&id)? {
            Some(record) if !record.accepts_election() => {
                trace!(item = %id.short(), state = %record.state, "vote for a settled record");
                return Ok(());
            }
            Some(record) => record.to_result(false),
            None => ItemResult::undefined().with_state(ItemState::Pending),
        };
        debug!(item = %id.short(), peer = %from, "election started by peer vote");
        let item = self.local_item(&id);
        item_processor::start(self, id, item, Some(from), tag, initial);

        if let Some(handle) = self.processors().get(&id) {
            handle.send(ProcessorEvent::Vote { from, result });
        }
        Ok(())
    }

    fn on_resync(&self, n: ResyncNotification) -> Result<(), NodeError> {
        if !n.answer_requested {
            if let Some(handle) = self.processors().get(&n.item_id) {
                handle.send(ProcessorEvent::ResyncAnswer {
                    from: n.from,
                    states: n.states,
                });
            }
            return Ok(());
        }

        let mut states = BTreeMap::new();
        for id in n.states.keys() {
            let state = self
                .ledger
                .get_record(id)?
                .map_or(ItemState::Undefined, |r| r.state);
            states.insert(*id, state);
        }
        let answer = Notification::Resync(ResyncNotification {
            from: self.local,
            item_id: n.item_id,
            states,
            answer_requested: false,
        });
        self.send(n.from, answer);
        Ok(())
    }

    fn on_parcel(self: &Arc<Self>, n: ParcelNotification) -> Result<(), NodeError> {
        let ids = ParcelIds {
            parcel_id: n.parcel_id,
            payment_id: n.payment_id,
            payload_id: n.payload_id,
        };
        if self.check_parcel(&ids.parcel_id).is_none() {
            if !ids.is_consistent() {
                self.metrics.notifications_dropped.inc();
                warn!(parcel = %ids.parcel_id.short(), "parcel id does not match its items");
                return Ok(());
            }
            debug!(parcel = %ids.parcel_id.short(), peer = %n.from, "parcel learned from peer");
            parcel_processor::start(self, ids, None, Some(n.from));
        }

        self.metrics.votes_received.inc();
        let item_id = n.item_id();
        let route = match n.item_type {
            ParcelItemType::Payment => true,
            // The payload is only voted on once the payment is approved here.
            ParcelItemType::Payload => {
                self.processors().contains_key(&ids.payload_id)
                    || self
                        .ledger
                        .get_record(&ids.payment_id)?
                        .is_some_and(|r| r.state == ItemState::Approved)
            }
        };
        let tag = ParcelTag::from_notification(&n);
        if route {
            self.route_vote(n.from, item_id, n.result.clone(), Some(tag))?;
        }
        if n.answer_requested {
            let answer = tag.notification(self.local, self.check_item(&item_id)?, false);
            self.send(n.from, answer);
        }
        Ok(())
    }

    fn send(&self, to: NodeId, notification: Notification) {
        if let Err(e) = self.network.deliver(to, notification) {
            trace!(peer = %to, error = %e, "answer not delivered");
        }
    }
}

/// Inbound side registered with the network. Holds the node weakly so a
/// dropped node is not kept alive by its transport.
struct Inbox {
    shared: Weak<NodeShared>,
}

impl NotificationConsumer for Inbox {
    fn on_notification(&self, notification: Notification) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.shutdown.is_triggered() {
            return;
        }
        let kind = notification.type_name();
        if let Err(e) = shared.handle_notification(notification) {
            warn!(kind, error = %e, "notification handling failed");
        }
    }

    fn serve_item(&self, id: &ItemId) -> Option<Arc<dyn Item>> {
        self.shared.upgrade()?.local_item(id)
    }
}

/// A running quorum node.
///
/// Dropping the node triggers shutdown; running elections stop at their next
/// wake-up.
pub struct Node {
    shared: Arc<NodeShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Validate `config`, subscribe to `network` and start the sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        config: NodeConfig,
        ledger: Arc<dyn Ledger>,
        network: Arc<dyn Network>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let metrics = NodeMetrics::new()?;
        let (changes, _) = watch::channel(0);
        let item_age = Duration::from_secs(config.item_cache_max_age_secs);

        let shared = Arc::new(NodeShared {
            local: config.local_id,
            roster: config.roster.clone(),
            consensus: RwLock::new(Arc::new(config.consensus.clone())),
            broadcaster: Broadcaster::new(Arc::clone(&network), config.local_id),
            ledger,
            network: Arc::clone(&network),
            metrics,
            item_lock: ItemLock::new(),
            parcel_lock: ParcelLock::new(),
            processors: Mutex::new(HashMap::new()),
            parcels: Mutex::new(HashMap::new()),
            item_cache: ItemCache::new(item_age),
            parcel_cache: ParcelCache::new(Duration::from_secs(config.parcel_cache_max_age_secs)),
            aborted: ResultCache::new(item_age),
            env_cache: EnvCache::new(Duration::from_secs(config.env_cache_max_age_secs)),
            name_cache: NameCache::new(Duration::from_secs(config.name_cache_max_age_secs)),
            callbacks: CallbackTracker::new(item_age),
            changes,
            shutdown: ShutdownController::new(),
            next_generation: AtomicU64::new(0),
        });

        network.subscribe(
            config.local_id,
            Arc::new(Inbox {
                shared: Arc::downgrade(&shared),
            }),
        );
        let sweeper = sweeper::spawn(&shared, config.sweep_interval());

        info!(
            node = %config.local_id,
            roster = config.roster.len(),
            positive = config.consensus.positive_consensus,
            negative = config.consensus.negative_consensus,
            "quorum node started"
        );
        Ok(Self {
            shared,
            tasks: Mutex::new(vec![sweeper]),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.shared.local
    }

    pub fn roster(&self) -> &Roster {
        &self.shared.roster
    }

    // ── Items ──────────────────────────────────────────────────────────

    /// Start (or join) the election of `item` and return its current result
    /// without waiting. Registering an item again is harmless.
    pub fn register_item(&self, item: Arc<dyn Item>) -> Result<ItemResult, NodeError> {
        self.shared.register(item, None)
    }

    /// Wait until `id` is final here. The election keeps running after a
    /// timeout.
    pub async fn wait_item(&self, id: &ItemId, timeout: Duration) -> Result<ItemResult, NodeError> {
        self.shared.wait_item(id, timeout).await
    }

    /// Current local result. Never starts an election.
    pub fn check_item(&self, id: &ItemId) -> Result<ItemResult, NodeError> {
        self.shared.check_item(id)
    }

    /// Accept a vote from `from` as if it had arrived over the network.
    pub fn notify(
        &self,
        from: NodeId,
        id: ItemId,
        result: ItemResult,
        answer_requested: bool,
    ) -> Result<(), NodeError> {
        self.shared.notify(from, id, result, answer_requested)
    }

    pub fn get_item(&self, id: &ItemId) -> Option<Arc<dyn Item>> {
        self.shared.local_item(id)
    }

    /// Phase and result of a running election.
    pub fn processor_status(&self, id: &ItemId) -> Option<ProcessorStatus> {
        self.shared.processor_status(id)
    }

    pub fn active_elections(&self) -> usize {
        self.shared.processors().len()
    }

    // ── Parcels ────────────────────────────────────────────────────────

    pub fn register_parcel(&self, parcel: Parcel) -> Result<ParcelResult, NodeError> {
        if self.shared.shutdown.is_triggered() {
            return Err(NodeError::ShuttingDown);
        }
        let ids = ParcelIds::of(&parcel);
        if let Some(known) = self.shared.parcel_cache.get(&ids.parcel_id) {
            return Ok(known);
        }
        // Peers that learn the parcel pull both halves from us right away.
        for item in [&parcel.payment, &parcel.payload] {
            self.shared.item_cache.put(item.id(), Arc::clone(item));
            self.shared.ledger.put_item(Arc::clone(item))?;
        }
        Ok(parcel_processor::start(&self.shared, ids, Some(parcel), None))
    }

    pub async fn wait_parcel(
        &self,
        id: &ItemId,
        timeout: Duration,
    ) -> Result<ParcelResult, NodeError> {
        let deadline = Instant::now() + timeout;
        let mut changes = self.shared.changes.subscribe();
        loop {
            let result = self
                .shared
                .check_parcel(id)
                .ok_or(NodeError::UnknownParcel(*id))?;
            if result.state.is_processing_finished() {
                return Ok(result);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(NodeError::ShuttingDown),
                Err(_) => {
                    return Err(NodeError::Timeout {
                        id: *id,
                        waited: timeout,
                    })
                }
            }
        }
    }

    pub fn check_parcel(&self, id: &ItemId) -> Option<ParcelResult> {
        self.shared.check_parcel(id)
    }

    // ── Notifications and callbacks ────────────────────────────────────

    /// Dispatch an inbound notification by variant.
    pub fn handle_notification(&self, notification: Notification) -> Result<(), NodeError> {
        self.shared.handle_notification(notification)
    }

    /// Record the local outcome of a follower callback and tell the roster.
    pub fn report_callback(
        &self,
        item_id: ItemId,
        callback_id: ItemId,
        status: CallbackStatus,
        signature: Vec<u8>,
    ) -> BroadcastResult {
        let report = CallbackNotification {
            from: self.shared.local,
            item_id,
            callback_id,
            status,
            signature,
        };
        self.shared.callbacks.record(&report);
        self.shared.notify_changed();
        self.shared
            .broadcaster
            .broadcast_to_all(&self.shared.roster, &Notification::Callback(report))
    }

    /// Roster-wide status of a callback, `None` if nobody reported it.
    pub fn callback_state(&self, callback_id: &ItemId) -> Option<CallbackStatus> {
        self.shared
            .callbacks
            .state(callback_id, &self.shared.consensus())
    }

    // ── Environments, names ────────────────────────────────────────────

    pub fn set_environment(&self, environment: Environment) {
        self.shared.env_cache.put(environment.item_id, environment);
    }

    pub fn environment(&self, item_id: &ItemId) -> Option<Environment> {
        self.shared.env_cache.get(item_id)
    }

    pub fn name_cache(&self) -> &NameCache {
        &self.shared.name_cache
    }

    // ── Operations ─────────────────────────────────────────────────────

    /// Replace the consensus config. Running elections keep the config
    /// they started with.
    pub fn update_config(&self, config: ConsensusConfig) -> Result<(), NodeError> {
        config.validate()?;
        let n = self.shared.roster.len();
        if config.positive_consensus > n || config.negative_consensus > n {
            return Err(NodeError::Config(format!(
                "thresholds {}/{} cannot be met by a roster of {n}",
                config.positive_consensus, config.negative_consensus
            )));
        }
        info!(
            positive = config.positive_consensus,
            negative = config.negative_consensus,
            "consensus config updated"
        );
        *self
            .shared
            .consensus
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        Ok(())
    }

    pub fn consensus_config(&self) -> Arc<ConsensusConfig> {
        self.shared.consensus()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.shared.metrics
    }

    /// Entries in the item lock table (held or awaited ids).
    pub fn item_lock_size(&self) -> usize {
        self.shared.item_lock.size()
    }

    /// Run one sweep now instead of waiting for the sweeper.
    pub fn sweep(&self) -> SweepStats {
        sweeper::sweep(&self.shared)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_triggered()
    }

    /// Stop the sweeper and every running processor.
    pub async fn shutdown(&self) {
        self.shared.shutdown.shutdown();
        self.shared.notify_changed();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        info!(node = %self.shared.local, "quorum node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shared.shutdown.shutdown();
    }
}
