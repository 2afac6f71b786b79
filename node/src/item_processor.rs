//! One election: validate an item, vote, collect peer votes, commit.
//!
//! A processor is a tokio task holding the item's keyed lock from start to
//! finish. Everything it hears from outside arrives on its event channel;
//! everything it publishes goes through [`ProcessorStatus`] and the node's
//! change channel. An election always ends by itself, at quorum or at
//! `max_elections_time`; callers waiting on it never cancel it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use quorum_consensus::{
    should_resync, ConsensusConfig, ConsensusError, Election, Item, ProcessorState, Quantiser,
    ResyncProgress, ResyncSet,
};
use quorum_messages::{ItemNotification, Notification, ResyncNotification};
use quorum_store::{LedgerTxn, StateRecord, StoreError};
use quorum_types::{ErrorCode, ItemError, ItemId, ItemResult, ItemState, NodeId, Timestamp};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant as Deadline, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::node::NodeShared;
use crate::parcel_processor::ParcelTag;
use crate::tracing_spans::{election_span, resync_span};
use crate::NodeError;

/// What a running election currently reports about its item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorStatus {
    pub phase: ProcessorState,
    pub result: ItemResult,
}

/// Input to a running processor.
#[derive(Debug)]
pub(crate) enum ProcessorEvent {
    Vote { from: NodeId, result: ItemResult },
    ResyncAnswer {
        from: NodeId,
        states: BTreeMap<ItemId, ItemState>,
    },
    /// The item's content, for a processor started from a peer vote.
    Content(Arc<dyn Item>),
}

/// The node's handle on a running processor.
pub(crate) struct ProcessorHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<ProcessorEvent>,
    status: Arc<Mutex<ProcessorStatus>>,
}

impl ProcessorHandle {
    /// False once the processor stopped reading.
    pub(crate) fn send(&self, event: ProcessorEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub(crate) fn status(&self) -> ProcessorStatus {
        lock_status(&self.status).clone()
    }
}

fn lock_status(status: &Mutex<ProcessorStatus>) -> MutexGuard<'_, ProcessorStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start a processor for `item_id` unless one is running.
///
/// An already running processor receives `item` as content. Returns the
/// status of whichever processor now owns the id.
pub(crate) fn start(
    shared: &Arc<NodeShared>,
    item_id: ItemId,
    item: Option<Arc<dyn Item>>,
    origin: Option<NodeId>,
    tag: Option<ParcelTag>,
    initial: ItemResult,
) -> ProcessorStatus {
    let mut processors = shared.processors();
    if let Some(handle) = processors.get(&item_id) {
        if let Some(item) = item {
            handle.send(ProcessorEvent::Content(item));
        }
        return handle.status();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let status = ProcessorStatus {
        phase: ProcessorState::Init,
        result: initial,
    };
    let shared_status = Arc::new(Mutex::new(status.clone()));
    let generation = shared.next_generation();
    shared.aborted.remove(&item_id);
    processors.insert(
        item_id,
        ProcessorHandle {
            generation,
            tx,
            status: Arc::clone(&shared_status),
        },
    );
    drop(processors);

    let processor = ItemProcessor::new(
        Arc::clone(shared),
        item_id,
        item,
        origin,
        tag,
        generation,
        rx,
        shared_status,
    );
    tokio::spawn(processor.run());
    status
}

/// Local opinion after validation.
enum Verdict {
    Positive,
    Negative(Vec<ItemError>),
    /// Quota exceeded: no opinion at all.
    Inconclusive(Vec<ItemError>),
    /// Some dependencies are ambiguous locally.
    Unknown { ids: Vec<ItemId>, known: usize },
}

enum Outcome {
    Decided(ItemState),
    Expired,
    /// Late content ran out of work quota.
    Aborted,
}

enum Wake {
    Shutdown,
    Deadline,
    Tick,
    Event(Option<ProcessorEvent>),
}

struct ItemProcessor {
    shared: Arc<NodeShared>,
    config: Arc<ConsensusConfig>,
    item_id: ItemId,
    item: Option<Arc<dyn Item>>,
    /// Peer whose vote started this processor; the item is pulled from it.
    origin: Option<NodeId>,
    tag: Option<ParcelTag>,
    generation: u64,
    rx: mpsc::UnboundedReceiver<ProcessorEvent>,
    shutdown: broadcast::Receiver<()>,
    status: Arc<Mutex<ProcessorStatus>>,
    election: Election,
    record: StateRecord,
    errors: Vec<ItemError>,
    /// Revoke locks and creation placeholders are held by this item.
    locks_held: bool,
    peer_expires: Option<Timestamp>,
    started: Instant,
    deadline: Deadline,
}

impl ItemProcessor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        shared: Arc<NodeShared>,
        item_id: ItemId,
        item: Option<Arc<dyn Item>>,
        origin: Option<NodeId>,
        tag: Option<ParcelTag>,
        generation: u64,
        rx: mpsc::UnboundedReceiver<ProcessorEvent>,
        status: Arc<Mutex<ProcessorStatus>>,
    ) -> Self {
        let config = shared.consensus();
        let election = Election::new(
            item_id,
            shared.roster.clone(),
            config.positive_consensus,
            config.negative_consensus,
        );
        let now = Timestamp::now();
        let record = StateRecord::pending(
            item_id,
            now,
            now.plus_secs(config.pending_record_lifetime_secs),
        );
        let deadline = Deadline::now() + config.max_elections_time();
        let shutdown = shared.shutdown.subscribe();
        Self {
            shared,
            config,
            item_id,
            item,
            origin,
            tag,
            generation,
            rx,
            shutdown,
            status,
            election,
            record,
            errors: Vec::new(),
            locks_held: false,
            peer_expires: None,
            started: Instant::now(),
            deadline,
        }
    }

    async fn run(mut self) {
        let span = election_span(self.shared.local, &self.item_id);
        async move {
            let _guard = self.shared.item_lock.lock(self.item_id).await;
            self.shared.metrics.elections_started.inc();
            self.shared.metrics.active_elections.inc();

            if self.shared.shutdown.is_triggered() {
                self.abandon();
            } else {
                match self.drive().await {
                    Ok(()) => {}
                    Err(NodeError::ShuttingDown) => {
                        debug!("election abandoned on shutdown");
                        self.abandon();
                    }
                    Err(e) => {
                        warn!(error = %e, "election failed");
                        self.abandon();
                    }
                }
            }

            self.finish();
            self.shared.metrics.active_elections.dec();
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> Result<(), NodeError> {
        let lifetime = self.config.pending_record_lifetime_secs;
        self.record = self
            .shared
            .ledger
            .find_or_create(&self.item_id, Timestamp::now().plus_secs(lifetime))?;
        if !self.record.accepts_election() {
            debug!(state = %self.record.state, locked_by = ?self.record.locked_by, "record settled or held; no election");
            self.publish(ProcessorState::Done);
            return Ok(());
        }

        if self.item.is_none() {
            self.item = self.shared.local_item(&self.item_id);
        }
        if self.item.is_none() {
            if let Some(origin) = self.origin {
                self.download(origin).await;
            }
        }

        if !self.form_opinion().await? {
            return self.abort_undefined();
        }

        match self.poll().await? {
            Outcome::Decided(verdict) => self.commit(verdict).await,
            Outcome::Expired => self.expire(),
            Outcome::Aborted => self.abort_undefined(),
        }
    }

    async fn download(&mut self, origin: NodeId) {
        self.publish(ProcessorState::Downloading);
        let timeout = self.config.item_download_timeout();
        match self
            .shared
            .network
            .get_item(self.item_id, origin, timeout)
            .await
        {
            Ok(item) if item.id() == self.item_id => {
                self.shared.item_cache.put(self.item_id, Arc::clone(&item));
                if let Err(e) = self.shared.ledger.put_item(Arc::clone(&item)) {
                    warn!(error = %e, "cannot store downloaded item");
                }
                debug!(%origin, "item downloaded");
                self.item = Some(item);
            }
            Ok(item) => warn!(%origin, got = %item.id().short(), "peer served another item"),
            Err(e) => debug!(%origin, error = %e, "item download failed"),
        }
    }

    // ── Validation ─────────────────────────────────────────────────────

    /// Validate (resyncing if needed), take dependency locks and cast the
    /// local vote. Without content there is nothing to validate.
    ///
    /// False when validation ran out of quota: the election cannot go on.
    async fn form_opinion(&mut self) -> Result<bool, NodeError> {
        let Some(item) = self.item.clone() else {
            return Ok(true);
        };
        self.publish(ProcessorState::Validating);

        let verdict = match self.validate(&item)? {
            Verdict::Unknown { ids, known } if should_resync(known, ids.len(), &self.config) => {
                match self.resync(ids).await? {
                    ResyncProgress::Complete => self.validate(&item)?,
                    _ => resync_failed(&self.item_id),
                }
            }
            Verdict::Unknown { .. } => resync_failed(&self.item_id),
            other => other,
        };
        let verdict = match verdict {
            Verdict::Positive => self.take_locks(&item)?,
            other => other,
        };

        let state = match verdict {
            Verdict::Positive => ItemState::PendingPositive,
            Verdict::Negative(errors) => {
                self.errors = errors;
                ItemState::PendingNegative
            }
            Verdict::Unknown { .. } => {
                self.errors = vec![ItemError::new(
                    ErrorCode::ResyncFailed,
                    self.item_id.short(),
                    "dependencies still ambiguous after resync",
                )];
                ItemState::PendingNegative
            }
            Verdict::Inconclusive(errors) => {
                self.errors = errors;
                return Ok(false);
            }
        };
        self.cast(state)?;
        Ok(true)
    }

    fn validate(&self, item: &Arc<dyn Item>) -> Result<Verdict, NodeError> {
        let object = self.item_id.short();
        if item.expires_at().is_past(Timestamp::now()) {
            return Ok(Verdict::Negative(vec![ItemError::new(
                ErrorCode::Expired,
                object,
                "item expired",
            )]));
        }

        let mut quantiser = Quantiser::new(self.config.quantiser_limit);
        match item.check(&mut quantiser) {
            Ok(true) => {}
            Ok(false) => {
                let mut errors = item.errors();
                if errors.is_empty() {
                    errors.push(ItemError::new(ErrorCode::FailedCheck, object, "check failed"));
                }
                return Ok(Verdict::Negative(errors));
            }
            Err(e @ ConsensusError::QuantiserExceeded { .. }) => {
                self.shared.metrics.quantiser_exceeded.inc();
                info!(error = %e, "validation aborted");
                return Ok(Verdict::Inconclusive(vec![ItemError::new(
                    ErrorCode::QuantiserExceeded,
                    object,
                    e.to_string(),
                )]));
            }
            Err(e) => {
                return Ok(Verdict::Negative(vec![ItemError::new(
                    ErrorCode::FailedCheck,
                    object,
                    e.to_string(),
                )]));
            }
        }

        self.check_dependencies(item)
    }

    fn check_dependencies(&self, item: &Arc<dyn Item>) -> Result<Verdict, NodeError> {
        let ledger = &self.shared.ledger;
        let mut errors = Vec::new();
        let mut unknown = Vec::new();
        let mut known = 0;

        for id in item.referenced_items() {
            match ledger.get_record(&id)? {
                Some(r) if r.state.is_approved() => known += 1,
                Some(r) if !r.state.is_ambiguous() => errors.push(ItemError::new(
                    ErrorCode::BadReference,
                    id.short(),
                    format!("referenced item is {}", r.state),
                )),
                _ => unknown.push(id),
            }
        }

        for id in item.revoking_items() {
            match ledger.get_record(&id)? {
                Some(r) if r.state == ItemState::Approved => known += 1,
                Some(r) if r.state == ItemState::Locked && r.is_locked_by(&self.item_id) => {
                    known += 1
                }
                Some(r) if r.state == ItemState::Locked => errors.push(ItemError::new(
                    ErrorCode::BadRevoke,
                    id.short(),
                    "locked by another item",
                )),
                Some(r) if !r.state.is_ambiguous() => errors.push(ItemError::new(
                    ErrorCode::BadRevoke,
                    id.short(),
                    format!("cannot revoke a {} item", r.state),
                )),
                _ => unknown.push(id),
            }
        }

        for id in item.new_items() {
            if let Some(r) = ledger.get_record(&id)? {
                let own = r.state == ItemState::LockedForCreation && r.is_locked_by(&self.item_id);
                if !own {
                    errors.push(ItemError::new(
                        ErrorCode::NewItemExists,
                        id.short(),
                        format!("already exists as {}", r.state),
                    ));
                }
            }
        }

        Ok(if !errors.is_empty() {
            Verdict::Negative(errors)
        } else if !unknown.is_empty() {
            Verdict::Unknown { ids: unknown, known }
        } else {
            Verdict::Positive
        })
    }

    /// Lock every revoked item and reserve every created one. All or none.
    fn take_locks(&mut self, item: &Arc<dyn Item>) -> Result<Verdict, NodeError> {
        let ledger = Arc::clone(&self.shared.ledger);
        self.locks_held = true;

        for id in item.revoking_items() {
            if ledger.lock_to_revoke(&self.item_id, &id)?.is_none() {
                self.release_locks(item)?;
                return Ok(Verdict::Negative(vec![ItemError::new(
                    ErrorCode::BadRevoke,
                    id.short(),
                    "revoke lock refused",
                )]));
            }
        }
        let expires = item.expires_at();
        for id in item.new_items() {
            if ledger
                .create_output_lock_record(&self.item_id, &id, expires)?
                .is_none()
            {
                self.release_locks(item)?;
                return Ok(Verdict::Negative(vec![ItemError::new(
                    ErrorCode::NewItemExists,
                    id.short(),
                    "creation lock refused",
                )]));
            }
        }
        Ok(Verdict::Positive)
    }

    /// Give back revoke locks and drop placeholders owned by this item.
    fn release_locks(&mut self, item: &Arc<dyn Item>) -> Result<(), NodeError> {
        let ledger = &self.shared.ledger;
        for id in item.revoking_items() {
            ledger.unlock(&self.item_id, &id)?;
        }
        for id in item.new_items() {
            if let Some(r) = ledger.get_record(&id)? {
                if r.state == ItemState::LockedForCreation && r.is_locked_by(&self.item_id) {
                    ledger.destroy(&id)?;
                }
            }
        }
        self.locks_held = false;
        Ok(())
    }

    fn cast(&mut self, state: ItemState) -> Result<(), NodeError> {
        self.record.state = state;
        self.save_own()?;
        self.election.vote(self.shared.local, state);
        debug!(%state, errors = self.errors.len(), "local opinion formed");
        Ok(())
    }

    /// Write the item's own record unless it became final or another
    /// item's election holds it in the meantime. False if left alone.
    fn save_own(&mut self) -> Result<bool, NodeError> {
        let mine = self.record.clone();
        let mut held: Option<StateRecord> = None;
        let saved = self.shared.ledger.transaction(&mut |txn: &mut dyn LedgerTxn| {
            held = None;
            if let Some(current) = txn.get(&mine.id) {
                if current.state.is_consensus_found() || current.locked_by.is_some() {
                    held = Some(current);
                    return Err(StoreError::Rollback);
                }
            }
            txn.put(mine.clone());
            Ok(())
        })?;
        if let Some(current) = held {
            warn!(state = %current.state, locked_by = ?current.locked_by, "own record taken over; not overwritten");
            self.record = current;
        }
        Ok(saved)
    }

    // ── Resync ─────────────────────────────────────────────────────────

    async fn resync(&mut self, ids: Vec<ItemId>) -> Result<ResyncProgress, NodeError> {
        let span = resync_span(&self.item_id, ids.len());
        self.resync_round(ids).instrument(span).await
    }

    async fn resync_round(&mut self, ids: Vec<ItemId>) -> Result<ResyncProgress, NodeError> {
        self.publish(ProcessorState::Resyncing);
        self.shared.metrics.resyncs_started.inc();

        let peers = self.shared.roster.peers_of(self.shared.local);
        if peers.is_empty() {
            self.shared.metrics.resyncs_broken.inc();
            info!("no peers to resync with");
            return Ok(ResyncProgress::Broken);
        }

        let mut states = BTreeMap::new();
        for id in &ids {
            let state = self
                .shared
                .ledger
                .get_record(id)?
                .map_or(ItemState::Undefined, |r| r.state);
            states.insert(*id, state);
        }
        let query = Notification::Resync(ResyncNotification {
            from: self.shared.local,
            item_id: self.item_id,
            states,
            answer_requested: true,
        });
        let sent = self.shared.broadcaster.broadcast_to(peers, &query);
        debug!(sent = sent.sent, failed = sent.failed, "resync query sent");

        let mut set = ResyncSet::new(&ids, &self.config);
        let window = (Deadline::now() + self.config.max_resync_time()).min(self.deadline);
        let progress = loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.recv() => Wake::Shutdown,
                _ = time::sleep_until(window) => Wake::Deadline,
                event = self.rx.recv() => Wake::Event(event),
            };
            match wake {
                Wake::Shutdown | Wake::Event(None) => return Err(NodeError::ShuttingDown),
                Wake::Deadline => break ResyncProgress::Broken,
                Wake::Tick => {}
                Wake::Event(Some(ProcessorEvent::ResyncAnswer { from, states })) => {
                    set.answer(from, &states);
                    match set.progress() {
                        ResyncProgress::Pending => {}
                        done => break done,
                    }
                }
                Wake::Event(Some(ProcessorEvent::Vote { from, result })) => {
                    self.on_vote(from, &result)
                }
                Wake::Event(Some(ProcessorEvent::Content(_))) => {}
            }
        };

        match progress {
            ResyncProgress::Complete => {
                self.adopt(&set)?;
                info!(deps = ids.len(), "resync complete");
            }
            _ => {
                self.shared.metrics.resyncs_broken.inc();
                info!(deps = ids.len(), "resync inconclusive");
            }
        }
        Ok(progress)
    }

    /// Write resolved dependency states into the ledger. Final records,
    /// locked records and items with a running election are left alone.
    fn adopt(&self, set: &ResyncSet) -> Result<(), NodeError> {
        let now = Timestamp::now();
        let keep_until = now.plus_secs(self.config.declined_item_store_time_secs);
        for (id, state) in set.resolved() {
            if self.shared.item_lock.is_locked(&id) {
                continue;
            }
            let record = match self.shared.ledger.get_record(&id)? {
                Some(r) if r.state.is_consensus_found() || r.locked_by.is_some() => continue,
                Some(mut r) => {
                    r.state = state;
                    r.expires_at = r.expires_at.max(keep_until);
                    r
                }
                None => StateRecord {
                    id,
                    state,
                    created_at: now,
                    expires_at: keep_until,
                    locked_by: None,
                },
            };
            self.shared.ledger.save(&record)?;
            debug!(dep = %id.short(), %state, "adopted resynced state");
        }
        Ok(())
    }

    // ── Polling ────────────────────────────────────────────────────────

    async fn poll(&mut self) -> Result<Outcome, NodeError> {
        self.publish(ProcessorState::Polling);
        self.broadcast_vote(true);
        if let Some(verdict) = self.decide() {
            return Ok(Outcome::Decided(verdict));
        }

        let period = self.config.poll_time();
        let mut ticker = time::interval_at(Deadline::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.recv() => Wake::Shutdown,
                _ = time::sleep_until(self.deadline) => Wake::Deadline,
                event = self.rx.recv() => Wake::Event(event),
                _ = ticker.tick() => Wake::Tick,
            };
            match wake {
                Wake::Shutdown | Wake::Event(None) => return Err(NodeError::ShuttingDown),
                Wake::Deadline => return Ok(Outcome::Expired),
                Wake::Tick => self.ask_missing(),
                Wake::Event(Some(ProcessorEvent::Vote { from, result })) => {
                    self.on_vote(from, &result)
                }
                Wake::Event(Some(ProcessorEvent::ResyncAnswer { .. })) => {}
                Wake::Event(Some(ProcessorEvent::Content(item))) => {
                    if self.item.is_none() && item.id() == self.item_id {
                        self.item = Some(item);
                        if !self.form_opinion().await? {
                            return Ok(Outcome::Aborted);
                        }
                        self.publish(ProcessorState::Polling);
                        self.broadcast_vote(true);
                    }
                }
            }
            if let Some(verdict) = self.decide() {
                return Ok(Outcome::Decided(verdict));
            }
        }
    }

    fn on_vote(&mut self, from: NodeId, result: &ItemResult) {
        if from == self.shared.local {
            return;
        }
        if result.state.is_positive() && result.expires_at > Timestamp::EPOCH {
            self.peer_expires = Some(result.expires_at);
        }
        let outcome = self.election.vote(from, result.state);
        trace!(peer = %from, state = %result.state, ?outcome, "vote");
    }

    fn decide(&mut self) -> Option<ItemState> {
        let verdict = self.election.try_decide()?;
        info!(
            %verdict,
            positive = self.election.positive_count(),
            negative = self.election.negative_count(),
            "quorum reached"
        );
        self.publish(ProcessorState::Deciding);
        Some(verdict)
    }

    /// Re-ask peers that have not given a decisive vote yet.
    fn ask_missing(&self) {
        let missing: Vec<NodeId> = self
            .shared
            .roster
            .peers_of(self.shared.local)
            .into_iter()
            .filter(|peer| {
                self.election
                    .vote_of(*peer)
                    .map_or(true, |v| !v.is_positive() && !v.is_negative())
            })
            .collect();
        if missing.is_empty() {
            return;
        }
        let ask = self.vote_notification(true);
        let sent = self.shared.broadcaster.broadcast_to(missing, &ask);
        trace!(sent = sent.sent, "re-polled peers");
    }

    fn vote_notification(&self, answer_requested: bool) -> Notification {
        let result = self.current_result();
        match &self.tag {
            Some(tag) => tag.notification(self.shared.local, result, answer_requested),
            None => Notification::Item(ItemNotification {
                from: self.shared.local,
                item_id: self.item_id,
                result,
                answer_requested,
            }),
        }
    }

    fn broadcast_vote(&self, answer_requested: bool) {
        let vote = self.vote_notification(answer_requested);
        self.shared
            .broadcaster
            .broadcast_to_all(&self.shared.roster, &vote);
    }

    // ── Endings ────────────────────────────────────────────────────────

    async fn commit(&mut self, verdict: ItemState) -> Result<(), NodeError> {
        self.publish(ProcessorState::Committing);

        let (revoking, new_items, item_expires) = match &self.item {
            Some(item) => (
                item.revoking_items(),
                item.new_items(),
                Some(item.expires_at()),
            ),
            None => {
                warn!("committing without content; dependencies untouched");
                (Vec::new(), Vec::new(), None)
            }
        };

        // Sorted so two commits sharing dependencies lock them in one order.
        let mut deps: Vec<ItemId> = revoking
            .iter()
            .chain(&new_items)
            .copied()
            .filter(|d| *d != self.item_id)
            .collect();
        deps.sort();
        deps.dedup();
        // A dependency's own election may be waiting for this item; the
        // timeout breaks that cycle and leaves the verdict provisional.
        let mut guards = Vec::with_capacity(deps.len());
        for dep in deps {
            match time::timeout(self.config.max_resync_time(), self.shared.item_lock.lock(dep)).await
            {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    warn!(dep = %dep.short(), %verdict, "dependency lock timed out; commit skipped");
                    drop(guards);
                    let provisional = if verdict == ItemState::Approved {
                        ItemState::PendingPositive
                    } else {
                        ItemState::PendingNegative
                    };
                    return self.stop_provisional(provisional);
                }
            }
        }

        let now = Timestamp::now();
        let keep_declined = now.plus_secs(self.config.declined_item_store_time_secs);
        let keep_approved = item_expires.or(self.peer_expires).unwrap_or(keep_declined);
        let id = self.item_id;
        let fallback = self.record.clone();
        let mut violation: Option<String> = None;
        let mut written: Option<StateRecord> = None;
        let mut already_final: Option<StateRecord> = None;

        let committed = self.shared.ledger.transaction(&mut |txn: &mut dyn LedgerTxn| {
            violation = None;
            written = None;
            already_final = None;

            let mut main = txn.get(&id).unwrap_or_else(|| fallback.clone());
            if main.state.is_consensus_found() {
                already_final = Some(main);
                return Err(StoreError::Rollback);
            }

            if verdict == ItemState::Approved {
                for dep in &revoking {
                    match txn.get(dep) {
                        Some(mut r) if r.state.is_approved() || r.state.is_ambiguous() => {
                            r.state = ItemState::Revoked;
                            r.locked_by = None;
                            txn.put(r);
                        }
                        None => txn.put(StateRecord {
                            id: *dep,
                            state: ItemState::Revoked,
                            created_at: now,
                            expires_at: keep_declined,
                            locked_by: None,
                        }),
                        Some(r) => {
                            violation = Some(format!("revoking {} which is {}", dep.short(), r.state));
                            return Err(StoreError::Rollback);
                        }
                    }
                }
                for new in &new_items {
                    match txn.get(new) {
                        Some(r) if r.state == ItemState::LockedForCreation && r.is_locked_by(&id) => {
                            txn.put(StateRecord {
                                state: ItemState::Approved,
                                expires_at: keep_approved,
                                locked_by: None,
                                ..r
                            })
                        }
                        None => txn.put(StateRecord {
                            id: *new,
                            state: ItemState::Approved,
                            created_at: now,
                            expires_at: keep_approved,
                            locked_by: None,
                        }),
                        Some(r) => {
                            violation = Some(format!("creating {} which is {}", new.short(), r.state));
                            return Err(StoreError::Rollback);
                        }
                    }
                }
                main.expires_at = keep_approved;
            } else {
                for dep in &revoking {
                    if let Some(mut r) = txn.get(dep) {
                        if r.state == ItemState::Locked && r.is_locked_by(&id) {
                            r.state = ItemState::Approved;
                            r.locked_by = None;
                            txn.put(r);
                        }
                    }
                }
                for new in &new_items {
                    if let Some(r) = txn.get(new) {
                        if r.state == ItemState::LockedForCreation && r.is_locked_by(&id) {
                            txn.remove(new);
                        }
                    }
                }
                main.expires_at = keep_declined;
            }

            main.state = verdict;
            main.locked_by = None;
            txn.put(main.clone());
            written = Some(main);
            Ok(())
        })?;
        drop(guards);

        if let Some(reason) = violation {
            error!(%reason, %verdict, "commit rolled back: invariant violated");
            return Err(ConsensusError::InvariantViolation(reason).into());
        }
        let record = if committed { written } else { already_final };
        let Some(record) = record else {
            return Err(ConsensusError::Other("commit produced no record".into()).into());
        };
        if record.state != verdict {
            info!(state = %record.state, "record was already final");
        }

        self.locks_held = false;
        self.record = record;
        match self.record.state {
            ItemState::Approved => self.shared.metrics.elections_approved.inc(),
            ItemState::Declined => self.shared.metrics.elections_declined.inc(),
            _ => {}
        }
        self.shared
            .metrics
            .election_latency_ms
            .observe(self.started.elapsed().as_secs_f64() * 1_000.0);
        info!(state = %self.record.state, "committed");

        self.publish(ProcessorState::Done);
        self.broadcast_vote(false);
        Ok(())
    }

    /// Deadline passed without quorum: keep the provisional state.
    fn expire(&mut self) -> Result<(), NodeError> {
        let implied = self.election.expire();
        let state = if implied == ItemState::Pending {
            self.record.state
        } else {
            implied
        };
        self.stop_provisional(state)
    }

    /// End without a committed verdict, leaving `state` on the record.
    fn stop_provisional(&mut self, state: ItemState) -> Result<(), NodeError> {
        if let Some(item) = self.item.clone() {
            if self.locks_held {
                self.release_locks(&item)?;
            }
        }

        if self.item.is_none() && self.origin.is_some() && self.record.state.can_remove_self() {
            // Learned from a peer and never seen: forget it.
            self.shared.ledger.destroy(&self.item_id)?;
            self.record.state = ItemState::Undefined;
        } else if !self.record.state.is_consensus_found() {
            self.record.state = state;
            self.save_own()?;
        }

        self.shared.metrics.elections_timed_out.inc();
        info!(
            %state,
            positive = self.election.positive_count(),
            negative = self.election.negative_count(),
            "election ended without a committed verdict"
        );
        self.publish(ProcessorState::TimedOut);
        Ok(())
    }

    /// Validation ran out of quota: no vote, the record stays `UNDEFINED`
    /// and waiters get the result with its quota error.
    fn abort_undefined(&mut self) -> Result<(), NodeError> {
        if let Some(item) = self.item.clone() {
            if self.locks_held {
                self.release_locks(&item)?;
            }
        }
        self.record.state = ItemState::Undefined;
        self.save_own()?;
        self.shared.aborted.put(self.item_id, self.current_result());
        info!(errors = self.errors.len(), "election aborted: work quota exceeded");
        self.publish(ProcessorState::Aborted);
        Ok(())
    }

    /// Stop early (shutdown or failure), releasing what this item holds.
    fn abandon(&mut self) {
        if let Some(item) = self.item.clone() {
            if self.locks_held {
                if let Err(e) = self.release_locks(&item) {
                    warn!(error = %e, "cannot release dependency locks");
                }
            }
        }
        self.publish(ProcessorState::TimedOut);
    }

    fn finish(&self) {
        {
            let mut processors = self.shared.processors();
            if processors
                .get(&self.item_id)
                .is_some_and(|h| h.generation == self.generation)
            {
                processors.remove(&self.item_id);
            }
        }
        self.shared.notify_changed();
    }

    fn current_result(&self) -> ItemResult {
        self.record
            .to_result(self.item.is_some())
            .with_errors(self.errors.clone())
    }

    fn publish(&self, phase: ProcessorState) {
        {
            let mut status = lock_status(&self.status);
            status.phase = phase;
            status.result = self.current_result();
        }
        self.shared.notify_changed();
    }
}

fn resync_failed(item_id: &ItemId) -> Verdict {
    Verdict::Negative(vec![ItemError::new(
        ErrorCode::ResyncFailed,
        item_id.short(),
        "dependencies could not be resolved",
    )])
}
