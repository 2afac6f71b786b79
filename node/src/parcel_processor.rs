//! Parcel processing: the payment election gates the payload election.
//!
//! A parcel processor holds the parcel's keyed lock for its whole run. It
//! registers the payment, waits for its verdict, and only after the payment
//! is approved registers the payload. Peers learn the parcel from the
//! `Parcel` notifications both elections send instead of plain item votes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use quorum_consensus::{Item, Parcel, ParcelItemType, ParcelResult, ParcelState};
use quorum_messages::{Notification, ParcelNotification};
use quorum_types::{ItemId, ItemResult, ItemState, NodeId};
use tracing::{debug, info, warn, Instrument};

use crate::node::NodeShared;
use crate::tracing_spans::parcel_span;
use crate::NodeError;

/// Marks an item election as one half of a parcel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ParcelTag {
    pub parcel_id: ItemId,
    pub payment_id: ItemId,
    pub payload_id: ItemId,
    pub which: ParcelItemType,
}

impl ParcelTag {
    pub(crate) fn of(parcel: &ParcelIds, which: ParcelItemType) -> Self {
        Self {
            parcel_id: parcel.parcel_id,
            payment_id: parcel.payment_id,
            payload_id: parcel.payload_id,
            which,
        }
    }

    pub(crate) fn from_notification(n: &ParcelNotification) -> Self {
        Self {
            parcel_id: n.parcel_id,
            payment_id: n.payment_id,
            payload_id: n.payload_id,
            which: n.item_type,
        }
    }

    pub(crate) fn notification(
        &self,
        from: NodeId,
        result: ItemResult,
        answer_requested: bool,
    ) -> Notification {
        Notification::Parcel(ParcelNotification {
            from,
            parcel_id: self.parcel_id,
            payment_id: self.payment_id,
            payload_id: self.payload_id,
            item_type: self.which,
            result,
            answer_requested,
        })
    }
}

/// Identity of a parcel before its content is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ParcelIds {
    pub parcel_id: ItemId,
    pub payment_id: ItemId,
    pub payload_id: ItemId,
}

impl ParcelIds {
    pub(crate) fn of(parcel: &Parcel) -> Self {
        Self {
            parcel_id: parcel.id(),
            payment_id: parcel.payment.id(),
            payload_id: parcel.payload.id(),
        }
    }

    /// Whether the ids are consistent with each other.
    pub(crate) fn is_consistent(&self) -> bool {
        Parcel::compute_id(&self.payment_id, &self.payload_id) == self.parcel_id
    }
}

pub(crate) type SharedParcelResult = Arc<Mutex<ParcelResult>>;

pub(crate) fn lock_result(result: &Mutex<ParcelResult>) -> MutexGuard<'_, ParcelResult> {
    result.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start processing a parcel unless it is already running. `content` is
/// `None` when the parcel was learned from `origin`'s notification.
pub(crate) fn start(
    shared: &Arc<NodeShared>,
    ids: ParcelIds,
    content: Option<Parcel>,
    origin: Option<NodeId>,
) -> ParcelResult {
    let mut parcels = shared.parcels();
    if let Some(running) = parcels.get(&ids.parcel_id) {
        return lock_result(running).clone();
    }
    let result = ParcelResult::new(ids.parcel_id);
    let shared_result = Arc::new(Mutex::new(result.clone()));
    parcels.insert(ids.parcel_id, Arc::clone(&shared_result));
    drop(parcels);

    let processor = ParcelProcessor {
        shared: Arc::clone(shared),
        ids,
        content,
        origin,
        result: shared_result,
    };
    tokio::spawn(processor.run());
    result
}

struct ParcelProcessor {
    shared: Arc<NodeShared>,
    ids: ParcelIds,
    content: Option<Parcel>,
    origin: Option<NodeId>,
    result: SharedParcelResult,
}

impl ParcelProcessor {
    async fn run(mut self) {
        let span = parcel_span(self.shared.local, &self.ids.parcel_id);
        async move {
            let _guard = self.shared.parcel_lock.lock(self.ids.parcel_id).await;
            self.shared.metrics.active_parcels.inc();

            let end = match self.drive().await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "parcel processing broke off");
                    ParcelState::EmergencyBreak
                }
            };
            self.set_state(end);
            info!(state = ?end, "parcel finished");

            let snapshot = lock_result(&self.result).clone();
            self.shared.parcel_cache.put(self.ids.parcel_id, snapshot);
            self.shared.parcels().remove(&self.ids.parcel_id);
            self.shared.metrics.active_parcels.dec();
            self.shared.notify_changed();
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> Result<ParcelState, NodeError> {
        let parcel = match self.content.take() {
            Some(parcel) => parcel,
            None => {
                self.set_state(ParcelState::Downloading);
                match self.download().await {
                    Some(parcel) => parcel,
                    None => return Ok(ParcelState::EmergencyBreak),
                }
            }
        };

        self.set_state(ParcelState::Preparing);
        if parcel.id() != self.ids.parcel_id {
            warn!(computed = %parcel.id().short(), "parcel id does not match its items");
            return Ok(ParcelState::EmergencyBreak);
        }

        self.set_state(ParcelState::PaymentChecking);
        let payment = self.elect(&parcel, ParcelItemType::Payment).await?;
        let payment_result = match &payment {
            Some(result) => result.clone(),
            None => self
                .shared
                .check_item(&self.ids.payment_id)
                .unwrap_or_else(|_| ItemResult::undefined()),
        };
        lock_result(&self.result).payment = payment_result;
        let Some(payment) = payment else {
            return Ok(ParcelState::EmergencyBreak);
        };
        if payment.state != ItemState::Approved {
            debug!(state = %payment.state, "payment not approved; payload skipped");
            return Ok(ParcelState::Finished);
        }

        self.set_state(ParcelState::PayloadChecking);
        let payload = self.elect(&parcel, ParcelItemType::Payload).await?;
        let Some(payload) = payload else {
            let provisional = self.shared.check_item(&self.ids.payload_id).ok();
            lock_result(&self.result).payload = provisional;
            return Ok(ParcelState::EmergencyBreak);
        };

        self.set_state(ParcelState::GotConsensus);
        lock_result(&self.result).payload = Some(payload);
        // Final votes go out from each item election as it commits.
        self.set_state(ParcelState::SendingConsensus);
        Ok(ParcelState::Finished)
    }

    /// Run one half of the parcel to a verdict. `None` on timeout.
    async fn elect(
        &self,
        parcel: &Parcel,
        which: ParcelItemType,
    ) -> Result<Option<ItemResult>, NodeError> {
        let item = Arc::clone(parcel.item(which));
        let id = item.id();
        let tag = ParcelTag::of(&self.ids, which);
        self.shared.register(item, Some(tag))?;
        if which == ParcelItemType::Payload {
            self.set_state(ParcelState::Polling);
        }

        let config = self.shared.consensus();
        let budget = config.max_elections_time()
            + config.max_resync_time()
            + config.item_download_timeout();
        match self.shared.wait_item(&id, budget).await {
            Ok(result) => Ok(Some(result)),
            Err(NodeError::Timeout { .. }) => {
                info!(item = %id.short(), ?which, "no consensus in time");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn download(&self) -> Option<Parcel> {
        let payment = self.fetch(self.ids.payment_id).await?;
        let payload = self.fetch(self.ids.payload_id).await?;
        Some(Parcel::new(payment, payload))
    }

    async fn fetch(&self, id: ItemId) -> Option<Arc<dyn Item>> {
        if let Some(item) = self.shared.local_item(&id) {
            return Some(item);
        }
        let origin = self.origin?;
        let timeout = self.shared.consensus().item_download_timeout();
        match self.shared.network.get_item(id, origin, timeout).await {
            Ok(item) if item.id() == id => {
                self.shared.item_cache.put(id, Arc::clone(&item));
                Some(item)
            }
            Ok(_) => {
                warn!(%origin, item = %id.short(), "peer served another item");
                None
            }
            Err(e) => {
                debug!(%origin, item = %id.short(), error = %e, "parcel item download failed");
                None
            }
        }
    }

    fn set_state(&self, state: ParcelState) {
        lock_result(&self.result).state = state;
        self.shared.notify_changed();
    }
}
