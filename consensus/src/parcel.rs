//! Parcels: a payment item and a payload item processed as one unit.
//!
//! The payment must be approved before the payload is even put to a vote.
//! The parcel is finished once both sub-items are final, or the payment
//! failed.

use std::sync::Arc;

use quorum_types::{ItemId, ItemResult};
use serde::{Deserialize, Serialize};

use crate::Item;

/// Which half of a parcel a message is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParcelItemType {
    Payment,
    Payload,
}

/// Processing phase of one parcel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParcelState {
    Init,
    /// Pulling the sub-items from the peer that announced the parcel.
    Downloading,
    Preparing,
    PaymentChecking,
    PayloadChecking,
    /// A sub-item election is resolving dependencies.
    Resyncing,
    Polling,
    GotConsensus,
    SendingConsensus,
    Finished,
    /// Aborted from any phase.
    EmergencyBreak,
}

impl ParcelState {
    pub fn is_processing_finished(self) -> bool {
        matches!(self, ParcelState::Finished | ParcelState::EmergencyBreak)
    }
}

/// The bundle under consensus.
#[derive(Clone, Debug)]
pub struct Parcel {
    id: ItemId,
    pub payment: Arc<dyn Item>,
    pub payload: Arc<dyn Item>,
}

impl Parcel {
    pub fn new(payment: Arc<dyn Item>, payload: Arc<dyn Item>) -> Self {
        let id = Self::compute_id(&payment.id(), &payload.id());
        Self {
            id,
            payment,
            payload,
        }
    }

    /// Parcel id: digest of the payment id followed by the payload id.
    pub fn compute_id(payment: &ItemId, payload: &ItemId) -> ItemId {
        ItemId::of_parts(&[payment.as_bytes().as_slice(), payload.as_bytes().as_slice()])
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn item(&self, which: ParcelItemType) -> &Arc<dyn Item> {
        match which {
            ParcelItemType::Payment => &self.payment,
            ParcelItemType::Payload => &self.payload,
        }
    }
}

/// What a node reports about a parcel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParcelResult {
    pub parcel_id: ItemId,
    pub state: ParcelState,
    pub payment: ItemResult,
    /// `None` until the payload is put to a vote.
    pub payload: Option<ItemResult>,
}

impl ParcelResult {
    pub fn new(parcel_id: ItemId) -> Self {
        Self {
            parcel_id,
            state: ParcelState::Init,
            payment: ItemResult::undefined(),
            payload: None,
        }
    }
}
