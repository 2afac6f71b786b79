//! Notification types for node-to-node communication.
//!
//! Every notification travels as one type-code byte followed by the bincode
//! body of its variant. The codes and the field order of each body are part
//! of the protocol and must not change between versions.

use std::collections::BTreeMap;

use quorum_consensus::ParcelItemType;
use quorum_types::{ItemId, ItemResult, ItemState, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ITEM_NOTIFICATION: u8 = 1;
pub const RESYNC_NOTIFICATION: u8 = 2;
pub const PARCEL_NOTIFICATION: u8 = 3;
pub const CALLBACK_NOTIFICATION: u8 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty frame")]
    Empty,

    #[error("unknown notification type code {0}")]
    UnknownType(u8),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),
}

/// A node's vote on an item, or a request for one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemNotification {
    pub from: NodeId,
    pub item_id: ItemId,
    pub result: ItemResult,
    /// The receiver should reply with its own opinion.
    pub answer_requested: bool,
}

/// Query for (or answer with) the states of dependencies of `item_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncNotification {
    pub from: NodeId,
    /// The item whose check is waiting on the resync.
    pub item_id: ItemId,
    /// Dependency id → sender's local state.
    pub states: BTreeMap<ItemId, ItemState>,
    pub answer_requested: bool,
}

/// A vote on one half of a parcel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelNotification {
    pub from: NodeId,
    pub parcel_id: ItemId,
    pub payment_id: ItemId,
    pub payload_id: ItemId,
    pub item_type: ParcelItemType,
    pub result: ItemResult,
    pub answer_requested: bool,
}

impl ParcelNotification {
    /// The sub-item this vote is about.
    pub fn item_id(&self) -> ItemId {
        match self.item_type {
            ParcelItemType::Payment => self.payment_id,
            ParcelItemType::Payload => self.payload_id,
        }
    }
}

/// Status of a follower callback as reported by one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackStatus {
    Started,
    Completed,
    FailedCheck,
    FailedEnvironment,
}

/// A node's report on a follower callback fired for `item_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackNotification {
    pub from: NodeId,
    pub item_id: ItemId,
    pub callback_id: ItemId,
    pub status: CallbackStatus,
    /// Receipt signature from the callback endpoint, opaque here.
    pub signature: Vec<u8>,
}

/// Every message exchanged between nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Item(ItemNotification),
    Resync(ResyncNotification),
    Parcel(ParcelNotification),
    Callback(CallbackNotification),
}

impl Notification {
    pub fn type_code(&self) -> u8 {
        match self {
            Notification::Item(_) => ITEM_NOTIFICATION,
            Notification::Resync(_) => RESYNC_NOTIFICATION,
            Notification::Parcel(_) => PARCEL_NOTIFICATION,
            Notification::Callback(_) => CALLBACK_NOTIFICATION,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Notification::Item(_) => "item",
            Notification::Resync(_) => "resync",
            Notification::Parcel(_) => "parcel",
            Notification::Callback(_) => "callback",
        }
    }

    pub fn from(&self) -> NodeId {
        match self {
            Notification::Item(n) => n.from,
            Notification::Resync(n) => n.from,
            Notification::Parcel(n) => n.from,
            Notification::Callback(n) => n.from,
        }
    }

    pub fn item_id(&self) -> ItemId {
        match self {
            Notification::Item(n) => n.item_id,
            Notification::Resync(n) => n.item_id,
            Notification::Parcel(n) => n.item_id(),
            Notification::Callback(n) => n.item_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let body = match self {
            Notification::Item(n) => bincode::serialize(n),
            Notification::Resync(n) => bincode::serialize(n),
            Notification::Parcel(n) => bincode::serialize(n),
            Notification::Callback(n) => bincode::serialize(n),
        }
        .map_err(|e| MessageError::Encode(e.to_string()))?;

        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(self.type_code());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, MessageError> {
        let (&code, body) = frame.split_first().ok_or(MessageError::Empty)?;
        let decode_err = |e: bincode::Error| MessageError::Decode(e.to_string());
        Ok(match code {
            ITEM_NOTIFICATION => Notification::Item(bincode::deserialize(body).map_err(decode_err)?),
            RESYNC_NOTIFICATION => {
                Notification::Resync(bincode::deserialize(body).map_err(decode_err)?)
            }
            PARCEL_NOTIFICATION => {
                Notification::Parcel(bincode::deserialize(body).map_err(decode_err)?)
            }
            CALLBACK_NOTIFICATION => {
                Notification::Callback(bincode::deserialize(body).map_err(decode_err)?)
            }
            other => return Err(MessageError::UnknownType(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_types::Timestamp;

    fn result(state: ItemState) -> ItemResult {
        ItemResult::new(state, true, Timestamp::new(100), Timestamp::new(200))
    }

    fn vote() -> Notification {
        Notification::Item(ItemNotification {
            from: NodeId(2),
            item_id: ItemId::of(b"item"),
            result: result(ItemState::PendingPositive),
            answer_requested: true,
        })
    }

    #[test]
    fn frame_starts_with_type_code() {
        let frame = vote().encode().unwrap();
        assert_eq!(frame[0], ITEM_NOTIFICATION);
        assert_eq!(Notification::decode(&frame).unwrap(), vote());
    }

    #[test]
    fn resync_answer_keeps_states() {
        let mut states = BTreeMap::new();
        states.insert(ItemId::of(b"a"), ItemState::Approved);
        states.insert(ItemId::of(b"b"), ItemState::Revoked);
        let n = Notification::Resync(ResyncNotification {
            from: NodeId(3),
            item_id: ItemId::of(b"main"),
            states,
            answer_requested: false,
        });
        let frame = n.encode().unwrap();
        assert_eq!(frame[0], RESYNC_NOTIFICATION);
        assert_eq!(Notification::decode(&frame).unwrap(), n);
    }

    #[test]
    fn parcel_notification_targets_sub_item() {
        let p = ParcelNotification {
            from: NodeId(1),
            parcel_id: ItemId::of(b"parcel"),
            payment_id: ItemId::of(b"pay"),
            payload_id: ItemId::of(b"load"),
            item_type: ParcelItemType::Payload,
            result: result(ItemState::PendingNegative),
            answer_requested: false,
        };
        assert_eq!(p.item_id(), ItemId::of(b"load"));
        let n = Notification::Parcel(p);
        assert_eq!(n.item_id(), ItemId::of(b"load"));
        assert_eq!(n.encode().unwrap()[0], PARCEL_NOTIFICATION);
    }

    #[test]
    fn callback_carries_signature() {
        let n = Notification::Callback(CallbackNotification {
            from: NodeId(4),
            item_id: ItemId::of(b"item"),
            callback_id: ItemId::of(b"cb"),
            status: CallbackStatus::Completed,
            signature: vec![1, 2, 3],
        });
        let frame = n.encode().unwrap();
        assert_eq!(frame[0], CALLBACK_NOTIFICATION);
        assert_eq!(Notification::decode(&frame).unwrap(), n);
        assert_eq!(n.from(), NodeId(4));
    }

    #[test]
    fn errors_are_not_on_the_wire() {
        let mut r = result(ItemState::PendingNegative);
        r.errors.push(quorum_types::ItemError::new(
            quorum_types::ErrorCode::FailedCheck,
            "x",
            "nope",
        ));
        let n = Notification::Item(ItemNotification {
            from: NodeId(1),
            item_id: ItemId::of(b"x"),
            result: r,
            answer_requested: false,
        });
        match Notification::decode(&n.encode().unwrap()).unwrap() {
            Notification::Item(i) => assert!(i.result.errors.is_empty()),
            other => panic!("expected item notification, got {other:?}"),
        }
    }

    #[test]
    fn unknown_code_rejected() {
        assert_eq!(Notification::decode(&[9, 0, 0]), Err(MessageError::UnknownType(9)));
        assert_eq!(Notification::decode(&[]), Err(MessageError::Empty));
    }

    #[test]
    fn truncated_body_rejected() {
        let frame = vote().encode().unwrap();
        assert!(matches!(
            Notification::decode(&frame[..frame.len() / 2]),
            Err(MessageError::Decode(_))
        ));
    }
}
