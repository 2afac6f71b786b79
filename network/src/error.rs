use quorum_messages::MessageError;
use quorum_types::{ItemId, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{0} is not reachable")]
    Unreachable(NodeId),

    #[error("{0} has no subscribed consumer")]
    NotSubscribed(NodeId),

    #[error("{from} does not hold item {id}")]
    ItemNotFound { id: ItemId, from: NodeId },

    #[error("timed out pulling item {id} from {from}")]
    Timeout { id: ItemId, from: NodeId },

    #[error("codec error: {0}")]
    Codec(#[from] MessageError),
}
