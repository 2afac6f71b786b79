use std::time::Duration;

use quorum_types::ItemId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no consensus on {id} within {waited:?}")]
    Timeout { id: ItemId, waited: Duration },

    #[error("parcel {0} is not known to this node")]
    UnknownParcel(ItemId),

    #[error("store error: {0}")]
    Store(#[from] quorum_store::StoreError),

    #[error("network error: {0}")]
    Network(#[from] quorum_network::NetworkError),

    #[error("consensus error: {0}")]
    Consensus(#[from] quorum_consensus::ConsensusError),

    #[error("message error: {0}")]
    Message(#[from] quorum_messages::MessageError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node is shutting down")]
    ShuttingDown,
}
