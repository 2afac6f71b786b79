//! Fundamental types for the quorum node.
//!
//! This crate defines the value types shared across every other crate in the
//! workspace: item identifiers, item states and results, node identities, and
//! timestamps.

pub mod error;
pub mod item_id;
pub mod node_info;
pub mod result;
pub mod state;
pub mod time;

pub use error::QuorumError;
pub use item_id::ItemId;
pub use node_info::{NodeId, NodeInfo, Roster};
pub use result::{ErrorCode, ItemError, ItemResult};
pub use state::ItemState;
pub use time::Timestamp;
