//! Consensus primitives for the quorum node.
//!
//! Everything here is free of I/O; the node crate drives these pieces from
//! its item and parcel processors.
//!
//! ## Module overview
//!
//! - [`election`]: Per-item vote tally and quorum decision.
//! - [`vote_info`]: Latest opinion of one node.
//! - [`resync`]: Peer answers about ambiguous dependencies.
//! - [`quantiser`]: Work budget of one validation.
//! - [`keyed_lock`]: Per-id mutual exclusion with a self-pruning table.
//! - [`item`]: The item capability the engine votes on.
//! - [`parcel`]: Payment + payload bundles.
//! - [`config`]: Thresholds and timings.
//! - [`error`]: Consensus error types.

pub mod config;
pub mod election;
pub mod error;
pub mod item;
pub mod keyed_lock;
pub mod parcel;
pub mod quantiser;
pub mod resync;
pub mod vote_info;

pub use config::ConsensusConfig;
pub use election::{Election, ElectionState, ProcessorState};
pub use error::ConsensusError;
pub use item::Item;
pub use keyed_lock::{ItemLock, KeyedGuard, KeyedLock, ParcelLock};
pub use parcel::{Parcel, ParcelItemType, ParcelResult, ParcelState};
pub use quantiser::{Quantiser, QuantiserPrice};
pub use resync::{should_resync, ResyncOutcome, ResyncProgress, ResyncSet, ResyncTally};
pub use vote_info::{VoteInfo, VoteResult};
