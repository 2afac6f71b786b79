//! Quorum node: per-item consensus on a permissioned ledger.
//!
//! The node runs one election per item it is asked about:
//! - Validates the item under a work quota and checks its dependencies
//! - Resyncs ambiguous dependencies with the roster
//! - Polls peers until a positive or negative quorum is reached
//! - Commits the verdict and its dependency effects in one ledger transaction
//! - Processes parcels (a payment gating a payload)
//! - Tracks follower-callback reports, name reservations and short-lived caches

pub mod caches;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod item_processor;
pub mod logging;
pub mod metrics;
pub mod name_cache;
pub mod node;
mod parcel_processor;
pub mod shutdown;
pub mod sweeper;
pub mod tracing_spans;

pub use caches::{EnvCache, Environment, ItemCache, ParcelCache, ResultCache, TimedCache};
pub use callbacks::CallbackTracker;
pub use config::NodeConfig;
pub use error::NodeError;
pub use item_processor::ProcessorStatus;
pub use logging::{init_logging, LogFormat};
pub use metrics::NodeMetrics;
pub use name_cache::NameCache;
pub use node::Node;
pub use shutdown::ShutdownController;
pub use sweeper::SweepStats;
