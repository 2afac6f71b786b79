//! Abstract ledger traits for the quorum node.
//!
//! The durable storage engine is not part of this workspace. The consensus
//! engine depends only on the [`Ledger`] trait; `quorum-nullables` provides
//! an in-memory implementation for tests and simulation.

pub mod error;
pub mod ledger;
pub mod record;

pub use error::StoreError;
pub use ledger::{Ledger, LedgerTxn};
pub use record::StateRecord;
