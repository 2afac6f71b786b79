//! Nullable infrastructure for deterministic testing.
//!
//! The node talks to storage and transport only through the `Ledger` and
//! `Network` traits. This crate provides in-process implementations that
//! never touch the filesystem or a socket and can be steered from tests:
//! - [`MemoryLedger`] keeps records in a map and rolls transactions back
//!   from a snapshot.
//! - [`LoopbackNetwork`] routes notifications between nodes of one process,
//!   through the real wire codec, with optional loss, duplication, latency
//!   and disconnected nodes.
//! - [`TestItem`] is an item whose verdict, cost and dependencies are set
//!   by the test.

pub mod item;
pub mod ledger;
pub mod network;

pub use item::TestItem;
pub use ledger::MemoryLedger;
pub use network::LoopbackNetwork;
