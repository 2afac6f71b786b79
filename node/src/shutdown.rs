//! Graceful shutdown controller for the quorum node.
//!
//! Broadcasts a shutdown signal to the sweeper and every running processor
//! via a `tokio::sync::broadcast` channel.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Coordinates graceful shutdown across all node subsystems.
///
/// Subsystems call [`ShutdownController::subscribe`] to get a receiver, then
/// `select!` on it alongside their main loop. When [`Node::shutdown`] runs or
/// the node is dropped, every receiver is notified. Work started after the
/// signal should check [`ShutdownController::is_triggered`].
///
/// [`Node::shutdown`]: crate::Node::shutdown
pub struct ShutdownController {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}
