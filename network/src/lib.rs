//! Transport seam of a quorum node.
//!
//! The consensus engine only needs three things from the wire: best-effort
//! delivery of notifications, a registered inbound handler, and a bounded
//! pull of item content from one peer. Delivery may lose, duplicate or
//! reorder notifications; the engine tolerates all three.

pub mod broadcast;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quorum_consensus::Item;
use quorum_messages::Notification;
use quorum_types::{ItemId, NodeId, Roster};

pub use broadcast::{BroadcastResult, Broadcaster};
pub use error::NetworkError;

/// Inbound side of a node, registered with [`Network::subscribe`].
pub trait NotificationConsumer: Send + Sync {
    /// Handle one inbound notification. Must not block.
    fn on_notification(&self, notification: Notification);

    /// Content of `id` if this node holds it, served to pulling peers.
    fn serve_item(&self, id: &ItemId) -> Option<Arc<dyn Item>>;
}

#[async_trait]
pub trait Network: Send + Sync {
    /// Queue `notification` for `to`. Returns once queued, not once delivered.
    fn deliver(&self, to: NodeId, notification: Notification) -> Result<(), NetworkError>;

    /// Register the inbound handler of `local`, replacing any earlier one.
    fn subscribe(&self, local: NodeId, consumer: Arc<dyn NotificationConsumer>);

    /// Pull item content from `from`, giving up after `timeout`.
    async fn get_item(
        &self,
        id: ItemId,
        from: NodeId,
        timeout: Duration,
    ) -> Result<Arc<dyn Item>, NetworkError>;

    /// Nodes this transport knows about.
    fn roster(&self) -> Roster;
}
