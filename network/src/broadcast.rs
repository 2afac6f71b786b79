//! Flood broadcasting of notifications to the roster.
//!
//! The [`Broadcaster`] does not talk to sockets. It hands one copy of the
//! notification per target to [`Network::deliver`] and counts how many
//! were queued.

use std::sync::Arc;

use quorum_messages::Notification;
use quorum_types::{NodeId, Roster};
use tracing::trace;

use crate::Network;

/// Outcome of a broadcast attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Number of peers the notification was queued for.
    pub sent: usize,
    /// Number of peers for which queueing failed.
    pub failed: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    network: Arc<dyn Network>,
    local: NodeId,
}

impl Broadcaster {
    pub fn new(network: Arc<dyn Network>, local: NodeId) -> Self {
        Self { network, local }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Send to every roster member except the local node.
    pub fn broadcast_to_all(&self, roster: &Roster, notification: &Notification) -> BroadcastResult {
        self.broadcast_to(roster.peers_of(self.local), notification)
    }

    /// Send to the given peers. The local node is skipped if listed.
    pub fn broadcast_to(
        &self,
        peers: impl IntoIterator<Item = NodeId>,
        notification: &Notification,
    ) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        for peer in peers.into_iter().filter(|p| *p != self.local) {
            match self.network.deliver(peer, notification.clone()) {
                Ok(()) => result.sent += 1,
                Err(e) => {
                    trace!(%peer, error = %e, kind = notification.type_name(), "delivery failed");
                    result.failed += 1;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NetworkError, NotificationConsumer};
    use async_trait::async_trait;
    use quorum_consensus::Item;
    use quorum_messages::ItemNotification;
    use quorum_types::{ItemId, ItemResult, ItemState};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records deliveries; refuses peers listed in `down`.
    struct RecordingNetwork {
        delivered: Mutex<Vec<NodeId>>,
        down: Vec<NodeId>,
    }

    #[async_trait]
    impl Network for RecordingNetwork {
        fn deliver(&self, to: NodeId, _n: Notification) -> Result<(), NetworkError> {
            if self.down.contains(&to) {
                return Err(NetworkError::Unreachable(to));
            }
            self.delivered.lock().unwrap().push(to);
            Ok(())
        }

        fn subscribe(&self, _local: NodeId, _consumer: Arc<dyn NotificationConsumer>) {}

        async fn get_item(
            &self,
            id: ItemId,
            from: NodeId,
            _timeout: Duration,
        ) -> Result<Arc<dyn Item>, NetworkError> {
            Err(NetworkError::ItemNotFound { id, from })
        }

        fn roster(&self) -> Roster {
            Roster::numbered(4)
        }
    }

    fn vote() -> Notification {
        Notification::Item(ItemNotification {
            from: NodeId(1),
            item_id: ItemId::of(b"x"),
            result: ItemResult::undefined().with_state(ItemState::PendingPositive),
            answer_requested: false,
        })
    }

    fn network(down: Vec<NodeId>) -> Arc<RecordingNetwork> {
        Arc::new(RecordingNetwork {
            delivered: Mutex::new(Vec::new()),
            down,
        })
    }

    #[test]
    fn broadcast_skips_local_node() {
        let net = network(vec![]);
        let b = Broadcaster::new(net.clone(), NodeId(1));
        let result = b.broadcast_to_all(&Roster::numbered(4), &vote());
        assert_eq!(result, BroadcastResult { sent: 3, failed: 0 });
        assert_eq!(
            *net.delivered.lock().unwrap(),
            vec![NodeId(2), NodeId(3), NodeId(4)]
        );
    }

    #[test]
    fn unreachable_peers_counted_as_failed() {
        let net = network(vec![NodeId(3)]);
        let b = Broadcaster::new(net.clone(), NodeId(1));
        let result = b.broadcast_to([NodeId(1), NodeId(2), NodeId(3)], &vote());
        assert_eq!(result, BroadcastResult { sent: 1, failed: 1 });
    }
}
