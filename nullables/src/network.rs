//! Nullable network: in-process routing between nodes.
//!
//! Every notification goes through the real wire codec on its way, so a
//! node only ever sees what would survive a socket. Faults are injected
//! per hub: random loss, random duplication, fixed latency, and nodes that
//! are disconnected from everyone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use quorum_consensus::Item;
use quorum_messages::Notification;
use quorum_network::{Network, NetworkError, NotificationConsumer};
use quorum_types::{ItemId, NodeId, Roster};
use rand::Rng;
use tracing::trace;

#[derive(Clone, Debug, Default)]
struct Faults {
    loss: f64,
    duplication: f64,
    latency: Duration,
    disconnected: HashSet<NodeId>,
}

/// A hub all nodes of one test subscribe to.
pub struct LoopbackNetwork {
    roster: Roster,
    consumers: RwLock<HashMap<NodeId, Arc<dyn NotificationConsumer>>>,
    faults: Mutex<Faults>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new(roster: Roster) -> Self {
        Self {
            roster,
            consumers: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn consumer(&self, node: NodeId) -> Option<Arc<dyn NotificationConsumer>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)
            .cloned()
    }

    /// Probability in `[0, 1]` that a delivery is silently dropped.
    pub fn set_loss(&self, probability: f64) {
        self.faults().loss = probability.clamp(0.0, 1.0);
    }

    /// Probability in `[0, 1]` that a delivery arrives twice.
    pub fn set_duplication(&self, probability: f64) {
        self.faults().duplication = probability.clamp(0.0, 1.0);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults().latency = latency;
    }

    /// Cut `node` off: nothing it sends or is sent arrives, and its items
    /// cannot be pulled.
    pub fn disconnect(&self, node: NodeId) {
        self.faults().disconnected.insert(node);
    }

    pub fn reconnect(&self, node: NodeId) {
        self.faults().disconnected.remove(&node);
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn dispatch(&self, consumer: Arc<dyn NotificationConsumer>, n: Notification, latency: Duration) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    consumer.on_notification(n);
                });
            }
            Err(_) => consumer.on_notification(n),
        }
    }
}

#[async_trait]
impl Network for LoopbackNetwork {
    fn deliver(&self, to: NodeId, notification: Notification) -> Result<(), NetworkError> {
        let consumer = self.consumer(to).ok_or(NetworkError::NotSubscribed(to))?;
        let frame = notification.encode()?;

        let faults = self.faults().clone();
        let from = notification.from();
        if faults.disconnected.contains(&from) || faults.disconnected.contains(&to) {
            trace!(%from, %to, "dropped: node disconnected");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let (lost, duplicated) = {
            let mut rng = rand::thread_rng();
            (
                faults.loss > 0.0 && rng.gen_bool(faults.loss),
                faults.duplication > 0.0 && rng.gen_bool(faults.duplication),
            )
        };
        if lost {
            trace!(%from, %to, "dropped: random loss");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let received = Notification::decode(&frame)?;
        if duplicated {
            self.dispatch(consumer.clone(), received.clone(), faults.latency);
        }
        self.dispatch(consumer, received, faults.latency);
        Ok(())
    }

    fn subscribe(&self, local: NodeId, consumer: Arc<dyn NotificationConsumer>) {
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local, consumer);
    }

    async fn get_item(
        &self,
        id: ItemId,
        from: NodeId,
        timeout: Duration,
    ) -> Result<Arc<dyn Item>, NetworkError> {
        let faults = self.faults().clone();
        if faults.disconnected.contains(&from) {
            // Nobody answers; the caller waits out its timeout.
            tokio::time::sleep(timeout).await;
            return Err(NetworkError::Timeout { id, from });
        }
        if !faults.latency.is_zero() {
            if faults.latency >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(NetworkError::Timeout { id, from });
            }
            tokio::time::sleep(faults.latency).await;
        }
        let consumer = self.consumer(from).ok_or(NetworkError::NotSubscribed(from))?;
        consumer
            .serve_item(&id)
            .ok_or(NetworkError::ItemNotFound { id, from })
    }

    fn roster(&self) -> Roster {
        self.roster.clone()
    }
}
