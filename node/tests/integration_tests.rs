//! End-to-end elections over the in-memory ledger and loopback network.
//!
//! Every node of a test shares one `LoopbackNetwork`, so notifications go
//! through the real wire codec. Timings are shrunk so that a full election,
//! including a timeout, fits in a couple of seconds.

use std::sync::Arc;
use std::time::Duration;

use quorum_consensus::{ConsensusConfig, Item, Parcel, ParcelState};
use quorum_messages::CallbackStatus;
use quorum_node::{Environment, Node, NodeConfig, NodeError};
use quorum_nullables::{LoopbackNetwork, MemoryLedger, TestItem};
use quorum_types::{ErrorCode, ItemId, ItemResult, ItemState, NodeId, Roster, Timestamp};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

fn fast_consensus(nodes: usize) -> ConsensusConfig {
    ConsensusConfig {
        poll_time_ms: 20,
        max_elections_time_ms: 1_500,
        max_resync_time_ms: 200,
        item_download_timeout_ms: 200,
        ..ConsensusConfig::for_roster_size(nodes)
    }
}

struct Cluster {
    network: Arc<LoopbackNetwork>,
    ledgers: Vec<Arc<MemoryLedger>>,
    nodes: Vec<Node>,
}

impl Cluster {
    async fn start(size: u32) -> Self {
        Self::start_with(size, fast_consensus(size as usize)).await
    }

    async fn start_with(size: u32, consensus: ConsensusConfig) -> Self {
        let roster = Roster::numbered(size);
        let network = Arc::new(LoopbackNetwork::new(roster.clone()));
        let mut ledgers = Vec::new();
        let mut nodes = Vec::new();
        for id in 1..=size {
            let mut config = NodeConfig::for_roster(NodeId(id), roster.clone());
            config.consensus = consensus.clone();
            let ledger = Arc::new(MemoryLedger::new());
            let node = Node::start(config, ledger.clone(), network.clone())
                .await
                .expect("node starts");
            ledgers.push(ledger);
            nodes.push(node);
        }
        Self {
            network,
            ledgers,
            nodes,
        }
    }

    fn node(&self, id: u32) -> &Node {
        &self.nodes[(id - 1) as usize]
    }

    fn ledger(&self, id: u32) -> &MemoryLedger {
        &self.ledgers[(id - 1) as usize]
    }

    /// Seed `id` as approved on every node.
    fn seed_approved(&self, id: ItemId) {
        for ledger in &self.ledgers {
            ledger.insert(id, ItemState::Approved, Timestamp::now().plus_secs(600));
        }
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn vote(state: ItemState) -> ItemResult {
    ItemResult::undefined().with_state(state)
}

// ---------------------------------------------------------------------------
// 1. Single node
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_node_approves_valid_item() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let item = TestItem::new(b"valid");
    let id = item.id();
    let expires = item.expires_at();

    node.register_item(Arc::new(item)).unwrap();
    let result = node.wait_item(&id, WAIT).await.unwrap();

    assert_eq!(result.state, ItemState::Approved);
    assert!(result.have_copy);
    assert_eq!(result.expires_at, expires);
    assert_eq!(cluster.ledger(1).state_of(&id), Some(ItemState::Approved));
    assert_eq!(node.metrics().elections_approved.get(), 1);
    assert!(eventually(|| node.active_elections() == 0).await);
}

#[tokio::test]
async fn single_node_declines_invalid_item() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let item = TestItem::new(b"invalid").valid(false);
    let id = item.id();

    node.register_item(Arc::new(item)).unwrap();
    let result = node.wait_item(&id, WAIT).await.unwrap();

    assert_eq!(result.state, ItemState::Declined);
    assert_eq!(node.metrics().elections_declined.get(), 1);
}

#[tokio::test]
async fn expired_item_is_declined() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let item = TestItem::new(b"stale").expiring_at(Timestamp::new(1));
    let id = item.id();

    node.register_item(Arc::new(item)).unwrap();
    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Declined);
}

#[tokio::test]
async fn registering_twice_runs_one_election() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let item = Arc::new(TestItem::new(b"twice"));
    let id = item.id();

    node.register_item(item.clone()).unwrap();
    node.register_item(item.clone()).unwrap();
    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Approved);

    // Final already: no new election.
    let again = node.register_item(item).unwrap();
    assert_eq!(again.state, ItemState::Approved);
    assert_eq!(node.metrics().elections_started.get(), 1);
}

#[tokio::test]
async fn check_item_never_starts_an_election() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let id = ItemId::of(b"unknown");

    assert_eq!(node.check_item(&id).unwrap().state, ItemState::Undefined);
    assert_eq!(node.active_elections(), 0);
    assert_eq!(cluster.ledger(1).record_count(), 0);
}

// ---------------------------------------------------------------------------
// 2. Multi-node quorum
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_converge_on_approval() {
    let cluster = Cluster::start(3).await;
    let item = TestItem::new(b"shared");
    let id = item.id();

    cluster.node(1).register_item(Arc::new(item)).unwrap();

    for n in 1..=3 {
        let result = cluster.node(n).wait_item(&id, WAIT).await.unwrap();
        assert_eq!(result.state, ItemState::Approved, "node {n}");
    }
    // Peers downloaded the content from the registering node.
    assert!(cluster.node(2).get_item(&id).is_some());
    assert!(cluster.network.delivered_count() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_converge_on_decline() {
    let cluster = Cluster::start(3).await;
    let item = TestItem::new(b"bad").valid(false);
    let id = item.id();

    cluster.node(2).register_item(Arc::new(item)).unwrap();

    for n in 1..=3 {
        let result = cluster.node(n).wait_item(&id, WAIT).await.unwrap();
        assert_eq!(result.state, ItemState::Declined, "node {n}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_node_times_out_with_provisional_state() {
    let cluster = Cluster::start(3).await;
    cluster.network.disconnect(NodeId(2));
    cluster.network.disconnect(NodeId(3));
    let node = cluster.node(1);
    let item = TestItem::new(b"lonely");
    let id = item.id();

    node.register_item(Arc::new(item)).unwrap();
    let waited = node.wait_item(&id, Duration::from_millis(200)).await;
    assert!(matches!(waited, Err(NodeError::Timeout { .. })));

    // The caller's timeout does not stop the election; its own deadline does.
    assert!(eventually(|| node.active_elections() == 0).await);
    let result = node.check_item(&id).unwrap();
    assert_eq!(result.state, ItemState::PendingPositive);
    let now = Timestamp::now();
    let lifetime = node.consensus_config().pending_record_lifetime_secs;
    assert!(result.expires_at > now);
    assert!(result.expires_at <= now.plus_secs(lifetime));
    assert_eq!(node.metrics().elections_timed_out.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicated_notifications_count_once() {
    let cluster = Cluster::start(3).await;
    cluster.network.set_duplication(0.5);
    cluster.network.set_latency(Duration::from_millis(5));
    let item = TestItem::new(b"echoed");
    let id = item.id();

    cluster.node(3).register_item(Arc::new(item)).unwrap();
    let result = cluster.node(3).wait_item(&id, WAIT).await.unwrap();
    assert_eq!(result.state, ItemState::Approved);
}

// ---------------------------------------------------------------------------
// 3. Dependencies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_revokes_and_creates_dependencies() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let old = ItemId::of(b"old");
    let created = ItemId::of(b"created");
    cluster.seed_approved(old);

    let item = TestItem::new(b"split").revoking([old]).creating([created]);
    let id = item.id();
    node.register_item(Arc::new(item)).unwrap();

    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Approved);
    assert_eq!(cluster.ledger(1).state_of(&old), Some(ItemState::Revoked));
    assert_eq!(cluster.ledger(1).state_of(&created), Some(ItemState::Approved));
}

#[tokio::test]
async fn competing_revocations_approve_only_one() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let coin = ItemId::of(b"coin");
    cluster.seed_approved(coin);

    let first = TestItem::new(b"spend-1").revoking([coin]);
    let second = TestItem::new(b"spend-2").revoking([coin]);
    let (a, b) = (first.id(), second.id());
    node.register_item(Arc::new(first)).unwrap();
    node.register_item(Arc::new(second)).unwrap();

    let ra = node.wait_item(&a, WAIT).await.unwrap();
    let rb = node.wait_item(&b, WAIT).await.unwrap();
    let approved = [ra.state, rb.state]
        .iter()
        .filter(|s| **s == ItemState::Approved)
        .count();
    assert_eq!(approved, 1);
    assert_eq!(cluster.ledger(1).state_of(&coin), Some(ItemState::Revoked));
}

#[tokio::test]
async fn bad_reference_declines_and_leaves_dependency_alone() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let declined = ItemId::of(b"declined-dep");
    cluster
        .ledger(1)
        .insert(declined, ItemState::Declined, Timestamp::now().plus_secs(600));

    let item = TestItem::new(b"referrer").referencing([declined]);
    let id = item.id();
    node.register_item(Arc::new(item)).unwrap();

    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Declined);
    assert_eq!(cluster.ledger(1).state_of(&declined), Some(ItemState::Declined));
}

#[tokio::test]
async fn existing_output_declines_creator() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let taken = ItemId::of(b"taken");
    cluster.seed_approved(taken);

    let item = TestItem::new(b"creator").creating([taken]);
    let id = item.id();
    node.register_item(Arc::new(item)).unwrap();

    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Declined);
    assert_eq!(cluster.ledger(1).state_of(&taken), Some(ItemState::Approved));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn declined_by_quorum_releases_locks() {
    // Two nodes: approval needs both, one negative vote declines.
    let consensus = ConsensusConfig {
        positive_consensus: 2,
        negative_consensus: 1,
        resync_break_consensus: 1,
        ..fast_consensus(2)
    };
    let cluster = Cluster::start_with(2, consensus).await;
    cluster.network.disconnect(NodeId(2));
    let node = cluster.node(1);
    let old = ItemId::of(b"locked-old");
    let created = ItemId::of(b"never-created");
    cluster.seed_approved(old);

    let item = TestItem::new(b"outvoted").revoking([old]).creating([created]);
    let id = item.id();
    node.register_item(Arc::new(item)).unwrap();
    node.notify(NodeId(2), id, vote(ItemState::PendingNegative), false)
        .unwrap();

    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Declined);
    assert_eq!(cluster.ledger(1).state_of(&old), Some(ItemState::Approved));
    assert_eq!(cluster.ledger(1).state_of(&created), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ambiguous_dependency_resolved_by_resync() {
    let cluster = Cluster::start(3).await;
    let dep = ItemId::of(b"dep");
    // Nodes 2 and 3 know the dependency is approved; node 1 has nothing.
    for n in [2, 3] {
        cluster
            .ledger(n)
            .insert(dep, ItemState::Approved, Timestamp::now().plus_secs(600));
    }

    let item = TestItem::new(b"needs-dep").referencing([dep]);
    let id = item.id();
    cluster.node(1).register_item(Arc::new(item)).unwrap();

    assert_eq!(
        cluster.node(1).wait_item(&id, WAIT).await.unwrap().state,
        ItemState::Approved
    );
    assert_eq!(cluster.ledger(1).state_of(&dep), Some(ItemState::Approved));
    assert!(cluster.node(1).metrics().resyncs_started.get() >= 1);
}

#[tokio::test]
async fn resync_without_peers_declines() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let item = TestItem::new(b"orphan").referencing([ItemId::of(b"nowhere")]);
    let id = item.id();

    node.register_item(Arc::new(item)).unwrap();
    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Declined);
    assert_eq!(node.metrics().resyncs_broken.get(), 1);
}

/// Dependency states that must make a referencing item fail.
const UNUSABLE_DEPENDENCY_STATES: [ItemState; 7] = [
    ItemState::Pending,
    ItemState::PendingPositive,
    ItemState::PendingNegative,
    ItemState::Undefined,
    ItemState::Declined,
    ItemState::Revoked,
    ItemState::LockedForCreation,
];

/// Every node declines an item referencing one approved dependency and one
/// unusable one, and neither dependency changes anywhere.
async fn unusable_dependency_declines(size: u32) {
    for (i, state) in UNUSABLE_DEPENDENCY_STATES.into_iter().enumerate() {
        let cluster = Cluster::start(size).await;
        let tag = i as u8;
        let good = ItemId::of(&[b'g', tag]);
        let bad = ItemId::of(&[b'b', tag]);
        let expires = Timestamp::now().plus_secs(600);
        for n in 1..=size {
            cluster.ledger(n).insert(good, ItemState::Approved, expires);
            cluster.ledger(n).insert(bad, state, expires);
        }

        let item = TestItem::new(&[b'r', tag]).referencing([good, bad]);
        let id = item.id();
        cluster.node(1).register_item(Arc::new(item)).unwrap();

        for n in 1..=size {
            let result = cluster.node(n).wait_item(&id, WAIT).await.unwrap();
            assert_eq!(result.state, ItemState::Declined, "{state} dependency, node {n}");
            let ledger = cluster.ledger(n);
            assert_eq!(ledger.state_of(&good), Some(ItemState::Approved), "{state}, node {n}");
            assert_eq!(ledger.state_of(&bad), Some(state), "node {n}");
        }
    }
}

#[tokio::test]
async fn unusable_dependency_declines_on_single_node() {
    unusable_dependency_declines(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unusable_dependency_declines_on_three_nodes() {
    unusable_dependency_declines(3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_votes_cannot_reopen_held_records() {
    // Two nodes, approval needs both; node 2 is unreachable.
    let cluster = Cluster::start(2).await;
    cluster.network.disconnect(NodeId(2));
    let node = cluster.node(1);
    let ledger = cluster.ledger(1);
    let coin = ItemId::of(b"held-coin");
    let change = ItemId::of(b"held-change");
    cluster.seed_approved(coin);

    let spend = TestItem::new(b"held-spend").revoking([coin]).creating([change]);
    let spend_id = spend.id();
    node.register_item(Arc::new(spend)).unwrap();
    assert!(
        eventually(|| {
            ledger.state_of(&coin) == Some(ItemState::Locked)
                && ledger.state_of(&change) == Some(ItemState::LockedForCreation)
        })
        .await
    );

    node.notify(NodeId(2), coin, vote(ItemState::PendingPositive), false)
        .unwrap();
    node.notify(NodeId(2), change, vote(ItemState::PendingNegative), true)
        .unwrap();
    assert!(node.processor_status(&coin).is_none());
    assert!(node.processor_status(&change).is_none());
    assert_eq!(node.active_elections(), 1);
    assert_eq!(ledger.state_of(&coin), Some(ItemState::Locked));

    // The spend times out and gives its locks back.
    assert!(eventually(|| node.active_elections() == 0).await);
    assert_eq!(
        node.check_item(&spend_id).unwrap().state,
        ItemState::PendingPositive
    );
    assert_eq!(ledger.state_of(&coin), Some(ItemState::Approved));
    assert_eq!(ledger.state_of(&change), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_dependency_leaves_verdict_provisional() {
    // One negative vote declines; node 2 is unreachable.
    let cluster = Cluster::start(2).await;
    cluster.network.disconnect(NodeId(2));
    let node = cluster.node(1);
    let ledger = cluster.ledger(1);
    let output = ItemId::of(b"busy-output");

    // A peer vote opens an election on the output id, which holds the id
    // until its own deadline.
    node.notify(NodeId(2), output, vote(ItemState::PendingPositive), false)
        .unwrap();
    assert!(eventually(|| ledger.state_of(&output).is_some()).await);

    let creator = TestItem::new(b"busy-creator").creating([output]);
    let id = creator.id();
    node.register_item(Arc::new(creator)).unwrap();

    assert!(eventually(|| node.processor_status(&id).is_none()).await);
    assert_eq!(node.check_item(&id).unwrap().state, ItemState::PendingNegative);
    assert_eq!(node.metrics().elections_declined.get(), 0);
    assert!(node.processor_status(&output).is_some());
}

// ---------------------------------------------------------------------------
// 4. Finality, quota, roster
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn final_state_ignores_later_votes() {
    let cluster = Cluster::start(3).await;
    let item = TestItem::new(b"final");
    let id = item.id();
    cluster.node(1).register_item(Arc::new(item)).unwrap();
    for n in 1..=3 {
        cluster.node(n).wait_item(&id, WAIT).await.unwrap();
    }
    let node = cluster.node(1);
    assert!(eventually(|| node.active_elections() == 0).await);

    node.notify(NodeId(2), id, vote(ItemState::Declined), true)
        .unwrap();
    node.notify(NodeId(3), id, vote(ItemState::PendingNegative), false)
        .unwrap();

    assert_eq!(node.active_elections(), 0);
    assert_eq!(node.check_item(&id).unwrap().state, ItemState::Approved);
}

#[tokio::test]
async fn exceeded_quota_ends_election_undefined() {
    let consensus = ConsensusConfig {
        quantiser_limit: Some(5),
        max_elections_time_ms: 5_000,
        ..fast_consensus(1)
    };
    let cluster = Cluster::start_with(1, consensus).await;
    let node = cluster.node(1);
    let item = Arc::new(TestItem::new(b"expensive").cost(10));
    let id = item.id();

    node.register_item(item.clone()).unwrap();
    // Well inside the election deadline: the abort is reported, not waited out.
    let result = node.wait_item(&id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(result.state, ItemState::Undefined);
    assert!(result
        .errors
        .iter()
        .any(|e| e.code == ErrorCode::QuantiserExceeded));

    assert!(eventually(|| node.active_elections() == 0).await);
    assert_eq!(node.check_item(&id).unwrap().state, ItemState::Undefined);
    assert_eq!(node.metrics().quantiser_exceeded.get(), 1);
    assert_eq!(node.metrics().elections_declined.get(), 0);
    assert_eq!(node.metrics().elections_timed_out.get(), 0);

    // A larger quota lets the same item through on a fresh election.
    node.update_config(ConsensusConfig {
        quantiser_limit: Some(50),
        ..fast_consensus(1)
    })
    .unwrap();
    node.register_item(item).unwrap();
    assert_eq!(node.wait_item(&id, WAIT).await.unwrap().state, ItemState::Approved);
}

#[tokio::test]
async fn votes_from_outside_the_roster_are_dropped() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let id = ItemId::of(b"stranger");

    node.notify(NodeId(42), id, vote(ItemState::PendingPositive), true)
        .unwrap();

    assert_eq!(node.metrics().notifications_dropped.get(), 1);
    assert_eq!(node.active_elections(), 0);
    assert_eq!(cluster.ledger(1).record_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_vote_for_unreachable_content_is_forgotten() {
    let cluster = Cluster::start(3).await;
    // Node 2 votes but never serves the item: it does not hold it.
    let node = cluster.node(1);
    let id = ItemId::of(b"phantom");

    node.notify(NodeId(2), id, vote(ItemState::PendingPositive), false)
        .unwrap();
    assert_eq!(node.active_elections(), 1);

    assert!(eventually(|| node.active_elections() == 0).await);
    assert_eq!(node.check_item(&id).unwrap().state, ItemState::Undefined);
    assert_eq!(cluster.ledger(1).state_of(&id), None);
}

// ---------------------------------------------------------------------------
// 5. Parcels
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parcel_approves_payment_then_payload() {
    let cluster = Cluster::start(3).await;
    let payment: Arc<dyn Item> = Arc::new(TestItem::new(b"payment"));
    let payload: Arc<dyn Item> = Arc::new(TestItem::new(b"payload"));
    let parcel = Parcel::new(payment.clone(), payload.clone());
    let id = parcel.id();

    cluster.node(1).register_parcel(parcel).unwrap();
    let result = cluster.node(1).wait_parcel(&id, WAIT).await.unwrap();

    assert_eq!(result.state, ParcelState::Finished);
    assert_eq!(result.payment.state, ItemState::Approved);
    assert_eq!(result.payload.map(|r| r.state), Some(ItemState::Approved));

    // Peers learn the parcel from its notifications.
    let peer = cluster.node(2);
    assert!(eventually(|| peer.check_parcel(&id).is_some()).await);
    let seen = peer.wait_parcel(&id, WAIT).await.unwrap();
    assert_eq!(seen.state, ParcelState::Finished);
    assert_eq!(
        peer.check_item(&payload.id()).unwrap().state,
        ItemState::Approved
    );
}

#[tokio::test]
async fn declined_payment_skips_payload() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let payment: Arc<dyn Item> = Arc::new(TestItem::new(b"no-funds").valid(false));
    let payload: Arc<dyn Item> = Arc::new(TestItem::new(b"wanted"));
    let payload_id = payload.id();
    let parcel = Parcel::new(payment, payload);
    let id = parcel.id();

    node.register_parcel(parcel).unwrap();
    let result = node.wait_parcel(&id, WAIT).await.unwrap();

    assert_eq!(result.state, ParcelState::Finished);
    assert_eq!(result.payment.state, ItemState::Declined);
    assert!(result.payload.is_none());
    assert_eq!(cluster.ledger(1).state_of(&payload_id), None);
}

#[tokio::test]
async fn unknown_parcel_cannot_be_awaited() {
    let cluster = Cluster::start(1).await;
    let id = ItemId::of(b"no-such-parcel");
    assert!(matches!(
        cluster.node(1).wait_parcel(&id, WAIT).await,
        Err(NodeError::UnknownParcel(_))
    ));
    assert!(cluster.node(1).check_parcel(&id).is_none());
}

// ---------------------------------------------------------------------------
// 6. Callbacks, environments, config, housekeeping
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_completes_at_positive_quorum() {
    let cluster = Cluster::start(3).await;
    let item = ItemId::of(b"followed");
    let callback = ItemId::of(b"callback");

    let sent = cluster
        .node(1)
        .report_callback(item, callback, CallbackStatus::Completed, vec![1]);
    assert_eq!(sent.sent, 2);
    assert_eq!(
        cluster.node(1).callback_state(&callback),
        Some(CallbackStatus::Started)
    );

    cluster
        .node(2)
        .report_callback(item, callback, CallbackStatus::Completed, vec![2]);
    for n in 1..=3 {
        let node = cluster.node(n);
        assert!(
            eventually(|| node.callback_state(&callback) == Some(CallbackStatus::Completed)).await,
            "node {n}"
        );
    }
}

#[tokio::test]
async fn environments_are_cached_per_item() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let id = ItemId::of(b"contract");
    let mut env = Environment::new(id);
    env.set("balance", json!(100));

    node.set_environment(env.clone());
    assert_eq!(node.environment(&id), Some(env));
    assert_eq!(node.environment(&ItemId::of(b"other")), None);
}

#[tokio::test]
async fn name_reservations_go_through_the_node() {
    let cluster = Cluster::start(1).await;
    let names = cluster.node(1).name_cache();
    names.lock_names(&["alice".to_string()]).unwrap();
    assert!(names.lock_names(&["alice".to_string()]).is_err());
    names.unlock_names(&["alice".to_string()]);
    names.lock_names(&["alice".to_string()]).unwrap();
}

#[tokio::test]
async fn config_updates_apply_to_new_elections() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);

    let zero = ConsensusConfig {
        positive_consensus: 0,
        ..fast_consensus(1)
    };
    assert!(node.update_config(zero).is_err());
    let unreachable = ConsensusConfig {
        positive_consensus: 2,
        ..fast_consensus(1)
    };
    assert!(matches!(
        node.update_config(unreachable),
        Err(NodeError::Config(_))
    ));

    let stricter = ConsensusConfig {
        quantiser_limit: Some(3),
        ..fast_consensus(1)
    };
    node.update_config(stricter).unwrap();
    assert_eq!(node.consensus_config().quantiser_limit, Some(3));

    let item = TestItem::new(b"now-too-costly").cost(4);
    node.register_item(Arc::new(item)).unwrap();
    assert!(eventually(|| node.metrics().quantiser_exceeded.get() == 1).await);
}

#[tokio::test]
async fn lock_table_is_empty_after_elections() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let ids: Vec<ItemId> = (0..8u8)
        .map(|i| {
            let item = TestItem::new(&[b'x', i]);
            let id = item.id();
            node.register_item(Arc::new(item)).unwrap();
            id
        })
        .collect();
    for id in &ids {
        node.wait_item(id, WAIT).await.unwrap();
    }

    assert!(eventually(|| node.active_elections() == 0).await);
    node.sweep();
    assert_eq!(node.item_lock_size(), 0);
}

#[tokio::test]
async fn sweep_drops_expired_records() {
    let cluster = Cluster::start(1).await;
    let stale = ItemId::of(b"stale-record");
    cluster
        .ledger(1)
        .insert(stale, ItemState::Declined, Timestamp::new(1));

    let stats = cluster.node(1).sweep();
    assert_eq!(stats.records, 1);
    assert_eq!(cluster.ledger(1).state_of(&stale), None);
}

#[tokio::test]
async fn shutdown_refuses_new_items() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    node.shutdown().await;

    assert!(node.is_shutting_down());
    assert!(matches!(
        node.register_item(Arc::new(TestItem::new(b"late"))),
        Err(NodeError::ShuttingDown)
    ));
}

#[tokio::test]
async fn metrics_render_as_text() {
    let cluster = Cluster::start(1).await;
    let node = cluster.node(1);
    let item = TestItem::new(b"counted");
    let id = item.id();
    node.register_item(Arc::new(item)).unwrap();
    node.wait_item(&id, WAIT).await.unwrap();

    let text = node.metrics().encode_text().unwrap();
    assert!(text.contains("quorum_items_registered_total 1"));
    assert!(text.contains("quorum_elections_approved_total 1"));
}
