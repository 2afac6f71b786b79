//! Prometheus metrics for the quorum node.
//!
//! Exposes counters, gauges, and a histogram covering elections, votes,
//! resyncs and notification handling.  The [`NodeMetrics`] struct owns a
//! dedicated [`Registry`] so several nodes in one process (tests, local
//! simulations) never collide.

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge,
    Opts, Registry, TextEncoder,
};

use crate::NodeError;

/// Central collection of all node-level Prometheus metrics.
pub struct NodeMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Items submitted through `register_item`.
    pub items_registered: IntCounter,
    /// Elections (item processors) started.
    pub elections_started: IntCounter,
    pub elections_approved: IntCounter,
    pub elections_declined: IntCounter,
    /// Elections that hit `max_elections_time` without quorum.
    pub elections_timed_out: IntCounter,
    /// Votes received from roster peers.
    pub votes_received: IntCounter,
    pub resyncs_started: IntCounter,
    /// Resyncs that ended inconclusive and declined their item.
    pub resyncs_broken: IntCounter,
    /// Validations aborted by the quantiser.
    pub quantiser_exceeded: IntCounter,
    /// Inbound notifications ignored (unknown sender, malformed parcel).
    pub notifications_dropped: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Item processors currently running.
    pub active_elections: IntGauge,
    /// Parcel processors currently running.
    pub active_parcels: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Time from processor start to a committed verdict, in milliseconds.
    pub election_latency_ms: Histogram,
}

impl NodeMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Result<Self, NodeError> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            register_int_counter_with_registry!(Opts::new(name, help), registry)
        };

        let items_registered = counter("quorum_items_registered_total", "Items registered locally")?;
        let elections_started = counter("quorum_elections_started_total", "Elections started")?;
        let elections_approved =
            counter("quorum_elections_approved_total", "Elections ending approved")?;
        let elections_declined =
            counter("quorum_elections_declined_total", "Elections ending declined")?;
        let elections_timed_out = counter(
            "quorum_elections_timed_out_total",
            "Elections ending without quorum",
        )?;
        let votes_received = counter("quorum_votes_received_total", "Peer votes received")?;
        let resyncs_started = counter("quorum_resyncs_started_total", "Dependency resyncs started")?;
        let resyncs_broken = counter(
            "quorum_resyncs_broken_total",
            "Dependency resyncs ending inconclusive",
        )?;
        let quantiser_exceeded = counter(
            "quorum_quantiser_exceeded_total",
            "Validations aborted by the work quota",
        )?;
        let notifications_dropped = counter(
            "quorum_notifications_dropped_total",
            "Inbound notifications ignored",
        )?;

        let active_elections = register_int_gauge_with_registry!(
            Opts::new("quorum_active_elections", "Item processors currently running"),
            registry
        )?;
        let active_parcels = register_int_gauge_with_registry!(
            Opts::new("quorum_active_parcels", "Parcel processors currently running"),
            registry
        )?;

        // Exponential buckets covering 1 ms → ~16 s.
        let election_latency_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "quorum_election_latency_ms",
                "Election latency in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 15)?),
            registry
        )?;

        Ok(Self {
            registry,
            items_registered,
            elections_started,
            elections_approved,
            elections_declined,
            elections_timed_out,
            votes_received,
            resyncs_started,
            resyncs_broken,
            quantiser_exceeded,
            notifications_dropped,
            active_elections,
            active_parcels,
            election_latency_ms,
        })
    }

    /// All metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, NodeError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| NodeError::Config(e.to_string()))
    }
}
