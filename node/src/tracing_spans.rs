//! Pre-built [`tracing::Span`] constructors for common node operations.
//!
//! Using consistent span names and field sets across the codebase makes it
//! easy to filter, search, and correlate traces of one item across nodes.

use quorum_types::{ItemId, NodeId};
use tracing::{info_span, Span};

/// Span covering one election, from lock acquisition to release.
pub fn election_span(local: NodeId, item: &ItemId) -> Span {
    info_span!("election", node = %local, item = %item.short())
}

/// Span covering a resync of `count` dependencies of `item`.
pub fn resync_span(item: &ItemId, count: usize) -> Span {
    info_span!("resync", item = %item.short(), deps = count)
}

/// Span covering the handling of a single inbound notification.
pub fn notification_span(local: NodeId, peer: NodeId, kind: &str) -> Span {
    info_span!("notification", node = %local, peer = %peer, kind = %kind)
}

/// Span covering the processing of one parcel.
pub fn parcel_span(local: NodeId, parcel: &ItemId) -> Span {
    info_span!("parcel", node = %local, parcel = %parcel.short())
}

/// Span covering the broadcast of a notification to the roster.
pub fn broadcast_span(kind: &str, peer_count: usize) -> Span {
    info_span!("broadcast", kind = %kind, peer_count = %peer_count)
}
