//! Static peer descriptors and the roster of known nodes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::QuorumError;

/// Numeric identity of a node within the roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A peer as loaded from the roster at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    /// Raw public key bytes, hex-encoded in config files.
    #[serde(
        serialize_with = "serialize_hex",
        deserialize_with = "deserialize_hex",
        default
    )]
    pub public_key: Vec<u8>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl NodeInfo {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: NodeId(id),
            name: name.into(),
            public_key: Vec::new(),
            addresses: Vec::new(),
        }
    }

    pub fn with_public_key_hex(mut self, key: &str) -> Result<Self, QuorumError> {
        self.public_key =
            hex::decode(key).map_err(|e| QuorumError::InvalidPublicKey(e.to_string()))?;
        Ok(self)
    }
}

fn serialize_hex<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

fn deserialize_hex<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    hex::decode(&s).map_err(serde::de::Error::custom)
}

/// The fixed set of nodes taking part in elections.
///
/// Kept sorted by id; config files may list nodes in any order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<NodeInfo>", into = "Vec<NodeInfo>")]
pub struct Roster {
    nodes: Vec<NodeInfo>,
}

impl From<Vec<NodeInfo>> for Roster {
    fn from(nodes: Vec<NodeInfo>) -> Self {
        Self::new(nodes)
    }
}

impl From<Roster> for Vec<NodeInfo> {
    fn from(roster: Roster) -> Self {
        roster.nodes
    }
}

impl Roster {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        let mut nodes = nodes;
        nodes.sort_by_key(|n| n.id);
        nodes.dedup_by_key(|n| n.id);
        Self { nodes }
    }

    /// A roster of `count` anonymous nodes with ids `1..=count`.
    pub fn numbered(count: u32) -> Self {
        Self::new(
            (1..=count)
                .map(|i| NodeInfo::new(i, format!("node{i}")))
                .collect(),
        )
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.binary_search_by_key(&id, |n| n.id).is_ok()
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes
            .binary_search_by_key(&id, |n| n.id)
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Every node except `local`.
    pub fn peers_of(&self, local: NodeId) -> Vec<NodeId> {
        self.ids().filter(|id| *id != local).collect()
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
