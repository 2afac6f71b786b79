//! Content-address of an item.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::QuorumError;

type Blake2b256 = Blake2b<U32>;

/// A 32-byte Blake2b digest identifying an item by its content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId([u8; 32]);

impl ItemId {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash `content` into an id.
    pub fn of(content: &[u8]) -> Self {
        Self::of_parts(&[content])
    }

    /// Hash several byte slices as one stream (used for composite ids such as parcels).
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Blake2b256::new();
        for part in parts {
            hasher.update(part);
        }
        let result = hasher.finalize();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        Self(output)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, QuorumError> {
        let bytes = hex::decode(s).map_err(|e| QuorumError::InvalidItemId(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| QuorumError::InvalidItemId(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(arr))
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({}\u{2026})", self.short())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
