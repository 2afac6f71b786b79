//! Top-level error type shared across crates.

use thiserror::Error;

/// Errors raised while parsing or converting fundamental types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuorumError {
    #[error("invalid item id: {0}")]
    InvalidItemId(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("unknown item state ordinal {0}")]
    UnknownState(u8),

    #[error("{0}")]
    Other(String),
}
