use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("quantiser limit {limit} exceeded: {spent} spent, {requested} requested")]
    QuantiserExceeded { limit: u64, spent: u64, requested: u64 },

    #[error("resync inconclusive: {0}")]
    ResyncInconclusive(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid consensus config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}
