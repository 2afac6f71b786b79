//! Quantiser: bounds the work one validation may cost.
//!
//! Every expensive step of an item check reports its price here. Once the
//! running sum would pass the limit, the check is aborted and the item ends
//! up `UNDEFINED` on this node, not `DECLINED`.

use crate::ConsensusError;

/// Fixed prices of validation steps, in quanta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantiserPrice {
    /// Signature check with a 2048-bit key.
    SignatureCheck2048,
    /// Signature check with a 4096-bit key.
    SignatureCheck4096,
    /// Simple role/permission check.
    SimplePermission,
    /// Split-join (amount-aware) permission check.
    SplitJoinPermission,
    /// Revoking one version of a contract.
    RevokeVersion,
    /// Registering one new version of a contract.
    RegisterVersion,
    /// Checking one referenced version of a contract.
    CheckVersion,
}

impl QuantiserPrice {
    pub fn cost(self) -> u64 {
        match self {
            QuantiserPrice::SignatureCheck2048 => 1,
            QuantiserPrice::SignatureCheck4096 => 8,
            QuantiserPrice::SimplePermission => 1,
            QuantiserPrice::SplitJoinPermission => 2,
            QuantiserPrice::RevokeVersion => 20,
            QuantiserPrice::RegisterVersion => 20,
            QuantiserPrice::CheckVersion => 1,
        }
    }
}

/// Monotonic cost meter with an optional ceiling.
///
/// One instance is created per validation attempt and passed down the call
/// chain, so concurrent validations never share a budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quantiser {
    sum: u64,
    limit: Option<u64>,
}

impl Quantiser {
    pub fn new(limit: Option<u64>) -> Self {
        Self { sum: 0, limit }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Start a new validation attempt.
    pub fn reset(&mut self, limit: Option<u64>) {
        self.sum = 0;
        self.limit = limit;
    }

    pub fn add_work_cost(&mut self, price: QuantiserPrice) -> Result<(), ConsensusError> {
        self.add_work_cost_units(price.cost())
    }

    /// Add raw quanta. A failing call leaves the sum unchanged.
    pub fn add_work_cost_units(&mut self, units: u64) -> Result<(), ConsensusError> {
        let next = self.sum.saturating_add(units);
        if let Some(limit) = self.limit {
            if next > limit {
                return Err(ConsensusError::QuantiserExceeded {
                    limit,
                    spent: self.sum,
                    requested: units,
                });
            }
        }
        self.sum = next;
        Ok(())
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Quanta left before the limit; `None` when unlimited.
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|l| l.saturating_sub(self.sum))
    }
}

impl Default for Quantiser {
    fn default() -> Self {
        Self::unlimited()
    }
}
