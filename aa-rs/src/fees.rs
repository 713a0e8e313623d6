use crate::error::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::types::{FeeConditions, GasFees, UserOperation};
use ethers::types::U256;
use std::sync::Arc;

const BPS: u64 = 10_000;

/// How fees are derived from the observed fee market. Multipliers are in basis
/// points (10_000 = 1x).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeePolicy {
    /// Headroom on the base fee. Clamped to at least 1x.
    pub base_fee_multiplier_bps: u64,
    pub priority_fee_multiplier_bps: u64,
    pub min_priority_fee: U256,
    /// Bump applied per attempt by [`FeePolicy::escalate`].
    pub bump_percent: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            // 2x the base fee covers several blocks of 12.5% increases.
            base_fee_multiplier_bps: 20_000,
            priority_fee_multiplier_bps: BPS,
            min_priority_fee: U256::zero(),
            bump_percent: 10,
        }
    }
}

fn apply_bps(n: U256, bps: u64) -> U256 {
    n.saturating_mul(U256::from(bps)) / U256::from(BPS)
}

pub fn increase_by_percent(n: U256, percent: u64) -> U256 {
    n.saturating_mul(U256::from(100 + percent)) / U256::from(100)
}

impl FeePolicy {
    pub fn derive(&self, conditions: FeeConditions) -> GasFees {
        let max_priority_fee_per_gas = apply_bps(
            conditions.suggested_priority_fee,
            self.priority_fee_multiplier_bps,
        )
        .max(self.min_priority_fee);
        let max_fee_per_gas = apply_bps(
            conditions.base_fee,
            self.base_fee_multiplier_bps.max(BPS),
        )
        .saturating_add(max_priority_fee_per_gas);

        GasFees {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }

    /// Fees for the `attempt`-th resubmission after an underpricing rejection.
    /// Attempt 0 returns `fees` unchanged.
    pub fn escalate(&self, fees: GasFees, attempt: u32) -> GasFees {
        (0..attempt).fold(fees, |f, _| GasFees {
            max_fee_per_gas: increase_by_percent(f.max_fee_per_gas, self.bump_percent),
            max_priority_fee_per_gas: increase_by_percent(
                f.max_priority_fee_per_gas,
                self.bump_percent,
            ),
        })
    }
}

/// Prices operations from the ledger's current fee market.
pub struct FeeEstimator<L: ?Sized> {
    ledger: Arc<L>,
    policy: FeePolicy,
}

impl<L: Ledger + ?Sized> FeeEstimator<L> {
    pub fn new(ledger: Arc<L>, policy: FeePolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    pub async fn estimate(&self) -> Result<GasFees> {
        let conditions = self
            .ledger
            .fee_conditions()
            .await
            .map_err(|e| PipelineError::FeeUnavailable(e.to_string()))?;
        let fees = self.policy.derive(conditions);
        tracing::debug!(
            base_fee = %conditions.base_fee,
            max_fee_per_gas = %fees.max_fee_per_gas,
            max_priority_fee_per_gas = %fees.max_priority_fee_per_gas,
            "estimated fees"
        );
        Ok(fees)
    }

    /// Writes freshly estimated fees into an unsigned operation.
    pub async fn price(&self, op: UserOperation) -> Result<UserOperation> {
        let fees = self.estimate().await?;
        Ok(op.with_fees(fees))
    }
}
