//! Budgeted removal of poorly scoring contracts.
//!
//! Score-based !GFR demotions are *suggested* by the utility checks and
//! admitted here against a per-period byte budget, so one bad scoring
//! period cannot expel the whole contract set at once.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use stratus_common::BlockHeight;
use tracing::debug;

/// Persisted slice of the limiter state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChurnPersist {
    pub aggregate_current_period_churn: u64,
    pub remaining_churn_budget: i128,
}

#[derive(Debug, Default)]
struct ChurnInner {
    /// Bytes churned so far this period.
    aggregate: u64,
    /// Bytes the limiter will allow right now; may go negative after a
    /// large-contract carve-out.
    remaining: i128,
    max_period_churn: u64,
    period: BlockHeight,
}

#[derive(Debug, Default)]
pub struct ChurnLimiter {
    inner: Mutex<ChurnInner>,
}

impl ChurnLimiter {
    pub fn new() -> Self {
        ChurnLimiter::default()
    }

    pub fn from_persist(persist: &ChurnPersist) -> Self {
        let limiter = ChurnLimiter::new();
        {
            let mut inner = limiter.lock();
            inner.aggregate = persist.aggregate_current_period_churn;
            inner.remaining = persist.remaining_churn_budget;
        }
        limiter
    }

    pub fn persist(&self) -> ChurnPersist {
        let inner = self.lock();
        ChurnPersist {
            aggregate_current_period_churn: inner.aggregate,
            remaining_churn_budget: inner.remaining,
        }
    }

    /// Called whenever the allowance changes.
    pub fn set_allowance(&self, max_period_churn: u64, period: BlockHeight) {
        let mut inner = self.lock();
        inner.max_period_churn = max_period_churn;
        inner.period = period;
    }

    /// Grows the budget for newly applied blocks, capped at half the
    /// period's allowance so a quiet stretch never banks a whole period.
    pub fn blocks_applied(&self, num_blocks: u64) {
        let mut inner = self.lock();
        if inner.period == 0 {
            return;
        }
        let cap = (inner.max_period_churn / 2) as i128;
        let gained = (num_blocks as u128 * inner.max_period_churn as u128
            / inner.period as u128) as i128;
        inner.remaining = (inner.remaining + gained).min(cap);
    }

    /// Period rollover: the aggregate counter starts over.
    pub fn reset_aggregate(&self) {
        let mut inner = self.lock();
        debug!(
            churned = inner.aggregate,
            "Resetting aggregate churn for new period"
        );
        inner.aggregate = 0;
    }

    /// Whether a contract of `size` bytes may be churned right now.
    pub fn can_churn(&self, size: u64) -> bool {
        let inner = self.lock();
        let cap = (inner.max_period_churn / 2) as i128;
        // A contract larger than the instantaneous budget is still allowed
        // when the budget is fully topped up, otherwise it could never be
        // churned at all.
        let budget_ok = inner.remaining - size as i128 >= 0 || inner.remaining == cap;
        // Same carve-out against the period aggregate: the first churn of a
        // period may exceed it.
        let aggregate_ok = inner
            .max_period_churn
            .checked_sub(inner.aggregate)
            .is_some_and(|left| left >= size)
            || inner.aggregate == 0;
        budget_ok && aggregate_ok
    }

    /// Records an admitted churn decision.
    pub fn record_churn(&self, size: u64) {
        let mut inner = self.lock();
        inner.aggregate += size;
        inner.remaining -= size as i128;
    }

    pub fn aggregate(&self) -> u64 {
        self.lock().aggregate
    }

    pub fn remaining_budget(&self) -> i128 {
        self.lock().remaining
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChurnInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn limiter(max_churn: u64, period: BlockHeight) -> ChurnLimiter {
        let limiter = ChurnLimiter::new();
        limiter.set_allowance(max_churn, period);
        limiter
    }

    #[test]
    fn budget_accrues_per_block_and_caps_at_half() {
        let limiter = limiter(100 * MIB, 100);
        limiter.blocks_applied(10);
        assert_eq!(limiter.remaining_budget(), (10 * MIB) as i128);
        // Far more blocks than the period: capped at half the allowance.
        limiter.blocks_applied(1_000);
        assert_eq!(limiter.remaining_budget(), (50 * MIB) as i128);
    }

    #[test]
    fn churn_decrements_both_counters() {
        let limiter = limiter(100 * MIB, 100);
        limiter.blocks_applied(50);
        assert!(limiter.can_churn(20 * MIB));
        limiter.record_churn(20 * MIB);
        assert_eq!(limiter.aggregate(), 20 * MIB);
        assert_eq!(limiter.remaining_budget(), (30 * MIB) as i128);
    }

    #[test]
    fn large_contract_carve_out_requires_full_budget() {
        let limiter = limiter(100 * MIB, 100);
        limiter.blocks_applied(10_000); // budget at cap (50 MiB)
        // Bigger than the instantaneous budget, but the budget is topped up.
        assert!(limiter.can_churn(80 * MIB));
        limiter.record_churn(80 * MIB);
        // Budget went negative; nothing further fits.
        assert!(limiter.remaining_budget() < 0);
        assert!(!limiter.can_churn(MIB));
    }

    #[test]
    fn first_churn_carve_out_only_when_aggregate_is_zero() {
        let limiter = limiter(10 * MIB, 100);
        limiter.blocks_applied(10_000); // cap = 5 MiB
        // First churn may exceed the whole period budget.
        assert!(limiter.can_churn(40 * MIB));
        limiter.record_churn(40 * MIB);
        // With prior churn this period, the aggregate limit binds.
        limiter.blocks_applied(10_000);
        assert!(!limiter.can_churn(MIB));
    }

    #[test]
    fn aggregate_resets_on_period_rollover() {
        let limiter = limiter(10 * MIB, 10);
        limiter.blocks_applied(10_000);
        limiter.record_churn(5 * MIB);
        limiter.record_churn(5 * MIB);
        assert!(!limiter.can_churn(MIB));

        limiter.reset_aggregate();
        limiter.blocks_applied(10_000);
        assert!(limiter.can_churn(MIB));
    }

    #[test]
    fn zero_period_accrues_nothing() {
        let limiter = limiter(10 * MIB, 0);
        limiter.blocks_applied(100);
        assert_eq!(limiter.remaining_budget(), 0);
    }

    #[test]
    fn persist_roundtrip() {
        let limiter = limiter(10 * MIB, 10);
        limiter.blocks_applied(5);
        limiter.record_churn(MIB);
        let persist = limiter.persist();
        let restored = ChurnLimiter::from_persist(&persist);
        assert_eq!(restored.aggregate(), limiter.aggregate());
        assert_eq!(restored.remaining_budget(), limiter.remaining_budget());
    }
}
