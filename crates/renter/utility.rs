//! Contract utility checks.
//!
//! Maintenance runs these in a fixed order per contract; the first check
//! that triggers decides the contract's new utility. Most decisions are
//! *necessary* and applied immediately; the score-based !GFR demotion is
//! only *suggested* and must pass the churn limiter first.

use stratus_common::{
    BlockHeight, SECTOR_SIZE, U256,
    types::{ContractUtility, HostEntry, RenterContract},
};

/// Fraction of the median host score below which a contract loses GFR.
pub const MIN_SCORE_GFR_DIV: u64 = 500;
/// Fraction of the median host score below which a contract loses GFU.
pub const MIN_SCORE_GFU_DIV: u64 = 40;
/// Blocks to wait before retrying a host that reported out-of-storage.
pub const OOS_RETRY_INTERVAL: BlockHeight = 144;
/// A contract keeps GFU only while its remaining funds exceed this
/// fraction (1/20) of its total cost.
pub const MIN_FUND_UPLOAD_DIV: u64 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    /// Applied unconditionally.
    Necessary,
    /// Routed through the churn limiter before being applied.
    Suggested,
}

#[derive(Clone, Debug)]
pub struct UtilityUpdate {
    pub utility: ContractUtility,
    pub kind: UpdateKind,
    pub reason: &'static str,
}

pub struct UtilityContext<'a> {
    pub contract: &'a RenterContract,
    pub host: Option<&'a HostEntry>,
    pub score: Option<U256>,
    pub min_score_gfr: Option<U256>,
    pub min_score_gfu: Option<U256>,
    pub height: BlockHeight,
    pub renew_window: BlockHeight,
    /// The contract already has a successor in the renewed-to map.
    pub renewed: bool,
    /// The host database flagged this host as sharing a subnet with
    /// another contracted host.
    pub ip_violation: bool,
    /// Payment contracts may store zero bytes and are exempt from the
    /// score-based GFR demotion.
    pub payment_contract: bool,
}

/// Runs the checks in order; returns the first triggered update, or None
/// when the contract's utility should stay as it is.
pub fn check_utility(ctx: &UtilityContext<'_>) -> Option<UtilityUpdate> {
    let current = &ctx.contract.utility;
    if current.locked {
        return None;
    }

    // renewedCheck
    if ctx.renewed {
        return Some(update(current, false, false, false, UpdateKind::Necessary, "renewed"));
    }
    // maxRevisionCheck
    if ctx.contract.revision_number() == u64::MAX {
        return Some(update(
            current,
            false,
            false,
            true,
            UpdateKind::Necessary,
            "revision number at maximum",
        ));
    }
    // badContractCheck
    if current.bad_contract {
        return Some(update(current, false, false, false, UpdateKind::Necessary, "bad contract"));
    }
    // offlineCheck
    let Some(host) = ctx.host else {
        return Some(update(current, false, false, false, UpdateKind::Necessary, "host unknown"));
    };
    if !host.online {
        return Some(update(current, false, false, false, UpdateKind::Necessary, "host offline"));
    }
    // ipViolationCheck
    if ctx.ip_violation {
        return Some(update(current, false, false, false, UpdateKind::Necessary, "ip violation"));
    }
    // upForRenewalCheck
    if ctx.height + ctx.renew_window >= ctx.contract.end_height {
        return Some(update(current, false, true, false, UpdateKind::Necessary, "up for renewal"));
    }
    // sufficientFundsCheck
    let funds = ctx.contract.renter_funds();
    let sector_price = sector_price(host, ctx.contract.end_height, ctx.height);
    let below_sector_floor = funds < sector_price * 3u64;
    let below_fraction = funds * MIN_FUND_UPLOAD_DIV < ctx.contract.total_cost;
    if below_sector_floor || below_fraction {
        return Some(update(current, false, true, false, UpdateKind::Necessary, "low funds"));
    }
    // outOfStorageCheck
    if current.last_oos_err > 0 && ctx.height.saturating_sub(current.last_oos_err) <= OOS_RETRY_INTERVAL
    {
        return Some(update(current, false, true, false, UpdateKind::Necessary, "out of storage"));
    }
    // hostScoreCheck
    if let Some(score) = ctx.score {
        if score <= U256::one() {
            return Some(update(current, false, false, false, UpdateKind::Necessary, "zero score"));
        }
        if let Some(gfr_floor) = ctx.min_score_gfr {
            if score < gfr_floor && !ctx.payment_contract {
                return Some(update(
                    current,
                    false,
                    false,
                    false,
                    UpdateKind::Suggested,
                    "score below renew floor",
                ));
            }
        }
        if let Some(gfu_floor) = ctx.min_score_gfu {
            if score < gfu_floor {
                return Some(update(
                    current,
                    false,
                    true,
                    false,
                    UpdateKind::Necessary,
                    "score below upload floor",
                ));
            }
        }
    }
    None
}

/// Cost of storing and transferring one sector for the remainder of the
/// contract.
pub fn sector_price(host: &HostEntry, end_height: BlockHeight, height: BlockHeight) -> U256 {
    let remaining = end_height.saturating_sub(height);
    host.settings.storage_price * SECTOR_SIZE * remaining
        + host.settings.upload_bandwidth_price * SECTOR_SIZE
        + host.settings.download_bandwidth_price * SECTOR_SIZE
}

/// Floors for GFR and GFU from the scores of the currently active hosts:
/// a fraction of the median, with separate factors.
pub fn min_scores(scores: &[U256]) -> (Option<U256>, Option<U256>) {
    if scores.is_empty() {
        return (None, None);
    }
    let mut sorted = scores.to_vec();
    sorted.sort();
    let median = sorted[sorted.len() / 2];
    (
        Some(median / MIN_SCORE_GFR_DIV),
        Some(median / MIN_SCORE_GFU_DIV),
    )
}

fn update(
    current: &ContractUtility,
    gfu: bool,
    gfr: bool,
    locked: bool,
    kind: UpdateKind,
    reason: &'static str,
) -> UtilityUpdate {
    UtilityUpdate {
        utility: ContractUtility {
            good_for_upload: gfu,
            good_for_renew: gfr,
            locked: current.locked || locked,
            ..current.clone()
        },
        kind,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::host_entry;
    use stratus_common::{Currency, H256, types::{FileContractRevision, Output}};

    fn contract() -> RenterContract {
        let mut c = RenterContract {
            id: H256::from_low_u64_be(1),
            host_public_key: crate::testutil::host_key(1),
            start_height: 10,
            end_height: 200,
            total_cost: Currency::from(1_000_000u64),
            ..Default::default()
        };
        c.utility.good_for_upload = true;
        c.utility.good_for_renew = true;
        c.transaction.file_contract_revisions.push(FileContractRevision {
            parent_id: c.id,
            revision_number: 3,
            valid_proof_outputs: vec![
                Output {
                    // Plenty of funds relative to prices and total cost.
                    value: Currency::from(900_000_000_000u64),
                    unlock_hash: H256::zero(),
                },
                Output {
                    value: Currency::from(100u64),
                    unlock_hash: H256::zero(),
                },
            ],
            ..Default::default()
        });
        c.total_cost = Currency::from(1_000_000_000_000u64);
        c
    }

    fn ctx<'a>(contract: &'a RenterContract, host: &'a HostEntry) -> UtilityContext<'a> {
        UtilityContext {
            contract,
            host: Some(host),
            score: Some(U256::from(1_000_000u64)),
            min_score_gfr: Some(U256::from(100u64)),
            min_score_gfu: Some(U256::from(1_000u64)),
            height: 50,
            renew_window: 10,
            renewed: false,
            ip_violation: false,
            payment_contract: false,
        }
    }

    #[test]
    fn healthy_contract_needs_no_update() {
        let c = contract();
        let h = host_entry(1);
        assert!(check_utility(&ctx(&c, &h)).is_none());
    }

    #[test]
    fn locked_contracts_are_never_touched() {
        let mut c = contract();
        c.utility.locked = true;
        c.utility.bad_contract = true;
        let h = host_entry(1);
        assert!(check_utility(&ctx(&c, &h)).is_none());
    }

    #[test]
    fn renewed_contract_loses_both_flags() {
        let c = contract();
        let h = host_entry(1);
        let mut context = ctx(&c, &h);
        context.renewed = true;
        let update = check_utility(&context).expect("update");
        assert!(!update.utility.good_for_upload);
        assert!(!update.utility.good_for_renew);
        assert_eq!(update.kind, UpdateKind::Necessary);
        assert_eq!(update.reason, "renewed");
    }

    #[test]
    fn max_revision_locks_the_contract() {
        let mut c = contract();
        c.transaction.file_contract_revisions[0].revision_number = u64::MAX;
        let h = host_entry(1);
        let update = check_utility(&ctx(&c, &h)).expect("update");
        assert!(update.utility.locked);
        assert!(!update.utility.good_for_renew);
    }

    #[test]
    fn offline_host_disables_contract() {
        let c = contract();
        let mut h = host_entry(1);
        h.online = false;
        let update = check_utility(&ctx(&c, &h)).expect("update");
        assert!(!update.utility.good_for_upload);
        assert!(!update.utility.good_for_renew);
        assert_eq!(update.reason, "host offline");

        // Unknown host reads the same way.
        let mut context = ctx(&c, &h);
        context.host = None;
        assert_eq!(check_utility(&context).expect("update").reason, "host unknown");
    }

    #[test]
    fn ip_violation_disables_contract() {
        let c = contract();
        let h = host_entry(1);
        let mut context = ctx(&c, &h);
        context.ip_violation = true;
        let update = check_utility(&context).expect("update");
        assert!(!update.utility.good_for_upload);
        assert!(!update.utility.good_for_renew);
        assert_eq!(update.reason, "ip violation");
    }

    #[test]
    fn renewal_window_clears_gfu_keeps_gfr() {
        let c = contract();
        let h = host_entry(1);
        let mut context = ctx(&c, &h);
        context.height = 191; // 191 + 10 >= 200
        let update = check_utility(&context).expect("update");
        assert!(!update.utility.good_for_upload);
        assert!(update.utility.good_for_renew);
        assert_eq!(update.reason, "up for renewal");
    }

    #[test]
    fn low_funds_clear_gfu() {
        let mut c = contract();
        c.transaction.file_contract_revisions[0].valid_proof_outputs[0].value =
            Currency::from(1u64);
        let h = host_entry(1);
        let update = check_utility(&ctx(&c, &h)).expect("update");
        assert!(!update.utility.good_for_upload);
        assert!(update.utility.good_for_renew);
        assert_eq!(update.reason, "low funds");
    }

    #[test]
    fn recent_oos_clears_gfu_until_retry_interval() {
        let mut c = contract();
        c.utility.last_oos_err = 40;
        let h = host_entry(1);
        let update = check_utility(&ctx(&c, &h)).expect("update");
        assert_eq!(update.reason, "out of storage");
        assert!(update.utility.good_for_renew);

        // Past the retry interval the check no longer triggers.
        let mut context = ctx(&c, &h);
        context.height = 40 + OOS_RETRY_INTERVAL + 1;
        assert!(check_utility(&context).is_none());
    }

    #[test]
    fn score_floors_tier_the_demotions() {
        let c = contract();
        let h = host_entry(1);

        // Score of one: hard disable.
        let mut context = ctx(&c, &h);
        context.score = Some(U256::one());
        let update = check_utility(&context).expect("update");
        assert_eq!(update.kind, UpdateKind::Necessary);
        assert!(!update.utility.good_for_renew);

        // Below the GFR floor: suggested, both flags off.
        let mut context = ctx(&c, &h);
        context.score = Some(U256::from(50u64));
        let update = check_utility(&context).expect("update");
        assert_eq!(update.kind, UpdateKind::Suggested);
        assert!(!update.utility.good_for_renew);

        // A payment contract is exempt from the GFR demotion but still
        // loses GFU below the upload floor.
        let mut context = ctx(&c, &h);
        context.score = Some(U256::from(50u64));
        context.payment_contract = true;
        let update = check_utility(&context).expect("update");
        assert_eq!(update.kind, UpdateKind::Necessary);
        assert!(update.utility.good_for_renew);
        assert!(!update.utility.good_for_upload);

        // Between the floors: GFU-only demotion.
        let mut context = ctx(&c, &h);
        context.score = Some(U256::from(500u64));
        let update = check_utility(&context).expect("update");
        assert_eq!(update.kind, UpdateKind::Necessary);
        assert!(update.utility.good_for_renew);
        assert!(!update.utility.good_for_upload);
    }

    #[test]
    fn min_scores_derive_from_median() {
        let scores: Vec<U256> = [100_000u64, 200_000, 300_000, 400_000, 500_000]
            .iter()
            .map(|&s| U256::from(s))
            .collect();
        let (gfr, gfu) = min_scores(&scores);
        assert_eq!(gfr, Some(U256::from(300_000u64 / MIN_SCORE_GFR_DIV)));
        assert_eq!(gfu, Some(U256::from(300_000u64 / MIN_SCORE_GFU_DIV)));
        assert_eq!(min_scores(&[]), (None, None));
    }
}
