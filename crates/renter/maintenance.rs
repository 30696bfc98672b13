//! The contractor's maintenance round.
//!
//! Runs after every synced consensus change and on allowance changes:
//! archives dead contracts, recomputes utilities (routing suggested score
//! demotions through the churn limiter), forms contracts up to the target
//! host count, and processes renewals and refreshes sequentially.

use stratus_common::U256;
use stratus_common::types::{ContractUtility, RenterContract};
use tracing::{debug, info, warn};

use crate::{
    alerts::AlertSeverity,
    contractor::{
        ALERT_ALLOWANCE_LOW_FUNDS, ALERT_MODULE, ALERT_RENEWAL_FAILURE, ALERT_WALLET_LOCKED,
        Contractor, MAX_RENEWAL_FAILURES,
    },
    error::ContractorError,
    formation::{self, MIN_FUND_REFRESH_DIV},
    utility::{self, UpdateKind, UtilityContext},
};

pub(crate) async fn run(c: &Contractor) {
    let allowance = c.allowance();
    if allowance.is_empty() || !c.synced() {
        return;
    }

    // A locked wallet cannot sign anything this round.
    match c.state.wallet.unlocked().await {
        Ok(true) => c.state.alerter.unregister(ALERT_MODULE, ALERT_WALLET_LOCKED),
        Ok(false) | Err(_) => {
            warn!("Wallet locked; skipping contract maintenance");
            c.state.alerter.register(
                ALERT_MODULE,
                ALERT_WALLET_LOCKED,
                "the wallet must be unlocked before contracts can be signed",
                AlertSeverity::Warning,
            );
            return;
        }
    }

    archive_contracts(c).await;
    update_utilities(c).await;

    let mut low_funds = false;

    // Form new contracts up to the target host count.
    let gfr_count = c
        .contracts()
        .iter()
        .filter(|v| v.utility.good_for_renew)
        .count();
    let needed = (allowance.hosts as usize).saturating_sub(gfr_count);
    match formation::form_contracts(c, needed).await {
        Ok(formed) if formed > 0 => info!(formed, "Formed new contracts"),
        Ok(_) => {}
        Err(ContractorError::InsufficientAllowance) => low_funds = true,
        Err(e) => warn!(err = %e, "Contract formation round failed"),
    }

    // Renewals and refreshes, sequentially.
    if let Err(ContractorError::InsufficientAllowance) = process_renewals(c).await {
        low_funds = true;
    }

    if low_funds {
        c.state.alerter.register(
            ALERT_MODULE,
            ALERT_ALLOWANCE_LOW_FUNDS,
            "the allowance has insufficient remaining funds for this period",
            AlertSeverity::Warning,
        );
    } else {
        c.state
            .alerter
            .unregister(ALERT_MODULE, ALERT_ALLOWANCE_LOW_FUNDS);
    }

    if let Err(e) = c.save() {
        warn!(err = %e, "Failed to persist contractor state after maintenance");
    }
}

/// Moves expired, renewed and double-spent contracts out of the active set.
async fn archive_contracts(c: &Contractor) {
    let height = c.block_height();
    let double_spent: Vec<_> = {
        let mut pending = c
            .state
            .pending_double_spends
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.drain().collect()
    };

    for (id, ds_height) in double_spent {
        if !c.state.set.contains(&id) {
            continue;
        }
        warn!(contract = %id, height = ds_height, "Abandoning double-spent contract");
        if let Ok(mut acquired) = c.state.set.acquire(&id).await {
            let mut utility = acquired.metadata().utility.clone();
            utility.good_for_upload = false;
            utility.good_for_renew = false;
            utility.bad_contract = true;
            let _ = acquired.set_utility(utility);
        }
        if let Ok(removed) = c.state.set.remove(&id).await {
            let mut inner = c.write();
            inner.double_spent.insert(id, ds_height);
            inner.old_contracts.insert(id, removed);
        }
    }

    for id in c.state.set.ids() {
        let Some(view) = c.state.set.view(&id) else {
            continue;
        };
        let renewed = c.read().renewed_to.contains_key(&id);
        if view.end_height < height || renewed {
            match c.state.set.remove(&id).await {
                Ok(removed) => {
                    debug!(contract = %id, renewed, "Archiving contract");
                    let mut inner = c.write();
                    inner.old_contracts.insert(id, removed);
                }
                Err(e) => warn!(contract = %id, err = %e, "Failed to archive contract"),
            }
        }
    }
}

/// Runs the utility checks over every active contract; necessary updates
/// apply immediately, suggested !GFR demotions go through the churn
/// limiter in ascending score order.
async fn update_utilities(c: &Contractor) {
    let allowance = c.allowance();
    let (height, renew_window) = (c.block_height(), allowance.renew_window);

    // Score floors derive from the currently active host set.
    let mut scores = Vec::new();
    if let Ok(active_hosts) = c.state.hostdb.active_hosts().await {
        for entry in &active_hosts {
            if let Ok(breakdown) = c.state.hostdb.score_breakdown(entry) {
                scores.push(breakdown.score);
            }
        }
    }
    let (min_score_gfr, min_score_gfu) = utility::min_scores(&scores);

    // Hosts sharing a subnet with another contracted host get disabled.
    let contracted_keys: Vec<_> = c
        .contracts()
        .iter()
        .map(|v| v.host_public_key)
        .collect();
    let ip_violations = c
        .state
        .hostdb
        .check_for_ip_violations(&contracted_keys)
        .await
        .unwrap_or_default();

    // (score, id, size, target utility) for churn-limited demotions.
    let mut suggested: Vec<(U256, RenterContract, ContractUtility)> = Vec::new();

    for id in c.state.set.ids() {
        let Some(view) = c.state.set.view(&id) else {
            continue;
        };
        if view.utility.locked {
            continue;
        }
        let host = match c.state.hostdb.host(&view.host_public_key).await {
            Ok(host) => host,
            Err(_) => None,
        };
        let score = host
            .as_ref()
            .and_then(|h| c.state.hostdb.score_breakdown(h).ok())
            .map(|b| b.score);
        let renewed = c.read().renewed_to.contains_key(&id);
        let payment_contract =
            allowance.payment_contract_initial_funding.is_some() && view.file_size() == 0;

        let context = UtilityContext {
            contract: &view,
            host: host.as_ref(),
            score,
            min_score_gfr,
            min_score_gfu,
            height,
            renew_window,
            renewed,
            ip_violation: ip_violations.contains(&view.host_public_key),
            payment_contract,
        };
        match utility::check_utility(&context) {
            None => {
                // Nothing failed: the contract is fully usable again.
                let target = ContractUtility {
                    good_for_upload: true,
                    good_for_renew: true,
                    ..view.utility.clone()
                };
                if target != view.utility {
                    apply_utility(c, &view, target, "healthy").await;
                }
            }
            Some(update) => match update.kind {
                UpdateKind::Necessary => {
                    if update.utility != view.utility {
                        apply_utility(c, &view, update.utility, update.reason).await;
                    }
                }
                UpdateKind::Suggested => {
                    // An already-demoted contract is not queued again, so
                    // it cannot count against the budget twice.
                    if update.utility != view.utility {
                        suggested.push((score.unwrap_or_default(), view, update.utility));
                    }
                }
            },
        }
    }

    // Worst hosts churn first; refused candidates keep GFR until the next
    // maintenance pass.
    suggested.sort_by_key(|(score, _, _)| *score);
    for (_, view, target) in suggested {
        let size = view.file_size();
        if c.state.churn.can_churn(size) {
            c.state.churn.record_churn(size);
            info!(contract = %view.id, size, "Churning low-score contract");
            apply_utility(c, &view, target, "score below renew floor").await;
        } else {
            debug!(contract = %view.id, size, "Churn budget exhausted, keeping contract usable");
        }
    }
}

async fn apply_utility(
    c: &Contractor,
    view: &RenterContract,
    target: ContractUtility,
    reason: &str,
) {
    debug!(contract = %view.id, reason, gfu = target.good_for_upload, gfr = target.good_for_renew, "Updating contract utility");
    if let Err(e) = c.state.set.update_utility(&view.id, target).await {
        warn!(contract = %view.id, err = %e, "Failed to update contract utility");
    }
}

/// Partitions contracts inside the renew window into renewals and
/// refreshes, then processes them one at a time.
async fn process_renewals(c: &Contractor) -> Result<(), ContractorError> {
    let allowance = c.allowance();
    let height = c.block_height();
    let mut insufficient = false;

    let up_for_renewal: Vec<RenterContract> = c
        .contracts()
        .into_iter()
        .filter(|v| v.utility.good_for_renew && !v.utility.locked)
        .filter(|v| height + allowance.renew_window >= v.end_height)
        .filter(|v| !c.read().renewed_to.contains_key(&v.id))
        .collect();

    for view in up_for_renewal {
        // Low remaining funds mean the contract gets refreshed (replaced
        // with more funds at the same end height) instead of renewed.
        let refresh = view.renter_funds() * MIN_FUND_REFRESH_DIV < view.total_cost;
        match formation::renew_or_refresh(c, &view, refresh).await {
            Ok(new_id) => {
                debug!(old = %view.id, new = %new_id, refresh, "Renewal complete");
                c.write().renewal_failures.remove(&view.id);
                c.state
                    .alerter
                    .unregister(ALERT_MODULE, ALERT_RENEWAL_FAILURE);
            }
            Err(ContractorError::InsufficientAllowance) => {
                insufficient = true;
            }
            Err(e) => {
                let failures = {
                    let mut inner = c.write();
                    let failures = inner.renewal_failures.entry(view.id).or_insert(0);
                    *failures += 1;
                    *failures
                };
                warn!(contract = %view.id, err = %e, failures, "Renewal failed");
                let severity = if failures >= MAX_RENEWAL_FAILURES {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                };
                c.state.alerter.register(
                    ALERT_MODULE,
                    ALERT_RENEWAL_FAILURE,
                    &format!("contract {:#x} failed to renew: {e}", view.id),
                    severity,
                );
            }
        }
    }

    if insufficient {
        Err(ContractorError::InsufficientAllowance)
    } else {
        Ok(())
    }
}
