//! Contract formation, renewal and refresh.

use stratus_common::{
    ContractId, Currency, H256,
    interfaces::TxPoolError,
    types::{
        ContractSpending, ContractUtility, FileContract, HostEntry, HostSettings, Output,
        RenterContract, Transaction,
    },
};
use tracing::{debug, info};

use crate::{
    contractor::Contractor,
    error::ContractorError,
    session::{self, FormContractRequest, RenewContractRequest},
    watchdog::MonitorContractArgs,
};

/// Funding clamps around `Funds / Hosts` for a single contract.
pub(crate) const MIN_INITIAL_CONTRACT_FUNDING_DIV: u64 = 20;
pub(crate) const MAX_INITIAL_CONTRACT_FUNDING_MUL: u64 = 10;
pub(crate) const MAX_INITIAL_CONTRACT_FUNDING_DIV: u64 = 3;
/// Cushion on the estimated formation fee.
pub(crate) const TXN_FEE_MULTIPLIER: u64 = 10;
/// Rough byte size of a formation transaction set, for fee estimation.
pub(crate) const ESTIMATED_FORMATION_TXN_SIZE: u64 = 2_000;
/// A contract refreshes rather than renews when its remaining funds fall
/// below this fraction (1/4) of its total cost.
pub(crate) const MIN_FUND_REFRESH_DIV: u64 = 4;

/// Funding for one new contract: the expected spend against this host
/// (contract price, cushioned fee, and this host's share of the expected
/// storage and transfer) clamped into `[initial/20, initial*10/3]` around
/// `initial = Funds / Hosts`. Returns None when even the clamped funding
/// cannot cover the host's contract price plus the cushioned fee.
pub(crate) fn contract_funding(
    allowance: &stratus_common::types::Allowance,
    settings: &HostSettings,
    txn_fee: Currency,
) -> Option<Currency> {
    let hosts = allowance.hosts.max(1);
    let initial = allowance.funds / hosts;
    let min = initial / MIN_INITIAL_CONTRACT_FUNDING_DIV;
    let max = initial * MAX_INITIAL_CONTRACT_FUNDING_MUL / MAX_INITIAL_CONTRACT_FUNDING_DIV;
    let fee_cushion = txn_fee * TXN_FEE_MULTIPLIER;

    let storage = settings.storage_price * (allowance.expected_storage / hosts) * allowance.period;
    let upload = settings.upload_bandwidth_price * (allowance.expected_upload / hosts);
    let download = settings.download_bandwidth_price * (allowance.expected_download / hosts);
    let target = settings.contract_price + fee_cushion + storage + upload + download;

    let funding = target.clamp(min, max);
    (funding > settings.contract_price + fee_cushion).then_some(funding)
}

pub(crate) async fn estimated_txn_fee(c: &Contractor) -> Result<Currency, ContractorError> {
    let (_, max_fee) = c.state.tpool.fee_estimate().await?;
    Ok(max_fee * ESTIMATED_FORMATION_TXN_SIZE)
}

/// Forms up to `needed` contracts with fresh hosts. Returns how many were
/// actually formed.
pub(crate) async fn form_contracts(c: &Contractor, needed: usize) -> Result<usize, ContractorError> {
    if needed == 0 {
        return Ok(0);
    }
    let allowance = c.allowance();
    let active = c.contracts();
    let excluded_keys: Vec<_> = active.iter().map(|v| v.host_public_key).collect();
    let excluded_addresses: Vec<_> = Vec::new();
    let candidates = c
        .state
        .hostdb
        .random_hosts(needed * 4 + 10, &excluded_keys, &excluded_addresses)
        .await?;
    let txn_fee = estimated_txn_fee(c).await?;

    let mut formed = 0;
    for host in candidates {
        if formed == needed {
            break;
        }
        if !host.settings.accepting_contracts || host.filtered {
            continue;
        }
        if let Err(e) = session::check_price_gates(&allowance, &host.settings) {
            debug!(host = %host.public_key, err = %e, "Host fails a price gate");
            continue;
        }
        let Some(funding) = contract_funding(&allowance, &host.settings, txn_fee) else {
            debug!(host = %host.public_key, "Funding cannot cover the host's prices");
            continue;
        };
        // Stay inside the allowance for the period.
        if c.read().period_spent + funding + txn_fee > allowance.funds {
            return Err(ContractorError::InsufficientAllowance);
        }
        match form_contract_with_host(c, &host, funding, txn_fee).await {
            Ok(id) => {
                info!(contract = %id, host = %host.public_key, %funding, "Formed contract");
                formed += 1;
            }
            Err(e @ ContractorError::Wallet(_)) => return Err(e),
            Err(e) => {
                debug!(host = %host.public_key, err = %e, "Contract formation failed");
                let _ = c
                    .state
                    .hostdb
                    .increment_failed_interactions(&host.public_key)
                    .await;
            }
        }
    }
    Ok(formed)
}

async fn form_contract_with_host(
    c: &Contractor,
    host: &HostEntry,
    funding: Currency,
    txn_fee: Currency,
) -> Result<ContractId, ContractorError> {
    let (allowance, height) = {
        let inner = c.read();
        (inner.allowance.clone(), inner.block_height)
    };
    let end_height = height + allowance.period;
    let window_start = end_height;
    let window_end = end_height + host.settings.window_size;

    let (txn_set, owned_inputs, contract_id) =
        build_contract_txn(c, host, funding, txn_fee, end_height, window_end).await?;

    let response = c
        .state
        .transport
        .form_contract(
            host,
            FormContractRequest {
                transaction_set: txn_set,
                contract_id,
            },
        )
        .await?;

    submit_set(c, response.transaction_set.clone()).await?;
    let (sweep_txn, sweep_parents) = build_sweep(c, owned_inputs, funding).await?;

    let revision_txn = Transaction {
        file_contract_revisions: vec![response.initial_revision],
        signatures: response.signatures,
        ..Default::default()
    };
    let contract = RenterContract {
        id: contract_id,
        host_public_key: host.public_key,
        start_height: height,
        end_height,
        transaction: revision_txn,
        spending: ContractSpending {
            fees: txn_fee + host.settings.contract_price,
            ..Default::default()
        },
        total_cost: funding + txn_fee,
        utility: ContractUtility {
            good_for_upload: true,
            good_for_renew: true,
            ..Default::default()
        },
    };
    c.state.set.insert(contract, Vec::new())?;
    c.state.watchdog.monitor_contract(MonitorContractArgs {
        id: contract_id,
        formation_txn_set: response.transaction_set,
        sweep_txn,
        sweep_parents,
        window_start,
        window_end,
    });
    {
        let mut inner = c.write();
        inner.period_spent += funding + txn_fee;
    }
    let _ = c
        .state
        .hostdb
        .increment_successful_interactions(&host.public_key)
        .await;
    Ok(contract_id)
}

/// Renews (successor for the next period) or refreshes (replacement with
/// more funds, same end height) one contract. Updates the renewed-from and
/// renewed-to maps atomically with the insertion of the successor.
pub(crate) async fn renew_or_refresh(
    c: &Contractor,
    old: &RenterContract,
    refresh: bool,
) -> Result<ContractId, ContractorError> {
    if !c.state.set.mark_renewing(&old.id) {
        return Err(ContractorError::ContractRenewing(old.id));
    }
    let result = renew_inner(c, old, refresh).await;
    c.state.set.clear_renewing(&old.id);
    result
}

async fn renew_inner(
    c: &Contractor,
    old: &RenterContract,
    refresh: bool,
) -> Result<ContractId, ContractorError> {
    let host = c
        .state
        .hostdb
        .host(&old.host_public_key)
        .await?
        .ok_or(ContractorError::NoContractWithHost(old.host_public_key))?;
    let allowance = c.allowance();
    session::check_price_gates(&allowance, &host.settings)?;
    let txn_fee = estimated_txn_fee(c).await?;

    // Renewals are funded like formations; a refresh re-funds with the
    // contract's own cost so heavy users grow their contracts over time.
    let funding = if refresh {
        let initial = allowance.funds / allowance.hosts.max(1);
        let max = initial * MAX_INITIAL_CONTRACT_FUNDING_MUL / MAX_INITIAL_CONTRACT_FUNDING_DIV;
        old.total_cost.min(max)
    } else {
        contract_funding(&allowance, &host.settings, txn_fee)
            .ok_or(ContractorError::InsufficientAllowance)?
    };
    if c.read().period_spent + funding + txn_fee > allowance.funds {
        return Err(ContractorError::InsufficientAllowance);
    }

    let height = c.block_height();
    let end_height = if refresh {
        old.end_height
    } else {
        height + allowance.period
    };
    let window_start = end_height;
    let window_end = end_height + host.settings.window_size;

    let (txn_set, owned_inputs, contract_id) =
        build_contract_txn(c, &host, funding, txn_fee, end_height, window_end).await?;

    let response = c
        .state
        .transport
        .renew_contract(
            &host,
            RenewContractRequest {
                transaction_set: txn_set,
                contract_id,
                renewed_from: old.id,
            },
        )
        .await?;

    submit_set(c, response.transaction_set.clone()).await?;
    let (sweep_txn, sweep_parents) = build_sweep(c, owned_inputs, funding).await?;

    let revision_txn = Transaction {
        file_contract_revisions: vec![response.initial_revision],
        signatures: response.signatures,
        ..Default::default()
    };
    let contract = RenterContract {
        id: contract_id,
        host_public_key: host.public_key,
        start_height: height,
        end_height,
        transaction: revision_txn,
        spending: ContractSpending {
            fees: txn_fee + host.settings.contract_price,
            ..Default::default()
        },
        total_cost: funding + txn_fee,
        utility: ContractUtility {
            good_for_upload: true,
            good_for_renew: true,
            ..Default::default()
        },
    };
    c.state.set.insert(contract, Vec::new())?;
    c.state.watchdog.monitor_contract(MonitorContractArgs {
        id: contract_id,
        formation_txn_set: response.transaction_set,
        sweep_txn,
        sweep_parents,
        window_start,
        window_end,
    });
    {
        let mut inner = c.write();
        inner.renewed_from.insert(contract_id, old.id);
        inner.renewed_to.insert(old.id, contract_id);
        inner.period_spent += funding + txn_fee;
    }
    info!(
        old = %old.id,
        new = %contract_id,
        refresh,
        "Contract renewed"
    );
    Ok(contract_id)
}

/// Builds and signs the renter half of a contract transaction. Returns the
/// signed set, the wallet-owned inputs (for the sweep) and the new
/// contract's id.
async fn build_contract_txn(
    c: &Contractor,
    host: &HostEntry,
    funding: Currency,
    txn_fee: Currency,
    end_height: u64,
    window_end: u64,
) -> Result<(Vec<Transaction>, Vec<stratus_common::types::Input>, ContractId), ContractorError> {
    let allowance = c.allowance();
    let renter_address = c.state.wallet.next_address().await?;
    let contract_price = host.settings.contract_price;
    let renter_payout = funding - contract_price;

    // Collateral the host is expected to commit for this contract's share
    // of the allowance, capped by its own maximum.
    let per_host_storage = allowance.expected_storage / allowance.hosts.max(1);
    let collateral = (host.settings.collateral * per_host_storage * allowance.period)
        .min(host.settings.max_collateral);

    let file_contract = FileContract {
        file_size: 0,
        file_merkle_root: H256::zero(),
        window_start: end_height,
        window_end,
        payout: renter_payout + collateral + contract_price,
        valid_proof_outputs: vec![
            Output {
                value: renter_payout,
                unlock_hash: renter_address,
            },
            Output {
                value: collateral + contract_price,
                unlock_hash: host_unlock_hash(host),
            },
        ],
        missed_proof_outputs: vec![
            Output {
                value: renter_payout,
                unlock_hash: renter_address,
            },
            Output {
                value: collateral + contract_price,
                unlock_hash: host_unlock_hash(host),
            },
        ],
        unlock_hash: renter_address,
        revision_number: 0,
    };

    let mut builder = c.state.wallet.start_transaction().await?;
    builder.fund(funding + txn_fee).await?;
    builder.add_file_contract(file_contract);
    builder.add_miner_fee(txn_fee);
    let owned_inputs = builder.mark_owned_inputs();
    let txn_set = builder.sign().await?;
    let contract_txn = txn_set
        .last()
        .ok_or_else(|| ContractorError::Wallet(stratus_common::interfaces::WalletError::Other(
            "builder returned an empty set".to_string(),
        )))?;
    let contract_id = contract_txn.file_contract_id(0);
    Ok((txn_set, owned_inputs, contract_id))
}

/// The precomputed sweep: re-spends the renter's formation inputs back to a
/// wallet address, abandoning the contract if it never confirms.
async fn build_sweep(
    c: &Contractor,
    owned_inputs: Vec<stratus_common::types::Input>,
    funding: Currency,
) -> Result<(Transaction, Vec<Transaction>), ContractorError> {
    let refund_address = c.state.wallet.next_address().await?;
    let unsigned = Transaction {
        inputs: owned_inputs,
        outputs: vec![Output {
            value: funding,
            unlock_hash: refund_address,
        }],
        ..Default::default()
    };
    let mut builder = c
        .state
        .wallet
        .register_transaction(unsigned, Vec::new())
        .await?;
    let mut signed = builder.sign().await?;
    let sweep_txn = signed
        .pop()
        .ok_or_else(|| ContractorError::Wallet(stratus_common::interfaces::WalletError::Other(
            "builder returned an empty sweep set".to_string(),
        )))?;
    Ok((sweep_txn, signed))
}

/// Watchdog-style idempotent submit.
async fn submit_set(c: &Contractor, set: Vec<Transaction>) -> Result<(), ContractorError> {
    match c.state.tpool.accept_transaction_set(set).await {
        Ok(()) | Err(TxPoolError::DuplicateTransactionSet) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn host_unlock_hash(host: &HostEntry) -> H256 {
    // Hosts are paid to an address derived from their public key.
    H256::from_slice(&host.public_key.as_bytes()[..32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{allowance, host_settings};

    #[test]
    fn funding_clamps_to_the_minimum_for_cheap_hosts() {
        let a = allowance();
        let settings = host_settings();
        let fee = Currency::from(10u64);
        // The expected spend against a cheap host sits far below the
        // minimum clamp of initial/20.
        let initial = a.funds / a.hosts;
        let funding = contract_funding(&a, &settings, fee).expect("funding");
        assert_eq!(funding, initial / MIN_INITIAL_CONTRACT_FUNDING_DIV);
    }

    #[test]
    fn funding_clamps_to_the_maximum_for_expensive_hosts() {
        let mut a = allowance();
        a.funds = Currency::from(10_000u64);
        let mut settings = host_settings();
        settings.storage_price = Currency::from(1_000_000u64);
        let fee = Currency::from(1u64);
        let initial = a.funds / a.hosts;
        let funding = contract_funding(&a, &settings, fee).expect("funding");
        assert_eq!(
            funding,
            initial * MAX_INITIAL_CONTRACT_FUNDING_MUL / MAX_INITIAL_CONTRACT_FUNDING_DIV
        );
    }

    #[test]
    fn funding_refused_when_clamped_below_host_floor() {
        let mut a = allowance();
        a.funds = Currency::from(10_000u64);
        let mut settings = host_settings();
        // Floor = contract price + fee * 10 = 5_000 + 100, above the
        // maximum clamp of (10_000 / 2) * 10 / 3.
        settings.contract_price = Currency::from(50_000u64);
        let fee = Currency::from(10u64);
        assert!(contract_funding(&a, &settings, fee).is_none());
    }

    #[test]
    fn zero_hosts_does_not_divide_by_zero() {
        let mut a = allowance();
        a.hosts = 0;
        assert!(contract_funding(&a, &host_settings(), Currency::from(1u64)).is_some());
    }
}
