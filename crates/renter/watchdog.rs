//! On-chain contract tracking.
//!
//! Every formed contract is monitored from the moment its formation
//! transaction set leaves for the transaction pool. Until the formation
//! confirms, the watchdog rebroadcasts the set each block; once the
//! planned sweep height passes, it gives up and submits the precomputed
//! sweep transaction instead, re-spending the renter's inputs back to the
//! wallet and cancelling the contract. Confirmed contracts are watched for
//! revisions and storage proofs until their proof window closes, and every
//! renter input backing a formation is indexed so a double-spend is caught
//! in a single transaction scan.
//!
//! Broadcasting happens only after the state lock is released, so the
//! watchdog never holds its own lock across the transaction pool.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use stratus_common::{
    BlockHeight, ContractId, OutputId,
    interfaces::{TransactionPool, TxPoolError, Wallet},
    types::{Block, ConsensusChange, Transaction},
};
use tracing::{debug, error, info, warn};

use crate::error::ContractorError;

/// Blocks after formation broadcast before the watchdog sweeps instead of
/// rebroadcasting.
pub const FORMATION_SWEEP_LEEWAY: BlockHeight = 36;
/// Extension of the sweep height whenever a reorg reverts formation state.
pub const REORG_LEEWAY: BlockHeight = 12;
/// Byte cap on a rebroadcast formation set; larger sets go straight to
/// sweeping since no pool will relay them.
pub const STANDARDNESS_SET_LIMIT: usize = 100_000;

/// Everything the watchdog needs back from the contractor, injected as
/// capabilities rather than a reference to the contractor itself.
pub trait WatchdogCallbacks: Send + Sync {
    /// A formation input was spent by a foreign transaction; the contract
    /// can never confirm and should be abandoned.
    fn contract_double_spent(&self, id: ContractId, height: BlockHeight);
    /// The renter's latest locally held revision transaction, if any.
    fn latest_revision(&self, id: &ContractId) -> Option<Transaction>;
}

/// Per-contract monitoring state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileContractStatus {
    pub contract_found: bool,
    /// Highest revision number observed on chain; 0 when none was seen.
    pub revision_found: u64,
    /// Height the first storage proof appeared at; 0 when none was seen.
    pub storage_proof_found: BlockHeight,
    /// Unconfirmed formation transactions, pruned as they confirm.
    pub formation_txn_set: Vec<Transaction>,
    pub sweep_txn: Transaction,
    pub sweep_parents: Vec<Transaction>,
    pub formation_sweep_height: BlockHeight,
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    pub double_spend_height: Option<BlockHeight>,
    /// Attempts at broadcasting the final revision; fee bumping starts on
    /// the second attempt.
    #[serde(default)]
    pub revision_broadcast_attempts: u64,
    /// Inverse actions for reorg handling, keyed by the height that caused
    /// them.
    #[serde(default)]
    undo: Vec<UndoRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct UndoRecord {
    height: BlockHeight,
    action: UndoAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum UndoAction {
    ContractFound(bool),
    RevisionFound(u64),
    StorageProofFound(BlockHeight),
    /// A formation transaction that was pruned when it confirmed.
    FormationTxnPruned(Transaction),
}

/// Serialized watchdog state, embedded in the contractor's persistence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchdogPersist {
    pub contracts: HashMap<ContractId, FileContractStatus>,
    pub archived: HashMap<ContractId, FileContractStatus>,
    pub block_height: BlockHeight,
}

#[derive(Debug, Default)]
struct WatchdogInner {
    contracts: HashMap<ContractId, FileContractStatus>,
    archived: HashMap<ContractId, FileContractStatus>,
    /// Consumed-output index: output id → contracts whose formation set
    /// depends on it.
    outputs: HashMap<OutputId, HashSet<ContractId>>,
    block_height: BlockHeight,
    renew_window: BlockHeight,
}

/// Arguments registering a new contract with the watchdog.
#[derive(Clone, Debug)]
pub struct MonitorContractArgs {
    pub id: ContractId,
    pub formation_txn_set: Vec<Transaction>,
    pub sweep_txn: Transaction,
    pub sweep_parents: Vec<Transaction>,
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
}

pub struct Watchdog {
    inner: Mutex<WatchdogInner>,
    tpool: Arc<dyn TransactionPool>,
    wallet: Arc<dyn Wallet>,
    callbacks: Box<dyn WatchdogCallbacks>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").finish()
    }
}

/// A broadcast decided under the lock and performed after it is released.
enum PendingBroadcast {
    Formation(ContractId, Vec<Transaction>),
    Sweep(ContractId, Vec<Transaction>),
    Revision(ContractId, Vec<Transaction>, u64),
}

impl Watchdog {
    pub fn new(
        tpool: Arc<dyn TransactionPool>,
        wallet: Arc<dyn Wallet>,
        callbacks: Box<dyn WatchdogCallbacks>,
    ) -> Self {
        Watchdog {
            inner: Mutex::new(WatchdogInner::default()),
            tpool,
            wallet,
            callbacks,
        }
    }

    pub fn restore(&self, persist: WatchdogPersist, renew_window: BlockHeight) {
        let mut inner = self.lock();
        inner.outputs.clear();
        for (id, status) in &persist.contracts {
            index_formation_set(&mut inner.outputs, *id, &status.formation_txn_set);
        }
        inner.contracts = persist.contracts;
        inner.archived = persist.archived;
        inner.block_height = persist.block_height;
        inner.renew_window = renew_window;
    }

    pub fn persist(&self) -> WatchdogPersist {
        let inner = self.lock();
        WatchdogPersist {
            contracts: inner.contracts.clone(),
            archived: inner.archived.clone(),
            block_height: inner.block_height,
        }
    }

    pub fn set_renew_window(&self, renew_window: BlockHeight) {
        self.lock().renew_window = renew_window;
    }

    /// Begins monitoring a freshly formed contract.
    pub fn monitor_contract(&self, args: MonitorContractArgs) {
        let mut inner = self.lock();
        let height = inner.block_height;
        index_formation_set(&mut inner.outputs, args.id, &args.formation_txn_set);
        let status = FileContractStatus {
            formation_txn_set: args.formation_txn_set,
            sweep_txn: args.sweep_txn,
            sweep_parents: args.sweep_parents,
            formation_sweep_height: height + FORMATION_SWEEP_LEEWAY,
            window_start: args.window_start,
            window_end: args.window_end,
            ..Default::default()
        };
        info!(contract = %args.id, sweep_height = status.formation_sweep_height, "Monitoring contract formation");
        inner.contracts.insert(args.id, status);
    }

    /// Stops monitoring without archiving (the contract was cancelled
    /// before confirmation mattered).
    pub fn forget_contract(&self, id: &ContractId) {
        let mut inner = self.lock();
        if inner.contracts.remove(id).is_some() {
            drop_index_entries(&mut inner.outputs, id);
        }
    }

    pub fn contract_status(&self, id: &ContractId) -> Option<FileContractStatus> {
        let inner = self.lock();
        inner
            .contracts
            .get(id)
            .or_else(|| inner.archived.get(id))
            .cloned()
    }

    pub fn current_height(&self) -> BlockHeight {
        self.lock().block_height
    }

    /// Entry point from the contractor's consensus-change handler.
    /// Processing is serial; broadcasts run after the lock is dropped.
    pub async fn process_consensus_change(&self, change: &ConsensusChange) {
        let broadcasts = {
            let mut inner = self.lock();
            for _block in &change.reverted_blocks {
                inner.block_height = inner.block_height.saturating_sub(1);
                let height = inner.block_height;
                undo_block(&mut inner, height);
            }
            for block in &change.applied_blocks {
                inner.block_height += 1;
                let height = inner.block_height;
                scan_applied_block(&mut inner, block, height, self.callbacks.as_ref());
            }
            if change.synced {
                self.per_block_actions(&mut inner)
            } else {
                Vec::new()
            }
        };
        for broadcast in broadcasts {
            self.perform_broadcast(broadcast).await;
        }
    }

    /// Decides rebroadcasts, sweeps, revision pushes and archivals for the
    /// current height. Runs under the lock, returns the IO to do outside.
    fn per_block_actions(&self, inner: &mut WatchdogInner) -> Vec<PendingBroadcast> {
        let height = inner.block_height;
        let renew_window = inner.renew_window;
        let mut broadcasts = Vec::new();
        let mut to_archive = Vec::new();

        for (id, status) in inner.contracts.iter_mut() {
            if !status.contract_found && status.double_spend_height.is_none() {
                let set_size: usize = status
                    .formation_txn_set
                    .iter()
                    .map(|t| t.encoded_len())
                    .sum();
                if height < status.formation_sweep_height && set_size <= STANDARDNESS_SET_LIMIT {
                    broadcasts.push(PendingBroadcast::Formation(
                        *id,
                        status.formation_txn_set.clone(),
                    ));
                } else {
                    let mut set = status.sweep_parents.clone();
                    set.push(status.sweep_txn.clone());
                    broadcasts.push(PendingBroadcast::Sweep(*id, set));
                }
            }

            if height + renew_window >= status.window_start {
                if let Some(revision_txn) = self.callbacks.latest_revision(id) {
                    let local_revision = revision_txn
                        .file_contract_revisions
                        .first()
                        .map(|r| r.revision_number)
                        .unwrap_or(0);
                    if local_revision > status.revision_found && height < status.window_end {
                        status.revision_broadcast_attempts += 1;
                        broadcasts.push(PendingBroadcast::Revision(
                            *id,
                            vec![revision_txn],
                            status.revision_broadcast_attempts,
                        ));
                    }
                }
            }

            if height >= status.window_end {
                if status.storage_proof_found > 0 {
                    info!(contract = %id, proof_height = status.storage_proof_found, "Proof window closed with storage proof");
                } else {
                    warn!(contract = %id, "Proof window closed without a storage proof");
                }
                to_archive.push(*id);
            }
        }

        for id in to_archive {
            archive_contract(inner, &id);
        }
        broadcasts
    }

    async fn perform_broadcast(&self, broadcast: PendingBroadcast) {
        match broadcast {
            PendingBroadcast::Formation(id, set) => {
                debug!(contract = %id, txns = set.len(), "Rebroadcasting formation set");
                self.submit(set).await;
            }
            PendingBroadcast::Sweep(id, mut set) => {
                // Extend the sweep with a fee appropriate for the current
                // tip before it goes out.
                if let Ok((_, max_fee)) = self.tpool.fee_estimate().await {
                    if let Some(sweep) = set.last_mut() {
                        let size = sweep.encoded_len();
                        sweep.miner_fees.push(max_fee * size as u64);
                    }
                }
                warn!(contract = %id, "Formation did not confirm in time, sweeping inputs");
                self.submit(set).await;
            }
            PendingBroadcast::Revision(id, mut set, attempts) => {
                debug!(contract = %id, attempts, "Broadcasting final revision");
                if attempts > 1 {
                    // Child-pays-for-parent: attach a fee-carrying child so
                    // the pool values the whole set higher on retries.
                    match self.build_fee_child(&set).await {
                        Ok(child) => set.push(child),
                        Err(e) => debug!(contract = %id, err = %e, "Could not build fee child"),
                    }
                }
                self.submit(set).await;
            }
        }
    }

    async fn build_fee_child(&self, set: &[Transaction]) -> Result<Transaction, ContractorError> {
        let (_, max_fee) = self.tpool.fee_estimate().await?;
        let size: usize = set.iter().map(|t| t.encoded_len()).sum();
        let fee = max_fee * (size as u64);
        let mut builder = self.wallet.start_transaction().await?;
        builder.fund(fee).await?;
        builder.add_miner_fee(fee);
        let mut signed = builder.sign().await?;
        signed
            .pop()
            .ok_or_else(|| ContractorError::Wallet(stratus_common::interfaces::WalletError::Other(
                "builder returned an empty set".to_string(),
            )))
    }

    /// Rebroadcasts are idempotent: a duplicate-set answer is success.
    async fn submit(&self, set: Vec<Transaction>) {
        match self.tpool.accept_transaction_set(set).await {
            Ok(()) | Err(TxPoolError::DuplicateTransactionSet) => {}
            Err(e) => error!(err = %e, "Transaction pool rejected watchdog broadcast"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatchdogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn index_formation_set(
    outputs: &mut HashMap<OutputId, HashSet<ContractId>>,
    id: ContractId,
    set: &[Transaction],
) {
    for txn in set {
        for input in &txn.inputs {
            outputs.entry(input.parent_id).or_default().insert(id);
        }
    }
}

fn drop_index_entries(outputs: &mut HashMap<OutputId, HashSet<ContractId>>, id: &ContractId) {
    outputs.retain(|_, contracts| {
        contracts.remove(id);
        !contracts.is_empty()
    });
}

fn archive_contract(inner: &mut WatchdogInner, id: &ContractId) {
    if let Some(mut status) = inner.contracts.remove(id) {
        status.undo.clear();
        inner.archived.insert(*id, status);
        drop_index_entries(&mut inner.outputs, id);
    }
}

fn scan_applied_block(
    inner: &mut WatchdogInner,
    block: &Block,
    height: BlockHeight,
    callbacks: &dyn WatchdogCallbacks,
) {
    for txn in &block.transactions {
        let txn_id = txn.id();

        // Newly confirmed contracts.
        for (i, _) in txn.file_contracts.iter().enumerate() {
            let fc_id = txn.file_contract_id(i);
            if let Some(status) = inner.contracts.get_mut(&fc_id) {
                if !status.contract_found {
                    info!(contract = %fc_id, height, "Contract formation confirmed");
                    status.undo.push(UndoRecord {
                        height,
                        action: UndoAction::ContractFound(status.contract_found),
                    });
                    status.contract_found = true;
                }
            }
        }

        // New revisions: track the highest revision number seen on chain.
        for rev in &txn.file_contract_revisions {
            if let Some(status) = inner.contracts.get_mut(&rev.parent_id) {
                if rev.revision_number > status.revision_found {
                    status.undo.push(UndoRecord {
                        height,
                        action: UndoAction::RevisionFound(status.revision_found),
                    });
                    status.revision_found = rev.revision_number;
                }
            }
        }

        // Storage proofs: record the first height one was seen at.
        for proof in &txn.storage_proofs {
            if let Some(status) = inner.contracts.get_mut(&proof.parent_id) {
                if status.storage_proof_found == 0 {
                    status.undo.push(UndoRecord {
                        height,
                        action: UndoAction::StorageProofFound(status.storage_proof_found),
                    });
                    status.storage_proof_found = height;
                }
            }
        }

        // Dependency resolution: every consumed output that formation sets
        // depend on either confirms the expected transaction or proves a
        // double-spend.
        for input in &txn.inputs {
            let Some(dependents) = inner.outputs.get(&input.parent_id).cloned() else {
                continue;
            };
            for contract_id in dependents {
                let mut double_spent = false;
                if let Some(status) = inner.contracts.get_mut(&contract_id) {
                    let expected = status
                        .formation_txn_set
                        .iter()
                        .position(|t| t.inputs.iter().any(|i| i.parent_id == input.parent_id));
                    match expected {
                        Some(pos) if status.formation_txn_set[pos].id() == txn_id => {
                            let confirmed = status.formation_txn_set.remove(pos);
                            for confirmed_input in &confirmed.inputs {
                                if let Some(set) = inner.outputs.get_mut(&confirmed_input.parent_id)
                                {
                                    set.remove(&contract_id);
                                    if set.is_empty() {
                                        inner.outputs.remove(&confirmed_input.parent_id);
                                    }
                                }
                            }
                            let status = inner
                                .contracts
                                .get_mut(&contract_id)
                                .expect("contract present");
                            status.undo.push(UndoRecord {
                                height,
                                action: UndoAction::FormationTxnPruned(confirmed),
                            });
                        }
                        _ => {
                            // The output was spent by a transaction that is
                            // not the one we expected: double-spend.
                            status.double_spend_height = Some(height);
                            double_spent = true;
                        }
                    }
                }
                if double_spent {
                    error!(contract = %contract_id, height, "Formation inputs double-spent");
                    archive_to_double_spent(inner, &contract_id, height);
                    callbacks.contract_double_spent(contract_id, height);
                }
            }
        }
    }
}

fn archive_to_double_spent(inner: &mut WatchdogInner, id: &ContractId, height: BlockHeight) {
    if let Some(mut status) = inner.contracts.remove(id) {
        status.double_spend_height = Some(height);
        status.undo.clear();
        inner.archived.insert(*id, status);
        drop_index_entries(&mut inner.outputs, id);
    }
}

/// Inverts every applied-scan effect recorded at the reverted height.
fn undo_block(inner: &mut WatchdogInner, height: BlockHeight) {
    // The reverted block sat at height + 1 when it was applied.
    let applied_height = height + 1;
    let mut reindex: Vec<(ContractId, Transaction)> = Vec::new();
    for (id, status) in inner.contracts.iter_mut() {
        let mut extended = false;
        while let Some(record) = status.undo.last() {
            if record.height != applied_height {
                break;
            }
            let record = status.undo.pop().expect("checked non-empty");
            extended = true;
            match record.action {
                UndoAction::ContractFound(prev) => status.contract_found = prev,
                UndoAction::RevisionFound(prev) => status.revision_found = prev,
                UndoAction::StorageProofFound(prev) => status.storage_proof_found = prev,
                UndoAction::FormationTxnPruned(txn) => {
                    reindex.push((*id, txn.clone()));
                    status.formation_txn_set.push(txn);
                }
            }
        }
        if extended {
            // The chain is reorganizing around this contract; give the
            // formation more time before sweeping.
            status.formation_sweep_height += REORG_LEEWAY;
        }
    }
    for (id, txn) in reindex {
        index_formation_set(&mut inner.outputs, id, &[txn]);
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{StubPool, StubWallet, applied_change, block, reverted_change};
    use std::sync::Mutex as StdMutex;
    use stratus_common::{
        Currency, H256,
        types::{FileContract, FileContractRevision, Input, Output, StorageProof},
    };

    #[derive(Default)]
    struct RecordingCallbacks {
        double_spent: StdMutex<Vec<(ContractId, BlockHeight)>>,
        revisions: StdMutex<HashMap<ContractId, Transaction>>,
    }

    impl WatchdogCallbacks for Arc<RecordingCallbacks> {
        fn contract_double_spent(&self, id: ContractId, height: BlockHeight) {
            self.double_spent.lock().unwrap().push((id, height));
        }

        fn latest_revision(&self, id: &ContractId) -> Option<Transaction> {
            self.revisions.lock().unwrap().get(id).cloned()
        }
    }

    struct Fixture {
        watchdog: Watchdog,
        pool: Arc<StubPool>,
        callbacks: Arc<RecordingCallbacks>,
        formation_txn: Transaction,
        contract_id: ContractId,
    }

    fn formation_txn() -> Transaction {
        Transaction {
            inputs: vec![Input {
                parent_id: H256::from_low_u64_be(0xcafe),
                unlock_hash: H256::from_low_u64_be(1),
            }],
            file_contracts: vec![FileContract {
                window_start: 100,
                window_end: 112,
                payout: Currency::from(1_000u64),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn sweep_for(txn: &Transaction) -> Transaction {
        Transaction {
            inputs: txn.inputs.clone(),
            outputs: vec![Output {
                value: Currency::from(900u64),
                unlock_hash: H256::from_low_u64_be(0xadd0),
            }],
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let pool = StubPool::new();
        let wallet = StubWallet::new();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let watchdog = Watchdog::new(
            pool.clone(),
            wallet,
            Box::new(callbacks.clone()),
        );
        watchdog.set_renew_window(10);

        let formation = formation_txn();
        let contract_id = formation.file_contract_id(0);
        watchdog.monitor_contract(MonitorContractArgs {
            id: contract_id,
            formation_txn_set: vec![formation.clone()],
            sweep_txn: sweep_for(&formation),
            sweep_parents: vec![],
            window_start: 100,
            window_end: 112,
        });
        Fixture {
            watchdog,
            pool,
            callbacks,
            formation_txn: formation,
            contract_id,
        }
    }

    #[tokio::test]
    async fn unconfirmed_formation_is_rebroadcast_each_block() {
        let fx = fixture();
        fx.watchdog
            .process_consensus_change(&applied_change(1, vec![block(1, vec![])]))
            .await;
        fx.watchdog
            .process_consensus_change(&applied_change(2, vec![block(2, vec![])]))
            .await;
        assert_eq!(fx.pool.accepted_count(), 2);
        assert_eq!(fx.pool.last_set().unwrap()[0].id(), fx.formation_txn.id());
    }

    #[tokio::test]
    async fn duplicate_pool_answers_are_suppressed() {
        let fx = fixture();
        fx.pool.set_duplicate(true);
        fx.watchdog
            .process_consensus_change(&applied_change(1, vec![block(1, vec![])]))
            .await;
        // Nothing recorded, no error surfaced.
        assert_eq!(fx.pool.accepted_count(), 0);
    }

    #[tokio::test]
    async fn confirmation_stops_rebroadcast_and_sets_contract_found() {
        let fx = fixture();
        fx.watchdog
            .process_consensus_change(&applied_change(
                1,
                vec![block(1, vec![fx.formation_txn.clone()])],
            ))
            .await;
        let status = fx.watchdog.contract_status(&fx.contract_id).unwrap();
        assert!(status.contract_found);
        assert!(status.formation_txn_set.is_empty());
        assert_eq!(fx.pool.accepted_count(), 0);
    }

    #[tokio::test]
    async fn revert_restores_pre_state_and_extends_sweep_height() {
        let fx = fixture();
        let before = fx.watchdog.contract_status(&fx.contract_id).unwrap();
        let confirm_block = block(1, vec![fx.formation_txn.clone()]);
        fx.watchdog
            .process_consensus_change(&applied_change(1, vec![confirm_block.clone()]))
            .await;
        fx.watchdog
            .process_consensus_change(&reverted_change(2, vec![confirm_block]))
            .await;

        let after = fx.watchdog.contract_status(&fx.contract_id).unwrap();
        assert_eq!(after.contract_found, before.contract_found);
        assert_eq!(after.revision_found, before.revision_found);
        assert_eq!(after.storage_proof_found, before.storage_proof_found);
        assert_eq!(after.formation_txn_set.len(), 1);
        assert_eq!(
            after.formation_sweep_height,
            before.formation_sweep_height + REORG_LEEWAY
        );
        assert_eq!(fx.watchdog.current_height(), 0);
    }

    #[tokio::test]
    async fn foreign_spend_of_formation_input_is_a_double_spend() {
        let fx = fixture();
        let thief = Transaction {
            inputs: fx.formation_txn.inputs.clone(),
            outputs: vec![Output {
                value: Currency::from(1u64),
                unlock_hash: H256::from_low_u64_be(0xbad),
            }],
            ..Default::default()
        };
        fx.watchdog
            .process_consensus_change(&applied_change(1, vec![block(1, vec![thief])]))
            .await;

        let status = fx.watchdog.contract_status(&fx.contract_id).unwrap();
        assert_eq!(status.double_spend_height, Some(1));
        assert_eq!(
            fx.callbacks.double_spent.lock().unwrap().as_slice(),
            &[(fx.contract_id, 1)]
        );
        // Archived: no further rebroadcasts for it.
        fx.watchdog
            .process_consensus_change(&applied_change(2, vec![block(2, vec![])]))
            .await;
        assert_eq!(fx.pool.accepted_count(), 0);
    }

    #[tokio::test]
    async fn sweep_submitted_past_formation_sweep_height() {
        let fx = fixture();
        let blocks: Vec<Block> = (1..=FORMATION_SWEEP_LEEWAY).map(|n| block(n, vec![])).collect();
        fx.watchdog
            .process_consensus_change(&applied_change(1, blocks))
            .await;
        let last = fx.pool.last_set().unwrap();
        // The final broadcast is the sweep, fee-extended.
        let sweep = last.last().unwrap();
        assert_eq!(sweep.inputs, fx.formation_txn.inputs);
        assert!(!sweep.miner_fees.is_empty());
    }

    #[tokio::test]
    async fn revision_broadcast_inside_renew_window_with_cpfp_on_retry() {
        let fx = fixture();
        // Confirm the formation so only revision logic fires.
        fx.watchdog
            .process_consensus_change(&applied_change(
                1,
                vec![block(1, vec![fx.formation_txn.clone()])],
            ))
            .await;

        let revision_txn = Transaction {
            file_contract_revisions: vec![FileContractRevision {
                parent_id: fx.contract_id,
                revision_number: 5,
                ..Default::default()
            }],
            ..Default::default()
        };
        fx.callbacks
            .revisions
            .lock()
            .unwrap()
            .insert(fx.contract_id, revision_txn.clone());

        // Height 1 now; window_start 100, renew_window 10. Advance to 90.
        let blocks: Vec<Block> = (2..=90).map(|n| block(n, vec![])).collect();
        fx.watchdog
            .process_consensus_change(&applied_change(2, blocks))
            .await;
        let first = fx.pool.last_set().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id(), revision_txn.id());

        // Second attempt carries a fee child.
        fx.watchdog
            .process_consensus_change(&applied_change(3, vec![block(91, vec![])]))
            .await;
        let second = fx.pool.last_set().unwrap();
        assert_eq!(second.len(), 2);
        assert!(!second[1].miner_fees.is_empty());
    }

    #[tokio::test]
    async fn confirmed_revision_stops_broadcasts() {
        let fx = fixture();
        fx.watchdog
            .process_consensus_change(&applied_change(
                1,
                vec![block(1, vec![fx.formation_txn.clone()])],
            ))
            .await;
        let revision_txn = Transaction {
            file_contract_revisions: vec![FileContractRevision {
                parent_id: fx.contract_id,
                revision_number: 5,
                ..Default::default()
            }],
            ..Default::default()
        };
        fx.callbacks
            .revisions
            .lock()
            .unwrap()
            .insert(fx.contract_id, revision_txn.clone());

        // The revision confirms on chain at the same number we hold.
        let blocks: Vec<Block> = (2..=89).map(|n| block(n, vec![])).collect();
        fx.watchdog
            .process_consensus_change(&applied_change(2, blocks))
            .await;
        fx.watchdog
            .process_consensus_change(&applied_change(
                3,
                vec![block(90, vec![revision_txn.clone()])],
            ))
            .await;
        let count_after_confirm = fx.pool.accepted_count();
        fx.watchdog
            .process_consensus_change(&applied_change(4, vec![block(91, vec![])]))
            .await;
        assert_eq!(fx.pool.accepted_count(), count_after_confirm);
        let status = fx.watchdog.contract_status(&fx.contract_id).unwrap();
        assert_eq!(status.revision_found, 5);
    }

    #[tokio::test]
    async fn window_end_archives_with_storage_proof_height() {
        let fx = fixture();
        fx.watchdog
            .process_consensus_change(&applied_change(
                1,
                vec![block(1, vec![fx.formation_txn.clone()])],
            ))
            .await;
        let proof = Transaction {
            storage_proofs: vec![StorageProof {
                parent_id: fx.contract_id,
                segment_index: 0,
                segment: vec![],
            }],
            ..Default::default()
        };
        let mut blocks: Vec<Block> = (2..=101).map(|n| block(n, vec![])).collect();
        blocks.push(block(102, vec![proof]));
        fx.watchdog
            .process_consensus_change(&applied_change(2, blocks))
            .await;

        // Advance past window_end (112).
        let blocks: Vec<Block> = (103..=112).map(|n| block(n, vec![])).collect();
        fx.watchdog
            .process_consensus_change(&applied_change(3, blocks))
            .await;

        let status = fx.watchdog.contract_status(&fx.contract_id).unwrap();
        assert_eq!(status.storage_proof_found, 102);
        // Archived now: monitoring state is served from the archive.
        let persisted = fx.watchdog.persist();
        assert!(persisted.contracts.is_empty());
        assert!(persisted.archived.contains_key(&fx.contract_id));
    }

    #[tokio::test]
    async fn persist_roundtrip_rebuilds_dependency_index() {
        let fx = fixture();
        let persisted = fx.watchdog.persist();

        let pool = StubPool::new();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let restored = Watchdog::new(pool, StubWallet::new(), Box::new(callbacks.clone()));
        restored.restore(persisted, 10);

        // A foreign spend is still detected after the restore.
        let thief = Transaction {
            inputs: fx.formation_txn.inputs.clone(),
            ..Default::default()
        };
        restored
            .process_consensus_change(&applied_change(1, vec![block(1, vec![thief])]))
            .await;
        assert_eq!(callbacks.double_spent.lock().unwrap().len(), 1);
    }
}
