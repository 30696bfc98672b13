//! In-process fakes for the collaborator interfaces, used across the
//! crate's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stratus_common::{
    Currency, H256, H512, HostPublicKey, U256, UnlockHash,
    interfaces::{
        HostDb, HostDbError, TransactionBuilder, TransactionPool, TxPoolError, Wallet,
        WalletError,
    },
    types::{
        Allowance, Block, FileContract, FileContractRevision, FilterMode, HostEntry,
        HostScoreBreakdown, HostSettings, Input, NetAddress, Output, Transaction,
    },
};

pub fn host_key(n: u64) -> HostPublicKey {
    H512::from_low_u64_be(n)
}

pub fn host_settings() -> HostSettings {
    HostSettings {
        accepting_contracts: true,
        max_duration: 1_000,
        window_size: 12,
        remaining_storage: 1 << 40,
        total_storage: 1 << 40,
        base_rpc_price: Currency::from(1u64),
        contract_price: Currency::from(50u64),
        storage_price: Currency::from(2u64),
        upload_bandwidth_price: Currency::from(1u64),
        download_bandwidth_price: Currency::from(1u64),
        sector_access_price: Currency::from(1u64),
        collateral: Currency::from(1u64),
        max_collateral: Currency::from(1_000_000u64),
        version: "1.5.0".to_string(),
    }
}

pub fn host_entry(n: u64) -> HostEntry {
    HostEntry {
        public_key: host_key(n),
        net_address: NetAddress::from(format!("10.0.0.{n}:9982").as_str()),
        settings: host_settings(),
        first_seen: 1,
        historic_successful_interactions: 100,
        historic_failed_interactions: 0,
        online: true,
        filtered: false,
    }
}

pub fn allowance() -> Allowance {
    Allowance {
        funds: Currency::from(1_000_000_000_000_000u64),
        hosts: 2,
        period: 50,
        renew_window: 10,
        expected_storage: 1 << 30,
        expected_upload: 1 << 28,
        expected_download: 1 << 28,
        expected_redundancy: 3.0,
        max_period_churn: 1 << 24,
        max_rpc_price: Currency::from(100u64),
        max_contract_price: Currency::from(1_000u64),
        max_storage_price: Currency::from(100u64),
        max_upload_bandwidth_price: Currency::from(100u64),
        max_download_bandwidth_price: Currency::from(100u64),
        max_sector_access_price: Currency::from(100u64),
        ..Default::default()
    }
}

/// A block containing the given transactions, with a unique id.
pub fn block(n: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        id: H256::from_low_u64_be(0xb10c_0000 + n),
        parent_id: H256::from_low_u64_be(0xb10c_0000 + n.saturating_sub(1)),
        timestamp: n,
        transactions,
    }
}

// --- transaction pool -----------------------------------------------------

#[derive(Debug, Default)]
pub struct StubPool {
    pub accepted: Mutex<Vec<Vec<Transaction>>>,
    /// When set, every accept reports a duplicate set.
    pub duplicate: Mutex<bool>,
    /// When set, every accept is rejected outright.
    pub reject: Mutex<bool>,
    pub fee: Mutex<(Currency, Currency)>,
}

impl StubPool {
    pub fn new() -> Arc<Self> {
        Arc::new(StubPool {
            fee: Mutex::new((Currency::from(1u64), Currency::from(3u64))),
            ..Default::default()
        })
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().expect("lock").len()
    }

    pub fn last_set(&self) -> Option<Vec<Transaction>> {
        self.accepted.lock().expect("lock").last().cloned()
    }

    pub fn set_duplicate(&self, on: bool) {
        *self.duplicate.lock().expect("lock") = on;
    }

    pub fn set_reject(&self, on: bool) {
        *self.reject.lock().expect("lock") = on;
    }
}

#[async_trait]
impl TransactionPool for StubPool {
    async fn accept_transaction_set(&self, txns: Vec<Transaction>) -> Result<(), TxPoolError> {
        if *self.reject.lock().expect("lock") {
            return Err(TxPoolError::Rejected("stub reject".to_string()));
        }
        if *self.duplicate.lock().expect("lock") {
            return Err(TxPoolError::DuplicateTransactionSet);
        }
        self.accepted.lock().expect("lock").push(txns);
        Ok(())
    }

    async fn fee_estimate(&self) -> Result<(Currency, Currency), TxPoolError> {
        Ok(*self.fee.lock().expect("lock"))
    }
}

// --- wallet ----------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StubWallet {
    pub locked: Mutex<bool>,
    next_address: Mutex<u64>,
}

impl StubWallet {
    pub fn new() -> Arc<Self> {
        Arc::new(StubWallet::default())
    }

    pub fn set_locked(&self, locked: bool) {
        *self.locked.lock().expect("lock") = locked;
    }
}

#[async_trait]
impl Wallet for StubWallet {
    async fn next_address(&self) -> Result<UnlockHash, WalletError> {
        let mut counter = self.next_address.lock().expect("lock");
        *counter += 1;
        Ok(H256::from_low_u64_be(0xadd0_0000 + *counter))
    }

    async fn primary_seed(&self) -> Result<H256, WalletError> {
        Ok(H256::from_low_u64_be(0x5eed))
    }

    async fn unlocked(&self) -> Result<bool, WalletError> {
        Ok(!*self.locked.lock().expect("lock"))
    }

    async fn start_transaction(&self) -> Result<Box<dyn TransactionBuilder>, WalletError> {
        if *self.locked.lock().expect("lock") {
            return Err(WalletError::Locked);
        }
        Ok(Box::new(StubBuilder::default()))
    }

    async fn register_transaction(
        &self,
        txn: Transaction,
        parents: Vec<Transaction>,
    ) -> Result<Box<dyn TransactionBuilder>, WalletError> {
        if *self.locked.lock().expect("lock") {
            return Err(WalletError::Locked);
        }
        Ok(Box::new(StubBuilder {
            txn,
            parents,
            ..Default::default()
        }))
    }
}

#[derive(Debug, Default)]
pub struct StubBuilder {
    txn: Transaction,
    parents: Vec<Transaction>,
    funded: Currency,
    owned: Vec<Input>,
}

#[async_trait]
impl TransactionBuilder for StubBuilder {
    async fn fund(&mut self, amount: Currency) -> Result<(), WalletError> {
        self.funded += amount;
        // One synthetic wallet input per funding call.
        let input = Input {
            parent_id: H256::from_low_u64_be(0xfeed_0000 + self.txn.inputs.len() as u64),
            unlock_hash: H256::from_low_u64_be(0xadd0_0000),
        };
        self.owned.push(input.clone());
        self.txn.inputs.push(input);
        Ok(())
    }

    fn add_file_contract(&mut self, contract: FileContract) -> u64 {
        self.txn.file_contracts.push(contract);
        (self.txn.file_contracts.len() - 1) as u64
    }

    fn add_revision(&mut self, revision: FileContractRevision) -> u64 {
        self.txn.file_contract_revisions.push(revision);
        (self.txn.file_contract_revisions.len() - 1) as u64
    }

    fn add_miner_fee(&mut self, fee: Currency) -> u64 {
        self.txn.miner_fees.push(fee);
        (self.txn.miner_fees.len() - 1) as u64
    }

    fn add_input(&mut self, input: Input) -> u64 {
        self.txn.inputs.push(input);
        (self.txn.inputs.len() - 1) as u64
    }

    fn add_output(&mut self, output: Output) -> u64 {
        self.txn.outputs.push(output);
        (self.txn.outputs.len() - 1) as u64
    }

    fn replace_output(&mut self, index: u64, output: Output) -> Result<(), WalletError> {
        match self.txn.outputs.get_mut(index as usize) {
            Some(slot) => {
                *slot = output;
                Ok(())
            }
            None => Err(WalletError::InvalidIndex(index)),
        }
    }

    fn mark_owned_inputs(&mut self) -> Vec<Input> {
        self.owned.clone()
    }

    async fn sign(&mut self) -> Result<Vec<Transaction>, WalletError> {
        let mut set = self.parents.clone();
        set.push(self.txn.clone());
        Ok(set)
    }

    fn view(&self) -> (Transaction, Vec<Transaction>) {
        (self.txn.clone(), self.parents.clone())
    }
}

// --- host database ----------------------------------------------------------

#[derive(Debug, Default)]
pub struct StubHostDb {
    pub hosts: Mutex<HashMap<HostPublicKey, HostEntry>>,
    pub scores: Mutex<HashMap<HostPublicKey, U256>>,
    pub successful: Mutex<HashMap<HostPublicKey, u64>>,
    pub failed: Mutex<HashMap<HostPublicKey, u64>>,
    pub allowance: Mutex<Option<Allowance>>,
}

impl StubHostDb {
    pub fn new() -> Arc<Self> {
        Arc::new(StubHostDb::default())
    }

    pub fn insert(&self, entry: HostEntry) {
        self.hosts
            .lock()
            .expect("lock")
            .insert(entry.public_key, entry);
    }

    pub fn set_score(&self, key: HostPublicKey, score: u64) {
        self.scores
            .lock()
            .expect("lock")
            .insert(key, U256::from(score));
    }

    pub fn set_online(&self, key: HostPublicKey, online: bool) {
        if let Some(entry) = self.hosts.lock().expect("lock").get_mut(&key) {
            entry.online = online;
        }
    }

    pub fn failed_count(&self, key: &HostPublicKey) -> u64 {
        *self.failed.lock().expect("lock").get(key).unwrap_or(&0)
    }

    pub fn successful_count(&self, key: &HostPublicKey) -> u64 {
        *self.successful.lock().expect("lock").get(key).unwrap_or(&0)
    }
}

#[async_trait]
impl HostDb for StubHostDb {
    async fn random_hosts(
        &self,
        n: usize,
        excluded_keys: &[HostPublicKey],
        excluded_addresses: &[NetAddress],
    ) -> Result<Vec<HostEntry>, HostDbError> {
        let hosts = self.hosts.lock().expect("lock");
        let mut out: Vec<HostEntry> = hosts
            .values()
            .filter(|h| !excluded_keys.contains(&h.public_key))
            .filter(|h| !excluded_addresses.contains(&h.net_address))
            .filter(|h| h.settings.accepting_contracts && !h.filtered)
            .cloned()
            .collect();
        out.sort_by_key(|h| h.public_key);
        out.truncate(n);
        Ok(out)
    }

    async fn host(&self, key: &HostPublicKey) -> Result<Option<HostEntry>, HostDbError> {
        Ok(self.hosts.lock().expect("lock").get(key).cloned())
    }

    async fn active_hosts(&self) -> Result<Vec<HostEntry>, HostDbError> {
        Ok(self.hosts.lock().expect("lock").values().cloned().collect())
    }

    fn score_breakdown(&self, entry: &HostEntry) -> Result<HostScoreBreakdown, HostDbError> {
        let score = self
            .scores
            .lock()
            .expect("lock")
            .get(&entry.public_key)
            .copied()
            .unwrap_or_else(|| U256::from(1_000_000u64));
        Ok(HostScoreBreakdown {
            score,
            ..Default::default()
        })
    }

    async fn check_for_ip_violations(
        &self,
        _keys: &[HostPublicKey],
    ) -> Result<Vec<HostPublicKey>, HostDbError> {
        Ok(Vec::new())
    }

    async fn filter_mode(&self) -> Result<(FilterMode, Vec<HostPublicKey>), HostDbError> {
        Ok((FilterMode::Disabled, Vec::new()))
    }

    async fn set_filter_mode(
        &self,
        _mode: FilterMode,
        _hosts: &[HostPublicKey],
    ) -> Result<(), HostDbError> {
        Ok(())
    }

    async fn increment_successful_interactions(
        &self,
        key: &HostPublicKey,
    ) -> Result<(), HostDbError> {
        *self
            .successful
            .lock()
            .expect("lock")
            .entry(*key)
            .or_default() += 1;
        Ok(())
    }

    async fn increment_failed_interactions(
        &self,
        key: &HostPublicKey,
    ) -> Result<(), HostDbError> {
        *self.failed.lock().expect("lock").entry(*key).or_default() += 1;
        Ok(())
    }

    async fn set_allowance(&self, allowance: &Allowance) -> Result<(), HostDbError> {
        *self.allowance.lock().expect("lock") = Some(allowance.clone());
        Ok(())
    }
}

// --- host transport ---------------------------------------------------------

use crate::error::SessionError;
use crate::session::{
    DownloadRequest, FormContractRequest, FormContractResponse, HostTransport,
    RenewContractRequest, RevisionAgreement, UploadRequest,
};
use stratus_common::types::TransactionSignature;

/// A scriptable in-process host side: tracks each contract's revision
/// number the way a real host would and stores uploaded sectors.
#[derive(Debug, Default)]
pub struct StubTransport {
    pub host_revisions: Mutex<HashMap<stratus_common::ContractId, u64>>,
    pub sectors: Mutex<HashMap<H256, Vec<u8>>>,
    /// Hosts that refuse every session with a fault.
    pub reject_hosts: Mutex<std::collections::HashSet<HostPublicKey>>,
    /// Hosts that answer uploads with out-of-storage.
    pub oos_hosts: Mutex<std::collections::HashSet<HostPublicKey>>,
    pub formed: Mutex<u64>,
    pub renewed: Mutex<u64>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(StubTransport::default())
    }

    pub fn reject_host(&self, key: HostPublicKey) {
        self.reject_hosts.lock().expect("lock").insert(key);
    }

    pub fn set_oos(&self, key: HostPublicKey, oos: bool) {
        let mut set = self.oos_hosts.lock().expect("lock");
        if oos {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    /// Forces the host-side revision counter, simulating divergence.
    pub fn set_host_revision(&self, id: stratus_common::ContractId, revision: u64) {
        self.host_revisions.lock().expect("lock").insert(id, revision);
    }

    fn sign() -> Vec<TransactionSignature> {
        vec![TransactionSignature {
            parent_id: H256::from_low_u64_be(0x5160),
            public_key_index: 0,
            signature: vec![0xab; 16],
        }]
    }

    fn respond_formation(
        &self,
        req_set: Vec<Transaction>,
        contract_id: stratus_common::ContractId,
    ) -> Result<FormContractResponse, SessionError> {
        let contract_txn = req_set
            .last()
            .ok_or_else(|| SessionError::Transport("empty formation set".to_string()))?;
        let fc = contract_txn
            .file_contracts
            .first()
            .ok_or_else(|| SessionError::Transport("no contract in set".to_string()))?;
        let initial_revision = FileContractRevision {
            parent_id: contract_id,
            unlock_hash: fc.unlock_hash,
            revision_number: 1,
            file_size: fc.file_size,
            file_merkle_root: fc.file_merkle_root,
            window_start: fc.window_start,
            window_end: fc.window_end,
            valid_proof_outputs: fc.valid_proof_outputs.clone(),
            missed_proof_outputs: fc.missed_proof_outputs.clone(),
        };
        self.host_revisions
            .lock()
            .expect("lock")
            .insert(contract_id, 1);
        Ok(FormContractResponse {
            transaction_set: req_set,
            initial_revision,
            signatures: Self::sign(),
        })
    }

    fn advance_revision(
        &self,
        id: stratus_common::ContractId,
        proposed: u64,
    ) -> Result<(), SessionError> {
        let mut revisions = self.host_revisions.lock().expect("lock");
        let current = revisions.get(&id).copied().unwrap_or(0);
        if proposed != current + 1 {
            return Err(SessionError::RevisionNumberMismatch {
                ours: proposed,
                theirs: current,
            });
        }
        revisions.insert(id, proposed);
        Ok(())
    }
}

#[async_trait]
impl HostTransport for StubTransport {
    async fn settings(&self, host: &HostEntry) -> Result<HostSettings, SessionError> {
        Ok(host.settings.clone())
    }

    async fn form_contract(
        &self,
        host: &HostEntry,
        req: FormContractRequest,
    ) -> Result<FormContractResponse, SessionError> {
        if self.reject_hosts.lock().expect("lock").contains(&host.public_key) {
            return Err(SessionError::HostFault("formation refused".to_string()));
        }
        *self.formed.lock().expect("lock") += 1;
        self.respond_formation(req.transaction_set, req.contract_id)
    }

    async fn renew_contract(
        &self,
        host: &HostEntry,
        req: RenewContractRequest,
    ) -> Result<FormContractResponse, SessionError> {
        if self.reject_hosts.lock().expect("lock").contains(&host.public_key) {
            return Err(SessionError::HostFault("renewal refused".to_string()));
        }
        *self.renewed.lock().expect("lock") += 1;
        self.respond_formation(req.transaction_set, req.contract_id)
    }

    async fn upload_sector(
        &self,
        host: &HostEntry,
        req: UploadRequest,
    ) -> Result<RevisionAgreement, SessionError> {
        if self.reject_hosts.lock().expect("lock").contains(&host.public_key) {
            return Err(SessionError::HostFault("session lock refused".to_string()));
        }
        if self.oos_hosts.lock().expect("lock").contains(&host.public_key) {
            return Err(SessionError::OutOfStorage);
        }
        self.advance_revision(req.contract_id, req.revision.revision_number)?;
        self.sectors
            .lock()
            .expect("lock")
            .insert(stratus_common::types::sector_root(&req.sector), req.sector);
        Ok(RevisionAgreement {
            signatures: Self::sign(),
            host_revision_number: req.revision.revision_number,
        })
    }

    async fn download_sector(
        &self,
        host: &HostEntry,
        req: DownloadRequest,
    ) -> Result<(Vec<u8>, RevisionAgreement), SessionError> {
        if self.reject_hosts.lock().expect("lock").contains(&host.public_key) {
            return Err(SessionError::HostFault("session lock refused".to_string()));
        }
        self.advance_revision(req.contract_id, req.revision.revision_number)?;
        let data = self
            .sectors
            .lock()
            .expect("lock")
            .get(&req.root)
            .cloned()
            .ok_or_else(|| SessionError::HostFault("unknown sector".to_string()))?;
        Ok((
            data,
            RevisionAgreement {
                signatures: Self::sign(),
                host_revision_number: req.revision.revision_number,
            },
        ))
    }
}

// --- height helper -----------------------------------------------------------

/// Consensus change applying `blocks`, marked synced.
pub fn applied_change(n: u64, blocks: Vec<Block>) -> stratus_common::types::ConsensusChange {
    stratus_common::types::ConsensusChange {
        id: H256::from_low_u64_be(0xcc_0000 + n),
        reverted_blocks: Vec::new(),
        applied_blocks: blocks,
        synced: true,
    }
}

/// Consensus change reverting `blocks`, marked synced.
pub fn reverted_change(n: u64, blocks: Vec<Block>) -> stratus_common::types::ConsensusChange {
    stratus_common::types::ConsensusChange {
        id: H256::from_low_u64_be(0xcc_8000 + n),
        reverted_blocks: blocks,
        applied_blocks: Vec::new(),
        synced: true,
    }
}
