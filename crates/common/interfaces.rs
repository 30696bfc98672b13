//! Collaborator interfaces consumed by the core.
//!
//! The consensus set, transaction pool, wallet and host database are
//! external subsystems; the core only ever sees them through these traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    BlockHeight, Currency, HostPublicKey, UnlockHash,
    types::{
        Allowance, ConsensusChange, FileContract, FileContractRevision, FilterMode, HostEntry,
        HostScoreBreakdown, Input, NetAddress, Output, Transaction,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum TxPoolError {
    /// The submitted set is already in the pool. Rebroadcasts treat this as
    /// success.
    #[error("transaction set duplicates one already in the pool")]
    DuplicateTransactionSet,
    #[error("transaction set rejected: {0}")]
    Rejected(String),
    #[error("transaction pool unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TransactionPool: Send + Sync {
    async fn accept_transaction_set(&self, txns: Vec<Transaction>) -> Result<(), TxPoolError>;
    /// Estimated (minimum, maximum) fee per byte for timely confirmation.
    async fn fee_estimate(&self) -> Result<(Currency, Currency), TxPoolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet is locked")]
    Locked,
    #[error("insufficient wallet balance")]
    InsufficientBalance,
    #[error("invalid builder index {0}")]
    InvalidIndex(u64),
    #[error("wallet failure: {0}")]
    Other(String),
}

#[async_trait]
pub trait Wallet: Send + Sync {
    async fn next_address(&self) -> Result<UnlockHash, WalletError>;
    /// The seed all wallet addresses derive from; contract recovery scans
    /// the chain for contracts paying to addresses under it.
    async fn primary_seed(&self) -> Result<crate::H256, WalletError>;
    async fn unlocked(&self) -> Result<bool, WalletError>;
    async fn start_transaction(&self) -> Result<Box<dyn TransactionBuilder>, WalletError>;
    /// Continue building on top of an existing transaction and its parents.
    async fn register_transaction(
        &self,
        txn: Transaction,
        parents: Vec<Transaction>,
    ) -> Result<Box<dyn TransactionBuilder>, WalletError>;
}

/// Incrementally assembles and signs one transaction. Indices returned by
/// the `add_*` methods address the appended element in the built transaction.
#[async_trait]
pub trait TransactionBuilder: Send + Sync {
    /// Add wallet inputs (and a refund output) covering `amount`.
    async fn fund(&mut self, amount: Currency) -> Result<(), WalletError>;
    fn add_file_contract(&mut self, contract: FileContract) -> u64;
    fn add_revision(&mut self, revision: FileContractRevision) -> u64;
    fn add_miner_fee(&mut self, fee: Currency) -> u64;
    fn add_input(&mut self, input: Input) -> u64;
    fn add_output(&mut self, output: Output) -> u64;
    fn replace_output(&mut self, index: u64, output: Output) -> Result<(), WalletError>;
    /// The wallet-controlled inputs added by `fund`, for sweep construction.
    fn mark_owned_inputs(&mut self) -> Vec<Input>;
    /// Sign and return the full transaction set, parents included.
    async fn sign(&mut self) -> Result<Vec<Transaction>, WalletError>;
    /// The transaction as built so far plus its unconfirmed parents.
    fn view(&self) -> (Transaction, Vec<Transaction>);
}

#[derive(Debug, thiserror::Error)]
pub enum HostDbError {
    #[error("host not found")]
    NotFound,
    #[error("host database unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait HostDb: Send + Sync {
    /// Up to `n` random hosts, excluding the given keys and any host that
    /// shares a network with the excluded addresses.
    async fn random_hosts(
        &self,
        n: usize,
        excluded_keys: &[HostPublicKey],
        excluded_addresses: &[NetAddress],
    ) -> Result<Vec<HostEntry>, HostDbError>;
    async fn host(&self, key: &HostPublicKey) -> Result<Option<HostEntry>, HostDbError>;
    async fn active_hosts(&self) -> Result<Vec<HostEntry>, HostDbError>;
    fn score_breakdown(&self, entry: &HostEntry) -> Result<HostScoreBreakdown, HostDbError>;
    /// Keys among `keys` that violate the one-host-per-subnet rule.
    async fn check_for_ip_violations(
        &self,
        keys: &[HostPublicKey],
    ) -> Result<Vec<HostPublicKey>, HostDbError>;
    async fn filter_mode(&self) -> Result<(FilterMode, Vec<HostPublicKey>), HostDbError>;
    async fn set_filter_mode(
        &self,
        mode: FilterMode,
        hosts: &[HostPublicKey],
    ) -> Result<(), HostDbError>;
    async fn increment_successful_interactions(
        &self,
        key: &HostPublicKey,
    ) -> Result<(), HostDbError>;
    async fn increment_failed_interactions(&self, key: &HostPublicKey)
    -> Result<(), HostDbError>;
    /// Scoring weights depend on the allowance in force.
    async fn set_allowance(&self, allowance: &Allowance) -> Result<(), HostDbError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("consensus set unavailable: {0}")]
    Unavailable(String),
}

/// Implemented by the core; the consensus set delivers changes in strict
/// order, one at a time.
#[async_trait]
pub trait ConsensusSubscriber: Send + Sync {
    async fn process_consensus_change(&self, change: ConsensusChange);
}

#[async_trait]
pub trait ConsensusSet: Send + Sync {
    async fn subscribe(&self, subscriber: Arc<dyn ConsensusSubscriber>)
    -> Result<(), ConsensusError>;
    fn synced(&self) -> bool;
    fn height(&self) -> BlockHeight;
}
