use stratus_common::{
    ContractId, HostPublicKey,
    interfaces::{HostDbError, TxPoolError, WalletError},
    types::AllowanceError,
};
use stratus_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ContractorError {
    #[error(transparent)]
    Allowance(#[from] AllowanceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    HostDb(#[from] HostDbError),
    #[error(transparent)]
    TxPool(#[from] TxPoolError),
    #[error("blockchain observer is not synced")]
    NotSynced,
    #[error("contract {0:#x} not found")]
    ContractNotFound(ContractId),
    #[error("no active contract with host {0:#x}")]
    NoContractWithHost(HostPublicKey),
    #[error("contract {0:#x} is currently being renewed")]
    ContractRenewing(ContractId),
    #[error("allowance has insufficient remaining funds")]
    InsufficientAllowance,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The host reported a different revision number than we hold locally.
    /// Not a host fault: the divergence may be ours.
    #[error("revision number mismatch (ours {ours}, host reports {theirs})")]
    RevisionNumberMismatch { ours: u64, theirs: u64 },
    #[error("host is out of storage")]
    OutOfStorage,
    #[error("contract has insufficient funds for this operation")]
    InsufficientFunds,
    #[error("contract is locked")]
    ContractLocked,
    #[error("contract is not usable for uploads")]
    NotGoodForUpload,
    #[error("host price exceeds the allowance gate: {0}")]
    PriceGateExceeded(&'static str),
    #[error("host fault: {0}")]
    HostFault(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("session cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Whether the failure counts against the host's interaction record.
    /// Revision mismatches and local/storage errors do not.
    pub fn is_host_fault(&self) -> bool {
        matches!(
            self,
            SessionError::OutOfStorage | SessionError::HostFault(_) | SessionError::Transport(_)
        )
    }
}
