use stratus_common::ContractId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("file not found")]
    NotFound,
    #[error("bad header: expected magic {expected:?}, found {found:?}")]
    BadHeader { expected: String, found: String },
    #[error("unrecognized version {found:?} (current is {current:?})")]
    BadVersion { current: String, found: String },
    #[error("corrupt persistence file: {0}")]
    Corrupt(String),
    #[error("contract {0:#x} is not in the set")]
    UnknownContract(ContractId),
    #[error("contract {0:#x} is already in the set")]
    DuplicateContract(ContractId),
    #[error("revision number did not increase (have {have}, got {got})")]
    NonMonotonicRevision { have: u64, got: u64 },
}
