pub mod allowance;
pub mod contract;
pub mod host;
pub mod netaddress;
pub mod transaction;

pub use allowance::{Allowance, AllowanceError};
pub use contract::{ContractSpending, ContractUtility, RenterContract};
pub use host::{FilterMode, HostEntry, HostScoreBreakdown, HostSettings};
pub use netaddress::{NetAddress, NetAddressError};
pub use transaction::{
    Block, ConsensusChange, FileContract, FileContractRevision, Input, Output, StorageProof,
    Transaction, TransactionSignature, merkle_root, sector_root,
};
