//! Shared types for the stratus storage client.
//!
//! This crate holds the data model used across the gateway, the renter and
//! the persistence layer, plus the narrow collaborator interfaces the core
//! consumes (consensus observer, transaction pool, wallet, host database).

pub mod interfaces;
pub mod types;

pub use ethereum_types::{H256, H512, U256};

/// Monetary amounts. Host prices, contract payouts and allowance funds are
/// all denominated in the chain's base unit.
pub type Currency = U256;

/// Height of a block in the chain, counted from genesis.
pub type BlockHeight = u64;

/// 32-byte identifier of a file contract.
pub type ContractId = H256;

/// 32-byte identifier of a transaction.
pub type TransactionId = H256;

/// 32-byte identifier of a chain output.
pub type OutputId = H256;

/// 32-byte identifier of a block.
pub type BlockId = H256;

/// Address that an output pays out to.
pub type UnlockHash = H256;

/// Public key identifying a storage host.
pub type HostPublicKey = H512;

/// Size of one sector, the atomic unit of storage negotiation.
pub const SECTOR_SIZE: u64 = 1 << 22; // 4 MiB
