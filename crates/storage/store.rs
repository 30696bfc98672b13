//! Durable state for the stratus client.
//!
//! Two storage shapes live here. Subsystem settings are single JSON
//! documents written atomically with a versioned header ([`persist`]).
//! File contracts get one file each, holding a metadata snapshot plus an
//! append-only log of unapplied revision updates ([`contract_set`]).

pub mod contract_set;
pub mod error;
pub mod persist;

pub use contract_set::{AcquiredContract, ContractSet, WalUpdate};
pub use error::StoreError;
pub use persist::{Metadata, load_json, save_json};
