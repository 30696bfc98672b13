//! Renter contract lifecycle engine.
//!
//! The [`Contractor`](contractor::Contractor) owns the allowance and keeps
//! one active contract per target host: forming, renewing, refreshing,
//! cancelling and retiring on-chain file contracts. A [`watchdog`] tracks
//! every formed contract on chain and rebroadcasts or sweeps formation
//! transactions that fail to confirm; the [`churn`] limiter caps how much
//! acceptable-but-low-scoring storage can be expelled per period; and
//! [`session`] carries out the revision exchanges that actually move data.

pub mod alerts;
pub mod churn;
pub mod contractor;
pub mod error;
pub mod session;
pub mod utility;
pub mod watchdog;

mod formation;
mod maintenance;
mod persist;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testutil;

pub use alerts::{Alert, AlertSeverity, Alerter};
pub use contractor::{Contractor, ContractorConfig, RecoveryProgress};
pub use error::{ContractorError, SessionError};
pub use session::{Downloader, Editor, GatewayTransport, HostTransport};
pub use watchdog::FileContractStatus;
