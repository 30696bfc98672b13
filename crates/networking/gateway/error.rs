use stratus_common::types::{NetAddress, NetAddressError};
use stratus_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Address(#[from] NetAddressError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("peer sent an invalid frame: {0}")]
    InvalidFrame(String),
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },
    #[error("peer rejected the connection: {0}")]
    Rejected(String),
    #[error("address {0} is blocklisted")]
    Blocklisted(NetAddress),
    #[error("already connected to {0}")]
    AlreadyConnected(NetAddress),
    #[error("refusing to connect to ourselves")]
    SelfConnect,
    #[error("no peer with address {0}")]
    UnknownPeer(NetAddress),
    #[error("rpc {0:?} is not registered")]
    UnknownRpc(String),
    #[error("rpc {rpc:?} failed on the remote side: {reason}")]
    RemoteRpc { rpc: String, reason: String },
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("gateway is shutting down")]
    ShuttingDown,
    #[error("could not discover an external address")]
    DiscoveryFailed,
    #[error("internal error: {0}")]
    Internal(String),
}
