use serde::{Deserialize, Serialize};
use stratus_common::types::NetAddress;

/// A long-lived entry in the node list: an address we may dial later.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub address: NetAddress,
    /// Whether we ever held an outbound connection to this node. Outbound
    /// history makes a node a preferred reconnect candidate.
    pub was_outbound_peer: bool,
    /// Consecutive failed dial attempts since the last success.
    #[serde(default)]
    pub failed_connects: u64,
}

impl Node {
    pub fn new(address: NetAddress, was_outbound_peer: bool) -> Self {
        Node {
            address,
            was_outbound_peer,
            failed_connects: 0,
        }
    }
}

/// Public view of an active peer session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: NetAddress,
    pub inbound: bool,
    /// Peers on loopback/LAN addresses; exempt from eviction and not
    /// counted for the online check.
    pub local: bool,
    pub version: String,
}
