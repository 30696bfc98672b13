//! Gateway on-disk state: settings document plus the node list.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stratus_storage::{Metadata, StoreError, load_json, save_json};
use tracing::warn;

use crate::types::Node;

const GATEWAY_META: Metadata = Metadata {
    magic: "stratus/gateway",
    version: "1.1.0",
};

const NODES_META: Metadata = Metadata {
    magic: "stratus/gateway-nodes",
    version: "1.1.0",
};

pub(crate) const GATEWAY_FILE: &str = "gateway.json";
pub(crate) const NODES_FILE: &str = "nodes.json";

/// Settings that survive restarts: the blocklist (host parts only), the
/// configured rate limits and the router URL used for port forwarding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayPersist {
    pub blocklist: Vec<String>,
    pub download_bytes_per_sec: u64,
    pub upload_bytes_per_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_url: Option<String>,
}

pub(crate) fn load_gateway(dir: &Path) -> Result<GatewayPersist, StoreError> {
    match load_json(GATEWAY_META, &dir.join(GATEWAY_FILE)) {
        Ok(persist) => Ok(persist),
        Err(StoreError::NotFound) => Ok(GatewayPersist::default()),
        Err(e) => Err(e),
    }
}

pub(crate) fn save_gateway(dir: &Path, persist: &GatewayPersist) -> Result<(), StoreError> {
    save_json(GATEWAY_META, persist, &dir.join(GATEWAY_FILE))
}

pub(crate) fn load_nodes(dir: &Path) -> Result<Vec<Node>, StoreError> {
    match load_json(NODES_META, &dir.join(NODES_FILE)) {
        Ok(nodes) => Ok(nodes),
        Err(StoreError::NotFound) => Ok(Vec::new()),
        Err(e @ StoreError::BadVersion { .. }) => Err(e),
        Err(e) => {
            // A corrupt node list is recoverable: the node manager refills
            // it. Settings corruption is not handled this way.
            warn!(err = %e, "Dropping unreadable node list");
            Ok(Vec::new())
        }
    }
}

pub(crate) fn save_nodes(dir: &Path, nodes: &[Node]) -> Result<(), StoreError> {
    save_json(NODES_META, &nodes.to_vec(), &dir.join(NODES_FILE))
}

pub(crate) fn gateway_dir(datadir: &Path) -> PathBuf {
    datadir.join("gateway")
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::types::NetAddress;
    use tempfile::TempDir;

    #[test]
    fn missing_files_default() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_gateway(dir.path()).unwrap(), GatewayPersist::default());
        assert!(load_nodes(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn settings_roundtrip() {
        let dir = TempDir::new().unwrap();
        let persist = GatewayPersist {
            blocklist: vec!["1.2.3.4".to_string()],
            download_bytes_per_sec: 100,
            upload_bytes_per_sec: 50,
            router_url: None,
        };
        save_gateway(dir.path(), &persist).unwrap();
        assert_eq!(load_gateway(dir.path()).unwrap(), persist);
    }

    #[test]
    fn corrupt_node_list_is_discarded() {
        let dir = TempDir::new().unwrap();
        let nodes = vec![Node::new(NetAddress::from("8.8.8.8:9981"), true)];
        save_nodes(dir.path(), &nodes).unwrap();
        assert_eq!(load_nodes(dir.path()).unwrap(), nodes);

        std::fs::write(dir.path().join(NODES_FILE), b"garbage").unwrap();
        assert!(load_nodes(dir.path()).unwrap().is_empty());
    }
}
