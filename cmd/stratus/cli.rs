use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "stratus", author, version, about = "stratus gossip gateway node")]
pub struct Options {
    /// Directory for persisted state.
    #[arg(long = "datadir", default_value = ".stratus", env = "STRATUS_DATADIR")]
    pub datadir: PathBuf,

    /// Address the gateway listens on.
    #[arg(long = "listen", default_value = "0.0.0.0:9981")]
    pub listen_addr: SocketAddr,

    /// Bootstrap node, `ip:port`. May be given multiple times.
    #[arg(long = "bootnode")]
    pub bootnodes: Vec<String>,

    /// Target number of outbound peers.
    #[arg(long = "outbound-peers", default_value_t = stratus_gateway::OUTBOUND_PEER_TARGET)]
    pub outbound_peers: usize,

    /// Hard cap on concurrent peers.
    #[arg(long = "max-peers", default_value_t = stratus_gateway::MAX_PEERS)]
    pub max_peers: usize,

    /// Download cap in bytes per second; 0 is unlimited.
    #[arg(long = "download-limit", default_value_t = 0)]
    pub download_limit: u64,

    /// Upload cap in bytes per second; 0 is unlimited.
    #[arg(long = "upload-limit", default_value_t = 0)]
    pub upload_limit: u64,

    #[arg(long = "log.level", default_value_t = Level::INFO, help = "ERROR, WARN, INFO, DEBUG or TRACE")]
    pub log_level: Level,
}
