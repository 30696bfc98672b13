//! Gateway node entrypoint.
//!
//! Runs the gossip gateway standalone: it maintains the peer set and node
//! list and relays registered RPCs. The renter engine (`stratus-renter`)
//! is a library wired in by embedding applications that supply the
//! consensus set, wallet, transaction pool and host database.

mod cli;
mod initializers;

use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let opts = cli::Options::parse();
    initializers::init_tracing(&opts);

    let gateway = initializers::init_gateway(&opts).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    gateway.shutdown().await;
    Ok(())
}
