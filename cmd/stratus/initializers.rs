use eyre::WrapErr;
use stratus_common::types::NetAddress;
use stratus_gateway::{Gateway, GatewayConfig};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, filter::Directive, fmt, layer::SubscriberExt, Registry};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();
    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);
    let fmt_layer = fmt::layer().with_target(include_target);
    let subscriber = Registry::default().with(fmt_layer).with(log_filter);
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

pub async fn init_gateway(opts: &Options) -> eyre::Result<Gateway> {
    let mut bootstrap = Vec::new();
    for node in &opts.bootnodes {
        let addr = NetAddress::from(node.as_str());
        addr.validate()
            .wrap_err_with(|| format!("invalid bootnode {node:?}"))?;
        bootstrap.push(addr);
    }

    let cfg = GatewayConfig {
        listen_addr: opts.listen_addr,
        datadir: opts.datadir.clone(),
        bootstrap,
        outbound_target: opts.outbound_peers,
        max_peers: opts.max_peers,
        ..Default::default()
    };
    let gateway = Gateway::new(cfg).wrap_err("failed to open gateway state")?;
    if opts.download_limit > 0 || opts.upload_limit > 0 {
        gateway.set_rate_limits(opts.download_limit, opts.upload_limit);
    }
    let addr = gateway.start().await.wrap_err("failed to start gateway")?;
    info!(%addr, "Gateway started");
    Ok(gateway)
}
