//! Peer-to-peer gossip gateway.
//!
//! The gateway keeps the node list and the active peer set, defends both
//! against eclipse attempts (IP-literal-only admission, per-source rate
//! limiting, inbound-only eviction), and exposes a registration-based RPC
//! transport that upper layers use to propagate blocks and transactions.
//!
//! There is intentionally no transport encryption or peer authentication
//! yet; see the project TODO before exposing a gateway to hostile networks.
// TODO: session encryption + peer authentication (tracked separately).

pub mod bandwidth;
pub mod codec;
pub mod error;
pub mod rpc;
pub mod types;

mod handshake;
mod maintain;
mod nodes;
mod peer;
mod persist;

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock, RwLock},
    time::Duration,
};

use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{codec::Framed, sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    bandwidth::{BandwidthCounters, RateLimits},
    codec::{Frame, FrameCodec},
    error::GatewayError,
    nodes::{NodeList, NodeListConfig},
    peer::PeerHandle,
    persist::GatewayPersist,
    rpc::{ConnectCall, RpcHandler},
    types::{Node, PeerInfo},
};
pub use persist::GatewayPersist as PersistedSettings;
use stratus_common::types::NetAddress;

/// Target number of outbound peers the peer manager maintains.
pub const OUTBOUND_PEER_TARGET: usize = 8;
/// Hard cap on concurrent peers; above it, inbound peers get evicted.
pub const MAX_PEERS: usize = 128;
/// Maximum nodes returned by one `ShareNodes` call.
const SHARE_NODES_MAX: usize = 10;
/// Peers queried per address-discovery round.
const DISCOVERY_QUERY_SIZE: usize = 8;
/// Agreeing answers required before we trust a discovered address.
const DISCOVERY_MIN_VOTES: usize = 3;
/// Pause between discovery rounds while votes are insufficient.
const DISCOVERY_RETRY: Duration = Duration::from_secs(20);
/// Overall cap on one `discover_address` call.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub datadir: PathBuf,
    pub bootstrap: Vec<NetAddress>,
    pub outbound_target: usize,
    pub max_peers: usize,
    pub min_node_list: usize,
    pub max_node_list: usize,
    /// Token bucket burst for node admission, per share source.
    pub node_admission_burst: f64,
    /// Refill interval of the admission bucket.
    pub node_admission_interval: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
    pub peer_manager_interval: Duration,
    pub node_manager_interval: Duration,
    pub purge_interval: Duration,
    pub save_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_addr: "0.0.0.0:9981".parse().expect("static address"),
            datadir: PathBuf::from("."),
            bootstrap: Vec::new(),
            outbound_target: OUTBOUND_PEER_TARGET,
            max_peers: MAX_PEERS,
            min_node_list: 50,
            max_node_list: 1200,
            node_admission_burst: 20.0,
            node_admission_interval: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(60),
            peer_manager_interval: Duration::from_secs(5),
            node_manager_interval: Duration::from_secs(10),
            purge_interval: Duration::from_secs(60),
            save_interval: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
struct PeerRecord {
    info: PeerInfo,
    handle: PeerHandle,
}

struct GatewayInner {
    peers: HashMap<NetAddress, PeerRecord>,
    nodes: NodeList,
    /// Host parts only; an address is blocklisted if its host matches.
    blocklist: HashSet<String>,
    rpc_handlers: HashMap<String, RpcHandler>,
    connect_calls: HashMap<String, ConnectCall>,
    my_address: Option<NetAddress>,
    router_url: Option<String>,
}

struct GatewayState {
    cfg: GatewayConfig,
    inner: RwLock<GatewayInner>,
    bandwidth: Arc<BandwidthCounters>,
    limits: Arc<RateLimits>,
    /// Spawned RPC handler tasks; shutdown waits for all of them.
    rpc_tasks: TaskTracker,
    shutdown: CancellationToken,
    listen_port: OnceLock<u16>,
}

/// Cheap-to-clone handle onto the gateway. All state lives behind one
/// gateway-wide lock plus atomic bandwidth counters.
#[derive(Clone)]
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("listen_addr", &self.state.cfg.listen_addr)
            .finish()
    }
}

impl Gateway {
    /// Builds a gateway from persisted state. Background loops do not run
    /// until [`Gateway::start`].
    pub fn new(cfg: GatewayConfig) -> Result<Gateway, GatewayError> {
        let dir = persist::gateway_dir(&cfg.datadir);
        let persisted = persist::load_gateway(&dir)?;
        let nodes = persist::load_nodes(&dir)?;

        let limits = Arc::new(RateLimits::default());
        limits.set(
            persisted.download_bytes_per_sec,
            persisted.upload_bytes_per_sec,
        );

        let node_cfg = NodeListConfig {
            min_size: cfg.min_node_list,
            max_size: cfg.max_node_list,
            admission_burst: cfg.node_admission_burst,
            admission_interval: cfg.node_admission_interval,
        };

        let inner = GatewayInner {
            peers: HashMap::new(),
            nodes: NodeList::from_nodes(node_cfg, nodes),
            blocklist: persisted.blocklist.into_iter().collect(),
            rpc_handlers: HashMap::new(),
            connect_calls: HashMap::new(),
            my_address: None,
            router_url: persisted.router_url,
        };

        Ok(Gateway {
            state: Arc::new(GatewayState {
                cfg,
                inner: RwLock::new(inner),
                bandwidth: Arc::new(BandwidthCounters::default()),
                limits,
                rpc_tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                listen_port: OnceLock::new(),
            }),
        })
    }

    /// Binds the listener, registers the bundled RPCs and spawns the
    /// background loops. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        let listener = TcpListener::bind(self.state.cfg.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.state.listen_port.set(local_addr.port());
        info!(addr = %local_addr, "Gateway listening");

        self.register_builtin_rpcs();
        self.spawn_accept_loop(listener);
        maintain::GatewayMaintainer::spawn(self.clone());

        for addr in self.state.cfg.bootstrap.clone() {
            let mut inner = self.write();
            inner.nodes.add_connected(addr, false);
        }
        Ok(local_addr)
    }

    // --- peer operations -------------------------------------------------

    /// Attempts an outbound connection; on success the peer is registered
    /// as outbound and every registered connect-call runs against it.
    pub async fn connect(&self, addr: &NetAddress) -> Result<(), GatewayError> {
        if self.state.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        addr.validate()?;
        {
            let inner = self.read();
            if is_blocklisted(&inner.blocklist, addr) {
                return Err(GatewayError::Blocklisted(addr.clone()));
            }
            if inner.peers.contains_key(addr) {
                return Err(GatewayError::AlreadyConnected(addr.clone()));
            }
            if inner.my_address.as_ref() == Some(addr) {
                return Err(GatewayError::SelfConnect);
            }
        }

        let stream = tokio::time::timeout(
            self.state.cfg.dial_timeout,
            TcpStream::connect(addr.as_str()),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        let mut framed = Framed::new(stream, FrameCodec::new(self.state.bandwidth.clone()));
        let version = tokio::time::timeout(
            self.state.cfg.handshake_timeout,
            handshake::dial_handshake(&mut framed, self.listen_port()),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        let info = PeerInfo {
            address: addr.clone(),
            inbound: false,
            local: addr.is_local(),
            version,
        };
        self.insert_peer(info.clone(), framed)?;
        debug!(peer = %addr, "Outbound peer connected");

        let connect_calls: Vec<(String, ConnectCall)> = {
            let inner = self.read();
            inner
                .connect_calls
                .iter()
                .map(|(name, call)| (name.clone(), call.clone()))
                .collect()
        };
        for (name, call) in connect_calls {
            trace!(peer = %addr, call = %name, "Running connect call");
            let gateway = self.clone();
            let peer = addr.clone();
            self.spawn_rpc(async move { call(gateway, peer).await });
        }
        Ok(())
    }

    /// Closes and removes a peer.
    pub async fn disconnect(&self, addr: &NetAddress) -> Result<(), GatewayError> {
        let record = {
            let mut inner = self.write();
            inner.peers.remove(addr)
        };
        match record {
            Some(mut record) => {
                record.handle.disconnect().await;
                debug!(peer = %addr, "Disconnected peer");
                Ok(())
            }
            None => Err(GatewayError::UnknownPeer(addr.clone())),
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.read().peers.values().map(|p| p.info.clone()).collect()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.read().nodes.all()
    }

    /// Online means at least one non-local peer.
    pub fn online(&self) -> bool {
        self.read().peers.values().any(|p| !p.info.local)
    }

    /// The gateway's externally visible address, once discovered.
    pub fn address(&self) -> Option<NetAddress> {
        self.read().my_address.clone()
    }

    // --- RPC surface -----------------------------------------------------

    /// Registers a server-side RPC. Duplicate registration is a programming
    /// bug and panics.
    pub fn register_rpc(&self, name: &str, handler: RpcHandler) {
        let mut inner = self.write();
        let previous = inner.rpc_handlers.insert(name.to_string(), handler);
        assert!(previous.is_none(), "duplicate RPC registration: {name}");
    }

    pub fn unregister_rpc(&self, name: &str) {
        self.write().rpc_handlers.remove(name);
    }

    /// Registers an RPC to invoke against every new outbound peer right
    /// after its handshake. Duplicate registration panics.
    pub fn register_connect_call(&self, name: &str, call: ConnectCall) {
        let mut inner = self.write();
        let previous = inner.connect_calls.insert(name.to_string(), call);
        assert!(previous.is_none(), "duplicate connect call registration: {name}");
    }

    pub fn unregister_connect_call(&self, name: &str) {
        self.write().connect_calls.remove(name);
    }

    /// Client-side RPC against an existing peer.
    pub async fn rpc(
        &self,
        addr: &NetAddress,
        name: &str,
        body: Value,
    ) -> Result<Value, GatewayError> {
        let mut handle = {
            let inner = self.read();
            inner
                .peers
                .get(addr)
                .map(|p| p.handle.clone())
                .ok_or_else(|| GatewayError::UnknownPeer(addr.clone()))?
        };
        handle.request(name, body, self.state.cfg.rpc_timeout).await
    }

    /// Best-effort fan-out of a notify frame. With `peers == None` the
    /// message goes to every connected peer.
    pub async fn broadcast(&self, name: &str, body: Value, peers: Option<&[NetAddress]>) {
        let targets: Vec<(NetAddress, PeerHandle)> = {
            let inner = self.read();
            match peers {
                Some(list) => list
                    .iter()
                    .filter_map(|a| inner.peers.get(a).map(|p| (a.clone(), p.handle.clone())))
                    .collect(),
                None => inner
                    .peers
                    .iter()
                    .map(|(a, p)| (a.clone(), p.handle.clone()))
                    .collect(),
            }
        };
        trace!(rpc = name, peers = targets.len(), "Broadcasting");
        for (addr, mut handle) in targets {
            let frame = Frame::Notify {
                rpc: name.to_string(),
                body: body.clone(),
            };
            if let Err(e) = handle.send(frame).await {
                debug!(peer = %addr, err = %e, "Broadcast enqueue failed");
            }
        }
    }

    // --- blocklist -------------------------------------------------------

    /// Blocklists the host parts of the given addresses, dropping any
    /// matching peers and nodes.
    pub async fn add_to_blocklist(&self, addrs: &[NetAddress]) {
        let dropped = {
            let mut inner = self.write();
            for addr in addrs {
                inner.blocklist.insert(addr.host().to_string());
            }
            let blocklist = inner.blocklist.clone();
            inner
                .nodes
                .remove_blocklisted(|a| blocklist.contains(a.host()));
            let matching: Vec<NetAddress> = inner
                .peers
                .keys()
                .filter(|a| blocklist.contains(a.host()))
                .cloned()
                .collect();
            let mut dropped = Vec::with_capacity(matching.len());
            for addr in matching {
                if let Some(record) = inner.peers.remove(&addr) {
                    dropped.push((addr, record.handle));
                }
            }
            dropped
        };
        for (addr, mut handle) in dropped {
            info!(peer = %addr, "Dropping blocklisted peer");
            handle.disconnect().await;
        }
    }

    pub fn remove_from_blocklist(&self, addrs: &[NetAddress]) {
        let mut inner = self.write();
        for addr in addrs {
            inner.blocklist.remove(addr.host());
        }
    }

    pub async fn set_blocklist(&self, addrs: &[NetAddress]) {
        {
            let mut inner = self.write();
            inner.blocklist.clear();
        }
        self.add_to_blocklist(addrs).await;
    }

    pub fn blocklist(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.read().blocklist.iter().cloned().collect();
        hosts.sort();
        hosts
    }

    // --- bandwidth -------------------------------------------------------

    pub fn set_rate_limits(&self, down_bytes_per_sec: u64, up_bytes_per_sec: u64) {
        self.state.limits.set(down_bytes_per_sec, up_bytes_per_sec);
        if let Err(e) = self.save() {
            warn!(err = %e, "Failed to persist rate limits");
        }
    }

    /// (download, upload) byte totals since startup.
    pub fn bandwidth_counters(&self) -> (u64, u64) {
        self.state.bandwidth.totals()
    }

    /// The configured (download, upload) caps in bytes per second; zero
    /// means unlimited.
    pub fn rate_limit_settings(&self) -> (u64, u64) {
        self.state.limits.get()
    }

    // --- address discovery -----------------------------------------------

    /// Resolves the gateway's externally visible address by asking random
    /// peers what IP they see and taking a plurality. Blocks until enough
    /// peers agree, the cancel token fires, or the overall cap elapses.
    pub async fn discover_address(
        &self,
        cancel: &CancellationToken,
    ) -> Result<NetAddress, GatewayError> {
        let deadline = tokio::time::Instant::now() + DISCOVERY_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            if self.state.shutdown.is_cancelled() {
                return Err(GatewayError::ShuttingDown);
            }
            if let Some(found) = self.discovery_round().await {
                let mut inner = self.write();
                inner.my_address = Some(found.clone());
                info!(address = %found, "Discovered external address");
                return Ok(found);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(GatewayError::DiscoveryFailed);
            }
            let pause = DISCOVERY_RETRY.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = self.state.shutdown.cancelled() => return Err(GatewayError::ShuttingDown),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn discovery_round(&self) -> Option<NetAddress> {
        let mut targets: Vec<NetAddress> = {
            let inner = self.read();
            inner
                .peers
                .values()
                .filter(|p| !p.info.local)
                .map(|p| p.info.address.clone())
                .collect()
        };
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(DISCOVERY_QUERY_SIZE);

        // One vote per peer host so a single operator cannot stuff the box.
        let mut votes: HashMap<String, HashSet<String>> = HashMap::new();
        for target in targets {
            match self.rpc(&target, "DiscoverIP", Value::Null).await {
                Ok(Value::String(ip)) if ip.parse::<std::net::IpAddr>().is_ok() => {
                    votes
                        .entry(ip)
                        .or_default()
                        .insert(target.host().to_string());
                }
                Ok(other) => {
                    trace!(peer = %target, ?other, "Ignoring malformed DiscoverIP response")
                }
                Err(e) => trace!(peer = %target, err = %e, "DiscoverIP failed"),
            }
        }
        let (winner, count) = votes
            .into_iter()
            .map(|(ip, voters)| (ip, voters.len()))
            .max_by_key(|(_, count)| *count)?;
        if count < DISCOVERY_MIN_VOTES {
            return None;
        }
        Some(NetAddress::new(format!("{winner}:{}", self.listen_port())))
    }

    // --- persistence & shutdown ------------------------------------------

    pub fn save(&self) -> Result<(), GatewayError> {
        let dir = persist::gateway_dir(&self.state.cfg.datadir);
        let (blocklist, nodes, router_url) = {
            let inner = self.read();
            (
                inner.blocklist.iter().cloned().collect::<Vec<_>>(),
                inner.nodes.all(),
                inner.router_url.clone(),
            )
        };
        let (down, up) = self.state.limits.get();
        persist::save_gateway(
            &dir,
            &GatewayPersist {
                blocklist,
                download_bytes_per_sec: down,
                upload_bytes_per_sec: up,
                router_url,
            },
        )?;
        persist::save_nodes(&dir, &nodes)?;
        Ok(())
    }

    /// Stops the gateway: cancels the normal scope, waits for in-flight
    /// RPC handlers, disconnects every peer and saves state.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        self.state.shutdown.cancel();
        self.state.rpc_tasks.close();
        self.state.rpc_tasks.wait().await;
        let addrs: Vec<NetAddress> = {
            let inner = self.read();
            inner.peers.keys().cloned().collect()
        };
        for addr in addrs {
            let _ = self.disconnect_quiet(&addr).await;
        }
        if let Err(e) = self.save() {
            warn!(err = %e, "Failed to save gateway state during shutdown");
        }
    }

    // --- crate-internal hooks --------------------------------------------

    pub(crate) fn rpc_handler(&self, name: &str) -> Option<RpcHandler> {
        self.read().rpc_handlers.get(name).cloned()
    }

    pub(crate) fn rate_limits(&self) -> Arc<RateLimits> {
        self.state.limits.clone()
    }

    /// Spawns an RPC handler task tracked by the gateway; shutdown blocks
    /// until every such task returns.
    pub(crate) fn spawn_rpc(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        let token = self.state.shutdown.clone();
        self.state.rpc_tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Session actors report their own death here.
    pub(crate) async fn peer_session_closed(&self, addr: &NetAddress) {
        let mut inner = self.write();
        if inner.peers.remove(addr).is_some() {
            debug!(peer = %addr, "Peer session closed");
        }
    }

    pub(crate) fn record_failed_connect(&self, addr: &NetAddress) {
        self.write().nodes.record_failed_connect(addr);
    }

    pub(crate) fn outbound_deficit(&self) -> usize {
        let inner = self.read();
        let outbound = inner.peers.values().filter(|p| !p.info.inbound).count();
        self.state.cfg.outbound_target.saturating_sub(outbound)
    }

    pub(crate) fn connect_candidates(&self, n: usize) -> Vec<NetAddress> {
        let inner = self.read();
        let peers = &inner.peers;
        inner.nodes.random_nodes(n, |addr| peers.contains_key(addr))
    }

    pub(crate) fn node_list_needs_more(&self) -> bool {
        self.read().nodes.needs_more()
    }

    pub(crate) fn random_outbound_peer(&self) -> Option<NetAddress> {
        let inner = self.read();
        let outbound: Vec<NetAddress> = inner
            .peers
            .values()
            .filter(|p| !p.info.inbound)
            .map(|p| p.info.address.clone())
            .collect();
        outbound.choose(&mut rand::thread_rng()).cloned()
    }

    pub(crate) fn admit_shared_nodes(&self, source: &NetAddress, addrs: Vec<NetAddress>) {
        let mut inner = self.write();
        let blocklist = inner.blocklist.clone();
        for addr in addrs {
            let outcome = inner
                .nodes
                .admit_shared(addr, source, |a| blocklist.contains(a.host()));
            trace!(?outcome, %source, "Shared node admission");
        }
    }

    pub(crate) fn purge_nodes(&self) {
        let removed = self.write().nodes.purge();
        if removed > 0 {
            debug!(removed, "Purged unreachable nodes");
        }
    }

    pub(crate) fn save_interval(&self) -> Duration {
        self.state.cfg.save_interval
    }

    pub(crate) fn intervals(&self) -> (Duration, Duration, Duration) {
        (
            self.state.cfg.peer_manager_interval,
            self.state.cfg.node_manager_interval,
            self.state.cfg.purge_interval,
        )
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    fn listen_port(&self) -> u16 {
        *self
            .state
            .listen_port
            .get()
            .unwrap_or(&self.state.cfg.listen_addr.port())
    }

    async fn disconnect_quiet(&self, addr: &NetAddress) -> Result<(), GatewayError> {
        match self.disconnect(addr).await {
            Ok(()) | Err(GatewayError::UnknownPeer(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn insert_peer(
        &self,
        info: PeerInfo,
        framed: Framed<TcpStream, FrameCodec>,
    ) -> Result<(), GatewayError> {
        let mut inner = self.write();
        if inner.peers.contains_key(&info.address) {
            // Dropping the framed stream closes the duplicate connection.
            return Err(GatewayError::AlreadyConnected(info.address));
        }
        let handle = PeerHandle::spawn(self.clone(), info.clone(), framed);
        inner
            .nodes
            .add_connected(info.address.clone(), !info.inbound);
        inner.peers.insert(info.address.clone(), PeerRecord { info, handle });
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = gateway.state.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, socket_addr)) => {
                            let gateway = gateway.clone();
                            tokio::spawn(async move {
                                if let Err(e) = gateway.handle_inbound(stream, socket_addr).await {
                                    debug!(from = %socket_addr, err = %e, "Inbound connection failed");
                                }
                            });
                        }
                        // Benign during shutdown; otherwise log and continue.
                        Err(e) => {
                            if gateway.state.shutdown.is_cancelled() {
                                break;
                            }
                            warn!(err = %e, "Accept failed");
                        }
                    }
                }
            }
            trace!("Accept loop stopped");
        });
    }

    async fn handle_inbound(
        &self,
        stream: TcpStream,
        socket_addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        let mut framed = Framed::new(stream, FrameCodec::new(self.state.bandwidth.clone()));
        let handshake_result = tokio::time::timeout(
            self.state.cfg.handshake_timeout,
            handshake::read_dialer_handshake(&mut framed),
        )
        .await
        .map_err(|_| GatewayError::Timeout)?;

        let (version, declared_port) = match handshake_result {
            Ok(parts) => parts,
            Err(e) => {
                let _ = handshake::send_verdict(&mut framed, false, Some(e.to_string())).await;
                return Err(e);
            }
        };

        // The peer is keyed by the address its own listener answers on.
        let remote = NetAddress::new(format!("{}:{declared_port}", socket_addr.ip()));

        let victim = match self.admit_inbound(&remote) {
            Ok(victim) => victim,
            Err(reason) => {
                let _ = handshake::send_verdict(&mut framed, false, Some(reason.to_string())).await;
                return Err(reason);
            }
        };
        // Eviction may disconnect another peer; do it outside the lock.
        if let Some(victim) = victim {
            info!(evicted = %victim, admitted = %remote, "Evicting inbound peer");
            let _ = self.disconnect_quiet(&victim).await;
        }

        handshake::send_verdict(&mut framed, true, None).await?;
        handshake::send_own_handshake(&mut framed).await?;

        let info = PeerInfo {
            address: remote.clone(),
            inbound: true,
            local: remote.is_local(),
            version,
        };
        self.insert_peer(info, framed)?;
        debug!(peer = %remote, "Inbound peer accepted");
        Ok(())
    }

    /// Validates an inbound connection and applies the eviction policy.
    /// Returns the peer to drop to make room, if any. Errors when the peer
    /// may not be admitted at all: blocklisted, duplicate, or the cap is
    /// hit and only local/outbound peers remain.
    fn admit_inbound(&self, remote: &NetAddress) -> Result<Option<NetAddress>, GatewayError> {
        if self.state.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }
        let inner = self.read();
        if is_blocklisted(&inner.blocklist, remote) {
            return Err(GatewayError::Blocklisted(remote.clone()));
        }
        if inner.peers.contains_key(remote) {
            return Err(GatewayError::AlreadyConnected(remote.clone()));
        }
        // An inbound peer sharing the IP gets replaced outright.
        if let Some(existing) = inner
            .peers
            .values()
            .find(|p| p.info.inbound && p.info.address.host() == remote.host())
        {
            return Ok(Some(existing.info.address.clone()));
        }
        if inner.peers.len() < self.state.cfg.max_peers {
            return Ok(None);
        }
        // Over the cap: only non-local inbound peers are candidates; local
        // and outbound peers are never evicted for a new inbound.
        let candidates: Vec<NetAddress> = inner
            .peers
            .values()
            .filter(|p| p.info.inbound && !p.info.local)
            .map(|p| p.info.address.clone())
            .collect();
        match candidates.choose(&mut rand::thread_rng()).cloned() {
            Some(victim) => Ok(Some(victim)),
            None => Err(GatewayError::Rejected("too many peers".to_string())),
        }
    }

    fn register_builtin_rpcs(&self) {
        let gateway = self.clone();
        self.register_rpc(
            "ShareNodes",
            rpc::handler(move |_peer, _body| {
                let gateway = gateway.clone();
                async move {
                    let nodes: Vec<NetAddress> = {
                        let inner = gateway.read();
                        inner.nodes.random_nodes(SHARE_NODES_MAX, |_| false)
                    };
                    serde_json::to_value(nodes).map_err(|e| e.to_string())
                }
            }),
        );
        self.register_rpc(
            "DiscoverIP",
            rpc::handler(move |peer, _body| async move {
                Ok(Value::String(peer.host().to_string()))
            }),
        );
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GatewayInner> {
        self.state.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GatewayInner> {
        self.state.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_blocklisted(blocklist: &HashSet<String>, addr: &NetAddress) -> bool {
    blocklist.contains(addr.host())
}
