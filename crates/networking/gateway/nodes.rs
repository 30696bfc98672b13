//! The node list and its admission policy.
//!
//! Nodes learned from `ShareNodes` are throttled per source with a token
//! bucket, so an attacker feeding us addresses from a single connection
//! needs hours to days to dominate the list. Direct connections bypass the
//! bucket: completing a handshake is itself the expensive part.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::Node;
use stratus_common::types::NetAddress;

/// Dial failures after which a node becomes prunable.
const MAX_FAILED_CONNECTS: u64 = 3;

#[derive(Clone, Debug)]
pub(crate) struct NodeListConfig {
    /// Below this many nodes the node manager actively solicits more, and
    /// the purger never removes anything.
    pub min_size: usize,
    /// Above this many nodes, admission of shared nodes stops.
    pub max_size: usize,
    /// Token bucket capacity per share source.
    pub admission_burst: f64,
    /// Seconds between token refills per share source.
    pub admission_interval: Duration,
}

impl Default for NodeListConfig {
    fn default() -> Self {
        NodeListConfig {
            min_size: 50,
            max_size: 1200,
            admission_burst: 20.0,
            admission_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub(crate) struct NodeList {
    cfg: NodeListConfig,
    nodes: FxHashMap<NetAddress, Node>,
    /// One bucket per sharing source, keyed by the source's host part.
    admission: FxHashMap<String, TokenBucket>,
}

/// Why a shared node was not admitted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AdmitOutcome {
    Admitted,
    AlreadyKnown,
    Invalid,
    Blocklisted,
    RateLimited,
    ListFull,
}

impl NodeList {
    pub fn new(cfg: NodeListConfig) -> Self {
        NodeList {
            cfg,
            nodes: FxHashMap::default(),
            admission: FxHashMap::default(),
        }
    }

    pub fn from_nodes(cfg: NodeListConfig, nodes: Vec<Node>) -> Self {
        let mut list = NodeList::new(cfg);
        for node in nodes {
            list.nodes.insert(node.address.clone(), node);
        }
        list
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.nodes.contains_key(addr)
    }

    pub fn needs_more(&self) -> bool {
        self.nodes.len() < self.cfg.min_size
    }

    pub fn all(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Inserts a node we actually connected to (or that connected to us).
    /// Resets the failure counter and upgrades the outbound marker.
    pub fn add_connected(&mut self, addr: NetAddress, outbound: bool) {
        let node = self
            .nodes
            .entry(addr.clone())
            .or_insert_with(|| Node::new(addr, outbound));
        node.failed_connects = 0;
        node.was_outbound_peer |= outbound;
    }

    /// Admission path for nodes learned through `ShareNodes`.
    pub fn admit_shared(
        &mut self,
        addr: NetAddress,
        source: &NetAddress,
        is_blocklisted: impl Fn(&NetAddress) -> bool,
    ) -> AdmitOutcome {
        if addr.validate().is_err() {
            return AdmitOutcome::Invalid;
        }
        if is_blocklisted(&addr) {
            return AdmitOutcome::Blocklisted;
        }
        if self.nodes.contains_key(&addr) {
            return AdmitOutcome::AlreadyKnown;
        }
        if self.nodes.len() >= self.cfg.max_size {
            return AdmitOutcome::ListFull;
        }
        if !self.take_admission_token(source) {
            trace!(%addr, %source, "Node admission rate limited");
            return AdmitOutcome::RateLimited;
        }
        self.nodes.insert(addr.clone(), Node::new(addr, false));
        AdmitOutcome::Admitted
    }

    pub fn remove(&mut self, addr: &NetAddress) {
        self.nodes.remove(addr);
    }

    /// Removes every node whose host part matches a blocklisted host.
    pub fn remove_blocklisted(&mut self, is_blocklisted: impl Fn(&NetAddress) -> bool) {
        self.nodes.retain(|addr, _| !is_blocklisted(addr));
    }

    pub fn record_failed_connect(&mut self, addr: &NetAddress) {
        if let Some(node) = self.nodes.get_mut(addr) {
            node.failed_connects += 1;
        }
    }

    /// Up to `n` random node addresses, excluding any for which `exclude`
    /// returns true.
    pub fn random_nodes(
        &self,
        n: usize,
        exclude: impl Fn(&NetAddress) -> bool,
    ) -> Vec<NetAddress> {
        let mut candidates: Vec<NetAddress> = self
            .nodes
            .keys()
            .filter(|addr| !exclude(addr))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(n);
        candidates
    }

    /// Drops unreachable nodes while the list is above the low-water mark.
    /// Returns how many were removed.
    pub fn purge(&mut self) -> usize {
        if self.nodes.len() <= self.cfg.min_size {
            return 0;
        }
        let mut removable: Vec<NetAddress> = self
            .nodes
            .values()
            .filter(|n| n.failed_connects >= MAX_FAILED_CONNECTS)
            .map(|n| n.address.clone())
            .collect();
        // Never prune below the low-water mark.
        let budget = self.nodes.len() - self.cfg.min_size;
        removable.truncate(budget);
        for addr in &removable {
            self.nodes.remove(addr);
        }
        removable.len()
    }

    fn take_admission_token(&mut self, source: &NetAddress) -> bool {
        let now = Instant::now();
        let interval = self.cfg.admission_interval.as_secs_f64().max(f64::MIN_POSITIVE);
        let burst = self.cfg.admission_burst;
        let bucket = self
            .admission
            .entry(source.host().to_string())
            .or_insert_with(|| TokenBucket {
                tokens: burst,
                last_refill: now,
            });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed / interval).min(burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> NetAddress {
        NetAddress::from(format!("8.8.8.{n}:9981").as_str())
    }

    fn list(cfg: NodeListConfig) -> NodeList {
        NodeList::new(cfg)
    }

    #[test]
    fn direct_connections_bypass_rate_limit() {
        let mut nodes = list(NodeListConfig {
            admission_burst: 1.0,
            ..Default::default()
        });
        for n in 0..10 {
            nodes.add_connected(addr(n), true);
        }
        assert_eq!(nodes.len(), 10);
    }

    #[test]
    fn shared_nodes_are_rate_limited_per_source() {
        let mut nodes = list(NodeListConfig {
            admission_burst: 3.0,
            admission_interval: Duration::from_secs(3600),
            ..Default::default()
        });
        let source = NetAddress::from("9.9.9.9:9981");
        let mut admitted = 0;
        for n in 0..10 {
            if nodes.admit_shared(addr(n), &source, |_| false) == AdmitOutcome::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);

        // A different source gets its own bucket.
        let other = NetAddress::from("7.7.7.7:9981");
        assert_eq!(
            nodes.admit_shared(addr(20), &other, |_| false),
            AdmitOutcome::Admitted
        );
    }

    #[test]
    fn admission_rejects_invalid_and_blocklisted() {
        let mut nodes = list(NodeListConfig::default());
        let source = NetAddress::from("9.9.9.9:9981");
        assert_eq!(
            nodes.admit_shared(NetAddress::from("example.com:9981"), &source, |_| false),
            AdmitOutcome::Invalid
        );
        assert_eq!(
            nodes.admit_shared(addr(1), &source, |_| true),
            AdmitOutcome::Blocklisted
        );
        assert_eq!(nodes.len(), 0);
    }

    #[test]
    fn purge_respects_low_water_mark() {
        let mut nodes = list(NodeListConfig {
            min_size: 2,
            ..Default::default()
        });
        for n in 0..4 {
            nodes.add_connected(addr(n), false);
        }
        for n in 0..4 {
            for _ in 0..MAX_FAILED_CONNECTS {
                nodes.record_failed_connect(&addr(n));
            }
        }
        let removed = nodes.purge();
        assert_eq!(removed, 2);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.purge(), 0);
    }

    #[test]
    fn random_nodes_excludes_and_truncates() {
        let mut nodes = list(NodeListConfig::default());
        for n in 0..10 {
            nodes.add_connected(addr(n), false);
        }
        let picked = nodes.random_nodes(3, |a| *a == addr(0));
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&addr(0)));
    }

    #[test]
    fn full_list_stops_admission() {
        let mut nodes = list(NodeListConfig {
            max_size: 1,
            ..Default::default()
        });
        let source = NetAddress::from("9.9.9.9:9981");
        assert_eq!(
            nodes.admit_shared(addr(1), &source, |_| false),
            AdmitOutcome::Admitted
        );
        assert_eq!(
            nodes.admit_shared(addr(2), &source, |_| false),
            AdmitOutcome::ListFull
        );
    }
}
