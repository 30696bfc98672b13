use std::fmt::Display;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NetAddressError {
    #[error("address is missing a port")]
    MissingPort,
    #[error("address has an empty host part")]
    MissingHost,
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("port 0 is not routable")]
    ZeroPort,
    #[error("host part is not an IP literal: {0}")]
    NotAnIp(String),
}

/// A `host:port` pair identifying a node on the gossip network.
///
/// Only IP literals are admitted to the node list; hostnames are rejected so
/// an attacker cannot multiply list entries behind a single DNS name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetAddress(String);

impl NetAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        NetAddress(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host part of the address. Blocklist entries key on this.
    pub fn host(&self) -> &str {
        match self.0.rfind(':') {
            Some(idx) => {
                let host = &self.0[..idx];
                host.strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host)
            }
            None => &self.0,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.0.rsplit(':').next()?.parse().ok()
    }

    /// Checks that the address is an IP literal with a non-zero port.
    pub fn validate(&self) -> Result<(), NetAddressError> {
        let Some(idx) = self.0.rfind(':') else {
            return Err(NetAddressError::MissingPort);
        };
        let (host, port) = self.0.split_at(idx);
        let port = &port[1..];
        if host.is_empty() {
            return Err(NetAddressError::MissingHost);
        }
        let port: u16 = port
            .parse()
            .map_err(|_| NetAddressError::InvalidPort(port.to_string()))?;
        if port == 0 {
            return Err(NetAddressError::ZeroPort);
        }
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if bare.parse::<IpAddr>().is_err() {
            return Err(NetAddressError::NotAnIp(bare.to_string()));
        }
        Ok(())
    }

    /// True when the host part is a loopback or otherwise non-routable IP.
    pub fn is_local(&self) -> bool {
        match self.host().parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            Ok(IpAddr::V6(v6)) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
            Err(_) => false,
        }
    }
}

impl Display for NetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetAddress {
    fn from(value: &str) -> Self {
        NetAddress(value.to_string())
    }
}

impl From<std::net::SocketAddr> for NetAddress {
    fn from(value: std::net::SocketAddr) -> Self {
        NetAddress(value.to_string())
    }
}
