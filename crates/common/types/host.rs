use serde::{Deserialize, Serialize};

use crate::{BlockHeight, Currency, HostPublicKey, U256, types::netaddress::NetAddress};

/// Host versions at or above this negotiate with a pricing leeway that
/// cushions block-height skew between renter and host.
pub const LEEWAY_VERSION: &str = "1.4.0";

/// The price table and capacity a host advertises.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    pub accepting_contracts: bool,
    pub max_duration: BlockHeight,
    pub window_size: BlockHeight,
    pub remaining_storage: u64,
    pub total_storage: u64,

    pub base_rpc_price: Currency,
    pub contract_price: Currency,
    pub storage_price: Currency,
    pub upload_bandwidth_price: Currency,
    pub download_bandwidth_price: Currency,
    pub sector_access_price: Currency,

    pub collateral: Currency,
    pub max_collateral: Currency,

    pub version: String,
}

impl HostSettings {
    /// Whether sessions against this host apply the pricing leeway.
    pub fn has_pricing_leeway(&self) -> bool {
        version_at_least(&self.version, LEEWAY_VERSION)
    }
}

fn version_at_least(version: &str, min: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    };
    parse(version) >= parse(min)
}

/// A host database record, as consumed by scoring and contract formation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostEntry {
    pub public_key: HostPublicKey,
    pub net_address: NetAddress,
    pub settings: HostSettings,
    pub first_seen: BlockHeight,
    pub historic_successful_interactions: u64,
    pub historic_failed_interactions: u64,
    /// Whether the host answered its most recent scan.
    pub online: bool,
    /// Set by the operator's host filter.
    pub filtered: bool,
}

/// Score components the host database reports for one host. Only the
/// composite `score` drives utility decisions; the components exist for
/// operator visibility.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostScoreBreakdown {
    pub score: U256,
    pub age_factor: f64,
    pub collateral_factor: f64,
    pub interaction_factor: f64,
    pub price_factor: f64,
    pub storage_remaining_factor: f64,
    pub uptime_factor: f64,
    pub version_factor: f64,
}

/// Host filter mode of the host database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    Disabled,
    /// Only listed hosts are used.
    Allowlist,
    /// Listed hosts are never used.
    Blocklist,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leeway_version_comparison() {
        assert!(version_at_least("1.4.0", LEEWAY_VERSION));
        assert!(version_at_least("1.4.1", LEEWAY_VERSION));
        assert!(version_at_least("1.10.0", LEEWAY_VERSION));
        assert!(!version_at_least("1.3.9", LEEWAY_VERSION));
        assert!(!version_at_least("0.9", LEEWAY_VERSION));
    }

    #[test]
    fn settings_leeway_flag() {
        let mut settings = HostSettings::default();
        assert!(!settings.has_pricing_leeway());
        settings.version = "1.5.2".to_string();
        assert!(settings.has_pricing_leeway());
    }
}
