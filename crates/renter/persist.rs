//! Contractor on-disk state with an explicit migration chain.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stratus_common::{
    BlockHeight, ContractId, Currency, H256,
    types::{Allowance, RenterContract},
};
use stratus_storage::{Metadata, StoreError, load_json, save_json};
use tracing::info;

use crate::{churn::ChurnPersist, watchdog::WatchdogPersist};

const CONTRACTOR_META: Metadata = Metadata {
    magic: "stratus/contractor",
    version: "1.4.0",
};

/// The pre-watchdog format; loads are migrated forward on sight.
const CONTRACTOR_META_V1: Metadata = Metadata {
    magic: "stratus/contractor",
    version: "1.1.0",
};

pub(crate) const CONTRACTOR_FILE: &str = "contractor.json";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ContractorPersist {
    pub allowance: Allowance,
    pub block_height: BlockHeight,
    pub current_period: BlockHeight,
    pub last_change_id: H256,
    /// Funds committed to formations and renewals this period.
    pub period_spent: Currency,
    pub renewed_from: HashMap<ContractId, ContractId>,
    pub renewed_to: HashMap<ContractId, ContractId>,
    pub old_contracts: HashMap<ContractId, RenterContract>,
    pub double_spent: HashMap<ContractId, BlockHeight>,
    pub recoverable: Vec<RenterContract>,
    pub churn: ChurnPersist,
    pub watchdog: WatchdogPersist,
}

#[derive(Deserialize)]
struct ContractorPersistV1 {
    allowance: Allowance,
    block_height: BlockHeight,
    current_period: BlockHeight,
    #[serde(default)]
    last_change_id: H256,
    renewed_from: HashMap<ContractId, ContractId>,
    renewed_to: HashMap<ContractId, ContractId>,
    old_contracts: HashMap<ContractId, RenterContract>,
}

impl From<ContractorPersistV1> for ContractorPersist {
    fn from(v1: ContractorPersistV1) -> Self {
        ContractorPersist {
            allowance: v1.allowance,
            block_height: v1.block_height,
            current_period: v1.current_period,
            last_change_id: v1.last_change_id,
            renewed_from: v1.renewed_from,
            renewed_to: v1.renewed_to,
            old_contracts: v1.old_contracts,
            ..Default::default()
        }
    }
}

pub(crate) fn load(dir: &Path) -> Result<Option<ContractorPersist>, StoreError> {
    let path = dir.join(CONTRACTOR_FILE);
    match load_json::<ContractorPersist>(CONTRACTOR_META, &path) {
        Ok(persist) => Ok(Some(persist)),
        Err(StoreError::NotFound) => Ok(None),
        Err(StoreError::BadVersion { found, .. }) if found == CONTRACTOR_META_V1.version => {
            info!(from = %found, to = CONTRACTOR_META.version, "Migrating contractor persistence");
            let v1: ContractorPersistV1 = load_json(CONTRACTOR_META_V1, &path)?;
            let migrated = ContractorPersist::from(v1);
            save(dir, &migrated)?;
            Ok(Some(migrated))
        }
        // Anything newer (or unknown) fails closed.
        Err(e) => Err(e),
    }
}

pub(crate) fn save(dir: &Path, persist: &ContractorPersist) -> Result<(), StoreError> {
    save_json(CONTRACTOR_META, persist, &dir.join(CONTRACTOR_FILE))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut persist = ContractorPersist {
            block_height: 42,
            current_period: 40,
            period_spent: Currency::from(777u64),
            ..Default::default()
        };
        persist
            .renewed_to
            .insert(H256::from_low_u64_be(1), H256::from_low_u64_be(2));
        save(dir.path(), &persist).unwrap();
        assert_eq!(load(dir.path()).unwrap().unwrap(), persist);
    }

    #[test]
    fn v1_files_migrate_forward() {
        #[derive(Serialize)]
        struct V1 {
            allowance: Allowance,
            block_height: BlockHeight,
            current_period: BlockHeight,
            renewed_from: HashMap<ContractId, ContractId>,
            renewed_to: HashMap<ContractId, ContractId>,
            old_contracts: HashMap<ContractId, RenterContract>,
        }
        let dir = TempDir::new().unwrap();
        let v1 = V1 {
            allowance: Allowance::default(),
            block_height: 10,
            current_period: 8,
            renewed_from: HashMap::new(),
            renewed_to: HashMap::new(),
            old_contracts: HashMap::new(),
        };
        save_json(CONTRACTOR_META_V1, &v1, &dir.path().join(CONTRACTOR_FILE)).unwrap();

        let migrated = load(dir.path()).unwrap().unwrap();
        assert_eq!(migrated.block_height, 10);
        assert_eq!(migrated.current_period, 8);
        assert_eq!(migrated.churn, ChurnPersist::default());

        // The migration rewrites the file at the current version.
        let reloaded: ContractorPersist =
            load_json(CONTRACTOR_META, &dir.path().join(CONTRACTOR_FILE)).unwrap();
        assert_eq!(reloaded, migrated);
    }

    #[test]
    fn unknown_newer_version_fails_closed() {
        let dir = TempDir::new().unwrap();
        let newer = Metadata {
            magic: "stratus/contractor",
            version: "9.9.9",
        };
        save_json(newer, &ContractorPersist::default(), &dir.path().join(CONTRACTOR_FILE))
            .unwrap();
        assert!(matches!(
            load(dir.path()),
            Err(StoreError::BadVersion { .. })
        ));
    }
}
