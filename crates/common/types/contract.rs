use serde::{Deserialize, Serialize};

use crate::{
    BlockHeight, ContractId, Currency, HostPublicKey, types::transaction::Transaction,
};

/// Usability flags maintained per contract by the contractor's utility checks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractUtility {
    pub good_for_upload: bool,
    pub good_for_renew: bool,
    /// Set after an unrecoverable failure; the contract is abandoned.
    pub bad_contract: bool,
    /// Height at which the host last reported out-of-storage, 0 if never.
    pub last_oos_err: BlockHeight,
    /// Locked contracts never change utility again and accept no sessions.
    pub locked: bool,
}

/// Spending accumulated against a contract over its lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpending {
    pub uploads: Currency,
    pub downloads: Currency,
    pub storage: Currency,
    pub fees: Currency,
}

impl ContractSpending {
    pub fn total(&self) -> Currency {
        self.uploads + self.downloads + self.storage + self.fees
    }
}

/// A file contract from the renter's point of view: the signed last revision
/// transaction plus local metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenterContract {
    pub id: ContractId,
    pub host_public_key: HostPublicKey,
    pub start_height: BlockHeight,
    pub end_height: BlockHeight,
    /// Transaction holding the most recent revision, with signatures.
    pub transaction: Transaction,
    pub spending: ContractSpending,
    /// Everything spent forming and funding the contract, fees included.
    pub total_cost: Currency,
    pub utility: ContractUtility,
}

impl RenterContract {
    /// Revision number of the contract's most recent revision.
    pub fn revision_number(&self) -> u64 {
        self.transaction
            .file_contract_revisions
            .first()
            .map(|r| r.revision_number)
            .unwrap_or(0)
    }

    /// Number of bytes the contract currently stores.
    pub fn file_size(&self) -> u64 {
        self.transaction
            .file_contract_revisions
            .first()
            .map(|r| r.file_size)
            .unwrap_or(0)
    }

    /// Remaining prepaid balance the renter can still spend.
    pub fn renter_funds(&self) -> Currency {
        self.transaction
            .file_contract_revisions
            .first()
            .map(|r| r.renter_payout())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::{FileContractRevision, Output};
    use ethereum_types::H256;

    #[test]
    fn contract_reads_through_last_revision() {
        let mut contract = RenterContract::default();
        assert_eq!(contract.revision_number(), 0);
        assert_eq!(contract.renter_funds(), Currency::zero());

        contract.transaction.file_contract_revisions.push(FileContractRevision {
            parent_id: H256::from_low_u64_be(1),
            revision_number: 7,
            file_size: 4096,
            valid_proof_outputs: vec![
                Output {
                    value: Currency::from(250u64),
                    unlock_hash: H256::zero(),
                },
                Output {
                    value: Currency::from(50u64),
                    unlock_hash: H256::zero(),
                },
            ],
            ..Default::default()
        });
        assert_eq!(contract.revision_number(), 7);
        assert_eq!(contract.file_size(), 4096);
        assert_eq!(contract.renter_funds(), Currency::from(250u64));
    }

    #[test]
    fn spending_totals() {
        let spending = ContractSpending {
            uploads: Currency::from(1u64),
            downloads: Currency::from(2u64),
            storage: Currency::from(3u64),
            fees: Currency::from(4u64),
        };
        assert_eq!(spending.total(), Currency::from(10u64));
    }
}
