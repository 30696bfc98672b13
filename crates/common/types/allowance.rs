use serde::{Deserialize, Serialize};

use crate::{BlockHeight, Currency};

/// Operator policy controlling how much is spent and across how many hosts.
///
/// Setting the empty (default) allowance cancels all contracts: they are
/// locked and marked neither good for upload nor good for renew.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Allowance {
    /// Budget for the period, across all hosts.
    pub funds: Currency,
    /// Target number of active contracts.
    pub hosts: u64,
    /// Height span over which `funds` is meant to be spent.
    pub period: BlockHeight,
    /// Height span before a contract's end height during which renewal is
    /// attempted. Contracts live `period + renew_window` blocks on chain.
    pub renew_window: BlockHeight,

    // Capacity hints, consumed by host scoring and contract funding.
    pub expected_storage: u64,
    pub expected_upload: u64,
    pub expected_download: u64,
    pub expected_redundancy: f64,

    /// Byte budget for churn-limited contract removal per period.
    pub max_period_churn: u64,

    /// When set, contracts funded with exactly this amount may store zero
    /// bytes and still be renewed (payment contracts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_contract_initial_funding: Option<Currency>,

    // Price gates. A host exceeding any of these is rejected outright.
    pub max_rpc_price: Currency,
    pub max_contract_price: Currency,
    pub max_storage_price: Currency,
    pub max_upload_bandwidth_price: Currency,
    pub max_download_bandwidth_price: Currency,
    pub max_sector_access_price: Currency,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllowanceError {
    #[error("allowance has zero funds")]
    ZeroFunds,
    #[error("allowance has zero hosts")]
    ZeroHosts,
    #[error("allowance has zero period")]
    ZeroPeriod,
    #[error("allowance has zero renew window")]
    ZeroRenewWindow,
    #[error("allowance has zero expected storage")]
    ZeroExpectedStorage,
    #[error("allowance has zero expected upload")]
    ZeroExpectedUpload,
    #[error("allowance has zero expected download")]
    ZeroExpectedDownload,
    #[error("allowance has zero expected redundancy")]
    ZeroExpectedRedundancy,
    #[error("allowance has zero max period churn")]
    ZeroMaxPeriodChurn,
}

impl Allowance {
    /// The empty allowance requests cancellation of all contracts.
    pub fn is_empty(&self) -> bool {
        *self == Allowance::default()
    }

    /// Every recognized option must be strictly positive unless the whole
    /// allowance is empty.
    pub fn validate(&self) -> Result<(), AllowanceError> {
        if self.is_empty() {
            return Ok(());
        }
        if self.funds.is_zero() {
            return Err(AllowanceError::ZeroFunds);
        }
        if self.hosts == 0 {
            return Err(AllowanceError::ZeroHosts);
        }
        if self.period == 0 {
            return Err(AllowanceError::ZeroPeriod);
        }
        if self.renew_window == 0 {
            return Err(AllowanceError::ZeroRenewWindow);
        }
        if self.expected_storage == 0 {
            return Err(AllowanceError::ZeroExpectedStorage);
        }
        if self.expected_upload == 0 {
            return Err(AllowanceError::ZeroExpectedUpload);
        }
        if self.expected_download == 0 {
            return Err(AllowanceError::ZeroExpectedDownload);
        }
        if self.expected_redundancy <= 0.0 {
            return Err(AllowanceError::ZeroExpectedRedundancy);
        }
        if self.max_period_churn == 0 {
            return Err(AllowanceError::ZeroMaxPeriodChurn);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn filled() -> Allowance {
        Allowance {
            funds: Currency::from(1_000_000u64),
            hosts: 8,
            period: 50,
            renew_window: 10,
            expected_storage: 1 << 30,
            expected_upload: 1 << 28,
            expected_download: 1 << 28,
            expected_redundancy: 3.0,
            max_period_churn: 1 << 24,
            max_rpc_price: Currency::from(100u64),
            max_contract_price: Currency::from(1_000u64),
            max_storage_price: Currency::from(10u64),
            max_upload_bandwidth_price: Currency::from(10u64),
            max_download_bandwidth_price: Currency::from(10u64),
            max_sector_access_price: Currency::from(10u64),
            ..Default::default()
        }
    }

    #[test]
    fn empty_allowance_is_valid() {
        assert!(Allowance::default().is_empty());
        assert_eq!(Allowance::default().validate(), Ok(()));
    }

    #[test]
    fn filled_allowance_is_valid() {
        assert!(!filled().is_empty());
        assert_eq!(filled().validate(), Ok(()));
    }

    #[test]
    fn zeroed_fields_are_rejected() {
        let mut a = filled();
        a.hosts = 0;
        assert_eq!(a.validate(), Err(AllowanceError::ZeroHosts));

        let mut a = filled();
        a.period = 0;
        assert_eq!(a.validate(), Err(AllowanceError::ZeroPeriod));

        let mut a = filled();
        a.max_period_churn = 0;
        assert_eq!(a.validate(), Err(AllowanceError::ZeroMaxPeriodChurn));
    }
}
