//! Renter-host sessions: one revision of a file contract per exchange.
//!
//! An [`Editor`] uploads sectors, a [`Downloader`] fetches them; both hold
//! the contract exclusively for the life of the session and apply agreed
//! revisions through the contract set's write-ahead log, so a crash at any
//! point converges to a consistent pre- or post-revision state.
//!
//! The conversation with the host runs over a [`HostTransport`], keeping
//! the revision logic independent of the wire; the production transport
//! rides the gateway's RPC surface.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_common::{
    BlockHeight, ContractId, H256, SECTOR_SIZE, U256,
    interfaces::HostDb,
    types::{
        Allowance, FileContractRevision, HostEntry, HostSettings, Output, Transaction,
        TransactionSignature, merkle_root, sector_root,
    },
};
use stratus_gateway::Gateway;
use stratus_storage::{AcquiredContract, WalUpdate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::SessionError;

/// Fractional pricing cushion applied against hosts new enough to
/// advertise it: prices are padded and collateral shaved by 1/20 so a
/// block-height skew between renter and host cannot sink the exchange.
pub const PRICE_LEEWAY_NUM: u64 = 21;
pub const PRICE_LEEWAY_DEN: u64 = 20;
pub const COLLATERAL_LEEWAY_NUM: u64 = 19;

// --- transport -------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormContractRequest {
    pub transaction_set: Vec<Transaction>,
    pub contract_id: ContractId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenewContractRequest {
    pub transaction_set: Vec<Transaction>,
    pub contract_id: ContractId,
    pub renewed_from: ContractId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormContractResponse {
    /// The formation set co-signed by the host.
    pub transaction_set: Vec<Transaction>,
    pub initial_revision: FileContractRevision,
    pub signatures: Vec<TransactionSignature>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadRequest {
    pub contract_id: ContractId,
    pub revision: FileContractRevision,
    pub expected_collateral: U256,
    pub sector: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub contract_id: ContractId,
    pub revision: FileContractRevision,
    pub root: H256,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevisionAgreement {
    pub signatures: Vec<TransactionSignature>,
    /// The revision number the host holds after the exchange.
    pub host_revision_number: u64,
}

/// The host side of a session, as the renter sees it.
#[async_trait]
pub trait HostTransport: Send + Sync {
    async fn settings(&self, host: &HostEntry) -> Result<HostSettings, SessionError>;
    async fn form_contract(
        &self,
        host: &HostEntry,
        req: FormContractRequest,
    ) -> Result<FormContractResponse, SessionError>;
    async fn renew_contract(
        &self,
        host: &HostEntry,
        req: RenewContractRequest,
    ) -> Result<FormContractResponse, SessionError>;
    async fn upload_sector(
        &self,
        host: &HostEntry,
        req: UploadRequest,
    ) -> Result<RevisionAgreement, SessionError>;
    async fn download_sector(
        &self,
        host: &HostEntry,
        req: DownloadRequest,
    ) -> Result<(Vec<u8>, RevisionAgreement), SessionError>;
}

/// Production transport: host conversations as gateway RPCs.
#[derive(Debug)]
pub struct GatewayTransport {
    gateway: Gateway,
}

impl GatewayTransport {
    pub fn new(gateway: Gateway) -> Self {
        GatewayTransport { gateway }
    }

    async fn call<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        host: &HostEntry,
        rpc: &str,
        req: &Req,
    ) -> Result<Resp, SessionError> {
        use stratus_gateway::error::GatewayError;
        // Hosts are dialed on demand; an existing session is reused.
        match self.gateway.connect(&host.net_address).await {
            Ok(()) | Err(GatewayError::AlreadyConnected(_)) => {}
            Err(e) => return Err(SessionError::Transport(e.to_string())),
        }
        let body = serde_json::to_value(req).map_err(|e| SessionError::Transport(e.to_string()))?;
        let reply = self
            .gateway
            .rpc(&host.net_address, rpc, body)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        serde_json::from_value(reply).map_err(|e| SessionError::Transport(e.to_string()))
    }
}

#[async_trait]
impl HostTransport for GatewayTransport {
    async fn settings(&self, host: &HostEntry) -> Result<HostSettings, SessionError> {
        self.call(host, "HostSettings", &serde_json::Value::Null).await
    }

    async fn form_contract(
        &self,
        host: &HostEntry,
        req: FormContractRequest,
    ) -> Result<FormContractResponse, SessionError> {
        self.call(host, "FormContract", &req).await
    }

    async fn renew_contract(
        &self,
        host: &HostEntry,
        req: RenewContractRequest,
    ) -> Result<FormContractResponse, SessionError> {
        self.call(host, "RenewContract", &req).await
    }

    async fn upload_sector(
        &self,
        host: &HostEntry,
        req: UploadRequest,
    ) -> Result<RevisionAgreement, SessionError> {
        self.call(host, "UploadSector", &req).await
    }

    async fn download_sector(
        &self,
        host: &HostEntry,
        req: DownloadRequest,
    ) -> Result<(Vec<u8>, RevisionAgreement), SessionError> {
        self.call(host, "DownloadSector", &req).await
    }
}

// --- pricing ---------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SectorPricing {
    pub storage: U256,
    pub bandwidth: U256,
    pub collateral: U256,
}

/// Prices one sector append against the host's settings for the remainder
/// of the contract window.
pub(crate) fn upload_pricing(
    settings: &HostSettings,
    window_end: BlockHeight,
    height: BlockHeight,
    missed_host_payout: U256,
) -> SectorPricing {
    let duration = window_end.saturating_sub(height);
    let mut storage = settings.storage_price * SECTOR_SIZE * duration;
    let mut bandwidth = settings.upload_bandwidth_price * SECTOR_SIZE;
    let mut collateral = settings.collateral * SECTOR_SIZE * duration;
    if settings.has_pricing_leeway() {
        storage = storage * PRICE_LEEWAY_NUM / PRICE_LEEWAY_DEN;
        bandwidth = bandwidth * PRICE_LEEWAY_NUM / PRICE_LEEWAY_DEN;
        collateral = collateral * COLLATERAL_LEEWAY_NUM / PRICE_LEEWAY_DEN;
    }
    // The host cannot risk more than its missed payout.
    collateral = collateral.min(missed_host_payout);
    SectorPricing {
        storage,
        bandwidth,
        collateral,
    }
}

pub(crate) fn download_pricing(settings: &HostSettings) -> U256 {
    let mut bandwidth =
        settings.download_bandwidth_price * SECTOR_SIZE + settings.sector_access_price;
    if settings.has_pricing_leeway() {
        bandwidth = bandwidth * PRICE_LEEWAY_NUM / PRICE_LEEWAY_DEN;
    }
    bandwidth
}

/// Rejects a host whose advertised prices break the allowance's gates.
pub(crate) fn check_price_gates(
    allowance: &Allowance,
    settings: &HostSettings,
) -> Result<(), SessionError> {
    if settings.base_rpc_price > allowance.max_rpc_price {
        return Err(SessionError::PriceGateExceeded("rpc price"));
    }
    if settings.contract_price > allowance.max_contract_price {
        return Err(SessionError::PriceGateExceeded("contract price"));
    }
    if settings.storage_price > allowance.max_storage_price {
        return Err(SessionError::PriceGateExceeded("storage price"));
    }
    if settings.upload_bandwidth_price > allowance.max_upload_bandwidth_price {
        return Err(SessionError::PriceGateExceeded("upload bandwidth price"));
    }
    if settings.download_bandwidth_price > allowance.max_download_bandwidth_price {
        return Err(SessionError::PriceGateExceeded("download bandwidth price"));
    }
    if settings.sector_access_price > allowance.max_sector_access_price {
        return Err(SessionError::PriceGateExceeded("sector access price"));
    }
    Ok(())
}

/// The next revision after debiting the renter by `cost` and crediting the
/// host, optionally replacing the contract contents.
fn next_revision(
    current: &FileContractRevision,
    cost: U256,
    new_root: Option<H256>,
    new_size: Option<u64>,
) -> Result<FileContractRevision, SessionError> {
    let renter_funds = current.renter_payout();
    if renter_funds < cost {
        return Err(SessionError::InsufficientFunds);
    }
    let mut revision = current.clone();
    revision.revision_number = current
        .revision_number
        .checked_add(1)
        .ok_or(SessionError::ContractLocked)?;
    if let Some(root) = new_root {
        revision.file_merkle_root = root;
    }
    if let Some(size) = new_size {
        revision.file_size = size;
    }
    set_payout(&mut revision.valid_proof_outputs, 0, renter_funds - cost);
    let host_valid = current.host_payout() + cost;
    set_payout(&mut revision.valid_proof_outputs, 1, host_valid);
    let missed_renter = current
        .missed_proof_outputs
        .first()
        .map(|o| o.value)
        .unwrap_or_default();
    set_payout(
        &mut revision.missed_proof_outputs,
        0,
        missed_renter.saturating_sub(cost),
    );
    Ok(revision)
}

fn set_payout(outputs: &mut Vec<Output>, index: usize, value: U256) {
    while outputs.len() <= index {
        outputs.push(Output::default());
    }
    outputs[index].value = value;
}

// --- editor ----------------------------------------------------------------

/// Mutable session against one contract's host; appends sectors.
pub struct Editor {
    pub(crate) host: HostEntry,
    pub(crate) settings: HostSettings,
    pub(crate) acquired: AcquiredContract,
    pub(crate) transport: Arc<dyn HostTransport>,
    pub(crate) hostdb: Arc<dyn HostDb>,
    pub(crate) height: BlockHeight,
    pub(crate) cancel: CancellationToken,
}

impl Editor {
    pub fn contract_id(&self) -> ContractId {
        self.acquired.metadata().id
    }

    /// Uploads one sector, revising the contract to pay for storage and
    /// bandwidth. Returns the sector's Merkle root.
    pub async fn upload(&mut self, data: &[u8]) -> Result<H256, SessionError> {
        match self.upload_once(data).await {
            Err(SessionError::RevisionNumberMismatch { ours, theirs }) => {
                debug!(
                    contract = %self.contract_id(),
                    ours, theirs,
                    "Revision mismatch; draining write-ahead log and retrying"
                );
                // Fold in any not-yet-applied revisions, then try once more.
                self.acquired.commit_unapplied()?;
                self.upload_once(data).await
            }
            other => other,
        }
    }

    async fn upload_once(&mut self, data: &[u8]) -> Result<H256, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let metadata = self.acquired.metadata();
        let contract_id = metadata.id;
        if metadata.utility.locked {
            return Err(SessionError::ContractLocked);
        }
        let current = metadata
            .transaction
            .file_contract_revisions
            .first()
            .cloned()
            .ok_or(SessionError::ContractLocked)?;

        let pricing = upload_pricing(
            &self.settings,
            current.window_end,
            self.height,
            current.missed_host_payout(),
        );
        let cost = pricing.storage + pricing.bandwidth;

        let root = sector_root(data);
        let mut roots = self.acquired.roots().to_vec();
        roots.push(root);
        let new_merkle_root = merkle_root(&roots);
        let new_size = current.file_size + SECTOR_SIZE;

        let revision = next_revision(&current, cost, Some(new_merkle_root), Some(new_size))?;

        // The append-intent makes the exchange atomic: recorded before the
        // host sees anything, committed or recovered afterwards.
        self.acquired.record_intent(WalUpdate {
            revision: revision.clone(),
            signatures: Vec::new(),
            appended_root: Some(root),
            storage_spending: pricing.storage,
            upload_spending: pricing.bandwidth,
            download_spending: U256::zero(),
        })?;

        let request = UploadRequest {
            contract_id,
            revision,
            expected_collateral: pricing.collateral,
            sector: data.to_vec(),
        };
        match self.transport.upload_sector(&self.host, request).await {
            Ok(agreement) => {
                self.acquired.attach_signatures(agreement.signatures);
                self.acquired.commit_unapplied()?;
                let _ = self
                    .hostdb
                    .increment_successful_interactions(&self.host.public_key)
                    .await;
                trace!(contract = %self.contract_id(), %root, "Sector uploaded");
                Ok(root)
            }
            Err(e) => {
                self.acquired.rollback_intent()?;
                self.handle_exchange_error(e).await
            }
        }
    }

    async fn handle_exchange_error<T>(&mut self, e: SessionError) -> Result<T, SessionError> {
        if let SessionError::OutOfStorage = e {
            let mut utility = self.acquired.metadata().utility.clone();
            utility.good_for_upload = false;
            utility.last_oos_err = self.height;
            self.acquired.set_utility(utility)?;
        }
        if e.is_host_fault() {
            let _ = self
                .hostdb
                .increment_failed_interactions(&self.host.public_key)
                .await;
        } else {
            let _ = self
                .hostdb
                .increment_successful_interactions(&self.host.public_key)
                .await;
        }
        Err(e)
    }
}

// --- downloader -------------------------------------------------------------

/// Read-only session against one contract's host; fetches sectors.
pub struct Downloader {
    pub(crate) host: HostEntry,
    pub(crate) settings: HostSettings,
    pub(crate) acquired: AcquiredContract,
    pub(crate) transport: Arc<dyn HostTransport>,
    pub(crate) hostdb: Arc<dyn HostDb>,
    pub(crate) cancel: CancellationToken,
}

impl Downloader {
    pub fn contract_id(&self) -> ContractId {
        self.acquired.metadata().id
    }

    /// Fetches the sector with the given root, paying bandwidth only; the
    /// Merkle root and file size stay untouched.
    pub async fn download(&mut self, root: H256) -> Result<Vec<u8>, SessionError> {
        match self.download_once(root).await {
            Err(SessionError::RevisionNumberMismatch { ours, theirs }) => {
                debug!(
                    contract = %self.contract_id(),
                    ours, theirs,
                    "Revision mismatch; draining write-ahead log and retrying"
                );
                self.acquired.commit_unapplied()?;
                self.download_once(root).await
            }
            other => other,
        }
    }

    async fn download_once(&mut self, root: H256) -> Result<Vec<u8>, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let metadata = self.acquired.metadata();
        let contract_id = metadata.id;
        if metadata.utility.locked {
            return Err(SessionError::ContractLocked);
        }
        let current = metadata
            .transaction
            .file_contract_revisions
            .first()
            .cloned()
            .ok_or(SessionError::ContractLocked)?;

        let cost = download_pricing(&self.settings);
        let revision = next_revision(&current, cost, None, None)?;

        self.acquired.record_intent(WalUpdate {
            revision: revision.clone(),
            signatures: Vec::new(),
            appended_root: None,
            storage_spending: U256::zero(),
            upload_spending: U256::zero(),
            download_spending: cost,
        })?;

        let request = DownloadRequest {
            contract_id,
            revision,
            root,
        };
        match self.transport.download_sector(&self.host, request).await {
            Ok((data, agreement)) => {
                if sector_root(&data) != root {
                    self.acquired.rollback_intent()?;
                    let _ = self
                        .hostdb
                        .increment_failed_interactions(&self.host.public_key)
                        .await;
                    return Err(SessionError::HostFault(
                        "sector does not match requested root".to_string(),
                    ));
                }
                self.acquired.attach_signatures(agreement.signatures);
                self.acquired.commit_unapplied()?;
                let _ = self
                    .hostdb
                    .increment_successful_interactions(&self.host.public_key)
                    .await;
                Ok(data)
            }
            Err(e) => {
                self.acquired.rollback_intent()?;
                if e.is_host_fault() {
                    let _ = self
                        .hostdb
                        .increment_failed_interactions(&self.host.public_key)
                        .await;
                }
                Err(e)
            }
        }
    }
}

