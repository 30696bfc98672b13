//! The contractor: allowance, contract set maintenance and lifecycle.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use stratus_common::{
    BlockHeight, ContractId, Currency, H256, HostPublicKey,
    interfaces::{ConsensusSubscriber, HostDb, TransactionPool, Wallet},
    types::{Allowance, ConsensusChange, ContractSpending, ContractUtility, RenterContract, Transaction},
};
use stratus_storage::ContractSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    alerts::Alerter,
    churn::ChurnLimiter,
    error::{ContractorError, SessionError},
    maintenance,
    persist::{self, ContractorPersist},
    session::{self, Downloader, Editor, HostTransport},
    watchdog::{FileContractStatus, Watchdog, WatchdogCallbacks},
};

/// Module tag used on alerts raised by the contractor.
pub(crate) const ALERT_MODULE: &str = "contractor";
pub(crate) const ALERT_WALLET_LOCKED: &str = "wallet locked during maintenance";
pub(crate) const ALERT_ALLOWANCE_LOW_FUNDS: &str = "allowance low funds";
pub(crate) const ALERT_RENEWAL_FAILURE: &str = "contract renewal failure";

/// Renewal attempts before the failure alert escalates to critical.
pub(crate) const MAX_RENEWAL_FAILURES: u32 = 3;

#[derive(Clone, Debug)]
pub struct ContractorConfig {
    pub datadir: PathBuf,
}

/// Operator view of contract recovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryProgress {
    pub recoverable_contracts: usize,
}

pub(crate) struct ContractorInner {
    pub allowance: Allowance,
    pub block_height: BlockHeight,
    pub current_period: BlockHeight,
    pub synced: bool,
    pub last_change_id: H256,
    pub period_spent: Currency,
    pub renewed_from: HashMap<ContractId, ContractId>,
    pub renewed_to: HashMap<ContractId, ContractId>,
    pub old_contracts: HashMap<ContractId, RenterContract>,
    pub double_spent: HashMap<ContractId, BlockHeight>,
    pub recoverable: Vec<RenterContract>,
    pub renewal_failures: HashMap<ContractId, u32>,
}

pub(crate) struct ContractorState {
    pub dir: PathBuf,
    pub inner: RwLock<ContractorInner>,
    pub set: ContractSet,
    pub watchdog: Watchdog,
    pub churn: ChurnLimiter,
    pub alerter: Arc<Alerter>,
    pub hostdb: Arc<dyn HostDb>,
    pub wallet: Arc<dyn Wallet>,
    pub tpool: Arc<dyn TransactionPool>,
    pub transport: Arc<dyn HostTransport>,
    /// Contracts the watchdog flagged as double-spent, drained by
    /// maintenance.
    pub pending_double_spends: Arc<StdMutex<HashMap<ContractId, BlockHeight>>>,
    maintenance_running: AtomicBool,
    maintenance_redo: AtomicBool,
    /// Serializes maintenance rounds regardless of who triggers them.
    maintenance_serial: tokio::sync::Mutex<()>,
    pub shutdown: CancellationToken,
}

/// Cheap-to-clone handle onto the contractor.
#[derive(Clone)]
pub struct Contractor {
    pub(crate) state: Arc<ContractorState>,
}

impl std::fmt::Debug for Contractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contractor").finish()
    }
}

/// Callback capabilities handed to the watchdog instead of a contractor
/// reference.
struct WatchdogHooks {
    pending: Arc<StdMutex<HashMap<ContractId, BlockHeight>>>,
    set: ContractSet,
}

impl WatchdogCallbacks for WatchdogHooks {
    fn contract_double_spent(&self, id: ContractId, height: BlockHeight) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, height);
    }

    fn latest_revision(&self, id: &ContractId) -> Option<Transaction> {
        self.set.view(id).map(|c| c.transaction)
    }
}

impl Contractor {
    /// Opens the contractor from its on-disk state. Nothing happens until
    /// consensus changes start arriving.
    pub fn new(
        cfg: ContractorConfig,
        hostdb: Arc<dyn HostDb>,
        wallet: Arc<dyn Wallet>,
        tpool: Arc<dyn TransactionPool>,
        transport: Arc<dyn HostTransport>,
        alerter: Arc<Alerter>,
    ) -> Result<Contractor, ContractorError> {
        let dir = cfg.datadir.join("contractor");
        let set = ContractSet::open(dir.join("contracts"))?;
        let persisted = persist::load(&dir)?;

        let pending = Arc::new(StdMutex::new(HashMap::new()));
        let hooks = WatchdogHooks {
            pending: pending.clone(),
            set: set.clone(),
        };
        let watchdog = Watchdog::new(tpool.clone(), wallet.clone(), Box::new(hooks));

        let (churn, inner) = match persisted {
            Some(p) => {
                let churn = ChurnLimiter::from_persist(&p.churn);
                churn.set_allowance(p.allowance.max_period_churn, p.allowance.period);
                watchdog.restore(p.watchdog, p.allowance.renew_window);
                let inner = ContractorInner {
                    allowance: p.allowance,
                    block_height: p.block_height,
                    current_period: p.current_period,
                    synced: false,
                    last_change_id: p.last_change_id,
                    period_spent: p.period_spent,
                    renewed_from: p.renewed_from,
                    renewed_to: p.renewed_to,
                    old_contracts: p.old_contracts,
                    double_spent: p.double_spent,
                    recoverable: p.recoverable,
                    renewal_failures: HashMap::new(),
                };
                (churn, inner)
            }
            None => (
                ChurnLimiter::new(),
                ContractorInner {
                    allowance: Allowance::default(),
                    block_height: 0,
                    current_period: 0,
                    synced: false,
                    last_change_id: H256::zero(),
                    period_spent: Currency::zero(),
                    renewed_from: HashMap::new(),
                    renewed_to: HashMap::new(),
                    old_contracts: HashMap::new(),
                    double_spent: HashMap::new(),
                    recoverable: Vec::new(),
                    renewal_failures: HashMap::new(),
                },
            ),
        };

        Ok(Contractor {
            state: Arc::new(ContractorState {
                dir,
                inner: RwLock::new(inner),
                set,
                watchdog,
                churn,
                alerter,
                hostdb,
                wallet,
                tpool,
                transport,
                pending_double_spends: pending,
                maintenance_running: AtomicBool::new(false),
                maintenance_redo: AtomicBool::new(false),
                maintenance_serial: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    // --- allowance --------------------------------------------------------

    /// Sets (or cancels, with the empty allowance) the operator policy and
    /// kicks off a maintenance round.
    pub async fn set_allowance(&self, allowance: Allowance) -> Result<(), ContractorError> {
        allowance.validate()?;

        if allowance.is_empty() {
            info!("Allowance cancelled, locking all contracts");
            self.cancel_all_contracts().await?;
            let mut inner = self.write();
            inner.allowance = allowance;
            drop(inner);
            self.save()?;
            return Ok(());
        }

        if !self.synced() {
            return Err(ContractorError::NotSynced);
        }

        {
            let mut inner = self.write();
            if inner.current_period == 0 {
                inner.current_period = inner.block_height;
            }
            inner.allowance = allowance.clone();
        }

        // Unlock contracts a previous cancellation froze; the next
        // maintenance pass recomputes their utility.
        for id in self.state.set.ids() {
            let Some(view) = self.state.set.view(&id) else {
                continue;
            };
            if view.utility.locked && view.revision_number() != u64::MAX {
                let mut utility = view.utility;
                utility.locked = false;
                self.state.set.update_utility(&id, utility).await?;
            }
        }

        self.state
            .churn
            .set_allowance(allowance.max_period_churn, allowance.period);
        self.state.watchdog.set_renew_window(allowance.renew_window);
        self.state.hostdb.set_allowance(&allowance).await?;
        self.save()?;
        self.trigger_maintenance();
        Ok(())
    }

    pub fn allowance(&self) -> Allowance {
        self.read().allowance.clone()
    }

    // --- contract views ---------------------------------------------------

    pub fn contracts(&self) -> Vec<RenterContract> {
        self.state.set.views()
    }

    pub fn contract_by_id(&self, id: &ContractId) -> Option<RenterContract> {
        self.state.set.view(id)
    }

    pub fn old_contracts(&self) -> Vec<RenterContract> {
        self.read().old_contracts.values().cloned().collect()
    }

    pub fn renewed_from(&self, id: &ContractId) -> Option<ContractId> {
        self.read().renewed_from.get(id).copied()
    }

    pub fn renewed_to(&self, id: &ContractId) -> Option<ContractId> {
        self.read().renewed_to.get(id).copied()
    }

    /// Watchdog view of one contract's on-chain standing.
    pub fn contract_status(&self, id: &ContractId) -> Option<FileContractStatus> {
        self.state.watchdog.contract_status(id)
    }

    pub fn recovery_progress(&self) -> RecoveryProgress {
        RecoveryProgress {
            recoverable_contracts: self.read().recoverable.len(),
        }
    }

    /// Aggregate spending attributed to the current period.
    pub fn period_spending(&self) -> ContractSpending {
        let mut spending = ContractSpending::default();
        for contract in self.state.set.views() {
            spending.uploads += contract.spending.uploads;
            spending.downloads += contract.spending.downloads;
            spending.storage += contract.spending.storage;
            spending.fees += contract.spending.fees;
        }
        spending.fees += self.read().period_spent;
        spending
    }

    pub fn synced(&self) -> bool {
        self.read().synced
    }

    pub fn block_height(&self) -> BlockHeight {
        self.read().block_height
    }

    pub fn current_period(&self) -> BlockHeight {
        self.read().current_period
    }

    pub fn alerts(&self) -> Vec<crate::alerts::Alert> {
        self.state.alerter.active()
    }

    // --- cancellation -----------------------------------------------------

    /// Cancels one contract: locked, unusable, moved to the archive.
    pub async fn cancel_contract(&self, id: &ContractId) -> Result<(), ContractorError> {
        if !self.state.set.contains(id) {
            return Err(ContractorError::ContractNotFound(*id));
        }
        self.disable_and_lock(id).await?;
        let removed = self.state.set.remove(id).await?;
        {
            let mut inner = self.write();
            inner.old_contracts.insert(*id, removed);
        }
        info!(contract = %id, "Contract cancelled");
        self.save()?;
        Ok(())
    }

    async fn cancel_all_contracts(&self) -> Result<(), ContractorError> {
        for id in self.state.set.ids() {
            self.disable_and_lock(&id).await?;
        }
        Ok(())
    }

    async fn disable_and_lock(&self, id: &ContractId) -> Result<(), ContractorError> {
        let Some(view) = self.state.set.view(id) else {
            return Ok(());
        };
        let utility = ContractUtility {
            good_for_upload: false,
            good_for_renew: false,
            locked: true,
            ..view.utility
        };
        self.state.set.update_utility(id, utility).await?;
        Ok(())
    }

    // --- sessions ---------------------------------------------------------

    /// A revising session against the active contract with `host_key`.
    /// Alias for [`Contractor::editor`]; downloads that only need the
    /// bandwidth debit use [`Contractor::downloader`] instead.
    pub async fn session(
        &self,
        host_key: &HostPublicKey,
        cancel: CancellationToken,
    ) -> Result<Editor, ContractorError> {
        self.editor(host_key, cancel).await
    }

    /// An upload session against the active contract with `host_key`.
    pub async fn editor(
        &self,
        host_key: &HostPublicKey,
        cancel: CancellationToken,
    ) -> Result<Editor, ContractorError> {
        let (id, view) = self.active_contract_with_host(host_key)?;
        if self.state.set.is_renewing(&id) {
            return Err(ContractorError::ContractRenewing(id));
        }
        if view.utility.locked {
            return Err(ContractorError::Session(SessionError::ContractLocked));
        }
        if !view.utility.good_for_upload {
            return Err(ContractorError::Session(SessionError::NotGoodForUpload));
        }
        let host = self
            .state
            .hostdb
            .host(host_key)
            .await?
            .ok_or(ContractorError::NoContractWithHost(*host_key))?;
        let settings = self.state.transport.settings(&host).await?;
        session::check_price_gates(&self.allowance(), &settings)?;
        let mut acquired = self.state.set.acquire(&id).await?;
        // Fold in anything a previous session left unapplied before the
        // host sees a new revision.
        acquired.commit_unapplied().map_err(SessionError::from)?;
        Ok(Editor {
            host,
            settings,
            acquired,
            transport: self.state.transport.clone(),
            hostdb: self.state.hostdb.clone(),
            height: self.block_height(),
            cancel,
        })
    }

    /// A download session against the active contract with `host_key`.
    pub async fn downloader(
        &self,
        host_key: &HostPublicKey,
        cancel: CancellationToken,
    ) -> Result<Downloader, ContractorError> {
        let (id, view) = self.active_contract_with_host(host_key)?;
        if self.state.set.is_renewing(&id) {
            return Err(ContractorError::ContractRenewing(id));
        }
        if view.utility.locked {
            return Err(ContractorError::Session(SessionError::ContractLocked));
        }
        let host = self
            .state
            .hostdb
            .host(host_key)
            .await?
            .ok_or(ContractorError::NoContractWithHost(*host_key))?;
        let settings = self.state.transport.settings(&host).await?;
        session::check_price_gates(&self.allowance(), &settings)?;
        let mut acquired = self.state.set.acquire(&id).await?;
        acquired.commit_unapplied().map_err(SessionError::from)?;
        Ok(Downloader {
            host,
            settings,
            acquired,
            transport: self.state.transport.clone(),
            hostdb: self.state.hostdb.clone(),
            cancel,
        })
    }

    fn active_contract_with_host(
        &self,
        host_key: &HostPublicKey,
    ) -> Result<(ContractId, RenterContract), ContractorError> {
        self.state
            .set
            .views()
            .into_iter()
            .find(|c| c.host_public_key == *host_key)
            .map(|c| (c.id, c))
            .ok_or(ContractorError::NoContractWithHost(*host_key))
    }

    // --- consensus --------------------------------------------------------

    /// Serial entry point for consensus changes; also the maintenance
    /// trigger.
    pub async fn process_change(&self, change: &ConsensusChange) {
        {
            let mut inner = self.write();
            for _ in &change.reverted_blocks {
                // Genesis is never reverted.
                inner.block_height = inner.block_height.saturating_sub(1);
            }
            inner.block_height += change.applied_blocks.len() as u64;
            inner.synced = change.synced;
            inner.last_change_id = change.id;
        }
        self.state
            .churn
            .blocks_applied(change.applied_blocks.len() as u64);

        // Watchdog runs inside the consensus-change handler, after the
        // contractor lock is released.
        self.state.watchdog.process_consensus_change(change).await;

        if change.synced {
            self.rollover_period_if_due();
            self.trigger_maintenance();
        }
    }

    fn rollover_period_if_due(&self) {
        let mut inner = self.write();
        let period = inner.allowance.period;
        if period == 0 || inner.current_period == 0 {
            return;
        }
        let mut rolled = false;
        while inner.block_height >= inner.current_period + period {
            inner.current_period += period;
            inner.period_spent = Currency::zero();
            rolled = true;
        }
        if rolled {
            info!(period_start = inner.current_period, "Period rollover");
            drop(inner);
            self.state.churn.reset_aggregate();
        }
    }

    /// Runs maintenance in a spawned task; a second trigger while one is
    /// running is coalesced into a re-run after it completes.
    pub fn trigger_maintenance(&self) {
        if !self.synced() || self.allowance().is_empty() {
            return;
        }
        if self
            .state
            .maintenance_running
            .swap(true, Ordering::AcqRel)
        {
            self.state.maintenance_redo.store(true, Ordering::Release);
            return;
        }
        let contractor = self.clone();
        tokio::spawn(async move {
            loop {
                contractor.perform_maintenance().await;
                if !contractor
                    .state
                    .maintenance_redo
                    .swap(false, Ordering::AcqRel)
                {
                    break;
                }
                debug!("Re-running coalesced maintenance");
            }
            contractor
                .state
                .maintenance_running
                .store(false, Ordering::Release);
        });
    }

    /// One full maintenance round, run to completion. Exposed so tests and
    /// the trigger task share the same path.
    pub async fn perform_maintenance(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        let _serial = self.state.maintenance_serial.lock().await;
        maintenance::run(self).await;
    }

    // --- persistence ------------------------------------------------------

    pub fn save(&self) -> Result<(), ContractorError> {
        let snapshot = {
            let inner = self.read();
            ContractorPersist {
                allowance: inner.allowance.clone(),
                block_height: inner.block_height,
                current_period: inner.current_period,
                last_change_id: inner.last_change_id,
                period_spent: inner.period_spent,
                renewed_from: inner.renewed_from.clone(),
                renewed_to: inner.renewed_to.clone(),
                old_contracts: inner.old_contracts.clone(),
                double_spent: inner.double_spent.clone(),
                recoverable: inner.recoverable.clone(),
                churn: self.state.churn.persist(),
                watchdog: self.state.watchdog.persist(),
            }
        };
        persist::save(&self.state.dir, &snapshot)?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.state.shutdown.cancel();
        if let Err(e) = self.save() {
            warn!(err = %e, "Failed to save contractor state during shutdown");
        }
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, ContractorInner> {
        self.state.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, ContractorInner> {
        self.state.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConsensusSubscriber for Contractor {
    async fn process_consensus_change(&self, change: ConsensusChange) {
        self.process_change(&change).await;
    }
}
