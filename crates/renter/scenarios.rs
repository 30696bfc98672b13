//! End-to-end contractor scenarios against in-process collaborators.

use std::sync::Arc;

use stratus_common::{
    SECTOR_SIZE, U256,
    types::{Allowance, Input, Output, Transaction},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
    alerts::Alerter,
    contractor::{Contractor, ContractorConfig},
    error::{ContractorError, SessionError},
    testutil::{
        StubHostDb, StubPool, StubTransport, StubWallet, allowance, applied_change, block,
        host_entry, reverted_change,
    },
};

struct Harness {
    contractor: Contractor,
    hostdb: Arc<StubHostDb>,
    wallet: Arc<StubWallet>,
    pool: Arc<StubPool>,
    transport: Arc<StubTransport>,
    next_block: u64,
    _dir: TempDir,
}

impl Harness {
    fn new(num_hosts: u64) -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let hostdb = StubHostDb::new();
        for n in 1..=num_hosts {
            hostdb.insert(host_entry(n));
        }
        let wallet = StubWallet::new();
        let pool = StubPool::new();
        let transport = StubTransport::new();
        let contractor = Contractor::new(
            ContractorConfig {
                datadir: dir.path().to_path_buf(),
            },
            hostdb.clone(),
            wallet.clone(),
            pool.clone(),
            transport.clone(),
            Arc::new(Alerter::new()),
        )
        .expect("contractor");
        Harness {
            contractor,
            hostdb,
            wallet,
            pool,
            transport,
            next_block: 0,
            _dir: dir,
        }
    }

    /// Applies empty synced blocks until `height`, then settles maintenance.
    async fn sync_to(&mut self, height: u64) {
        let mut blocks = Vec::new();
        while self.next_block < height {
            self.next_block += 1;
            blocks.push(block(self.next_block, vec![]));
        }
        self.contractor
            .process_change(&applied_change(self.next_block, blocks))
            .await;
        self.contractor.perform_maintenance().await;
    }

    async fn apply_block(&mut self, txns: Vec<Transaction>) {
        self.next_block += 1;
        self.contractor
            .process_change(&applied_change(self.next_block, vec![block(self.next_block, txns)]))
            .await;
        self.contractor.perform_maintenance().await;
    }

    async fn setup_contracts(&mut self, a: Allowance) {
        self.sync_to(1).await;
        self.contractor.set_allowance(a).await.expect("allowance");
        self.contractor.perform_maintenance().await;
    }
}

#[tokio::test]
async fn set_allowance_requires_synced_chain() {
    let harness = Harness::new(2);
    let err = harness.contractor.set_allowance(allowance()).await;
    assert!(matches!(err, Err(ContractorError::NotSynced)));
}

#[tokio::test]
async fn invalid_allowance_is_rejected() {
    let mut harness = Harness::new(2);
    harness.sync_to(1).await;
    let mut bad = allowance();
    bad.hosts = 0;
    assert!(matches!(
        harness.contractor.set_allowance(bad).await,
        Err(ContractorError::Allowance(_))
    ));
}

#[tokio::test]
async fn maintenance_forms_contracts_to_target() {
    let mut harness = Harness::new(4);
    harness.setup_contracts(allowance()).await;

    let contracts = harness.contractor.contracts();
    assert_eq!(contracts.len(), 2);
    for contract in &contracts {
        assert!(contract.utility.good_for_upload);
        assert!(contract.utility.good_for_renew);
        // The watchdog monitors every formation.
        assert!(harness.contractor.contract_status(&contract.id).is_some());
    }
    // One active contract per host.
    let mut hosts: Vec<_> = contracts.iter().map(|c| c.host_public_key).collect();
    hosts.sort();
    hosts.dedup();
    assert_eq!(hosts.len(), 2);
    // Formation sets went to the transaction pool.
    assert!(harness.pool.accepted_count() >= 2);
    assert_eq!(*harness.transport.formed.lock().expect("lock"), 2);
}

#[tokio::test]
async fn contracts_renew_inside_the_renew_window() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    let originals: Vec<_> = harness.contractor.contracts().iter().map(|c| c.id).collect();
    assert_eq!(originals.len(), 2);

    // Formed at height 1 with period 50: end height 51, renew window 10.
    harness.sync_to(41).await;
    // One more pass archives the renewed-from contracts.
    harness.contractor.perform_maintenance().await;

    let active = harness.contractor.contracts();
    assert_eq!(active.len(), 2);
    for old_id in &originals {
        let new_id = harness
            .contractor
            .renewed_to(old_id)
            .expect("successor recorded");
        assert!(active.iter().any(|c| c.id == new_id));
        assert_eq!(harness.contractor.renewed_from(&new_id), Some(*old_id));
    }
    let archived = harness.contractor.old_contracts();
    assert_eq!(archived.len(), 2);
    assert_eq!(*harness.transport.renewed.lock().expect("lock"), 2);
}

#[tokio::test]
async fn refresh_keeps_end_height_when_funds_run_low() {
    let mut harness = Harness::new(1);
    let mut a = allowance();
    a.hosts = 1;
    harness.setup_contracts(a).await;
    let original = harness.contractor.contracts().remove(0);

    // Drain the contract's funds so the partition picks refresh.
    {
        let mut acquired = harness
            .contractor
            .state
            .set
            .acquire(&original.id)
            .await
            .expect("acquire");
        let mut revision = original.transaction.file_contract_revisions[0].clone();
        revision.revision_number += 1;
        revision.valid_proof_outputs[0].value = U256::from(1u64);
        acquired
            .record_intent(stratus_storage::WalUpdate {
                revision,
                ..Default::default()
            })
            .expect("intent");
        acquired.commit_unapplied().expect("commit");
    }

    harness.sync_to(41).await;
    let successor_id = harness
        .contractor
        .renewed_to(&original.id)
        .expect("refreshed");
    let successor = harness
        .contractor
        .contract_by_id(&successor_id)
        .expect("successor active");
    // A refresh replaces the contract at the same end height.
    assert_eq!(successor.end_height, original.end_height);
}

#[tokio::test]
async fn empty_allowance_cancels_every_contract() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    assert_eq!(harness.contractor.contracts().len(), 2);

    harness
        .contractor
        .set_allowance(Allowance::default())
        .await
        .expect("cancel");

    for contract in harness.contractor.contracts() {
        assert!(contract.utility.locked);
        assert!(!contract.utility.good_for_upload);
        assert!(!contract.utility.good_for_renew);
    }

    // A fresh allowance unlocks them again.
    harness
        .contractor
        .set_allowance(allowance())
        .await
        .expect("allowance");
    harness.contractor.perform_maintenance().await;
    for contract in harness.contractor.contracts() {
        assert!(!contract.utility.locked);
        assert!(contract.utility.good_for_renew);
    }
}

#[tokio::test]
async fn upload_and_download_roundtrip() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    let contract = harness.contractor.contracts().remove(0);
    let key = contract.host_public_key;

    let data = vec![0x5a; 64];
    let root = {
        let mut editor = harness
            .contractor
            .editor(&key, CancellationToken::new())
            .await
            .expect("editor");
        editor.upload(&data).await.expect("upload")
    };

    let updated = harness
        .contractor
        .contract_by_id(&contract.id)
        .expect("contract");
    assert_eq!(updated.revision_number(), 2);
    assert_eq!(updated.file_size(), SECTOR_SIZE);
    assert!(updated.spending.uploads > U256::zero());
    assert!(updated.spending.storage > U256::zero());
    assert!(updated.renter_funds() < contract.renter_funds());

    let fetched = {
        let mut downloader = harness
            .contractor
            .downloader(&key, CancellationToken::new())
            .await
            .expect("downloader");
        downloader.download(root).await.expect("download")
    };
    assert_eq!(fetched, data);
    let after_download = harness
        .contractor
        .contract_by_id(&contract.id)
        .expect("contract");
    assert_eq!(after_download.revision_number(), 3);
    assert!(after_download.spending.downloads > U256::zero());
    assert!(harness.hostdb.successful_count(&key) >= 2);
}

#[tokio::test]
async fn locked_contract_refuses_sessions() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    let contract = harness.contractor.contracts().remove(0);

    let mut utility = contract.utility.clone();
    utility.locked = true;
    harness
        .contractor
        .state
        .set
        .update_utility(&contract.id, utility)
        .await
        .expect("lock");

    let err = harness
        .contractor
        .editor(&contract.host_public_key, CancellationToken::new())
        .await;
    assert!(matches!(
        err,
        Err(ContractorError::Session(SessionError::ContractLocked))
    ));
    let err = harness
        .contractor
        .downloader(&contract.host_public_key, CancellationToken::new())
        .await;
    assert!(matches!(
        err,
        Err(ContractorError::Session(SessionError::ContractLocked))
    ));
}

#[tokio::test]
async fn renewing_contract_refuses_new_sessions() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    let contract = harness.contractor.contracts().remove(0);

    assert!(harness.contractor.state.set.mark_renewing(&contract.id));
    let err = harness
        .contractor
        .editor(&contract.host_public_key, CancellationToken::new())
        .await;
    assert!(matches!(err, Err(ContractorError::ContractRenewing(_))));
}

#[tokio::test]
async fn out_of_storage_disables_uploads_and_counts_against_host() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    let contract = harness.contractor.contracts().remove(0);
    let key = contract.host_public_key;
    harness.transport.set_oos(key, true);

    let mut editor = harness
        .contractor
        .editor(&key, CancellationToken::new())
        .await
        .expect("editor");
    let err = editor.upload(&[1, 2, 3]).await;
    assert!(matches!(err, Err(SessionError::OutOfStorage)));
    drop(editor);

    let updated = harness
        .contractor
        .contract_by_id(&contract.id)
        .expect("contract");
    assert!(!updated.utility.good_for_upload);
    assert_eq!(updated.utility.last_oos_err, harness.contractor.block_height());
    assert_eq!(harness.hostdb.failed_count(&key), 1);
    // No revision went through.
    assert_eq!(updated.revision_number(), 1);
}

#[tokio::test]
async fn revision_mismatch_surfaces_without_blaming_the_host() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    let contract = harness.contractor.contracts().remove(0);
    let key = contract.host_public_key;

    // The host claims a revision far ahead of ours.
    harness.transport.set_host_revision(contract.id, 7);

    let mut editor = harness
        .contractor
        .editor(&key, CancellationToken::new())
        .await
        .expect("editor");
    let err = editor.upload(&[9, 9, 9]).await;
    assert!(matches!(
        err,
        Err(SessionError::RevisionNumberMismatch { ours: 2, theirs: 7 })
    ));
    drop(editor);
    assert_eq!(harness.hostdb.failed_count(&key), 0);
}

#[tokio::test]
async fn bad_host_is_replaced_by_a_fresh_one() {
    let mut harness = Harness::new(5);
    harness.setup_contracts(allowance()).await;
    let contracts = harness.contractor.contracts();
    assert_eq!(contracts.len(), 2);
    let bad = contracts[0].clone();

    // The bad host stops answering scans and refuses session locks.
    harness.transport.reject_host(bad.host_public_key);
    harness.hostdb.set_online(bad.host_public_key, false);

    harness.sync_to(5).await;

    let bad_now = harness
        .contractor
        .contract_by_id(&bad.id)
        .expect("still tracked");
    assert!(!bad_now.utility.good_for_upload);
    assert!(!bad_now.utility.good_for_renew);

    let usable: Vec<_> = harness
        .contractor
        .contracts()
        .into_iter()
        .filter(|c| c.utility.good_for_renew)
        .collect();
    assert_eq!(usable.len(), 2);
    assert!(usable.iter().all(|c| c.host_public_key != bad.host_public_key));
}

#[tokio::test]
async fn churn_is_capped_per_period_and_resumes_later() {
    // Extra well-scored hosts keep the median score high.
    let mut harness = Harness::new(16);
    let mut a = allowance();
    a.hosts = 5;
    // Budget of four sectors per period; it accrues per block (the period
    // is a power of two so the per-block gain divides exactly).
    a.max_period_churn = 4 * SECTOR_SIZE;
    a.period = 128;
    harness.setup_contracts(a).await;
    let contracts = harness.contractor.contracts();
    assert_eq!(contracts.len(), 5);

    // Every contract stores one sector.
    for contract in &contracts {
        let mut editor = harness
            .contractor
            .editor(&contract.host_public_key, CancellationToken::new())
            .await
            .expect("editor");
        editor.upload(&vec![7u8; 32]).await.expect("upload");
    }

    // Four hosts drop to a score far below the renew floor.
    let low_hosts: Vec<_> = contracts.iter().take(4).map(|c| c.host_public_key).collect();
    for key in &low_hosts {
        harness.hostdb.set_score(*key, 10);
    }

    let churned = |h: &Harness| {
        h.contractor
            .contracts()
            .into_iter()
            .filter(|c| low_hosts.contains(&c.host_public_key) && !c.utility.good_for_renew)
            .count()
    };

    // Too early: the accrued budget is below one sector, nothing churns
    // even though four contracts are candidates.
    harness.sync_to(20).await;
    assert_eq!(churned(&harness), 0);

    // Once a sector's worth of budget accrued, exactly one contract is
    // demoted; the other three stay usable.
    harness.sync_to(40).await;
    assert_eq!(churned(&harness), 1);

    // The instantaneous budget is spent; further passes change nothing
    // until it accrues again.
    harness.sync_to(50).await;
    assert_eq!(churned(&harness), 1);

    // With more blocks the budget refills and the next candidate churns.
    harness.sync_to(70).await;
    assert!(churned(&harness) >= 2);
}

#[tokio::test]
async fn double_spent_formation_is_abandoned_and_replaced() {
    let mut harness = Harness::new(3);
    let mut a = allowance();
    a.hosts = 1;
    harness.setup_contracts(a).await;
    let contract = harness.contractor.contracts().remove(0);

    let status = harness
        .contractor
        .contract_status(&contract.id)
        .expect("monitored");
    let spent_input: Input = status.formation_txn_set[0].inputs[0].clone();

    // A foreign transaction consumes the formation's input.
    let thief = Transaction {
        inputs: vec![spent_input],
        outputs: vec![Output::default()],
        ..Default::default()
    };
    harness.apply_block(vec![thief]).await;

    // The contract moved to the archive with a double-spend record, and a
    // replacement was formed at the next maintenance.
    assert!(harness.contractor.contract_by_id(&contract.id).is_none());
    assert!(
        harness
            .contractor
            .old_contracts()
            .iter()
            .any(|c| c.id == contract.id)
    );
    let status = harness
        .contractor
        .contract_status(&contract.id)
        .expect("archived status");
    assert!(status.double_spend_height.is_some());
    assert_eq!(harness.contractor.contracts().len(), 1);
    assert_ne!(harness.contractor.contracts()[0].id, contract.id);
}

#[tokio::test]
async fn reverted_blocks_restore_height_and_period() {
    let mut harness = Harness::new(2);
    harness.sync_to(1).await;
    let blocks: Vec<_> = (2..=4).map(|n| block(n, vec![])).collect();

    // Deliver unsynced so no maintenance interferes.
    let mut change = applied_change(10, blocks.clone());
    change.synced = false;
    harness.contractor.process_change(&change).await;
    let height_after = harness.contractor.block_height();
    assert_eq!(height_after, 4);

    let mut revert = reverted_change(11, blocks);
    revert.synced = false;
    harness.contractor.process_change(&revert).await;
    assert_eq!(harness.contractor.block_height(), 1);
    assert_eq!(harness.contractor.current_period(), 0);
}

#[tokio::test]
async fn cancel_contract_archives_it() {
    let mut harness = Harness::new(2);
    harness.setup_contracts(allowance()).await;
    let contract = harness.contractor.contracts().remove(0);

    harness
        .contractor
        .cancel_contract(&contract.id)
        .await
        .expect("cancel");
    assert!(harness.contractor.contract_by_id(&contract.id).is_none());
    let archived = harness
        .contractor
        .old_contracts()
        .into_iter()
        .find(|c| c.id == contract.id)
        .expect("archived");
    assert!(archived.utility.locked);
    assert!(matches!(
        harness.contractor.cancel_contract(&contract.id).await,
        Err(ContractorError::ContractNotFound(_))
    ));
}

#[tokio::test]
async fn wallet_lock_pauses_maintenance_with_an_alert() {
    let mut harness = Harness::new(2);
    harness.sync_to(1).await;
    harness.wallet.set_locked(true);
    harness.contractor.set_allowance(allowance()).await.expect("allowance");
    harness.contractor.perform_maintenance().await;

    assert!(harness.contractor.contracts().is_empty());
    assert!(
        harness
            .contractor
            .alerts()
            .iter()
            .any(|a| a.message == "wallet locked during maintenance")
    );

    // Unlocking clears the alert and maintenance proceeds.
    harness.wallet.set_locked(false);
    harness.contractor.perform_maintenance().await;
    assert_eq!(harness.contractor.contracts().len(), 2);
    assert!(
        !harness
            .contractor
            .alerts()
            .iter()
            .any(|a| a.message == "wallet locked during maintenance")
    );
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = TempDir::new().expect("tempdir");
    let hostdb = StubHostDb::new();
    for n in 1..=2 {
        hostdb.insert(host_entry(n));
    }
    let wallet = StubWallet::new();
    let pool = StubPool::new();
    let transport = StubTransport::new();
    let alerter = Arc::new(Alerter::new());
    let cfg = ContractorConfig {
        datadir: dir.path().to_path_buf(),
    };

    let (ids, a) = {
        let contractor = Contractor::new(
            cfg.clone(),
            hostdb.clone(),
            wallet.clone(),
            pool.clone(),
            transport.clone(),
            alerter.clone(),
        )
        .expect("contractor");
        contractor
            .process_change(&applied_change(1, vec![block(1, vec![])]))
            .await;
        contractor.set_allowance(allowance()).await.expect("allowance");
        contractor.perform_maintenance().await;
        let ids: Vec<_> = contractor.contracts().iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 2);
        contractor.shutdown().await;
        (ids, contractor.allowance())
    };

    let reopened = Contractor::new(cfg, hostdb, wallet, pool, transport, alerter)
        .expect("reopen");
    assert_eq!(reopened.allowance(), a);
    assert_eq!(reopened.block_height(), 1);
    let mut reopened_ids: Vec<_> = reopened.contracts().iter().map(|c| c.id).collect();
    let mut ids = ids;
    ids.sort();
    reopened_ids.sort();
    assert_eq!(ids, reopened_ids);
    // Watchdog state came back too.
    assert!(reopened.contract_status(&ids[0]).is_some());
}
