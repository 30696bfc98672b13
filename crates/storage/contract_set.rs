//! The on-disk set of active file contracts.
//!
//! Each contract lives in its own file: a header line, a body line with the
//! applied metadata snapshot and sector-root list, then zero or more
//! write-ahead entries for revisions that were signed but not yet folded
//! into the snapshot. On open, unapplied entries are replayed and the file
//! is rewritten clean, so a crash between recording an intent and
//! committing it converges to the post-revision state.
//!
//! Mutating a contract requires acquiring it; the acquisition is exclusive
//! across the whole process and callers hold it for the duration of a
//! revision exchange.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use stratus_common::{
    ContractId, Currency, H256,
    types::{
        ContractUtility, FileContractRevision, RenterContract, Transaction, TransactionSignature,
        merkle_root,
    },
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{error::StoreError, persist};

const CONTRACT_MAGIC: &str = "stratus/contract";
const CONTRACT_VERSION: &str = "1.1.0";
const CONTRACT_EXT: &str = "contract";

#[derive(Serialize, Deserialize)]
struct ContractHeader {
    magic: String,
    version: String,
    id: ContractId,
}

/// One signed-but-uncommitted revision of a contract: the write-ahead
/// record a session appends before exchanging signatures with the host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalUpdate {
    pub revision: FileContractRevision,
    pub signatures: Vec<TransactionSignature>,
    /// Root of the sector appended by an upload; absent for downloads.
    pub appended_root: Option<H256>,
    pub storage_spending: Currency,
    pub upload_spending: Currency,
    pub download_spending: Currency,
}

#[derive(Serialize, Deserialize)]
struct ContractBody {
    metadata: RenterContract,
    roots: Vec<H256>,
}

#[derive(Debug)]
struct ContractEntry {
    metadata: RenterContract,
    roots: Vec<H256>,
    unapplied: Vec<WalUpdate>,
    path: PathBuf,
}

#[derive(Debug, Default)]
struct SetInner {
    entries: HashMap<ContractId, Arc<AsyncMutex<ContractEntry>>>,
    /// Lock-free copies of the applied metadata, refreshed on every commit.
    snapshots: HashMap<ContractId, RenterContract>,
    /// Contracts currently being renewed refuse new sessions.
    being_renewed: HashSet<ContractId>,
}

/// Process-wide set of active contracts, one file per contract.
#[derive(Clone, Debug)]
pub struct ContractSet {
    dir: PathBuf,
    inner: Arc<RwLock<SetInner>>,
}

impl ContractSet {
    /// Opens (or creates) the contract directory, replaying any unapplied
    /// write-ahead entries found in contract files.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut inner = SetInner::default();
        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONTRACT_EXT) {
                continue;
            }
            let mut entry = read_contract_file(&path)?;
            if !entry.unapplied.is_empty() {
                info!(
                    contract = %entry.metadata.id,
                    count = entry.unapplied.len(),
                    "Replaying unapplied contract updates"
                );
                replay_unapplied(&mut entry);
                persist_entry(&entry)?;
            }
            inner
                .snapshots
                .insert(entry.metadata.id, entry.metadata.clone());
            inner
                .entries
                .insert(entry.metadata.id, Arc::new(AsyncMutex::new(entry)));
        }
        debug!(dir = %dir.display(), contracts = inner.entries.len(), "Opened contract set");
        Ok(ContractSet {
            dir,
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Adds a freshly formed contract to the set and persists its file.
    pub fn insert(&self, metadata: RenterContract, roots: Vec<H256>) -> Result<(), StoreError> {
        let id = metadata.id;
        let path = self.contract_path(&id);
        let mut inner = self.write();
        if inner.entries.contains_key(&id) {
            return Err(StoreError::DuplicateContract(id));
        }
        let entry = ContractEntry {
            metadata: metadata.clone(),
            roots,
            unapplied: Vec::new(),
            path,
        };
        persist_entry(&entry)?;
        inner.snapshots.insert(id, metadata);
        inner.entries.insert(id, Arc::new(AsyncMutex::new(entry)));
        Ok(())
    }

    /// Removes a contract from the set, deleting its file. Returns the last
    /// applied metadata so the caller can archive it.
    pub async fn remove(&self, id: &ContractId) -> Result<RenterContract, StoreError> {
        let handle = {
            let mut inner = self.write();
            let handle = inner
                .entries
                .remove(id)
                .ok_or(StoreError::UnknownContract(*id))?;
            inner.snapshots.remove(id);
            inner.being_renewed.remove(id);
            handle
        };
        // Wait for any in-flight session before unlinking the file.
        let entry = handle.lock().await;
        match fs::remove_file(&entry.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(entry.metadata.clone())
    }

    /// Exclusive acquisition; waits until any current holder returns it.
    pub async fn acquire(&self, id: &ContractId) -> Result<AcquiredContract, StoreError> {
        let handle = {
            let inner = self.read();
            inner
                .entries
                .get(id)
                .cloned()
                .ok_or(StoreError::UnknownContract(*id))?
        };
        let guard = handle.lock_owned().await;
        Ok(AcquiredContract {
            inner: self.inner.clone(),
            guard,
        })
    }

    pub fn contains(&self, id: &ContractId) -> bool {
        self.read().entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ContractId> {
        self.read().entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applied metadata of one contract, without acquiring it.
    pub fn view(&self, id: &ContractId) -> Option<RenterContract> {
        self.read().snapshots.get(id).cloned()
    }

    /// Applied metadata of every contract in the set.
    pub fn views(&self) -> Vec<RenterContract> {
        self.read().snapshots.values().cloned().collect()
    }

    /// Marks a contract as being renewed, blocking new sessions against it.
    /// Returns false if it was already marked.
    pub fn mark_renewing(&self, id: &ContractId) -> bool {
        self.write().being_renewed.insert(*id)
    }

    pub fn clear_renewing(&self, id: &ContractId) {
        self.write().being_renewed.remove(id);
    }

    pub fn is_renewing(&self, id: &ContractId) -> bool {
        self.read().being_renewed.contains(id)
    }

    /// Convenience: acquire, set utility, return.
    pub async fn update_utility(
        &self,
        id: &ContractId,
        utility: ContractUtility,
    ) -> Result<(), StoreError> {
        let mut acquired = self.acquire(id).await?;
        acquired.set_utility(utility)
    }

    fn contract_path(&self, id: &ContractId) -> PathBuf {
        self.dir.join(format!("{id:x}.{CONTRACT_EXT}"))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SetInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SetInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive handle on one contract. Held for the duration of a revision
/// exchange; dropping it returns the contract to the set.
pub struct AcquiredContract {
    inner: Arc<RwLock<SetInner>>,
    guard: OwnedMutexGuard<ContractEntry>,
}

impl AcquiredContract {
    pub fn metadata(&self) -> &RenterContract {
        &self.guard.metadata
    }

    pub fn roots(&self) -> &[H256] {
        &self.guard.roots
    }

    /// Merkle root over the applied sector roots.
    pub fn merkle_root(&self) -> H256 {
        merkle_root(&self.guard.roots)
    }

    pub fn has_unapplied(&self) -> bool {
        !self.guard.unapplied.is_empty()
    }

    /// Highest revision number across the applied state and the queue.
    pub fn pending_revision_number(&self) -> u64 {
        self.guard
            .unapplied
            .last()
            .map(|u| u.revision.revision_number)
            .unwrap_or_else(|| self.guard.metadata.revision_number())
    }

    /// Appends a signed-revision intent to the write-ahead log. After this
    /// returns, a crash converges to the post-revision state on reopen.
    pub fn record_intent(&mut self, update: WalUpdate) -> Result<(), StoreError> {
        let have = self.pending_revision_number();
        let got = update.revision.revision_number;
        if got <= have {
            return Err(StoreError::NonMonotonicRevision { have, got });
        }
        let mut line = serde_json::to_vec(&update)?;
        line.push(b'\n');
        persist::append_synced(&self.guard.path, &line)?;
        self.guard.unapplied.push(update);
        Ok(())
    }

    /// Attaches the host's signatures to the most recent intent. The file
    /// keeps the unsigned record; a replay after a crash converges to the
    /// same revision either way.
    pub fn attach_signatures(&mut self, signatures: Vec<TransactionSignature>) {
        if let Some(last) = self.guard.unapplied.last_mut() {
            last.signatures = signatures;
        }
    }

    /// Folds every unapplied entry into the metadata snapshot and rewrites
    /// the contract file clean.
    pub fn commit_unapplied(&mut self) -> Result<(), StoreError> {
        if self.guard.unapplied.is_empty() {
            return Ok(());
        }
        replay_unapplied(&mut self.guard);
        persist_entry(&self.guard)?;
        self.refresh_snapshot();
        Ok(())
    }

    /// Discards the most recent intent (the host refused the revision).
    pub fn rollback_intent(&mut self) -> Result<(), StoreError> {
        if self.guard.unapplied.pop().is_some() {
            persist_entry(&self.guard)?;
        }
        Ok(())
    }

    pub fn set_utility(&mut self, utility: ContractUtility) -> Result<(), StoreError> {
        if self.guard.metadata.utility == utility {
            return Ok(());
        }
        self.guard.metadata.utility = utility;
        persist_entry(&self.guard)?;
        self.refresh_snapshot();
        Ok(())
    }

    fn refresh_snapshot(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .snapshots
            .insert(self.guard.metadata.id, self.guard.metadata.clone());
    }
}

impl std::fmt::Debug for AcquiredContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredContract")
            .field("id", &self.guard.metadata.id)
            .finish()
    }
}

fn apply_update(metadata: &mut RenterContract, roots: &mut Vec<H256>, update: &WalUpdate) {
    metadata.transaction = Transaction {
        file_contract_revisions: vec![update.revision.clone()],
        signatures: update.signatures.clone(),
        ..Default::default()
    };
    if let Some(root) = update.appended_root {
        roots.push(root);
    }
    metadata.spending.storage += update.storage_spending;
    metadata.spending.uploads += update.upload_spending;
    metadata.spending.downloads += update.download_spending;
}

fn replay_unapplied(entry: &mut ContractEntry) {
    for update in std::mem::take(&mut entry.unapplied) {
        if update.revision.revision_number <= entry.metadata.revision_number() {
            warn!(
                contract = %entry.metadata.id,
                revision = update.revision.revision_number,
                "Skipping stale write-ahead entry"
            );
            continue;
        }
        apply_update(&mut entry.metadata, &mut entry.roots, &update);
    }
}

fn persist_entry(entry: &ContractEntry) -> Result<(), StoreError> {
    persist::write_atomic(&entry.path, &encode_contract_file(entry)?)
}

fn encode_contract_file(entry: &ContractEntry) -> Result<Vec<u8>, StoreError> {
    let header = ContractHeader {
        magic: CONTRACT_MAGIC.to_string(),
        version: CONTRACT_VERSION.to_string(),
        id: entry.metadata.id,
    };
    let body = ContractBody {
        metadata: entry.metadata.clone(),
        roots: entry.roots.clone(),
    };
    let mut buf = serde_json::to_vec(&header)?;
    buf.push(b'\n');
    buf.extend_from_slice(&serde_json::to_vec(&body)?);
    buf.push(b'\n');
    for update in &entry.unapplied {
        buf.extend_from_slice(&serde_json::to_vec(update)?);
        buf.push(b'\n');
    }
    Ok(buf)
}

fn read_contract_file(path: &Path) -> Result<ContractEntry, StoreError> {
    let bytes = fs::read(path)?;
    let mut lines = bytes.split(|&b| b == b'\n');
    let header_line = lines
        .next()
        .ok_or_else(|| StoreError::Corrupt("empty contract file".to_string()))?;
    let header: ContractHeader = serde_json::from_slice(header_line)
        .map_err(|_| StoreError::Corrupt("unparseable contract header".to_string()))?;
    if header.magic != CONTRACT_MAGIC {
        return Err(StoreError::BadHeader {
            expected: CONTRACT_MAGIC.to_string(),
            found: header.magic,
        });
    }
    if header.version != CONTRACT_VERSION {
        return Err(StoreError::BadVersion {
            current: CONTRACT_VERSION.to_string(),
            found: header.version,
        });
    }
    let body_line = lines
        .next()
        .ok_or_else(|| StoreError::Corrupt("contract file missing body".to_string()))?;
    let body: ContractBody = serde_json::from_slice(body_line)
        .map_err(|_| StoreError::Corrupt("unparseable contract body".to_string()))?;
    let mut unapplied = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<WalUpdate>(line) {
            Ok(update) => unapplied.push(update),
            Err(_) => {
                // A torn append from a crash mid-write; everything after it
                // is untrusted.
                warn!(path = %path.display(), "Dropping torn write-ahead entry");
                break;
            }
        }
    }
    Ok(ContractEntry {
        metadata: body.metadata,
        roots: body.roots,
        unapplied,
        path: path.to_path_buf(),
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::types::{FileContractRevision, Output};
    use tempfile::TempDir;

    fn contract(n: u64) -> RenterContract {
        let mut c = RenterContract {
            id: H256::from_low_u64_be(n),
            start_height: 10,
            end_height: 60,
            total_cost: Currency::from(1_000u64),
            ..Default::default()
        };
        c.utility.good_for_upload = true;
        c.utility.good_for_renew = true;
        c.transaction.file_contract_revisions.push(FileContractRevision {
            parent_id: c.id,
            revision_number: 1,
            valid_proof_outputs: vec![
                Output {
                    value: Currency::from(900u64),
                    unlock_hash: H256::zero(),
                },
                Output {
                    value: Currency::from(100u64),
                    unlock_hash: H256::zero(),
                },
            ],
            ..Default::default()
        });
        c
    }

    fn update(revision_number: u64, root: Option<H256>) -> WalUpdate {
        WalUpdate {
            revision: FileContractRevision {
                revision_number,
                file_size: 4096,
                ..Default::default()
            },
            appended_root: root,
            upload_spending: Currency::from(5u64),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_view_and_remove() {
        let dir = TempDir::new().unwrap();
        let set = ContractSet::open(dir.path()).unwrap();
        set.insert(contract(1), vec![]).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.view(&H256::from_low_u64_be(1)).unwrap().start_height, 10);

        let removed = set.remove(&H256::from_low_u64_be(1)).await.unwrap();
        assert_eq!(removed.id, H256::from_low_u64_be(1));
        assert!(set.is_empty());
        assert!(matches!(
            set.remove(&H256::from_low_u64_be(1)).await,
            Err(StoreError::UnknownContract(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let dir = TempDir::new().unwrap();
        let set = ContractSet::open(dir.path()).unwrap();
        set.insert(contract(1), vec![]).unwrap();
        assert!(matches!(
            set.insert(contract(1), vec![]),
            Err(StoreError::DuplicateContract(_))
        ));
    }

    #[tokio::test]
    async fn acquisition_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let set = ContractSet::open(dir.path()).unwrap();
        set.insert(contract(1), vec![]).unwrap();
        let id = H256::from_low_u64_be(1);

        let held = set.acquire(&id).await.unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), set.acquire(&id));
        assert!(second.await.is_err(), "second acquire should block");

        drop(held);
        let reacquired =
            tokio::time::timeout(std::time::Duration::from_millis(50), set.acquire(&id)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn record_and_commit_updates_snapshot() {
        let dir = TempDir::new().unwrap();
        let set = ContractSet::open(dir.path()).unwrap();
        set.insert(contract(1), vec![]).unwrap();
        let id = H256::from_low_u64_be(1);

        let mut acquired = set.acquire(&id).await.unwrap();
        let root = H256::from_low_u64_be(77);
        acquired.record_intent(update(2, Some(root))).unwrap();
        assert!(acquired.has_unapplied());
        acquired.commit_unapplied().unwrap();
        assert!(!acquired.has_unapplied());
        assert_eq!(acquired.roots(), &[root]);
        drop(acquired);

        let snapshot = set.view(&id).unwrap();
        assert_eq!(snapshot.revision_number(), 2);
        assert_eq!(snapshot.file_size(), 4096);
        assert_eq!(snapshot.spending.uploads, Currency::from(5u64));
    }

    #[tokio::test]
    async fn revision_numbers_must_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let set = ContractSet::open(dir.path()).unwrap();
        set.insert(contract(1), vec![]).unwrap();
        let id = H256::from_low_u64_be(1);

        let mut acquired = set.acquire(&id).await.unwrap();
        acquired.record_intent(update(2, None)).unwrap();
        // Equal to the queued revision: refused.
        assert!(matches!(
            acquired.record_intent(update(2, None)),
            Err(StoreError::NonMonotonicRevision { have: 2, got: 2 })
        ));
        // Below the applied revision: refused.
        assert!(matches!(
            acquired.record_intent(update(1, None)),
            Err(StoreError::NonMonotonicRevision { .. })
        ));
        acquired.record_intent(update(3, None)).unwrap();
        acquired.commit_unapplied().unwrap();
        assert_eq!(acquired.metadata().revision_number(), 3);
    }

    #[tokio::test]
    async fn unapplied_entries_replay_on_reopen() {
        let dir = TempDir::new().unwrap();
        let id = H256::from_low_u64_be(1);
        {
            let set = ContractSet::open(dir.path()).unwrap();
            set.insert(contract(1), vec![]).unwrap();
            let mut acquired = set.acquire(&id).await.unwrap();
            acquired.record_intent(update(2, Some(H256::from_low_u64_be(9)))).unwrap();
            // Dropped without commit: simulates a crash mid-session.
        }
        let reopened = ContractSet::open(dir.path()).unwrap();
        let snapshot = reopened.view(&id).unwrap();
        assert_eq!(snapshot.revision_number(), 2);
        let acquired = reopened.acquire(&id).await.unwrap();
        assert_eq!(acquired.roots(), &[H256::from_low_u64_be(9)]);
        assert!(!acquired.has_unapplied());
    }

    #[tokio::test]
    async fn rollback_discards_last_intent() {
        let dir = TempDir::new().unwrap();
        let set = ContractSet::open(dir.path()).unwrap();
        set.insert(contract(1), vec![]).unwrap();
        let id = H256::from_low_u64_be(1);

        let mut acquired = set.acquire(&id).await.unwrap();
        acquired.record_intent(update(2, None)).unwrap();
        acquired.rollback_intent().unwrap();
        assert!(!acquired.has_unapplied());
        acquired.commit_unapplied().unwrap();
        assert_eq!(acquired.metadata().revision_number(), 1);
    }

    #[tokio::test]
    async fn torn_wal_line_is_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        let id = H256::from_low_u64_be(1);
        let path = {
            let set = ContractSet::open(dir.path()).unwrap();
            set.insert(contract(1), vec![]).unwrap();
            let mut acquired = set.acquire(&id).await.unwrap();
            acquired.record_intent(update(2, None)).unwrap();
            dir.path().join(format!("{id:x}.contract"))
        };
        // Truncate the last WAL line to simulate a torn append.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let reopened = ContractSet::open(dir.path()).unwrap();
        assert_eq!(reopened.view(&id).unwrap().revision_number(), 1);
    }

    #[tokio::test]
    async fn renewing_marker() {
        let dir = TempDir::new().unwrap();
        let set = ContractSet::open(dir.path()).unwrap();
        let id = H256::from_low_u64_be(1);
        assert!(set.mark_renewing(&id));
        assert!(!set.mark_renewing(&id));
        assert!(set.is_renewing(&id));
        set.clear_renewing(&id);
        assert!(!set.is_renewing(&id));
    }

    #[tokio::test]
    async fn utility_update_persists() {
        let dir = TempDir::new().unwrap();
        let id = H256::from_low_u64_be(1);
        {
            let set = ContractSet::open(dir.path()).unwrap();
            set.insert(contract(1), vec![]).unwrap();
            let mut utility = set.view(&id).unwrap().utility;
            utility.good_for_upload = false;
            utility.locked = true;
            set.update_utility(&id, utility).await.unwrap();
        }
        let reopened = ContractSet::open(dir.path()).unwrap();
        let utility = reopened.view(&id).unwrap().utility;
        assert!(!utility.good_for_upload);
        assert!(utility.locked);
        assert!(utility.good_for_renew);
    }
}
