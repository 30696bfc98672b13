use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{BlockHeight, BlockId, ContractId, Currency, OutputId, TransactionId, UnlockHash};

/// A chain output: an amount owned by an address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub value: Currency,
    pub unlock_hash: UnlockHash,
}

/// A chain input consuming a previous output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub parent_id: OutputId,
    pub unlock_hash: UnlockHash,
}

/// The on-chain obligation between renter and host.
///
/// `valid_proof_outputs` pay out if the host submits a storage proof inside
/// the proof window, `missed_proof_outputs` if it does not. Index 0 is the
/// renter payout, index 1 the host payout by convention.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContract {
    pub file_size: u64,
    pub file_merkle_root: H256,
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    pub payout: Currency,
    pub valid_proof_outputs: Vec<Output>,
    pub missed_proof_outputs: Vec<Output>,
    pub unlock_hash: UnlockHash,
    pub revision_number: u64,
}

/// A revision of an existing file contract. Replaces the contract's mutable
/// fields; only the revision with the highest number counts at window time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContractRevision {
    pub parent_id: ContractId,
    pub unlock_hash: UnlockHash,
    pub revision_number: u64,
    pub file_size: u64,
    pub file_merkle_root: H256,
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    pub valid_proof_outputs: Vec<Output>,
    pub missed_proof_outputs: Vec<Output>,
}

impl FileContractRevision {
    /// Remaining renter payout under this revision, if present.
    pub fn renter_payout(&self) -> Currency {
        self.valid_proof_outputs
            .first()
            .map(|o| o.value)
            .unwrap_or_default()
    }

    pub fn host_payout(&self) -> Currency {
        self.valid_proof_outputs
            .get(1)
            .map(|o| o.value)
            .unwrap_or_default()
    }

    pub fn missed_host_payout(&self) -> Currency {
        self.missed_proof_outputs
            .get(1)
            .map(|o| o.value)
            .unwrap_or_default()
    }
}

/// Host's proof that it still stores the contract data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProof {
    pub parent_id: ContractId,
    pub segment_index: u64,
    #[serde(with = "serde_bytes_hex")]
    pub segment: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub parent_id: H256,
    pub public_key_index: u64,
    #[serde(with = "serde_bytes_hex")]
    pub signature: Vec<u8>,
}

/// A chain transaction, restricted to the fields the renter core inspects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_contracts: Vec<FileContract>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_contract_revisions: Vec<FileContractRevision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_proofs: Vec<StorageProof>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub miner_fees: Vec<Currency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<TransactionSignature>,
}

impl Transaction {
    /// Deterministic identifier: a digest over every field except signatures.
    pub fn id(&self) -> TransactionId {
        let mut h = FieldHasher::new(b"transaction");
        for input in &self.inputs {
            h.h256(&input.parent_id);
            h.h256(&input.unlock_hash);
        }
        for output in &self.outputs {
            h.currency(&output.value);
            h.h256(&output.unlock_hash);
        }
        for fc in &self.file_contracts {
            h.file_contract(fc);
        }
        for rev in &self.file_contract_revisions {
            h.h256(&rev.parent_id);
            h.u64(rev.revision_number);
            h.u64(rev.file_size);
            h.h256(&rev.file_merkle_root);
        }
        for proof in &self.storage_proofs {
            h.h256(&proof.parent_id);
            h.u64(proof.segment_index);
        }
        for fee in &self.miner_fees {
            h.currency(fee);
        }
        h.finalize()
    }

    /// Identifier of the output at `index`, derived from the transaction id.
    pub fn output_id(&self, index: usize) -> OutputId {
        let mut h = FieldHasher::new(b"output");
        h.h256(&self.id());
        h.u64(index as u64);
        h.finalize()
    }

    /// Identifier of the file contract declared at `index`.
    pub fn file_contract_id(&self, index: usize) -> ContractId {
        let mut h = FieldHasher::new(b"file contract");
        h.h256(&self.id());
        h.u64(index as u64);
        h.finalize()
    }

    /// Approximate wire size, used for transaction-set standardness checks.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// A block as delivered by the consensus observer.
///
/// Block identifiers are assigned by consensus; the core never recomputes
/// them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub parent_id: BlockId,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

/// An ordered batch of applied and reverted blocks from the consensus set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusChange {
    pub id: H256,
    pub reverted_blocks: Vec<Block>,
    pub applied_blocks: Vec<Block>,
    /// Whether the consensus set considers itself caught up with the
    /// network. Maintenance and watchdog actions only fire when synced.
    pub synced: bool,
}

struct FieldHasher(Sha256);

impl FieldHasher {
    fn new(domain: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update((domain.len() as u64).to_le_bytes());
        h.update(domain);
        FieldHasher(h)
    }

    fn u64(&mut self, v: u64) {
        self.0.update(v.to_le_bytes());
    }

    fn h256(&mut self, v: &H256) {
        self.0.update(v.as_bytes());
    }

    fn currency(&mut self, v: &Currency) {
        self.0.update(v.to_little_endian());
    }

    fn file_contract(&mut self, fc: &FileContract) {
        self.u64(fc.file_size);
        self.h256(&fc.file_merkle_root);
        self.u64(fc.window_start);
        self.u64(fc.window_end);
        self.currency(&fc.payout);
        for out in fc.valid_proof_outputs.iter().chain(&fc.missed_proof_outputs) {
            self.currency(&out.value);
            self.h256(&out.unlock_hash);
        }
        self.h256(&fc.unlock_hash);
        self.u64(fc.revision_number);
    }

    fn finalize(self) -> H256 {
        H256::from_slice(&self.0.finalize())
    }
}

/// Hex-string serde for opaque byte payloads, keeping persisted JSON legible.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}

/// Root of a Merkle tree over a contract's sector roots.
///
/// Empty input hashes to zero; odd levels promote the trailing root.
pub fn merkle_root(roots: &[H256]) -> H256 {
    if roots.is_empty() {
        return H256::zero();
    }
    let mut level: Vec<H256> = roots.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                let mut h = Sha256::new();
                h.update([0x01]);
                h.update(pair[0].as_bytes());
                h.update(pair[1].as_bytes());
                next.push(H256::from_slice(&h.finalize()));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}

/// Root of a single sector's raw bytes.
pub fn sector_root(data: &[u8]) -> H256 {
    let mut h = Sha256::new();
    h.update([0x00]);
    h.update(data);
    H256::from_slice(&h.finalize())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_txn() -> Transaction {
        Transaction {
            inputs: vec![Input {
                parent_id: H256::from_low_u64_be(1),
                unlock_hash: H256::from_low_u64_be(2),
            }],
            outputs: vec![Output {
                value: Currency::from(500u64),
                unlock_hash: H256::from_low_u64_be(3),
            }],
            file_contracts: vec![FileContract {
                file_size: 0,
                window_start: 100,
                window_end: 110,
                payout: Currency::from(1_000u64),
                ..Default::default()
            }],
            miner_fees: vec![Currency::from(10u64)],
            ..Default::default()
        }
    }

    #[test]
    fn transaction_id_is_stable() {
        assert_eq!(sample_txn().id(), sample_txn().id());
    }

    #[test]
    fn transaction_id_ignores_signatures() {
        let unsigned = sample_txn();
        let mut signed = sample_txn();
        signed.signatures.push(TransactionSignature {
            parent_id: H256::from_low_u64_be(9),
            public_key_index: 0,
            signature: vec![1, 2, 3],
        });
        assert_eq!(unsigned.id(), signed.id());
    }

    #[test]
    fn derived_ids_differ_by_index() {
        let txn = sample_txn();
        assert_ne!(txn.output_id(0), txn.output_id(1));
        assert_ne!(txn.file_contract_id(0), txn.output_id(0));
    }

    #[test]
    fn transaction_roundtrips_through_json() {
        let txn = sample_txn();
        let encoded = serde_json::to_string(&txn).unwrap();
        let decoded: Transaction = serde_json::from_str(&encoded).unwrap();
        assert_eq!(txn, decoded);
    }

    #[test]
    fn merkle_root_of_empty_is_zero() {
        assert_eq!(merkle_root(&[]), H256::zero());
    }

    #[test]
    fn merkle_root_changes_with_appended_sector() {
        let a = sector_root(b"sector a");
        let b = sector_root(b"sector b");
        let one = merkle_root(&[a]);
        let two = merkle_root(&[a, b]);
        assert_eq!(one, a);
        assert_ne!(one, two);
        // Appending is order sensitive.
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn merkle_root_odd_count_promotes_tail() {
        let roots: Vec<H256> = (0..5).map(|i| H256::from_low_u64_be(i)).collect();
        // Recompute by hand for five leaves.
        let ab = merkle_root(&roots[0..2]);
        let cd = merkle_root(&roots[2..4]);
        let abcd = merkle_root(&[ab, cd]);
        let expected = merkle_root(&[abcd, roots[4]]);
        assert_eq!(merkle_root(&roots), expected);
    }
}
