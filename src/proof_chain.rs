//! Commit-proof chain
//!
//! Accepts proofs in strict proof-id order. A submitted proof is bound to
//! its plaintext pubdata through the two commitments carried in its public
//! input, checked by the external verifier, linked to the previous accepted
//! proof and reconciled operation by operation against the queue.
//!
//! A proof that arrives ahead of its predecessor is buffered and applied
//! automatically once the gap closes.

use crate::codec::{decode_pubdata, first_mismatch};
use crate::config::ZkConfig;
use crate::error::{ZkError, ZkResult};
use crate::keys::meta;
use crate::ledger::genesis_root;
use crate::merkle::Hash;
use crate::mimc::{bytes_to_fr_str, normalize_fr_str, str_to_fr_bytes, u64_to_fr_bytes, Mimc};
use crate::queue::OperationQueue;
use crate::records::{CommitProofRecord, ProofQueueRange, VerifierSet};
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Boundary to the proof system.
pub trait Verifier {
    fn verify(&self, verify_key: &[u8], proof: &[u8], public_input: &[u8]) -> bool;
}

/// A proof as submitted by a prover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitProof {
    pub proof_id: u64,
    pub block_start: u64,
    pub block_end: u64,
    pub index_start: u64,
    pub index_end: u64,
    pub op_index: u64,
    pub old_tree_root: String,
    pub new_tree_root: String,
    pub proof: Vec<u8>,
    pub public_input: Vec<u8>,
    pub pub_datas: Vec<String>,
    #[serde(default)]
    pub on_chain_pub_datas: Vec<String>,
    #[serde(default)]
    pub on_chain_proof_id: u64,
}

impl CommitProof {
    fn into_record(self, commit_block_height: u64) -> CommitProofRecord {
        CommitProofRecord {
            proof_id: self.proof_id,
            block_start: self.block_start,
            block_end: self.block_end,
            index_start: self.index_start,
            index_end: self.index_end,
            op_index: self.op_index,
            old_tree_root: self.old_tree_root,
            new_tree_root: self.new_tree_root,
            proof: self.proof,
            public_input: self.public_input,
            pub_datas: self.pub_datas,
            on_chain_pub_datas: self.on_chain_pub_datas,
            on_chain_proof_id: self.on_chain_proof_id,
            commit_block_height,
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The proof was accepted, followed by any buffered successors.
    Applied { proof_id: u64, drained: Vec<u64> },
    /// The proof is ahead of the chain and waits for its predecessor.
    Buffered { proof_id: u64 },
}

/// Commitment over the block range, both roots and every pubdata chunk.
pub fn pub_data_commitment(
    block_start: u64,
    block_end: u64,
    old_root: &str,
    new_root: &str,
    pub_datas: &[String],
) -> ZkResult<Hash> {
    let mut h = Mimc::new();
    h.write(&u64_to_fr_bytes(block_start));
    h.write(&u64_to_fr_bytes(block_end));
    h.write(&str_to_fr_bytes(old_root)?);
    h.write(&str_to_fr_bytes(new_root)?);
    for chunk in pub_datas {
        h.write(&str_to_fr_bytes(chunk)?);
    }
    Ok(h.sum())
}

/// Chained commitment over the new root and the on-chain pubdata.
pub fn on_chain_commitment(new_root: &str, on_chain_pub_datas: &[String]) -> ZkResult<Hash> {
    let mut h = Mimc::new();
    h.write(&str_to_fr_bytes(new_root)?);
    let mut sum = h.sum();
    for chunk in on_chain_pub_datas {
        h.reset();
        h.write(&sum);
        h.write(&str_to_fr_bytes(chunk)?);
        sum = h.sum();
    }
    Ok(sum)
}

/// Public input bytes: `pub_data_commitment || on_chain_commitment`.
pub fn public_input(pub_data_commit: &Hash, on_chain_commit: &Hash) -> Vec<u8> {
    let mut input = Vec::with_capacity(64);
    input.extend_from_slice(pub_data_commit);
    input.extend_from_slice(on_chain_commit);
    input
}

/// Public input a proof must carry for its own data.
pub fn expected_public_input(proof: &CommitProof) -> ZkResult<Vec<u8>> {
    let pub_commit = pub_data_commitment(
        proof.block_start,
        proof.block_end,
        &proof.old_tree_root,
        &proof.new_tree_root,
        &proof.pub_datas,
    )?;
    let on_chain_commit = on_chain_commitment(&proof.new_tree_root, &proof.on_chain_pub_datas)?;
    Ok(public_input(&pub_commit, &on_chain_commit))
}

fn same_root(a: &str, b: &str) -> ZkResult<bool> {
    Ok(normalize_fr_str(a)? == normalize_fr_str(b)?)
}

/// Proof chain state machine over a [`StateStore`].
pub struct ProofChain<'a, V: Verifier + ?Sized> {
    store: &'a dyn StateStore,
    verifier: &'a V,
    config: &'a ZkConfig,
}

impl<'a, V: Verifier + ?Sized> ProofChain<'a, V> {
    pub fn new(store: &'a dyn StateStore, verifier: &'a V, config: &'a ZkConfig) -> Self {
        Self {
            store,
            verifier,
            config,
        }
    }

    fn require_manager(&self, caller: &str) -> ZkResult<()> {
        if self.config.is_super_manager(caller) {
            Ok(())
        } else {
            Err(ZkError::Unauthorized(format!("{} is not a super manager", caller)))
        }
    }

    /// Super managers and registered verifiers may submit proofs.
    pub fn require_prover(&self, caller: &str) -> ZkResult<()> {
        if self.config.is_super_manager(caller) || self.store.get_verifier_set()?.contains(caller) {
            Ok(())
        } else {
            Err(ZkError::Unauthorized(format!(
                "{} is neither a super manager nor a verifier",
                caller
            )))
        }
    }

    /// Replace the proof verification key.
    pub fn set_verify_key(&self, caller: &str, verify_key: &[u8]) -> ZkResult<()> {
        self.require_manager(caller)?;
        if verify_key.is_empty() {
            return Err(ZkError::malformed("empty verification key"));
        }
        self.store.put_verify_key(verify_key)?;
        info!("Verification key updated ({} bytes)", verify_key.len());
        Ok(())
    }

    /// Replace the set of registered verifiers.
    pub fn set_verifiers(&self, caller: &str, verifiers: Vec<String>) -> ZkResult<()> {
        self.require_manager(caller)?;
        if verifiers.iter().any(|v| v.trim().is_empty()) {
            return Err(ZkError::malformed("empty verifier address"));
        }
        info!("Verifier set updated: {:?}", verifiers);
        self.store.put_verifier_set(&VerifierSet { verifiers })?;
        Ok(())
    }

    pub fn last_proof_id(&self) -> ZkResult<u64> {
        Ok(self.store.get_counter(meta::LAST_PROOF_ID)?)
    }

    pub fn last_on_chain_proof_id(&self) -> ZkResult<u64> {
        Ok(self.store.get_counter(meta::LAST_ON_CHAIN_PROOF_ID)?)
    }

    /// The most recently accepted proof, if any.
    pub fn last_proof(&self) -> ZkResult<Option<CommitProofRecord>> {
        let last_id = self.last_proof_id()?;
        if last_id == 0 {
            return Ok(None);
        }
        Ok(self.store.get_proof(last_id)?)
    }

    /// Submit a proof at host height `height`.
    pub fn submit(&self, caller: &str, proof: CommitProof, height: u64) -> ZkResult<SubmitOutcome> {
        self.require_prover(caller)?;

        if proof.on_chain_pub_datas.is_empty() != (proof.on_chain_proof_id == 0) {
            return Err(ZkError::malformed(format!(
                "proof {} has {} on-chain pubdata entries but on-chain id {}",
                proof.proof_id,
                proof.on_chain_pub_datas.len(),
                proof.on_chain_proof_id
            )));
        }
        if proof.proof_id == 0 {
            return Err(ZkError::malformed("proof id starts at 1"));
        }

        if proof.proof_id == 1 {
            let genesis = genesis_root(&self.config.eth_fee_addr, &self.config.chain33_fee_addr)?;
            if !same_root(&proof.old_tree_root, &genesis)? {
                return Err(ZkError::ChainLinkage(format!(
                    "first proof starts from {}, genesis root is {}",
                    proof.old_tree_root, genesis
                )));
            }
        }

        let expected = expected_public_input(&proof)?;
        if proof.public_input != expected {
            return Err(ZkError::CommitmentMismatch(format!(
                "proof {} public input does not commit to its pubdata",
                proof.proof_id
            )));
        }

        let verify_key = self
            .store
            .get_verify_key()?
            .ok_or_else(|| ZkError::not_found("verification key"))?;
        if !self
            .verifier
            .verify(&verify_key, &proof.proof, &proof.public_input)
        {
            return Err(ZkError::ProofRejected(format!("proof {}", proof.proof_id)));
        }

        let last_id = self.last_proof_id()?;
        let proof_id = proof.proof_id;
        if proof_id <= last_id {
            return Err(ZkError::ChainLinkage(format!(
                "proof {} already superseded, next expected {}",
                proof_id,
                last_id + 1
            )));
        }

        // Roots are indexed in canonical decimal form.
        let mut record = proof.into_record(height);
        record.old_tree_root = normalize_fr_str(&record.old_tree_root)?;
        record.new_tree_root = normalize_fr_str(&record.new_tree_root)?;
        if proof_id > last_id + 1 {
            self.store.put_pending_proof(&record)?;
            if proof_id > self.store.get_counter(meta::MAX_PENDING_PROOF_ID)? {
                self.store.set_counter(meta::MAX_PENDING_PROOF_ID, proof_id)?;
            }
            info!("Buffered proof {} (last accepted {})", proof_id, last_id);
            return Ok(SubmitOutcome::Buffered { proof_id });
        }

        self.accept(&record)?;
        let drained = self.drain()?;
        Ok(SubmitOutcome::Applied { proof_id, drained })
    }

    /// Link, reconcile and persist a contiguous proof.
    fn accept(&self, record: &CommitProofRecord) -> ZkResult<ProofQueueRange> {
        let last_id = self.last_proof_id()?;
        if record.proof_id != last_id + 1 {
            return Err(ZkError::ChainLinkage(format!(
                "proof {} does not follow {}",
                record.proof_id, last_id
            )));
        }

        if last_id > 0 {
            let last = self
                .store
                .get_proof(last_id)?
                .ok_or_else(|| ZkError::not_found(format!("proof {}", last_id)))?;
            if !same_root(&record.old_tree_root, &last.new_tree_root)? {
                return Err(ZkError::ChainLinkage(format!(
                    "proof {} starts from root {}, proof {} ended at {}",
                    record.proof_id, record.old_tree_root, last_id, last.new_tree_root
                )));
            }
            if record.block_start != last.block_end {
                return Err(ZkError::ChainLinkage(format!(
                    "proof {} starts at block {}, proof {} ended at {}",
                    record.proof_id, record.block_start, last_id, last.block_end
                )));
            }
        }

        let last_on_chain = self.last_on_chain_proof_id()?;
        if record.on_chain_proof_id > 0 && record.on_chain_proof_id != last_on_chain + 1 {
            return Err(ZkError::ChainLinkage(format!(
                "proof {} carries on-chain id {}, expected {}",
                record.proof_id,
                record.on_chain_proof_id,
                last_on_chain + 1
            )));
        }

        let range = self.reconcile(record)?;

        self.store.put_proof(record)?;
        self.store.put_proof_range(record.proof_id, &range)?;
        self.store.set_counter(meta::LAST_PROOF_ID, record.proof_id)?;
        OperationQueue::new(self.store).advance(range.last_queue_id)?;
        if record.on_chain_proof_id > 0 {
            self.store
                .set_counter(meta::LAST_ON_CHAIN_PROOF_ID, record.on_chain_proof_id)?;
        }
        self.store.delete_pending_proof(record.proof_id)?;

        info!(
            "Accepted proof {}: root {} -> {}, queue {}..={}",
            record.proof_id,
            record.old_tree_root,
            record.new_tree_root,
            range.first_queue_id,
            range.last_queue_id
        );
        Ok(range)
    }

    /// Match every pubdata operation against the queue from the watermark on.
    fn reconcile(&self, record: &CommitProofRecord) -> ZkResult<ProofQueueRange> {
        let ops = decode_pubdata(&record.pub_datas)?;
        let queue = OperationQueue::new(self.store);
        let first = queue.first_unverified_id()?;

        for (i, op) in ops.iter().enumerate() {
            let queue_id = first + i as u64;
            let queued = self.store.get_queue_op(queue_id)?.ok_or_else(|| {
                ZkError::Reconciliation(format!(
                    "proof {} operation {} has no queue entry {}",
                    record.proof_id, i, queue_id
                ))
            })?;
            if let Some(field) = first_mismatch(op, &queued)? {
                return Err(ZkError::Reconciliation(format!(
                    "proof {} operation {} differs from queue entry {}: {}",
                    record.proof_id, i, queue_id, field
                )));
            }
        }
        debug!("Proof {} matches {} queue entries", record.proof_id, ops.len());

        Ok(ProofQueueRange {
            first_queue_id: first,
            last_queue_id: first + ops.len() as u64 - 1,
        })
    }

    /// Apply buffered successors of the last accepted proof.
    ///
    /// Stops at the first gap or failure and leaves that record buffered.
    fn drain(&self) -> ZkResult<Vec<u64>> {
        let max_pending = self.store.get_counter(meta::MAX_PENDING_PROOF_ID)?;
        let mut drained = Vec::new();
        loop {
            let next = self.last_proof_id()? + 1;
            if next > max_pending {
                break;
            }
            let Some(record) = self.store.get_pending_proof(next)? else {
                break;
            };
            match self.accept(&record) {
                Ok(_) => drained.push(next),
                Err(e) => {
                    warn!("Buffered proof {} not applied: {}", next, e);
                    break;
                }
            }
        }
        Ok(drained)
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub fn get_proof(&self, proof_id: u64) -> ZkResult<CommitProofRecord> {
        self.store
            .get_proof(proof_id)?
            .ok_or_else(|| ZkError::not_found(format!("proof {}", proof_id)))
    }

    pub fn get_pending_proof(&self, proof_id: u64) -> ZkResult<Option<CommitProofRecord>> {
        Ok(self.store.get_pending_proof(proof_id)?)
    }

    /// The accepted proof whose new root is `root`.
    pub fn proof_by_root(&self, root: &str) -> ZkResult<CommitProofRecord> {
        let root = normalize_fr_str(root)?;
        let proof_id = self
            .store
            .get_proof_id_by_root(&root)?
            .ok_or_else(|| ZkError::not_found(format!("proof with root {}", root)))?;
        self.get_proof(proof_id)
    }

    /// The accepted proof following `proof_id`, if any.
    pub fn next_proof(&self, proof_id: u64) -> ZkResult<Option<CommitProofRecord>> {
        Ok(self.store.get_proof(proof_id + 1)?)
    }

    /// The latest proof committed at or before host height `height`.
    pub fn latest_proof_at_or_before(&self, height: u64) -> ZkResult<Option<CommitProofRecord>> {
        match self.store.get_latest_proof_id_at_or_before(height)? {
            Some(proof_id) => Ok(Some(self.get_proof(proof_id)?)),
            None => Ok(None),
        }
    }

    /// The on-chain proof following on-chain id `sub_id`, if any.
    pub fn next_on_chain_proof(&self, sub_id: u64) -> ZkResult<Option<CommitProofRecord>> {
        match self.store.get_proof_id_by_on_chain_id(sub_id + 1)? {
            Some(proof_id) => Ok(Some(self.get_proof(proof_id)?)),
            None => Ok(None),
        }
    }

    /// Queue ids consumed by an accepted proof.
    pub fn proof_range(&self, proof_id: u64) -> ZkResult<ProofQueueRange> {
        self.store
            .get_proof_range(proof_id)?
            .ok_or_else(|| ZkError::not_found(format!("queue range of proof {}", proof_id)))
    }
}

/// Decimal text of the commitment pair in a public input, for display.
pub fn describe_public_input(input: &[u8]) -> Option<(String, String)> {
    if input.len() != 64 {
        return None;
    }
    Some((bytes_to_fr_str(&input[..32]), bytes_to_fr_str(&input[32..])))
}
