//! StateStore trait and RocksDB implementation
//!
//! Provides a persistent key-value store for the rollup ledger, the
//! operation queue and the proof chain bookkeeping.
//! Uses RocksDB with column families for efficient organization.

use crate::keys::{
    decode_height_index_key, encode_address_pair_key, encode_chain33_index_key,
    encode_eth_index_key, encode_fee_key, encode_height_index_key, encode_leaf_key,
    encode_meta_key, encode_on_chain_index_key, encode_pending_proof_key, encode_proof_key,
    encode_proof_range_key, encode_queue_key, encode_root_index_key, encode_token_key,
    encode_tree_node_key, meta,
};
use crate::records::{AccountLeaf, CommitProofRecord, ProofQueueRange, TokenBalance, VerifierSet};
use crate::types::Operation;
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

/// Trait defining the interface for rollup state storage.
///
/// All methods return Results for proper error handling.
/// Missing counters read as zero.
pub trait StateStore {
    /// Start staging writes; nothing reaches disk until [`commit_batch`].
    ///
    /// Point reads see staged writes. Fails if a batch is already open.
    ///
    /// [`commit_batch`]: StateStore::commit_batch
    fn begin_batch(&self) -> Result<()>;

    /// Write every staged change atomically and close the batch.
    fn commit_batch(&self) -> Result<()>;

    /// Drop every staged change and close the batch.
    fn discard_batch(&self) -> Result<()>;

    /// Get an account leaf by id.
    fn get_leaf(&self, account_id: u64) -> Result<Option<AccountLeaf>>;

    /// Store an account leaf.
    fn put_leaf(&self, leaf: &AccountLeaf) -> Result<()>;

    /// Index a leaf under its address pair and under each address.
    fn index_leaf_addresses(&self, leaf: &AccountLeaf) -> Result<()>;

    /// Account id owning exactly this (chain33, eth) address pair.
    fn get_account_id_by_addresses(&self, chain33_address: &str, eth_address: &str)
        -> Result<Option<u64>>;

    /// All accounts registered under an eth address.
    fn get_account_ids_by_eth(&self, eth_address: &str) -> Result<Vec<u64>>;

    /// All accounts registered under a chain33 address.
    fn get_account_ids_by_chain33(&self, chain33_address: &str) -> Result<Vec<u64>>;

    /// Get the balance of one (account, token) pair.
    fn get_token(&self, account_id: u64, token_id: u64) -> Result<Option<TokenBalance>>;

    /// Store the balance of one (account, token) pair.
    fn put_token(&self, account_id: u64, token: &TokenBalance) -> Result<()>;

    /// Get an account tree node.
    fn get_tree_node(&self, height: u8, index: u64) -> Result<Option<[u8; 32]>>;

    /// Store an account tree node.
    fn put_tree_node(&self, height: u8, index: u64, hash: &[u8; 32]) -> Result<()>;

    /// Get a queued operation.
    fn get_queue_op(&self, queue_id: u64) -> Result<Option<Operation>>;

    /// Store a queued operation.
    fn put_queue_op(&self, queue_id: u64, op: &Operation) -> Result<()>;

    /// Get an accepted proof.
    fn get_proof(&self, proof_id: u64) -> Result<Option<CommitProofRecord>>;

    /// Store an accepted proof and index it by root, height and on-chain id.
    fn put_proof(&self, record: &CommitProofRecord) -> Result<()>;

    /// Proof id whose new tree root is `root`.
    fn get_proof_id_by_root(&self, root: &str) -> Result<Option<u64>>;

    /// Proof id carrying the given on-chain proof id.
    fn get_proof_id_by_on_chain_id(&self, on_chain_proof_id: u64) -> Result<Option<u64>>;

    /// Latest proof committed at or before a host height.
    ///
    /// Scans committed data only.
    fn get_latest_proof_id_at_or_before(&self, height: u64) -> Result<Option<u64>>;

    /// Get a buffered out-of-order proof.
    fn get_pending_proof(&self, proof_id: u64) -> Result<Option<CommitProofRecord>>;

    /// Buffer an out-of-order proof.
    fn put_pending_proof(&self, record: &CommitProofRecord) -> Result<()>;

    /// Remove a buffered proof once it has been applied.
    fn delete_pending_proof(&self, proof_id: u64) -> Result<()>;

    /// Queue ids consumed by an accepted proof.
    fn get_proof_range(&self, proof_id: u64) -> Result<Option<ProofQueueRange>>;

    fn put_proof_range(&self, proof_id: u64, range: &ProofQueueRange) -> Result<()>;

    /// Get a singleton counter (see [`meta`]); zero when unset.
    fn get_counter(&self, meta_id: u8) -> Result<u64>;

    /// Set a singleton counter.
    fn set_counter(&self, meta_id: u8, value: u64) -> Result<()>;

    /// Get the proof verification key.
    fn get_verify_key(&self) -> Result<Option<Vec<u8>>>;

    /// Store the proof verification key.
    fn put_verify_key(&self, key: &[u8]) -> Result<()>;

    /// Get the registered verifiers; empty when unset.
    fn get_verifier_set(&self) -> Result<VerifierSet>;

    /// Store the registered verifiers.
    fn put_verifier_set(&self, set: &VerifierSet) -> Result<()>;

    /// Manager-set default fee for an operation kind paid in a token.
    fn get_fee(&self, kind_tag: u8, token_id: u64) -> Result<Option<String>>;

    fn put_fee(&self, kind_tag: u8, token_id: u64, fee: &str) -> Result<()>;
}

/// Writes staged between `begin_batch` and `commit_batch`.
///
/// `overlay` mirrors the batch so reads see their own writes; `None`
/// marks a staged delete.
#[derive(Default)]
struct Staged {
    batch: WriteBatch,
    overlay: HashMap<(&'static str, Vec<u8>), Option<Vec<u8>>>,
}

/// RocksDB-backed implementation of StateStore.
///
/// Uses column families to organize different types of data:
/// - leaves: account leaves
/// - tokens: token balances
/// - tree: account tree nodes
/// - queue: queued operations
/// - proofs: accepted proofs
/// - pending: out-of-order proofs waiting for their predecessor
/// - indexes: address, root, height and on-chain id lookups, proof queue ranges
/// - meta: counters, verification key, verifier set, fee table
pub struct RocksStateStore {
    db: DB,
    staged: RefCell<Option<Staged>>,
}

impl RocksStateStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = vec![
            ColumnFamilyDescriptor::new("leaves", Options::default()),
            ColumnFamilyDescriptor::new("tokens", Options::default()),
            ColumnFamilyDescriptor::new("tree", Options::default()),
            ColumnFamilyDescriptor::new("queue", Options::default()),
            ColumnFamilyDescriptor::new("proofs", Options::default()),
            ColumnFamilyDescriptor::new("pending", Options::default()),
            ColumnFamilyDescriptor::new("indexes", Options::default()),
            ColumnFamilyDescriptor::new("meta", Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self {
            db,
            staged: RefCell::new(None),
        })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    /// Raw read, staged writes first.
    fn read(&self, cf: &'static str, key: &[u8], what: &str) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.borrow().as_ref() {
            if let Some(value) = staged.overlay.get(&(cf, key.to_vec())) {
                return Ok(value.clone());
            }
        }
        let handle = self.get_cf(cf)?;
        self.db
            .get_cf(handle, key)
            .with_context(|| format!("Failed to get {}", what))
    }

    /// Raw write or delete (`None`), staged when a batch is open.
    fn write(&self, cf: &'static str, key: &[u8], value: Option<&[u8]>, what: &str) -> Result<()> {
        let handle = self.get_cf(cf)?;
        let mut staged = self.staged.borrow_mut();
        match (staged.as_mut(), value) {
            (Some(staged), Some(value)) => {
                staged.batch.put_cf(handle, key, value);
                staged.overlay.insert((cf, key.to_vec()), Some(value.to_vec()));
            }
            (Some(staged), None) => {
                staged.batch.delete_cf(handle, key);
                staged.overlay.insert((cf, key.to_vec()), None);
            }
            (None, Some(value)) => self
                .db
                .put_cf(handle, key, value)
                .with_context(|| format!("Failed to put {}", what))?,
            (None, None) => self
                .db
                .delete_cf(handle, key)
                .with_context(|| format!("Failed to delete {}", what))?,
        }
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        key: &[u8],
        what: &str,
    ) -> Result<Option<T>> {
        match self.read(cf, key, what)? {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .with_context(|| format!("Failed to deserialize {}", what))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(
        &self,
        cf: &'static str,
        key: &[u8],
        value: &T,
        what: &str,
    ) -> Result<()> {
        let bytes =
            postcard::to_allocvec(value).with_context(|| format!("Failed to serialize {}", what))?;
        self.write(cf, key, Some(&bytes), what)
    }

    fn get_u64(&self, cf: &'static str, key: &[u8], what: &str) -> Result<Option<u64>> {
        match self.read(cf, key, what)? {
            Some(bytes) => {
                if bytes.len() != 8 {
                    anyhow::bail!("{} must be 8 bytes (u64), got {}", what, bytes.len());
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn put_u64(&self, cf: &'static str, key: &[u8], value: u64, what: &str) -> Result<()> {
        self.write(cf, key, Some(&value.to_be_bytes()), what)
    }

    fn push_id_index(&self, key: &[u8], account_id: u64, what: &str) -> Result<()> {
        let mut ids: Vec<u64> = self.get_record("indexes", key, what)?.unwrap_or_default();
        if !ids.contains(&account_id) {
            ids.push(account_id);
            self.put_record("indexes", key, &ids, what)?;
        }
        Ok(())
    }
}

impl StateStore for RocksStateStore {
    fn begin_batch(&self) -> Result<()> {
        let mut staged = self.staged.borrow_mut();
        if staged.is_some() {
            anyhow::bail!("Write batch already open");
        }
        *staged = Some(Staged::default());
        Ok(())
    }

    fn commit_batch(&self) -> Result<()> {
        let staged = self
            .staged
            .borrow_mut()
            .take()
            .context("No write batch open")?;
        self.db
            .write(staged.batch)
            .context("Failed to write batch")
    }

    fn discard_batch(&self) -> Result<()> {
        self.staged.borrow_mut().take();
        Ok(())
    }

    fn get_leaf(&self, account_id: u64) -> Result<Option<AccountLeaf>> {
        self.get_record("leaves", &encode_leaf_key(account_id), "account leaf")
    }

    fn put_leaf(&self, leaf: &AccountLeaf) -> Result<()> {
        self.put_record("leaves", &encode_leaf_key(leaf.account_id), leaf, "account leaf")
    }

    fn index_leaf_addresses(&self, leaf: &AccountLeaf) -> Result<()> {
        let pair_key = encode_address_pair_key(&leaf.chain33_address, &leaf.eth_address);
        self.put_u64("indexes", &pair_key, leaf.account_id, "address pair index")?;
        self.push_id_index(
            &encode_eth_index_key(&leaf.eth_address),
            leaf.account_id,
            "eth address index",
        )?;
        self.push_id_index(
            &encode_chain33_index_key(&leaf.chain33_address),
            leaf.account_id,
            "chain33 address index",
        )
    }

    fn get_account_id_by_addresses(
        &self,
        chain33_address: &str,
        eth_address: &str,
    ) -> Result<Option<u64>> {
        let key = encode_address_pair_key(chain33_address, eth_address);
        self.get_u64("indexes", &key, "address pair index")
    }

    fn get_account_ids_by_eth(&self, eth_address: &str) -> Result<Vec<u64>> {
        let key = encode_eth_index_key(eth_address);
        Ok(self
            .get_record("indexes", &key, "eth address index")?
            .unwrap_or_default())
    }

    fn get_account_ids_by_chain33(&self, chain33_address: &str) -> Result<Vec<u64>> {
        let key = encode_chain33_index_key(chain33_address);
        Ok(self
            .get_record("indexes", &key, "chain33 address index")?
            .unwrap_or_default())
    }

    fn get_token(&self, account_id: u64, token_id: u64) -> Result<Option<TokenBalance>> {
        self.get_record("tokens", &encode_token_key(account_id, token_id), "token balance")
    }

    fn put_token(&self, account_id: u64, token: &TokenBalance) -> Result<()> {
        let key = encode_token_key(account_id, token.token_id);
        self.put_record("tokens", &key, token, "token balance")
    }

    fn get_tree_node(&self, height: u8, index: u64) -> Result<Option<[u8; 32]>> {
        let key = encode_tree_node_key(height, index);
        match self.read("tree", &key, "tree node")? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    anyhow::bail!("Tree node must be 32 bytes, got {}", bytes.len());
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    fn put_tree_node(&self, height: u8, index: u64, hash: &[u8; 32]) -> Result<()> {
        let key = encode_tree_node_key(height, index);
        self.write("tree", &key, Some(hash), "tree node")
    }

    fn get_queue_op(&self, queue_id: u64) -> Result<Option<Operation>> {
        self.get_record("queue", &encode_queue_key(queue_id), "queued operation")
    }

    fn put_queue_op(&self, queue_id: u64, op: &Operation) -> Result<()> {
        self.put_record("queue", &encode_queue_key(queue_id), op, "queued operation")
    }

    fn get_proof(&self, proof_id: u64) -> Result<Option<CommitProofRecord>> {
        self.get_record("proofs", &encode_proof_key(proof_id), "commit proof")
    }

    fn put_proof(&self, record: &CommitProofRecord) -> Result<()> {
        self.put_record("proofs", &encode_proof_key(record.proof_id), record, "commit proof")?;
        self.put_u64(
            "indexes",
            &encode_root_index_key(&record.new_tree_root),
            record.proof_id,
            "root index",
        )?;
        self.put_u64(
            "indexes",
            &encode_height_index_key(record.commit_block_height, record.proof_id),
            record.proof_id,
            "height index",
        )?;
        if record.on_chain_proof_id > 0 {
            self.put_u64(
                "indexes",
                &encode_on_chain_index_key(record.on_chain_proof_id),
                record.proof_id,
                "on-chain proof index",
            )?;
        }
        Ok(())
    }

    fn get_proof_id_by_root(&self, root: &str) -> Result<Option<u64>> {
        self.get_u64("indexes", &encode_root_index_key(root), "root index")
    }

    fn get_proof_id_by_on_chain_id(&self, on_chain_proof_id: u64) -> Result<Option<u64>> {
        let key = encode_on_chain_index_key(on_chain_proof_id);
        self.get_u64("indexes", &key, "on-chain proof index")
    }

    fn get_latest_proof_id_at_or_before(&self, height: u64) -> Result<Option<u64>> {
        let cf = self.get_cf("indexes")?;
        let search_key = encode_height_index_key(height, u64::MAX);

        // Reverse from (height, MAX): the first height key seen is the answer.
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&search_key, rocksdb::Direction::Reverse),
        );
        if let Some(item) = iter.take(1).next() {
            let (key, _) = item.context("Failed to read iterator")?;
            if key.first() != Some(&b'H') {
                return Ok(None);
            }
            let (key_height, proof_id) =
                decode_height_index_key(&key).context("Failed to decode height index key")?;
            if key_height <= height {
                return Ok(Some(proof_id));
            }
        }
        Ok(None)
    }

    fn get_pending_proof(&self, proof_id: u64) -> Result<Option<CommitProofRecord>> {
        self.get_record("pending", &encode_pending_proof_key(proof_id), "pending proof")
    }

    fn put_pending_proof(&self, record: &CommitProofRecord) -> Result<()> {
        let key = encode_pending_proof_key(record.proof_id);
        self.put_record("pending", &key, record, "pending proof")
    }

    fn delete_pending_proof(&self, proof_id: u64) -> Result<()> {
        let key = encode_pending_proof_key(proof_id);
        self.write("pending", &key, None, "pending proof")
    }

    fn get_proof_range(&self, proof_id: u64) -> Result<Option<ProofQueueRange>> {
        self.get_record("indexes", &encode_proof_range_key(proof_id), "proof queue range")
    }

    fn put_proof_range(&self, proof_id: u64, range: &ProofQueueRange) -> Result<()> {
        let key = encode_proof_range_key(proof_id);
        self.put_record("indexes", &key, range, "proof queue range")
    }

    fn get_counter(&self, meta_id: u8) -> Result<u64> {
        Ok(self
            .get_u64("meta", &encode_meta_key(meta_id), "counter")?
            .unwrap_or(0))
    }

    fn set_counter(&self, meta_id: u8, value: u64) -> Result<()> {
        self.put_u64("meta", &encode_meta_key(meta_id), value, "counter")
    }

    fn get_verify_key(&self) -> Result<Option<Vec<u8>>> {
        let key = encode_meta_key(meta::VERIFY_KEY);
        self.read("meta", &key, "verification key")
    }

    fn put_verify_key(&self, verify_key: &[u8]) -> Result<()> {
        let key = encode_meta_key(meta::VERIFY_KEY);
        self.write("meta", &key, Some(verify_key), "verification key")
    }

    fn get_verifier_set(&self) -> Result<VerifierSet> {
        let key = encode_meta_key(meta::VERIFIER_SET);
        Ok(self
            .get_record("meta", &key, "verifier set")?
            .unwrap_or_default())
    }

    fn put_verifier_set(&self, set: &VerifierSet) -> Result<()> {
        let key = encode_meta_key(meta::VERIFIER_SET);
        self.put_record("meta", &key, set, "verifier set")
    }

    fn get_fee(&self, kind_tag: u8, token_id: u64) -> Result<Option<String>> {
        self.get_record("meta", &encode_fee_key(kind_tag, token_id), "fee")
    }

    fn put_fee(&self, kind_tag: u8, token_id: u64, fee: &str) -> Result<()> {
        let key = encode_fee_key(kind_tag, token_id);
        self.put_record("meta", &key, &fee, "fee")
    }
}
