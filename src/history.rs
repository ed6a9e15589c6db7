//! Historical ledger reconstruction
//!
//! A [`Snapshot`] is the full account set at one root. Snapshots of the
//! live root are read from the store; older roots are rebuilt by replaying
//! the queue from genesis up to the last entry the matching proof consumed,
//! and the replayed root must equal the proof's root.
//!
//! [`witness_for`] turns a snapshot into account and token Merkle proofs.

use crate::apply::{apply_operation, AccountState, Change};
use crate::cache::SnapshotCache;
use crate::config::ZkConfig;
use crate::error::{ZkError, ZkResult};
use crate::ledger::{genesis_changes, leaf_hash, token_hash, token_tree_root, Ledger};
use crate::merkle::{self, Hash, MerkleProof};
use crate::mimc::{bytes_to_fr_str, normalize_fr_str, parse_decimal, str_to_fr_bytes};
use crate::queue::OperationQueue;
use crate::records::{AccountLeaf, TokenBalance};
use crate::store::StateStore;
use num_bigint::BigUint;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Account state held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    leaves: Vec<AccountLeaf>,
    leaf_hashes: Vec<Hash>,
    balances: HashMap<(u64, u64), BigUint>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State holding only the reserved genesis accounts.
    pub fn genesis(eth_fee_addr: &str, chain33_fee_addr: &str) -> ZkResult<Self> {
        let mut state = Self::new();
        state.commit(genesis_changes(eth_fee_addr, chain33_fee_addr)?)?;
        Ok(state)
    }

    /// Copy of the committed live ledger.
    pub fn from_ledger(ledger: &Ledger) -> ZkResult<Self> {
        let mut state = Self::new();
        for account_id in 0..ledger.account_count()? {
            let leaf = ledger
                .get_leaf(account_id)?
                .ok_or_else(|| ZkError::not_found(format!("account {}", account_id)))?;
            for token in ledger.tokens_of(&leaf)? {
                state
                    .balances
                    .insert((account_id, token.token_id), parse_decimal(&token.balance)?);
            }
            state.leaf_hashes.push(leaf_hash(&leaf)?);
            state.leaves.push(leaf);
        }
        Ok(state)
    }

    pub fn root(&self) -> ZkResult<Hash> {
        Ok(merkle::root(&self.leaf_hashes))
    }

    pub fn leaves(&self) -> &[AccountLeaf] {
        &self.leaves
    }

    pub fn leaf_hashes(&self) -> &[Hash] {
        &self.leaf_hashes
    }

    /// Balances of every token the account has held, in first-touch order.
    pub fn tokens_of(&self, account_id: u64) -> Vec<TokenBalance> {
        let Some(leaf) = self.leaves.get(account_id as usize) else {
            return Vec::new();
        };
        leaf.token_ids
            .iter()
            .map(|token_id| TokenBalance {
                token_id: *token_id,
                balance: self
                    .balances
                    .get(&(account_id, *token_id))
                    .cloned()
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect()
    }

    fn leaf_mut(&mut self, account_id: u64) -> ZkResult<&mut AccountLeaf> {
        self.leaves
            .get_mut(account_id as usize)
            .ok_or_else(|| ZkError::not_found(format!("account {}", account_id)))
    }
}

impl AccountState for MemoryState {
    fn leaf(&self, account_id: u64) -> ZkResult<Option<AccountLeaf>> {
        Ok(self.leaves.get(account_id as usize).cloned())
    }

    fn balance(&self, account_id: u64, token_id: u64) -> ZkResult<Option<BigUint>> {
        Ok(self.balances.get(&(account_id, token_id)).cloned())
    }

    fn account_count(&self) -> ZkResult<u64> {
        Ok(self.leaves.len() as u64)
    }

    fn commit(&mut self, changes: Vec<Change>) -> ZkResult<()> {
        let mut touched = BTreeSet::new();
        for change in changes {
            match change {
                Change::CreateLeaf {
                    account_id,
                    eth_address,
                    chain33_address,
                } => {
                    if account_id != self.leaves.len() as u64 {
                        return Err(ZkError::malformed(format!(
                            "account {} would leave a gap after {}",
                            account_id,
                            self.leaves.len()
                        )));
                    }
                    self.leaves
                        .push(AccountLeaf::new(account_id, &eth_address, &chain33_address));
                    touched.insert(account_id);
                }
                Change::SetBalance {
                    account_id,
                    token_id,
                    balance,
                } => {
                    let leaf = self.leaf_mut(account_id)?;
                    if !leaf.token_ids.contains(&token_id) {
                        leaf.token_ids.push(token_id);
                    }
                    self.balances.insert((account_id, token_id), balance);
                    touched.insert(account_id);
                }
                Change::SetPubKey {
                    account_id,
                    ty,
                    pub_key,
                } => {
                    self.leaf_mut(account_id)?.pub_keys[ty.slot()] = Some(pub_key);
                    touched.insert(account_id);
                }
            }
        }

        for account_id in touched {
            let tokens = self.tokens_of(account_id);
            let leaf = self.leaf_mut(account_id)?;
            leaf.token_tree_root = token_tree_root(account_id, &tokens)?;
            let data = leaf_hash(leaf)?;
            let index = account_id as usize;
            if index < self.leaf_hashes.len() {
                self.leaf_hashes[index] = data;
            } else {
                self.leaf_hashes.push(data);
            }
        }
        Ok(())
    }
}

/// Full account set at one root.
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: String,
    state: MemoryState,
}

impl Snapshot {
    pub fn new(state: MemoryState) -> ZkResult<Self> {
        let root = bytes_to_fr_str(&state.root()?);
        Ok(Self { root, state })
    }

    /// Root in canonical decimal form.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn leaves(&self) -> &[AccountLeaf] {
        self.state.leaves()
    }

    pub fn leaf_hashes(&self) -> &[Hash] {
        self.state.leaf_hashes()
    }

    pub fn tokens_of(&self, account_id: u64) -> Vec<TokenBalance> {
        self.state.tokens_of(account_id)
    }
}

/// Merkle witness for one (account, token) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Witness {
    pub root: String,
    pub account: AccountLeaf,
    pub account_proof: MerkleProof,
    pub token: TokenBalance,
    pub token_proof: MerkleProof,
    /// Every balance of the account, in token tree order.
    pub tokens: Vec<TokenBalance>,
}

/// Account and token proofs for `(account_id, token_id)` in `snapshot`.
///
/// Both proofs are folded back to their roots before being returned.
pub fn witness_for(snapshot: &Snapshot, account_id: u64, token_id: u64) -> ZkResult<Witness> {
    let account = snapshot
        .leaves()
        .get(account_id as usize)
        .cloned()
        .ok_or_else(|| ZkError::not_found(format!("account {} at root {}", account_id, snapshot.root())))?;
    let account_proof = merkle::prove(snapshot.leaf_hashes(), account_id as usize)
        .ok_or_else(|| ZkError::not_found(format!("account {}", account_id)))?;
    if !merkle::verify(&str_to_fr_bytes(snapshot.root())?, &account_proof) {
        return Err(ZkError::Reconciliation(format!(
            "account {} path does not reach root {}",
            account_id,
            snapshot.root()
        )));
    }

    let tokens = snapshot.tokens_of(account_id);
    let position = tokens
        .iter()
        .position(|t| t.token_id == token_id)
        .ok_or_else(|| ZkError::not_found(format!("token {} of account {}", token_id, account_id)))?;
    let token_hashes = tokens.iter().map(token_hash).collect::<ZkResult<Vec<_>>>()?;
    let token_proof = merkle::prove(&token_hashes, position)
        .ok_or_else(|| ZkError::not_found(format!("token {} of account {}", token_id, account_id)))?;
    if !merkle::verify(&str_to_fr_bytes(&account.token_tree_root)?, &token_proof) {
        return Err(ZkError::Reconciliation(format!(
            "token {} path does not reach token root of account {}",
            token_id, account_id
        )));
    }

    Ok(Witness {
        root: snapshot.root().to_string(),
        account,
        account_proof,
        token: tokens[position].clone(),
        token_proof,
        tokens,
    })
}

/// Builds snapshots of past ledger roots.
pub struct HistoryBuilder<'a> {
    store: &'a dyn StateStore,
    config: &'a ZkConfig,
    cache: SnapshotCache,
}

impl<'a> HistoryBuilder<'a> {
    pub fn new(store: &'a dyn StateStore, config: &'a ZkConfig) -> Self {
        Self {
            store,
            config,
            cache: SnapshotCache::new(),
        }
    }

    /// Snapshot at `target`, or at the live root when `target` is absent or empty.
    pub fn snapshot_at(&mut self, target: Option<&str>) -> ZkResult<&Snapshot> {
        let ledger = Ledger::new(self.store);
        let live_root = ledger.root()?;
        let root = match target.map(str::trim) {
            Some(t) if !t.is_empty() => normalize_fr_str(t)?,
            _ => live_root.clone(),
        };

        if !self.cache.contains(&root) {
            let snapshot = if root == live_root {
                debug!("Building snapshot from live state at {}", root);
                Snapshot::new(MemoryState::from_ledger(&ledger)?)?
            } else {
                self.replay_to_root(&root)?
            };
            self.cache.store(snapshot);
        }
        self.cached(&root)
    }

    /// Snapshot at the root produced by accepted proof `proof_id`.
    pub fn snapshot_at_proof(&mut self, proof_id: u64) -> ZkResult<&Snapshot> {
        let record = self
            .store
            .get_proof(proof_id)?
            .ok_or_else(|| ZkError::not_found(format!("proof {}", proof_id)))?;
        let root = normalize_fr_str(&record.new_tree_root)?;
        if !self.cache.contains(&root) {
            let snapshot = self.replay_to_proof(proof_id, &root)?;
            self.cache.store(snapshot);
        }
        self.cached(&root)
    }

    /// Snapshot at a root some accepted proof ended at.
    pub fn snapshot_at_root(&mut self, root: &str) -> ZkResult<&Snapshot> {
        let root = normalize_fr_str(root)?;
        if !self.cache.contains(&root) {
            let snapshot = self.replay_to_root(&root)?;
            self.cache.store(snapshot);
        }
        self.cached(&root)
    }

    fn cached(&self, root: &str) -> ZkResult<&Snapshot> {
        self.cache
            .get(root)
            .ok_or_else(|| ZkError::not_found(format!("snapshot at root {}", root)))
    }

    fn replay_to_root(&self, root: &str) -> ZkResult<Snapshot> {
        let genesis = MemoryState::genesis(&self.config.eth_fee_addr, &self.config.chain33_fee_addr)?;
        let genesis = Snapshot::new(genesis)?;
        if genesis.root() == root {
            return Ok(genesis);
        }
        let proof_id = self
            .store
            .get_proof_id_by_root(root)?
            .ok_or_else(|| ZkError::not_found(format!("proof with root {}", root)))?;
        self.replay_to_proof(proof_id, root)
    }

    /// Replay queue entries up to the last one `proof_id` consumed.
    fn replay_to_proof(&self, proof_id: u64, root: &str) -> ZkResult<Snapshot> {
        let range = self
            .store
            .get_proof_range(proof_id)?
            .ok_or_else(|| ZkError::not_found(format!("queue range of proof {}", proof_id)))?;

        let mut state = MemoryState::genesis(&self.config.eth_fee_addr, &self.config.chain33_fee_addr)?;
        let queue = OperationQueue::new(self.store);
        for queue_id in 1..=range.last_queue_id {
            apply_operation(&mut state, &queue.get(queue_id)?)?;
        }

        let snapshot = Snapshot::new(state)?;
        if snapshot.root() != root {
            return Err(ZkError::Reconciliation(format!(
                "replay through queue entry {} gives root {}, proof {} ended at {}",
                range.last_queue_id,
                snapshot.root(),
                proof_id,
                root
            )));
        }
        info!(
            "Rebuilt snapshot for proof {} from {} queue entries",
            proof_id, range.last_queue_id
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_pubdata;
    use crate::error::ErrorKind;
    use crate::mimc::hex_to_decimal;
    use crate::proof_chain::{expected_public_input, CommitProof, ProofChain, Verifier};
    use crate::store::RocksStateStore;
    use crate::types::{DepositOp, Operation, TransferOp};
    use tempfile::TempDir;

    struct AcceptAll;

    impl Verifier for AcceptAll {
        fn verify(&self, _key: &[u8], _proof: &[u8], _input: &[u8]) -> bool {
            true
        }
    }

    fn create_test_store() -> (RocksStateStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStateStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn test_config() -> ZkConfig {
        ZkConfig {
            eth_fee_addr: hex_to_decimal("832367164346888E248bd58b9A5f480299F1e88d").unwrap(),
            chain33_fee_addr: hex_to_decimal(
                "2c4a5c378be2424fa7585320630eceba764833f1ec1ffb2fafc1af97f27baf5a",
            )
            .unwrap(),
            super_managers: vec!["manager".to_string()],
            sys_decimal: 8,
        }
    }

    fn deposit(account_id: u64, amount: &str) -> Operation {
        Operation::Deposit(DepositOp {
            account_id,
            token_id: 1,
            amount: amount.into(),
            eth_address: (100 + account_id).to_string(),
            layer2_address: (200 + account_id).to_string(),
        })
    }

    fn transfer(from: u64, to: u64, amount: &str) -> Operation {
        Operation::Transfer(TransferOp {
            from_account_id: from,
            token_id: 1,
            to_account_id: to,
            amount: amount.into(),
            fee: "0".into(),
        })
    }

    /// Apply `ops` to the live ledger and queue.
    fn execute(store: &RocksStateStore, ops: &[Operation]) {
        let mut ledger = Ledger::new(store);
        let queue = OperationQueue::new(store);
        for op in ops {
            apply_operation(&mut ledger, op).unwrap();
            queue.append(op).unwrap();
        }
    }

    /// Submit a proof over `ops` ending at the current live root.
    fn prove(store: &RocksStateStore, config: &ZkConfig, proof_id: u64, old_root: &str, ops: &[Operation]) -> String {
        let new_root = Ledger::new(store).root().unwrap();
        let mut proof = CommitProof {
            proof_id,
            block_start: proof_id,
            block_end: proof_id + 1,
            index_start: 0,
            index_end: 0,
            op_index: 0,
            old_tree_root: old_root.to_string(),
            new_tree_root: new_root.clone(),
            proof: vec![1],
            public_input: Vec::new(),
            pub_datas: encode_pubdata(ops).unwrap(),
            on_chain_pub_datas: Vec::new(),
            on_chain_proof_id: 0,
        };
        proof.public_input = expected_public_input(&proof).unwrap();
        ProofChain::new(store, &AcceptAll, config)
            .submit("manager", proof, proof_id * 10)
            .unwrap();
        new_root
    }

    #[test]
    fn test_memory_state_matches_ledger() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let genesis = Ledger::new(&store)
            .init_genesis(&config.eth_fee_addr, &config.chain33_fee_addr)
            .unwrap();
        let memory = MemoryState::genesis(&config.eth_fee_addr, &config.chain33_fee_addr).unwrap();
        assert_eq!(bytes_to_fr_str(&memory.root().unwrap()), genesis);

        let ops = vec![deposit(4, "50"), deposit(5, "7"), transfer(4, 5, "20")];
        execute(&store, &ops);
        let mut replayed = memory;
        for op in &ops {
            apply_operation(&mut replayed, op).unwrap();
        }
        let live = MemoryState::from_ledger(&Ledger::new(&store)).unwrap();
        assert_eq!(replayed.root().unwrap(), live.root().unwrap());
        assert_eq!(
            bytes_to_fr_str(&live.root().unwrap()),
            Ledger::new(&store).root().unwrap()
        );
        assert_eq!(replayed.tokens_of(5)[0].balance, "27");
    }

    #[test]
    fn test_snapshots_at_past_roots() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        store.put_verify_key(&[9]).unwrap();
        let genesis = Ledger::new(&store)
            .init_genesis(&config.eth_fee_addr, &config.chain33_fee_addr)
            .unwrap();

        let first = vec![deposit(4, "50"), deposit(5, "7")];
        execute(&store, &first);
        let root1 = prove(&store, &config, 1, &genesis, &first);

        let second = vec![transfer(4, 5, "20")];
        execute(&store, &second);
        let root2 = prove(&store, &config, 2, &root1, &second);

        // Unproven tail
        execute(&store, &[deposit(6, "1")]);

        let mut history = HistoryBuilder::new(&store, &config);
        let snap = history.snapshot_at_proof(1).unwrap();
        assert_eq!(snap.root(), root1);
        assert_eq!(snap.leaves().len(), 6);
        assert_eq!(snap.tokens_of(4)[0].balance, "50");

        let snap = history.snapshot_at_root(&root2).unwrap();
        assert_eq!(snap.tokens_of(5)[0].balance, "27");
        assert_eq!(snap.leaves().len(), 6);

        let live = Ledger::new(&store).root().unwrap();
        let snap = history.snapshot_at(None).unwrap();
        assert_eq!(snap.root(), live);
        assert_eq!(snap.leaves().len(), 7);

        let snap = history.snapshot_at(Some(genesis.as_str())).unwrap();
        assert_eq!(snap.leaves().len(), 4);

        let err = history.snapshot_at(Some("12345")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn test_witness_folds_to_root() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let ledger_root = {
            let mut ledger = Ledger::new(&store);
            ledger
                .init_genesis(&config.eth_fee_addr, &config.chain33_fee_addr)
                .unwrap();
            ledger.root().unwrap()
        };
        assert!(!ledger_root.is_empty());
        execute(&store, &[deposit(4, "8000000000000000000"), deposit(5, "3")]);
        execute(
            &store,
            &[Operation::Deposit(DepositOp {
                account_id: 4,
                token_id: 2,
                amount: "11".into(),
                eth_address: "104".into(),
                layer2_address: "204".into(),
            })],
        );

        let mut history = HistoryBuilder::new(&store, &config);
        let snapshot = history.snapshot_at(None).unwrap();
        let witness = witness_for(snapshot, 4, 2).unwrap();

        assert_eq!(witness.root, Ledger::new(&store).root().unwrap());
        assert_eq!(witness.token.balance, "11");
        assert_eq!(witness.tokens.len(), 2);
        assert_eq!(witness.tokens[0].balance, "8000000000000000000");
        assert_eq!(witness.account_proof.index, 4);
        assert_eq!(witness.account_proof.num_leaves, 6);
        assert_eq!(witness.token_proof.index, 1);
        assert_eq!(witness.account_proof.proof_set[0], leaf_hash(&witness.account).unwrap());
        assert_eq!(
            merkle::root_from_proof(&witness.account_proof).map(|h| bytes_to_fr_str(&h)),
            Some(witness.root.clone())
        );

        assert_eq!(witness_for(snapshot, 4, 3).unwrap_err().kind(), ErrorKind::Resource);
        assert_eq!(witness_for(snapshot, 9, 1).unwrap_err().kind(), ErrorKind::Resource);

        // The fee account holds token 0 from genesis
        let fee = witness_for(snapshot, 1, 0).unwrap();
        assert_eq!(fee.token.balance, "0");
    }
}
