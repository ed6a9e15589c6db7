//! Record types for rollup state
//!
//! These structs represent the data stored in the state store.
//! They use postcard for binary serialization, which is compact and deterministic.

use crate::types::{PubKey, PubKeyType};
use serde::{Deserialize, Serialize};

/// One account of the account tree.
///
/// `pub_keys` is indexed by [`PubKeyType`]: primary, then the normal,
/// system and super proxy keys. An absent key hashes as `(0, 0)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLeaf {
    pub account_id: u64,
    /// Host-chain address, decimal text.
    pub eth_address: String,
    /// Layer-2 address, decimal text.
    pub chain33_address: String,
    pub pub_keys: [Option<PubKey>; 4],
    /// Every token this account has held, in first-touch order.
    pub token_ids: Vec<u64>,
    /// Root of the token sub-tree, decimal text.
    pub token_tree_root: String,
}

impl AccountLeaf {
    /// A leaf with no keys and no tokens.
    pub fn new(account_id: u64, eth_address: &str, chain33_address: &str) -> Self {
        Self {
            account_id,
            eth_address: eth_address.to_string(),
            chain33_address: chain33_address.to_string(),
            pub_keys: [None, None, None, None],
            token_ids: Vec::new(),
            token_tree_root: "0".to_string(),
        }
    }

    pub fn pub_key(&self, ty: PubKeyType) -> Option<&PubKey> {
        self.pub_keys[ty.slot()].as_ref()
    }
}

/// Balance of one (account, token) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token_id: u64,
    /// Non-negative integer, decimal text.
    pub balance: String,
}

/// A committed (or pending) proof together with the data it attests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitProofRecord {
    pub proof_id: u64,
    pub block_start: u64,
    pub block_end: u64,
    pub index_start: u64,
    pub index_end: u64,
    pub op_index: u64,
    pub old_tree_root: String,
    pub new_tree_root: String,
    pub proof: Vec<u8>,
    /// `[pubdata commitment, on-chain pubdata commitment]`, 32 bytes each.
    pub public_input: Vec<u8>,
    pub pub_datas: Vec<String>,
    pub on_chain_pub_datas: Vec<String>,
    /// Zero when the proof carries no on-chain data.
    pub on_chain_proof_id: u64,
    /// Host height at which the proof was submitted.
    pub commit_block_height: u64,
}

/// Queue ids consumed by one accepted proof.
///
/// `last_queue_id` is the verified watermark after the proof; a proof with
/// no operations has `last_queue_id == first_queue_id - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofQueueRange {
    pub first_queue_id: u64,
    pub last_queue_id: u64,
}

/// Accounts allowed to submit proofs besides the super managers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierSet {
    pub verifiers: Vec<String>,
}

impl VerifierSet {
    pub fn contains(&self, addr: &str) -> bool {
        self.verifiers.iter().any(|v| v.eq_ignore_ascii_case(addr))
    }
}
