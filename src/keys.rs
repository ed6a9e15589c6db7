//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data.
//! Integers are big-endian so keys sort in numeric order in RocksDB.

use anyhow::Result;

/// Meta ids for singleton records under the `M` prefix.
pub mod meta {
    /// Number of leaves in the account tree.
    pub const LEAF_COUNT: u8 = 0x01;
    /// Id of the most recently queued operation.
    pub const LAST_QUEUE_ID: u8 = 0x02;
    /// Id of the last queue entry covered by an accepted proof.
    pub const VERIFIED_QUEUE_ID: u8 = 0x03;
    pub const LAST_PROOF_ID: u8 = 0x04;
    pub const LAST_ON_CHAIN_PROOF_ID: u8 = 0x05;
    /// Highest proof id ever buffered as pending.
    pub const MAX_PENDING_PROOF_ID: u8 = 0x06;
    /// Last host-chain priority id consumed by a deposit.
    pub const LAST_PRIORITY_ID: u8 = 0x07;
    pub const VERIFY_KEY: u8 = 0x08;
    pub const VERIFIER_SET: u8 = 0x09;
}

fn id_key(prefix: u8, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Encode an account leaf key.
///
/// Format: byte 'L' + account_id (8 bytes, big-endian)
pub fn encode_leaf_key(account_id: u64) -> Vec<u8> {
    id_key(b'L', account_id)
}

/// Encode the (chain33 address, eth address) pair index key.
///
/// Format: byte 'P' + chain33 length (1 byte) + chain33 + eth
pub fn encode_address_pair_key(chain33_address: &str, eth_address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + chain33_address.len() + eth_address.len());
    key.push(b'P');
    key.push(chain33_address.len() as u8);
    key.extend_from_slice(chain33_address.as_bytes());
    key.extend_from_slice(eth_address.as_bytes());
    key
}

/// Format: byte 'E' + eth address text
pub fn encode_eth_index_key(eth_address: &str) -> Vec<u8> {
    let mut key = vec![b'E'];
    key.extend_from_slice(eth_address.as_bytes());
    key
}

/// Format: byte 'C' + chain33 address text
pub fn encode_chain33_index_key(chain33_address: &str) -> Vec<u8> {
    let mut key = vec![b'C'];
    key.extend_from_slice(chain33_address.as_bytes());
    key
}

/// Encode a token balance key.
///
/// Format: byte 'T' + account_id (8 bytes) + token_id (8 bytes)
/// Total length: 17 bytes
pub fn encode_token_key(account_id: u64, token_id: u64) -> Vec<u8> {
    let mut key = id_key(b'T', account_id);
    key.extend_from_slice(&token_id.to_be_bytes());
    key
}

/// Encode an account tree node key.
///
/// Format: byte 'N' + height (1 byte) + index (8 bytes)
pub fn encode_tree_node_key(height: u8, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.push(b'N');
    key.push(height);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Format: byte 'Q' + queue_id (8 bytes)
pub fn encode_queue_key(queue_id: u64) -> Vec<u8> {
    id_key(b'Q', queue_id)
}

/// Format: byte 'R' + proof_id (8 bytes)
pub fn encode_proof_key(proof_id: u64) -> Vec<u8> {
    id_key(b'R', proof_id)
}

/// Format: byte 'W' + proof_id (8 bytes)
pub fn encode_pending_proof_key(proof_id: u64) -> Vec<u8> {
    id_key(b'W', proof_id)
}

/// Format: byte 'G' + proof_id (8 bytes)
pub fn encode_proof_range_key(proof_id: u64) -> Vec<u8> {
    id_key(b'G', proof_id)
}

/// Format: byte 'O' + new tree root text
pub fn encode_root_index_key(root: &str) -> Vec<u8> {
    let mut key = vec![b'O'];
    key.extend_from_slice(root.as_bytes());
    key
}

/// Format: byte 'X' + on_chain_proof_id (8 bytes)
pub fn encode_on_chain_index_key(on_chain_proof_id: u64) -> Vec<u8> {
    id_key(b'X', on_chain_proof_id)
}

/// Encode a commit height index key.
///
/// Format: byte 'H' + height (8 bytes) + proof_id (8 bytes)
/// Total length: 17 bytes
pub fn encode_height_index_key(height: u64, proof_id: u64) -> Vec<u8> {
    let mut key = id_key(b'H', height);
    key.extend_from_slice(&proof_id.to_be_bytes());
    key
}

/// Decode a commit height index key into (height, proof_id).
pub fn decode_height_index_key(key: &[u8]) -> Result<(u64, u64)> {
    if key.len() != 17 || key[0] != b'H' {
        anyhow::bail!("Invalid height index key: {}", hex::encode(key));
    }
    let height = u64::from_be_bytes(key[1..9].try_into()?);
    let proof_id = u64::from_be_bytes(key[9..17].try_into()?);
    Ok((height, proof_id))
}

/// Encode a per-action fee key.
///
/// Format: byte 'F' + operation kind tag (1 byte) + token_id (8 bytes)
pub fn encode_fee_key(kind_tag: u8, token_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.push(b'F');
    key.push(kind_tag);
    key.extend_from_slice(&token_id.to_be_bytes());
    key
}

/// Encode a meta key.
///
/// Format: byte 'M' (0x4D) + meta_id (1 byte)
/// Total length: 2 bytes
pub fn encode_meta_key(meta_id: u8) -> Vec<u8> {
    vec![b'M', meta_id]
}
