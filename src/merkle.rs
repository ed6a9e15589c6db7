//! Append-only binary Merkle tree over MiMC
//!
//! A tree of `n` leaves is the list of perfect sub-trees given by the binary
//! expansion of `n`, largest first, folded from the right:
//! `root = node(S0, node(S1, .. Sk))`. A leaf node is `MiMC(data)`, an inner
//! node is `MiMC(left || right)` and the empty tree has root zero.
//!
//! Two renditions share these rules: [`root`] / [`prove`] work over a full
//! leaf list, and [`append`] / [`update`] / [`root_from_nodes`] maintain the
//! perfect sub-tree nodes in a [`NodeStore`] so one leaf change costs
//! O(log n) hashes.

use crate::error::ZkResult;
use crate::mimc;
use std::collections::HashMap;

pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];

pub fn leaf_node(data: &Hash) -> Hash {
    mimc::hash(&[data])
}

pub fn inner_node(left: &Hash, right: &Hash) -> Hash {
    mimc::hash(&[left, right])
}

/// Largest power of two strictly below `n` (`n >= 2`).
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Root over leaf data.
pub fn root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => ZERO_HASH,
        1 => leaf_node(&leaves[0]),
        n => {
            let k = split_point(n);
            inner_node(&root(&leaves[..k]), &root(&leaves[k..]))
        }
    }
}

/// Membership proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// `[leaf data, sibling_0, .. sibling_k]`, siblings bottom-up.
    pub proof_set: Vec<Hash>,
    /// One per sibling: `true` when the running node is the left child.
    pub helpers: Vec<bool>,
    pub index: u64,
    pub num_leaves: u64,
}

fn collect_siblings(leaves: &[Hash], index: usize, siblings: &mut Vec<Hash>, helpers: &mut Vec<bool>) {
    if leaves.len() <= 1 {
        return;
    }
    let k = split_point(leaves.len());
    if index < k {
        collect_siblings(&leaves[..k], index, siblings, helpers);
        siblings.push(root(&leaves[k..]));
        helpers.push(true);
    } else {
        collect_siblings(&leaves[k..], index - k, siblings, helpers);
        siblings.push(root(&leaves[..k]));
        helpers.push(false);
    }
}

/// Proof for `leaves[index]`, `None` if out of range.
pub fn prove(leaves: &[Hash], index: usize) -> Option<MerkleProof> {
    let data = *leaves.get(index)?;
    let mut siblings = Vec::new();
    let mut helpers = Vec::new();
    collect_siblings(leaves, index, &mut siblings, &mut helpers);

    let mut proof_set = Vec::with_capacity(siblings.len() + 1);
    proof_set.push(data);
    proof_set.extend(siblings);
    Some(MerkleProof {
        proof_set,
        helpers,
        index: index as u64,
        num_leaves: leaves.len() as u64,
    })
}

/// Root implied by a proof.
pub fn root_from_proof(proof: &MerkleProof) -> Option<Hash> {
    let (data, siblings) = proof.proof_set.split_first()?;
    if siblings.len() != proof.helpers.len() {
        return None;
    }
    let mut running = leaf_node(data);
    for (sibling, is_left) in siblings.iter().zip(proof.helpers.iter()) {
        running = if *is_left {
            inner_node(&running, sibling)
        } else {
            inner_node(sibling, &running)
        };
    }
    Some(running)
}

pub fn verify(expected_root: &Hash, proof: &MerkleProof) -> bool {
    root_from_proof(proof).as_ref() == Some(expected_root)
}

// ─────────────────────────────────────────────────────────────────
// Incremental tree
// ─────────────────────────────────────────────────────────────────

/// Storage for perfect sub-tree nodes, addressed by (height, index).
///
/// Height 0 holds leaf nodes; node `(h, i)` covers leaves
/// `[i * 2^h, (i + 1) * 2^h)` and exists only once that range is full.
pub trait NodeStore {
    fn node(&self, height: u8, index: u64) -> ZkResult<Option<Hash>>;
    fn set_node(&mut self, height: u8, index: u64, hash: Hash) -> ZkResult<()>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryNodes {
    nodes: HashMap<(u8, u64), Hash>,
}

impl MemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for MemoryNodes {
    fn node(&self, height: u8, index: u64) -> ZkResult<Option<Hash>> {
        Ok(self.nodes.get(&(height, index)).copied())
    }

    fn set_node(&mut self, height: u8, index: u64, hash: Hash) -> ZkResult<()> {
        self.nodes.insert((height, index), hash);
        Ok(())
    }
}

fn required<N: NodeStore + ?Sized>(nodes: &N, height: u8, index: u64) -> ZkResult<Hash> {
    nodes.node(height, index)?.ok_or_else(|| {
        anyhow::anyhow!("Merkle node ({}, {}) missing", height, index).into()
    })
}

/// Set leaf `index` of a tree holding `count` leaves and refresh every
/// complete ancestor.
pub fn update<N: NodeStore + ?Sized>(nodes: &mut N, count: u64, index: u64, data: &Hash) -> ZkResult<()> {
    let mut current = leaf_node(data);
    nodes.set_node(0, index, current)?;

    let mut height = 0u8;
    let mut idx = index;
    loop {
        let parent = idx >> 1;
        let parent_end = (parent + 1) << (height + 1);
        if height >= 63 || parent_end > count {
            break;
        }
        let sibling = required(nodes, height, idx ^ 1)?;
        current = if idx & 1 == 0 {
            inner_node(&current, &sibling)
        } else {
            inner_node(&sibling, &current)
        };
        height += 1;
        idx = parent;
        nodes.set_node(height, idx, current)?;
    }
    Ok(())
}

/// Append a leaf to a tree currently holding `count` leaves.
pub fn append<N: NodeStore + ?Sized>(nodes: &mut N, count: u64, data: &Hash) -> ZkResult<()> {
    update(nodes, count + 1, count, data)
}

/// Root of a tree holding `count` leaves.
pub fn root_from_nodes<N: NodeStore + ?Sized>(nodes: &N, count: u64) -> ZkResult<Hash> {
    let mut peaks = Vec::new();
    let mut offset = 0u64;
    for height in (0..64u8).rev() {
        if count & (1u64 << height) != 0 {
            peaks.push(required(nodes, height, offset >> height)?);
            offset += 1u64 << height;
        }
    }
    let mut iter = peaks.iter().rev();
    let Some(mut acc) = iter.next().copied() else {
        return Ok(ZERO_HASH);
    };
    for peak in iter {
        acc = inner_node(peak, &acc);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mimc::{bytes_to_fr_str, u64_to_fr_bytes};

    fn leaves(n: u64) -> Vec<Hash> {
        (0..n).map(|i| u64_to_fr_bytes(i * 7 + 3)).collect()
    }

    #[test]
    fn test_small_roots() {
        let l = leaves(3);
        assert_eq!(root(&[]), ZERO_HASH);
        assert_eq!(root(&l[..1]), leaf_node(&l[0]));
        assert_eq!(
            root(&l),
            inner_node(
                &inner_node(&leaf_node(&l[0]), &leaf_node(&l[1])),
                &leaf_node(&l[2])
            )
        );
        assert_eq!(bytes_to_fr_str(&root(&[])), "0");
    }

    #[test]
    fn test_incremental_matches_full_rebuild() {
        let all = leaves(19);
        let mut nodes = MemoryNodes::new();
        assert_eq!(root_from_nodes(&nodes, 0).unwrap(), ZERO_HASH);
        for (i, leaf) in all.iter().enumerate() {
            append(&mut nodes, i as u64, leaf).unwrap();
            let count = i as u64 + 1;
            assert_eq!(root_from_nodes(&nodes, count).unwrap(), root(&all[..=i]), "n={}", count);
        }
    }

    #[test]
    fn test_update_matches_full_rebuild() {
        let mut all = leaves(11);
        let mut nodes = MemoryNodes::new();
        for (i, leaf) in all.iter().enumerate() {
            append(&mut nodes, i as u64, leaf).unwrap();
        }
        for index in [0usize, 5, 8, 10] {
            all[index] = u64_to_fr_bytes(1000 + index as u64);
            update(&mut nodes, 11, index as u64, &all[index]).unwrap();
            assert_eq!(root_from_nodes(&nodes, 11).unwrap(), root(&all));
        }
    }

    #[test]
    fn test_prove_and_verify_every_index() {
        for n in 1..=9u64 {
            let all = leaves(n);
            let r = root(&all);
            for i in 0..n as usize {
                let proof = prove(&all, i).unwrap();
                assert_eq!(proof.proof_set[0], all[i]);
                assert_eq!(proof.helpers.len() + 1, proof.proof_set.len());
                assert!(verify(&r, &proof), "n={} i={}", n, i);
            }
            assert!(prove(&all, n as usize).is_none());
        }
    }

    #[test]
    fn test_helper_bits() {
        // 5 leaves: node(P4, leaf4)
        let all = leaves(5);
        let p0 = prove(&all, 0).unwrap();
        assert_eq!(p0.helpers, vec![true, true, true]);
        let p3 = prove(&all, 3).unwrap();
        assert_eq!(p3.helpers, vec![false, false, true]);
        let p4 = prove(&all, 4).unwrap();
        assert_eq!(p4.helpers, vec![false]);
        assert_eq!(p4.proof_set[1], root(&all[..4]));
    }

    #[test]
    fn test_tampered_proof_fails() {
        let all = leaves(6);
        let r = root(&all);
        let mut proof = prove(&all, 2).unwrap();
        proof.helpers[0] = !proof.helpers[0];
        assert!(!verify(&r, &proof));
        proof.helpers.pop();
        assert!(root_from_proof(&proof).is_none());
    }
}
