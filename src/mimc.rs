//! MiMC hash over the BN254 scalar field
//!
//! This is the algebraic hash used for every leaf, token, Merkle node and
//! pubdata commitment. Each block is fed forward through a
//! 91-round x^5 MiMC permutation whose round constants are derived from
//! the seed `"seed"` by iterated SHA3-256.
//!
//! Values that take part in hashing travel as decimal text (addresses,
//! balances, roots). They are turned into 32-byte big-endian field
//! elements before being written to the hasher.

use crate::error::{ZkError, ZkResult};
use ark_bn254::Fr;
use ark_ff::{BigInteger, Field, PrimeField};
use num_bigint::BigUint;
use sha3::{Digest, Sha3_256};
use std::sync::OnceLock;

/// Seed from which the round constants are derived.
pub const MIMC_SEED: &str = "seed";

/// Number of MiMC rounds.
pub const MIMC_ROUNDS: usize = 91;

/// Size of one absorbed block (one field element).
pub const BLOCK_SIZE: usize = 32;

fn round_constants() -> &'static [Fr] {
    static CONSTANTS: OnceLock<Vec<Fr>> = OnceLock::new();
    CONSTANTS.get_or_init(|| {
        let mut constants = Vec::with_capacity(MIMC_ROUNDS);
        let mut rnd: [u8; 32] = Sha3_256::digest(MIMC_SEED.as_bytes()).into();
        for _ in 0..MIMC_ROUNDS {
            // Constants chain on the unreduced integer, minimal big-endian form.
            let first = rnd.iter().position(|b| *b != 0).unwrap_or(rnd.len());
            rnd = Sha3_256::digest(&rnd[first..]).into();
            constants.push(Fr::from_be_bytes_mod_order(&rnd));
        }
        constants
    })
}

/// Streaming MiMC hasher.
///
/// Bytes are buffered by `write` and absorbed in `sum`, so the same
/// sequence of writes always yields the same digest regardless of how the
/// input was split.
#[derive(Debug, Default, Clone)]
pub struct Mimc {
    data: Vec<u8>,
}

impl Mimc {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Digest of everything written so far, as a 32-byte big-endian element.
    pub fn sum(&self) -> [u8; 32] {
        let mut data = self.data.clone();
        let rem = data.len() % BLOCK_SIZE;
        if rem != 0 {
            // A short tail is left-padded: .. || 0xaf8 -> .. || 0x00..0af8
            let tail = data.split_off(data.len() - rem);
            data.resize(data.len() + BLOCK_SIZE - rem, 0);
            data.extend_from_slice(&tail);
        }
        if data.is_empty() {
            data = vec![0u8; BLOCK_SIZE];
        }

        let mut h = Fr::from(0u64);
        for block in data.chunks(BLOCK_SIZE) {
            let x = Fr::from_be_bytes_mod_order(block);
            h = encrypt(x, h) + x;
        }
        fr_to_bytes(&h)
    }
}

/// MiMC permutation keyed by `key`, including the final key addition.
fn encrypt(message: Fr, key: Fr) -> Fr {
    let mut m = message;
    for c in round_constants() {
        let tmp = m + key + c;
        m = tmp.square().square() * tmp;
    }
    m + key
}

/// Hash the concatenation of `parts`.
pub fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Mimc::new();
    for part in parts {
        h.write(part);
    }
    h.sum()
}

pub fn fr_to_bytes(f: &Fr) -> [u8; 32] {
    let raw = f.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - raw.len()..].copy_from_slice(&raw);
    out
}

/// Field element bytes for a small integer (account id, token id, block).
pub fn u64_to_fr_bytes(value: u64) -> [u8; 32] {
    fr_to_bytes(&Fr::from(value))
}

/// Parse a non-negative decimal string.
pub fn parse_decimal(s: &str) -> ZkResult<BigUint> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ZkError::malformed(format!("invalid decimal value: {:?}", s)));
    }
    BigUint::parse_bytes(s.as_bytes(), 10)
        .ok_or_else(|| ZkError::malformed(format!("invalid decimal value: {:?}", s)))
}

/// Decimal text to a 32-byte field element, reduced mod r.
pub fn str_to_fr_bytes(s: &str) -> ZkResult<[u8; 32]> {
    let value = parse_decimal(s)?;
    let f = Fr::from_be_bytes_mod_order(&value.to_bytes_be());
    Ok(fr_to_bytes(&f))
}

/// Big-endian bytes to decimal text of the field element they encode.
pub fn bytes_to_fr_str(bytes: &[u8]) -> String {
    let f = Fr::from_be_bytes_mod_order(bytes);
    BigUint::from_bytes_be(&fr_to_bytes(&f)).to_string()
}

/// Canonical decimal form of a field element given as decimal text.
pub fn normalize_fr_str(s: &str) -> ZkResult<String> {
    Ok(bytes_to_fr_str(&str_to_fr_bytes(s)?))
}

/// Hex address (with or without `0x`) to decimal text.
pub fn hex_to_decimal(s: &str) -> ZkResult<String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Err(ZkError::malformed("empty hex address"));
    }
    BigUint::parse_bytes(s.as_bytes(), 16)
        .map(|v| v.to_string())
        .ok_or_else(|| ZkError::malformed(format!("invalid hex address: {}", s)))
}
