//! Configuration loading
//!
//! Reads the rollup configuration from a JSON file. Fee addresses are given
//! in hex and converted once, at load time, to the decimal text the ledger
//! hashes.
//!
//! # Example file format:
//! ```json
//! {
//!   "eth_fee_addr": "0x832367164346888E248bd58b9A5f480299F1e88d",
//!   "chain33_fee_addr": "0x2c4a5c378be2424fa7585320630eceba764833f1ec1ffb2fafc1af97f27baf5a",
//!   "super_managers": ["manager-address"],
//!   "sys_decimal": 8
//! }
//! ```

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use num_bigint::BigUint;
use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_sys_decimal() -> u32 {
    8
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    eth_fee_addr: String,
    chain33_fee_addr: String,
    super_managers: Vec<String>,
    #[serde(default = "default_sys_decimal")]
    sys_decimal: u32,
}

/// Validated rollup configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkConfig {
    /// Fee account host-chain address, decimal text.
    pub eth_fee_addr: String,
    /// Fee account layer-2 address, decimal text.
    pub chain33_fee_addr: String,
    /// Addresses allowed to run manager actions and submit proofs.
    pub super_managers: Vec<String>,
    /// Decimal precision of amounts on the host side.
    pub sys_decimal: u32,
}

impl ZkConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(text).context("Failed to parse config JSON")?;

        let eth = parse_eth_address(&file.eth_fee_addr).context("Invalid eth_fee_addr")?;
        let chain33 =
            parse_layer2_address(&file.chain33_fee_addr).context("Invalid chain33_fee_addr")?;

        if file.super_managers.is_empty() {
            anyhow::bail!("super_managers must list at least one address");
        }
        if file.super_managers.iter().any(|m| m.trim().is_empty()) {
            anyhow::bail!("super_managers contains an empty address");
        }

        Ok(Self {
            eth_fee_addr: BigUint::from_bytes_be(eth.as_slice()).to_string(),
            chain33_fee_addr: BigUint::from_bytes_be(chain33.as_slice()).to_string(),
            super_managers: file.super_managers,
            sys_decimal: file.sys_decimal,
        })
    }

    pub fn is_super_manager(&self, addr: &str) -> bool {
        self.super_managers
            .iter()
            .any(|m| m.eq_ignore_ascii_case(addr))
    }
}

/// Load the configuration from a file.
pub fn load_config(path: &Path) -> Result<ZkConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    ZkConfig::from_json(&contents).with_context(|| format!("Invalid config file: {:?}", path))
}

/// Pad an odd-length hex string with a leading zero.
fn pad_hex_string(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        anyhow::bail!("Empty hex address");
    }
    let s = pad_hex_string(s);
    hex::decode(&s).with_context(|| format!("Invalid hex address: {}", s))
}

/// Parse a 20-byte host-chain address.
fn parse_eth_address(s: &str) -> Result<Address> {
    let bytes = decode_hex(s)?;
    if bytes.len() != 20 {
        anyhow::bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }
    Ok(Address::from_slice(&bytes))
}

/// Parse a layer-2 address of at most 32 bytes, left-padded to 32.
fn parse_layer2_address(s: &str) -> Result<B256> {
    let bytes = decode_hex(s)?;
    if bytes.len() > 32 {
        anyhow::bail!("Layer-2 address must be at most 32 bytes, got {} bytes", bytes.len());
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(B256::from(padded))
}
