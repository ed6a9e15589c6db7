//! CLI implementation for zkctl
//!
//! Read-only queries over a ledger store. All commands output pretty JSON.

use crate::apply::AccountState;
use crate::codec::decode_pubdata;
use crate::config::load_config;
use crate::history::{witness_for, HistoryBuilder};
use crate::keys::meta;
use crate::ledger::{genesis_root, Ledger};
use crate::merkle::MerkleProof;
use crate::mimc::{bytes_to_fr_str, hex_to_decimal, normalize_fr_str};
use crate::queue::OperationQueue;
use crate::records::CommitProofRecord;
use crate::types::OpKind;
use crate::{RocksStateStore, StateStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Rollup ledger CLI tool
#[derive(Parser)]
#[command(name = "zkctl")]
#[command(about = "Query a zk-rollup ledger store")]
pub struct Cli {
    /// Path to the RocksDB database directory
    #[arg(short, long, default_value = "./zk_db")]
    db_path: PathBuf,

    /// Path to the rollup configuration (needed for genesis and history)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Current account root and queue pointers
    Status,
    /// Genesis root for the configured fee addresses
    GenesisRoot,
    /// Get an account by id
    Account {
        account_id: u64,
    },
    /// Get every account with a host-chain address (hex)
    AccountsByEth {
        address: String,
    },
    /// Get every account with a layer-2 address (hex)
    AccountsByChain33 {
        address: String,
    },
    /// Get one token balance
    Token {
        account_id: u64,
        token_id: u64,
    },
    /// Get a queued operation
    QueueOp {
        queue_id: u64,
    },
    /// Get an accepted proof by id
    Proof {
        proof_id: u64,
    },
    /// Get the accepted proof that ended at a root (decimal)
    ProofByRoot {
        root: String,
    },
    /// Get the latest proof committed at or before a host height
    LatestProof {
        height: u64,
    },
    /// Get the on-chain proof following an on-chain id
    NextOnChainProof {
        sub_id: u64,
    },
    /// Get a buffered proof waiting for its predecessor
    PendingProof {
        proof_id: u64,
    },
    /// Merkle witness for an account and token
    Witness {
        account_id: u64,
        token_id: u64,
        /// Historical root (decimal); the live root when omitted
        #[arg(short, long)]
        root: Option<String>,
        /// Take the root of this accepted proof instead
        #[arg(short, long, conflicts_with = "root")]
        proof_id: Option<u64>,
    },
    /// Manager-set default fee of an operation kind (numeric tag) in a token
    Fee {
        kind: u8,
        token_id: u64,
    },
    /// Decode pubdata chunks (decimal text) into operations
    Decode {
        pub_datas: Vec<String>,
    },
}

fn proof_json(record: &CommitProofRecord) -> Value {
    json!({
        "proof_id": record.proof_id,
        "block_start": record.block_start,
        "block_end": record.block_end,
        "index_start": record.index_start,
        "index_end": record.index_end,
        "op_index": record.op_index,
        "old_tree_root": record.old_tree_root,
        "new_tree_root": record.new_tree_root,
        "pub_datas": record.pub_datas.len(),
        "on_chain_pub_datas": record.on_chain_pub_datas.len(),
        "on_chain_proof_id": record.on_chain_proof_id,
        "commit_block_height": record.commit_block_height,
    })
}

fn merkle_json(proof: &MerkleProof) -> Value {
    json!({
        "index": proof.index,
        "num_leaves": proof.num_leaves,
        "proof_set": proof.proof_set.iter().map(|h| bytes_to_fr_str(h)).collect::<Vec<_>>(),
        "helpers": proof.helpers.iter().map(|b| u8::from(*b)).collect::<Vec<_>>(),
    })
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = RocksStateStore::open(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;
    let config = match &cli.config {
        Some(path) => Some(load_config(path)?),
        None => None,
    };
    let need_config = || {
        config
            .as_ref()
            .context("This command needs --config for the fee addresses")
    };
    let ledger = Ledger::new(&store);

    let result = match cli.command {
        Commands::Status => {
            let queue = OperationQueue::new(&store);
            json!({
                "root": ledger.root()?,
                "accounts": ledger.account_count()?,
                "last_queue_id": queue.last_id()?,
                "verified_queue_id": queue.verified_id()?,
                "last_proof_id": store.get_counter(meta::LAST_PROOF_ID)?,
                "last_on_chain_proof_id": store.get_counter(meta::LAST_ON_CHAIN_PROOF_ID)?,
                "last_priority_id": store.get_counter(meta::LAST_PRIORITY_ID)?,
            })
        }
        Commands::GenesisRoot => {
            let config = need_config()?;
            json!({ "genesis_root": genesis_root(&config.eth_fee_addr, &config.chain33_fee_addr)? })
        }
        Commands::Account { account_id } => match ledger.get_leaf(account_id)? {
            Some(leaf) => json!({
                "account": leaf,
                "tokens": ledger.tokens_of(&leaf)?,
            }),
            None => json!({ "account_id": account_id, "account": null }),
        },
        Commands::AccountsByEth { address } => {
            let address = hex_to_decimal(&address)?;
            json!({ "eth_address": address, "accounts": ledger.accounts_by_eth(&address)? })
        }
        Commands::AccountsByChain33 { address } => {
            let address = hex_to_decimal(&address)?;
            json!({ "chain33_address": address, "accounts": ledger.accounts_by_chain33(&address)? })
        }
        Commands::Token { account_id, token_id } => json!({
            "account_id": account_id,
            "token_id": token_id,
            "balance": ledger.get_token(account_id, token_id)?.map(|t| t.balance),
        }),
        Commands::QueueOp { queue_id } => json!({
            "queue_id": queue_id,
            "operation": store.get_queue_op(queue_id)?,
        }),
        Commands::Proof { proof_id } => match store.get_proof(proof_id)? {
            Some(record) => json!({ "proof": proof_json(&record) }),
            None => json!({ "proof_id": proof_id, "proof": null }),
        },
        Commands::ProofByRoot { root } => match store.get_proof_id_by_root(&normalize_fr_str(&root)?)? {
            Some(proof_id) => json!({ "proof": store.get_proof(proof_id)?.as_ref().map(proof_json) }),
            None => json!({ "root": root, "proof": null }),
        },
        Commands::LatestProof { height } => match store.get_latest_proof_id_at_or_before(height)? {
            Some(proof_id) => json!({ "proof": store.get_proof(proof_id)?.as_ref().map(proof_json) }),
            None => json!({ "height": height, "proof": null }),
        },
        Commands::NextOnChainProof { sub_id } => {
            match store.get_proof_id_by_on_chain_id(sub_id + 1)? {
                Some(proof_id) => {
                    json!({ "proof": store.get_proof(proof_id)?.as_ref().map(proof_json) })
                }
                None => json!({ "sub_id": sub_id, "proof": null }),
            }
        }
        Commands::PendingProof { proof_id } => json!({
            "proof_id": proof_id,
            "proof": store.get_pending_proof(proof_id)?.as_ref().map(proof_json),
        }),
        Commands::Witness {
            account_id,
            token_id,
            root,
            proof_id,
        } => {
            let config = need_config()?;
            let mut history = HistoryBuilder::new(&store, config);
            let snapshot = match proof_id {
                Some(proof_id) => history.snapshot_at_proof(proof_id)?,
                None => history.snapshot_at(root.as_deref())?,
            };
            let witness = witness_for(snapshot, account_id, token_id)?;
            json!({
                "root": witness.root,
                "account": witness.account,
                "account_proof": merkle_json(&witness.account_proof),
                "token": witness.token,
                "token_proof": merkle_json(&witness.token_proof),
                "tokens": witness.tokens,
            })
        }
        Commands::Fee { kind, token_id } => {
            let op_kind = OpKind::from_tag(kind)
                .with_context(|| format!("Unknown operation kind {}", kind))?;
            json!({
                "kind": format!("{:?}", op_kind),
                "token_id": token_id,
                "fee": store.get_fee(kind, token_id)?.unwrap_or_else(|| "0".to_string()),
            })
        }
        Commands::Decode { pub_datas } => json!({ "operations": decode_pubdata(&pub_datas)? }),
    };

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
