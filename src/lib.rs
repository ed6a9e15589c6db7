//! zkledger - state-commitment core of a zk-rollup
//!
//! This library keeps an authenticated account ledger (a MiMC Merkle tree of
//! accounts, each with its own token tree), encodes ledger operations into
//! fixed-width pubdata chunks, queues every operation in order and accepts
//! commit proofs that link successive ledger roots while matching their
//! pubdata against the queue. Past roots can be rebuilt by replay to serve
//! Merkle witnesses.

pub mod error;
pub mod mimc;
pub mod merkle;
pub mod types;
pub mod codec;

pub mod keys;
pub mod records;
pub mod store;

pub mod apply;
pub mod ledger;
pub mod queue;
pub mod proof_chain;
pub mod cache;
pub mod history;
pub mod executor;

pub mod config;
pub mod cli;

// Re-export the main types for convenience
pub use error::{ErrorKind, ZkError, ZkResult};
pub use executor::{Action, Executor, Receipt, SetFee};
pub use history::{witness_for, HistoryBuilder, Snapshot, Witness};
pub use ledger::Ledger;
pub use proof_chain::{CommitProof, ProofChain, SubmitOutcome, Verifier};
pub use queue::OperationQueue;
pub use records::{AccountLeaf, CommitProofRecord, ProofQueueRange, TokenBalance, VerifierSet};
pub use store::{RocksStateStore, StateStore};
pub use types::Operation;
