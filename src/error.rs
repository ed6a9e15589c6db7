//! Error taxonomy for ledger, codec and proof-chain operations
//!
//! Storage plumbing returns `anyhow::Result` like the rest of the store layer.
//! Domain operations return [`ZkError`], whose [`ErrorKind`] tells callers
//! which rejection category they hit.

use thiserror::Error;

/// Broad category of a [`ZkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller lacks the manager or verifier role.
    Authorization,
    /// Codec failure, field overflow, missing companion field.
    Malformed,
    /// Commitment mismatch or verifier rejection.
    Cryptographic,
    /// Proof id, root, block or on-chain id discontinuity.
    ChainLinkage,
    /// Pubdata operation differs from its queue entry.
    Reconciliation,
    /// Missing account/token/proof/root, or balance underflow.
    Resource,
    /// Underlying store failure.
    Storage,
}

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("commitment mismatch: {0}")]
    CommitmentMismatch(String),

    #[error("proof rejected by verifier: {0}")]
    ProofRejected(String),

    #[error("chain linkage: {0}")]
    ChainLinkage(String),

    #[error("queue reconciliation: {0}")]
    Reconciliation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient balance: account={account_id} token={token_id} balance={balance} delta={delta}")]
    InsufficientBalance {
        account_id: u64,
        token_id: u64,
        balance: String,
        delta: String,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ZkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ZkError::Unauthorized(_) => ErrorKind::Authorization,
            ZkError::Malformed(_) => ErrorKind::Malformed,
            ZkError::CommitmentMismatch(_) | ZkError::ProofRejected(_) => ErrorKind::Cryptographic,
            ZkError::ChainLinkage(_) => ErrorKind::ChainLinkage,
            ZkError::Reconciliation(_) => ErrorKind::Reconciliation,
            ZkError::NotFound(_) | ZkError::InsufficientBalance { .. } => ErrorKind::Resource,
            ZkError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Shorthand used by the codec and the decimal helpers.
    pub fn malformed(msg: impl Into<String>) -> Self {
        ZkError::Malformed(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ZkError::NotFound(msg.into())
    }
}

pub type ZkResult<T> = std::result::Result<T, ZkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ZkError::Unauthorized("x".into()).kind(), ErrorKind::Authorization);
        assert_eq!(ZkError::CommitmentMismatch("x".into()).kind(), ErrorKind::Cryptographic);
        assert_eq!(ZkError::ProofRejected("x".into()).kind(), ErrorKind::Cryptographic);
        assert_eq!(
            ZkError::InsufficientBalance {
                account_id: 4,
                token_id: 1,
                balance: "1".into(),
                delta: "2".into(),
            }
            .kind(),
            ErrorKind::Resource
        );
        let storage: ZkError = anyhow::anyhow!("disk gone").into();
        assert_eq!(storage.kind(), ErrorKind::Storage);
        assert_eq!(storage.to_string(), "disk gone");
    }
}
