//! Append-only operation queue
//!
//! Every ledger-affecting operation is appended here under a sequential
//! queue id, starting at 1. A single watermark records the last id covered
//! by an accepted proof and only ever moves forward.

use crate::error::{ZkError, ZkResult};
use crate::keys::meta;
use crate::store::StateStore;
use crate::types::Operation;
use tracing::debug;

pub struct OperationQueue<'a> {
    store: &'a dyn StateStore,
}

impl<'a> OperationQueue<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    /// Append an operation and return its queue id.
    pub fn append(&self, op: &Operation) -> ZkResult<u64> {
        if matches!(op, Operation::Noop) {
            return Err(ZkError::malformed("noop operations are never queued"));
        }
        let queue_id = self.last_id()? + 1;
        self.store.put_queue_op(queue_id, op)?;
        self.store.set_counter(meta::LAST_QUEUE_ID, queue_id)?;
        debug!("Queued {:?} as {}", op.kind(), queue_id);
        Ok(queue_id)
    }

    pub fn get(&self, queue_id: u64) -> ZkResult<Operation> {
        self.store
            .get_queue_op(queue_id)?
            .ok_or_else(|| ZkError::not_found(format!("queue entry {}", queue_id)))
    }

    /// Id of the most recent entry, 0 when empty.
    pub fn last_id(&self) -> ZkResult<u64> {
        Ok(self.store.get_counter(meta::LAST_QUEUE_ID)?)
    }

    /// Last id covered by an accepted proof, 0 before the first proof.
    pub fn verified_id(&self) -> ZkResult<u64> {
        Ok(self.store.get_counter(meta::VERIFIED_QUEUE_ID)?)
    }

    /// First id a new proof must start reconciling from.
    pub fn first_unverified_id(&self) -> ZkResult<u64> {
        Ok(self.verified_id()? + 1)
    }

    /// Move the watermark to `to`.
    pub fn advance(&self, to: u64) -> ZkResult<()> {
        let current = self.verified_id()?;
        if to < current {
            return Err(ZkError::ChainLinkage(format!(
                "queue watermark cannot move back from {} to {}",
                current, to
            )));
        }
        let last = self.last_id()?;
        if to > last {
            return Err(ZkError::not_found(format!(
                "queue watermark {} beyond last entry {}",
                to, last
            )));
        }
        self.store.set_counter(meta::VERIFIED_QUEUE_ID, to)?;
        Ok(())
    }
}
