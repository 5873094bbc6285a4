//! Per-shard transaction queue ordered by transaction id.
//!
//! The head is always the lowest id; `poll_execution` drains armed heads
//! in order and advances the shard's committed txid before each run. Any
//! transaction can be removed out of band (the coordinator does so after
//! an out-of-order run completes).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::txn::Transaction;
use crate::types::TxId;

#[derive(Default)]
pub struct TxQueue {
    queue: BTreeMap<TxId, Arc<Transaction>>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, trans: Arc<Transaction>) {
        let prev = self.queue.insert(trans.txid(), trans);
        assert!(prev.is_none(), "transaction id scheduled twice on one shard");
    }

    pub fn remove(&mut self, txid: TxId) -> Option<Arc<Transaction>> {
        self.queue.remove(&txid)
    }

    /// Lowest-id transaction without removing it.
    pub fn front(&self) -> Option<Arc<Transaction>> {
        self.queue.values().next().cloned()
    }

    pub fn pop_front(&mut self) -> Option<Arc<Transaction>> {
        let txid = *self.queue.keys().next()?;
        self.queue.remove(&txid)
    }

    /// Id of the head, if any.
    pub fn head_score(&self) -> Option<TxId> {
        self.queue.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
