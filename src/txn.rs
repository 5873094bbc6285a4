//! # Transaction State Machine
//!
//! Transactions are not coroutines: they are state machines driven by the
//! shard's `poll_execution`. The coordinator assigns each transaction a
//! monotonically increasing id, hops every shard holding any of its keys,
//! and *arms* a per-shard callback. The shard runtime runs armed
//! transactions according to the queue rules and the per-shard state mask:
//!
//! | bit | meaning |
//! |-----|---------|
//! | `ARMED` | a callback is armed on this shard and may run |
//! | `OUT_OF_ORDER` | the coordinator vouches the keys are lock-compatible with everything queued ahead |
//! | `SUSPENDED_Q` | parked in the blocking controller |
//! | `AWAKED_Q` | resumed by a writer or deadline; runs before the queue |
//! | `EXPIRED_Q` | the blocking deadline fired; the run observes a timeout |
//!
//! `run_in_shard` returns [`RunOutcome`]: `Keep` marks a multi-hop
//! transaction the shard must retain as its continuation; `Done` clears
//! the transient mask bits. A transaction runs at most once per arming.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::shard::EngineShard;
use crate::types::{ShardId, TxId};

pub const ARMED: u16 = 1 << 0;
pub const OUT_OF_ORDER: u16 = 1 << 1;
pub const SUSPENDED_Q: u16 = 1 << 2;
pub const AWAKED_Q: u16 = 1 << 3;
pub const EXPIRED_Q: u16 = 1 << 4;

/// What a shard callback reports back to `poll_execution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// This hop is finished on this shard.
    Done,
    /// Multi-hop: retain as the shard's continuation transaction.
    Keep,
}

pub type RunCallback = Box<dyn FnMut(&mut EngineShard, &Transaction) -> RunOutcome + Send>;

/// A scheduled unit of work with per-shard execution state.
pub struct Transaction {
    txid: TxId,
    notify_txid: AtomicU64,
    masks: Vec<AtomicU16>,
    runs: AtomicU64,
    cb: Mutex<Option<RunCallback>>,
}

impl Transaction {
    pub fn new(txid: TxId, shard_count: usize, cb: RunCallback) -> Arc<Self> {
        Arc::new(Self {
            txid,
            notify_txid: AtomicU64::new(0),
            masks: (0..shard_count).map(|_| AtomicU16::new(0)).collect(),
            runs: AtomicU64::new(0),
            cb: Mutex::new(Some(cb)),
        })
    }

    #[inline]
    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn debug_id(&self) -> String {
        format!("tx:{}", self.txid)
    }

    #[inline]
    pub fn local_mask(&self, sid: ShardId) -> u16 {
        self.masks[sid as usize].load(Ordering::Acquire)
    }

    pub fn set_mask(&self, sid: ShardId, bits: u16) {
        self.masks[sid as usize].fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_mask(&self, sid: ShardId, bits: u16) {
        self.masks[sid as usize].fetch_and(!bits, Ordering::AcqRel);
    }

    /// Arms the callback on `sid`; the next poll may run it.
    pub fn arm(&self, sid: ShardId) {
        self.set_mask(sid, ARMED);
    }

    #[inline]
    pub fn is_armed_in_shard(&self, sid: ShardId) -> bool {
        self.local_mask(sid) & ARMED != 0
    }

    #[inline]
    pub fn notify_txid(&self) -> TxId {
        self.notify_txid.load(Ordering::Acquire)
    }

    /// Transitions a parked transaction to the awaked state. `notify` is
    /// the shard's committed txid at wake time; the poll asserts it still
    /// matches when the transaction runs.
    pub fn set_awaked(&self, sid: ShardId, notify: TxId) {
        self.notify_txid.store(notify, Ordering::Release);
        self.clear_mask(sid, SUSPENDED_Q);
        self.set_mask(sid, AWAKED_Q | ARMED);
    }

    /// Marks the blocking deadline as fired; the next run observes it.
    pub fn set_expired(&self, sid: ShardId) {
        self.set_mask(sid, EXPIRED_Q);
    }

    #[inline]
    pub fn is_expired(&self, sid: ShardId) -> bool {
        self.local_mask(sid) & EXPIRED_Q != 0
    }

    /// Number of completed `run_in_shard` invocations.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// Runs the armed callback on the shard's thread. Clears `ARMED` first
    /// so a transaction runs at most once per arming; `Done` also clears
    /// the transient queue bits.
    pub fn run_in_shard(&self, shard: &mut EngineShard) -> RunOutcome {
        let sid = shard.shard_id();
        self.clear_mask(sid, ARMED);

        let outcome = {
            let mut cb = self.cb.lock();
            match cb.as_mut() {
                Some(f) => f(shard, self),
                None => RunOutcome::Done,
            }
        };
        self.runs.fetch_add(1, Ordering::AcqRel);

        if outcome == RunOutcome::Done {
            self.clear_mask(sid, OUT_OF_ORDER | SUSPENDED_Q | AWAKED_Q | EXPIRED_Q);
        }
        outcome
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txid", &self.txid)
            .field("runs", &self.run_count())
            .finish()
    }
}
