//! # Shard Runtime
//!
//! One OS thread per shard; each shard owns a disjoint partition of the
//! keyspace and touches its state from exactly that thread. Cross-shard
//! work is posted as closures to the target shard's task queue and
//! awaited from the caller - there is no shared mutable state between
//! shards.
//!
//! ## Execution Poll
//!
//! `poll_execution` is the heart of transaction ordering. It is invoked
//! after every task dequeue and directly by a transaction arming itself on
//! this shard, and applies four rules in order:
//!
//! 1. An AWAKED caller (resumed from a blocking wait) runs immediately;
//!    `Keep` installs it as the continuation.
//! 2. An installed continuation transaction runs whenever it is armed.
//! 3. With no continuation and no pending awaked transaction, armed queue
//!    heads run in strict txid order. `committed_txid` advances *before*
//!    the run so peers querying it mid-run observe a value consistent
//!    with the run in progress.
//! 4. A caller flagged OUT_OF_ORDER or SUSPENDED that was not the head
//!    just processed runs eagerly - the coordinator vouches its keys are
//!    lock-compatible with everything queued ahead, and the run leaves
//!    `committed_txid` untouched.
//!
//! ## Heartbeat
//!
//! Every tick advances the shard clock. Every 8th tick refreshes cached
//! memory statistics, recomputes the per-shard budget and bytes-per-object
//! estimate, runs the adaptive TTL reaper over databases whose expire
//! table is large relative to their prime table, and triggers eviction
//! when free memory drops under the redline (caching mode only). Blocking
//! deadlines are checked on every tick for millisecond precision.

pub mod queue;
pub mod set;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use tracing::{debug, trace};

use crate::config::{
    EngineConfig, EXPIRE_PRIME_RATIO, HEARTBEAT_STATS_PERIOD, RED_LIMIT_DIVISOR, TASK_QUEUE_LEN,
    TTL_DELETE_FLOOR, TTL_DELETE_LIMIT,
};
use crate::blocking::BlockingController;
use crate::slice::stats::MovingSum;
use crate::slice::DbSlice;
use crate::tiered::TieredStorage;
use crate::txn::{self, RunOutcome, Transaction};
use crate::txq::TxQueue;
use crate::types::{DbIndex, ShardId, TxId};

use queue::{ShardTask, TaskQueue, TaskSender};

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Shard-level execution counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardStats {
    /// Transactions run through the out-of-order fast path.
    pub ooo_runs: u64,
    /// Heartbeat ticks processed.
    pub heartbeats: u64,
}

impl std::ops::AddAssign for ShardStats {
    fn add_assign(&mut self, o: Self) {
        self.ooo_runs += o.ooo_runs;
        self.heartbeats += o.heartbeats;
    }
}

/// One shard: slice, transaction queue and runtime state, owned by a
/// single thread.
pub struct EngineShard {
    shard_id: ShardId,
    config: Arc<EngineConfig>,
    db_slice: DbSlice,
    txq: TxQueue,
    continuation: Option<Arc<Transaction>>,
    blocking: Option<Box<BlockingController>>,
    self_sender: TaskSender,
    committed_txid: TxId,
    stats: ShardStats,
    task_iters: u64,
    ttl_traverse: MovingSum,
    ttl_delete: MovingSum,
}

impl EngineShard {
    fn new(shard_id: ShardId, config: Arc<EngineConfig>, self_sender: TaskSender) -> Result<Self> {
        let mut db_slice = DbSlice::new(shard_id, config.cache_mode, &config);

        if let Some(prefix) = &config.backing_prefix {
            let tiered = TieredStorage::open(prefix, shard_id)
                .wrap_err_with(|| format!("opening tiered storage for shard {shard_id}"))?;
            db_slice.set_tiered(tiered);
        }

        // The expire base anchors the 32-bit TTL deltas at process start;
        // absolute expiry times fit 4 bytes for the next ~49 days.
        let now = unix_now_ms();
        db_slice.update_expire_base(now, 0);
        db_slice.update_expire_clock(now);

        Ok(Self {
            shard_id,
            config,
            db_slice,
            txq: TxQueue::new(),
            continuation: None,
            blocking: None,
            self_sender,
            committed_txid: 0,
            stats: ShardStats::default(),
            task_iters: 0,
            ttl_traverse: MovingSum::new(),
            ttl_delete: MovingSum::new(),
        })
    }

    #[inline]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn db_slice(&self) -> &DbSlice {
        &self.db_slice
    }

    pub fn db_slice_mut(&mut self) -> &mut DbSlice {
        &mut self.db_slice
    }

    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    pub fn txq_mut(&mut self) -> &mut TxQueue {
        &mut self.txq
    }

    #[inline]
    pub fn committed_txid(&self) -> TxId {
        self.committed_txid
    }

    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    pub fn continuation(&self) -> Option<&Arc<Transaction>> {
        self.continuation.as_ref()
    }

    pub fn blocking_controller(&self) -> Option<&BlockingController> {
        self.blocking.as_deref()
    }

    /// Parks `trans` on blocking keys, lazily creating the controller.
    pub fn add_blocked(
        &mut self,
        db: DbIndex,
        keys: &[&[u8]],
        deadline_ms: Option<u64>,
        trans: &Arc<Transaction>,
    ) {
        let sid = self.shard_id;
        let controller = self
            .blocking
            .get_or_insert_with(|| Box::new(BlockingController::new(sid)));
        controller.add_watched(db, keys, deadline_ms, trans);
    }

    /// Writer-side notification that `key` became ready. The earliest
    /// parked transaction is awaked and re-armed through the task queue.
    pub fn awake_watched(&mut self, db: DbIndex, key: &[u8]) {
        let committed = self.committed_txid;
        let Some(controller) = self.blocking.as_mut() else {
            return;
        };
        if let Some(trans) = controller.notify_key_ready(db, key, committed) {
            self.self_sender
                .add_task_internal(move |shard| shard.poll_execution("awake", Some(&trans)));
        }
    }

    /// Runs eligible transaction work. See the module docs for the four
    /// rules; their order is load-bearing.
    pub fn poll_execution(&mut self, context: &str, trans: Option<&Arc<Transaction>>) {
        let sid = self.shard_id;
        trace!(context, queue = self.txq.len(), "poll execution");

        let mut trans: Option<Arc<Transaction>> = trans.cloned();
        let trans_mask = trans.as_ref().map_or(0, |t| t.local_mask(sid));

        if trans_mask & txn::AWAKED_Q != 0 {
            let t = trans.take().expect("mask implies a caller");
            debug_assert!(self.continuation.is_none());
            assert_eq!(
                self.committed_txid,
                t.notify_txid(),
                "awaked transaction ran against a different committed txid than its wake"
            );
            if t.run_in_shard(self) == RunOutcome::Keep {
                self.continuation = Some(t);
                return;
            }
        }

        if let Some(cont) = self.continuation.clone() {
            if let Some(t) = &trans {
                if Arc::ptr_eq(t, &cont) {
                    trans = None;
                }
            }
            if cont.is_armed_in_shard(sid) {
                let keep = cont.run_in_shard(self) == RunOutcome::Keep;
                trace!(txid = cont.txid(), keep, "ran continuation");
                if !keep {
                    self.continuation = None;
                }
            }
        }

        let has_awaked = self
            .blocking
            .as_mut()
            .is_some_and(|b| b.has_awaked_transaction());

        if self.continuation.is_none() && !has_awaked {
            while let Some(head) = self.txq.front() {
                if !head.is_armed_in_shard(sid) {
                    break;
                }
                // This poll must not process two different callbacks of
                // one transaction: the head run may unblock a multi-hop
                // that re-arms the caller.
                if let Some(t) = &trans {
                    if Arc::ptr_eq(t, &head) {
                        trans = None;
                    }
                }

                let txid = head.txid();
                assert!(
                    self.committed_txid < txid,
                    "committed txid must be strictly increasing across queue heads"
                );
                // Advance before the run: a peer querying this shard's
                // committed id mid-run must observe a value consistent
                // with the run in progress.
                self.committed_txid = txid;
                self.txq.pop_front();

                let keep = head.run_in_shard(self) == RunOutcome::Keep;
                trace!(txid, keep, "ran queue head");
                if keep {
                    self.continuation = Some(head);
                    break;
                }
            }
        }

        // Optimistic out-of-order path: the coordinator vouches the keys
        // are lock-compatible with everything queued ahead.
        if let Some(t) = trans {
            let mask = t.local_mask(sid);
            let should_run = mask & (txn::OUT_OF_ORDER | txn::SUSPENDED_Q) != 0;
            if should_run && mask & txn::ARMED != 0 {
                self.stats.ooo_runs += 1;
                let keep = t.run_in_shard(self) == RunOutcome::Keep;
                trace!(txid = t.txid(), keep, "eager out-of-order run");
            }
        }
    }

    /// One heartbeat tick.
    pub fn heartbeat(&mut self) {
        let now = unix_now_ms();
        self.db_slice.update_expire_clock(now);
        self.stats.heartbeats += 1;

        // Deadlines are checked every tick; reaping and budget refresh
        // only every stats period.
        let committed = self.committed_txid;
        if let Some(controller) = self.blocking.as_mut() {
            for trans in controller.notify_deadlines(now, committed) {
                self.self_sender
                    .add_task_internal(move |shard| shard.poll_execution("deadline", Some(&trans)));
            }
        }

        self.task_iters += 1;
        if self.task_iters % HEARTBEAT_STATS_PERIOD != 0 {
            return;
        }

        self.cache_stats();

        let traversed = self.ttl_traverse.sum();
        let deleted = self.ttl_delete.sum();
        let mut ttl_delete_target = TTL_DELETE_FLOOR;
        if deleted > 10 {
            // Map the delete/traversed ratio into [0, TTL_DELETE_LIMIT):
            // the denser the expired population, the harder we reap.
            ttl_delete_target =
                (TTL_DELETE_LIMIT * deleted as f64 / (traversed as f64 + 10.0)) as u32;
        }

        let redline = (self.config.max_memory_per_shard() / RED_LIMIT_DIVISOR) as i64;
        for db in 0..self.db_slice.db_array_size() as DbIndex {
            if !self.db_slice.is_db_valid(db) {
                continue;
            }
            let (prime_size, expire_size) = {
                let (pt, expt) = self.db_slice.get_tables(db).expect("validated above");
                (pt.size(), expt.size())
            };
            if expire_size > prime_size / EXPIRE_PRIME_RATIO {
                let stats = self.db_slice.delete_expired_step(db, ttl_delete_target);
                self.ttl_traverse.inc_by(stats.traversed);
                self.ttl_delete.inc_by(stats.deleted);
            }

            if self.db_slice.memory_budget() < redline {
                let goal = (redline - self.db_slice.memory_budget()) as usize;
                self.db_slice.free_mem_with_eviction_step(db, goal);
            }
        }
        self.ttl_traverse.advance();
        self.ttl_delete.advance();
    }

    /// Refreshes the cached memory statistics: per-shard free memory and
    /// the expected bytes-per-object estimate.
    fn cache_stats(&mut self) {
        let used = self.db_slice.used_memory();
        let max_per_shard = self.config.max_memory_per_shard();
        let free = max_per_shard as i64 - used as i64;

        let mut entries = 0usize;
        let mut table_mem = 0usize;
        for db in 0..self.db_slice.db_array_size() as DbIndex {
            if let Some((pt, expt)) = self.db_slice.get_tables(db) {
                entries += pt.size();
                table_mem += pt.mem_usage() + expt.mem_usage();
            }
        }
        let obj_memory = used.saturating_sub(table_mem);
        let bytes_per_object = if entries > 0 { obj_memory / entries } else { 0 };

        self.db_slice.set_cached_params(free, bytes_per_object);
    }
}

fn run_loop(mut shard: EngineShard, queue: Arc<TaskQueue>, tick: Duration) {
    let mut last_beat = Instant::now();
    loop {
        match queue.pop_timeout(tick) {
            Some(ShardTask::Run(f)) => {
                f(&mut shard);
                shard.poll_execution("task", None);
            }
            Some(ShardTask::Stop) => break,
            None => {}
        }
        if last_beat.elapsed() >= tick {
            shard.heartbeat();
            last_beat = Instant::now();
        }
    }
    debug!(shard = shard.shard_id, "shard loop stopped");
}

/// Owner-side handle of a spawned shard thread.
pub struct ShardHandle {
    shard_id: ShardId,
    sender: TaskSender,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ShardHandle {
    pub(crate) fn spawn(shard_id: ShardId, config: Arc<EngineConfig>) -> Result<Self> {
        let queue = Arc::new(TaskQueue::new(TASK_QUEUE_LEN));
        let sender = TaskSender::new(queue.clone());
        let shard = EngineShard::new(shard_id, config.clone(), sender.clone())?;
        let tick = config.tick();

        let thread = std::thread::Builder::new()
            .name(format!("shard-{shard_id}"))
            .spawn(move || run_loop(shard, queue, tick))
            .wrap_err("spawning shard thread")?;

        Ok(Self { shard_id, sender, thread: Some(thread) })
    }

    #[inline]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Enqueues a unit of work; FIFO ordering, wakes the shard.
    pub fn add_task(&self, f: impl FnOnce(&mut EngineShard) + Send + 'static) {
        self.sender.add_task(f);
    }

    /// Runs `f` on the shard thread and returns its result, suspending the
    /// caller until the shard gets to it.
    pub fn run<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.sender.add_task(move |shard| {
            let _ = tx.send(f(shard));
        });
        rx.recv().expect("shard thread terminated")
    }

    pub fn pending_tasks(&self) -> usize {
        self.sender.pending()
    }

    pub(crate) fn stop_and_join(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.sender.stop();
            let _ = thread.join();
        }
    }
}

impl Drop for ShardHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
