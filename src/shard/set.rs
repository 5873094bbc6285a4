//! Fixed set of shards, one thread each, with stable key routing.
//!
//! The set spawns every shard up front and routes keys by a stable hash,
//! so a key's owning shard never changes for the lifetime of the set.
//! Dropping the set stops and joins every shard thread.

use std::sync::Arc;

use eyre::Result;
use tracing::debug;

use crate::config::EngineConfig;
use crate::slice::stats::SliceStats;
use crate::table::hash_key;
use crate::types::ShardId;

use super::{EngineShard, ShardHandle, ShardStats};

pub struct ShardSet {
    handles: Vec<ShardHandle>,
    config: Arc<EngineConfig>,
}

impl ShardSet {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let count = config.resolved_shard_count();
        let config = Arc::new(config);
        let mut handles = Vec::with_capacity(count);
        for sid in 0..count as ShardId {
            handles.push(ShardHandle::spawn(sid, config.clone())?);
        }
        debug!(shards = count, "shard set started");
        Ok(Self { handles, config })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Owning shard of `key` under the stable routing hash.
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        (hash_key(key) % self.handles.len() as u64) as ShardId
    }

    pub fn handle(&self, sid: ShardId) -> &ShardHandle {
        &self.handles[sid as usize]
    }

    /// Runs `f` on one shard and returns its result.
    pub fn run_on<R, F>(&self, sid: ShardId, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        self.handles[sid as usize].run(f)
    }

    /// Runs `f` on every shard, one after another.
    pub fn run_on_all<F>(&self, f: F)
    where
        F: Fn(&mut EngineShard) + Clone + Send + 'static,
    {
        for handle in &self.handles {
            let f = f.clone();
            handle.run(move |shard| f(shard));
        }
    }

    /// Slice statistics of every shard, gathered on the shard threads.
    pub fn slice_stats(&self) -> Vec<SliceStats> {
        self.handles
            .iter()
            .map(|h| h.run(|shard| shard.db_slice().stats()))
            .collect()
    }

    /// Aggregated shard-level counters.
    pub fn shard_stats(&self) -> ShardStats {
        let mut total = ShardStats::default();
        for handle in &self.handles {
            total += handle.run(|shard| shard.stats());
        }
        total
    }

    /// Stops every shard thread and joins them.
    pub fn shutdown(mut self) {
        for handle in &mut self.handles {
            handle.stop_and_join();
        }
    }
}
