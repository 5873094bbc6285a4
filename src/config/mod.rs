//! # Engine Configuration
//!
//! Runtime options recognized by the engine plus the centralized constants.
//!
//! | Option | Effect |
//! |--------|--------|
//! | `cache_mode` | evict on memory overrun instead of failing inserts |
//! | `hz` | heartbeat frequency; controls reaper and eviction cadence |
//! | `backing_prefix` | enables tiered storage; `None` disables |
//! | `maxmemory` | process-wide budget, split equally across shards; 0 auto-detects |
//! | `shard_count` | number of shard threads; 0 uses the available parallelism |
//!
//! Lowering `hz` below the default is not advised in production because it
//! reduces expiry precision for millisecond-granularity TTLs.

pub mod constants;

pub use constants::*;

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use sysinfo::System;

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

/// Runtime configuration of an engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Behave like a cache: evict entries when close to the memory limit
    /// instead of failing inserts with `OutOfMemory`.
    pub cache_mode: bool,
    /// Heartbeat frequency in Hz.
    pub hz: u32,
    /// Path prefix for per-shard tiered-storage backing files.
    pub backing_prefix: Option<PathBuf>,
    /// Process-wide memory budget in bytes; 0 auto-detects from system RAM.
    pub maxmemory: usize,
    /// Number of shard threads; 0 uses the available parallelism.
    pub shard_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_mode: false,
            hz: DEFAULT_HZ,
            backing_prefix: None,
            maxmemory: 0,
            shard_count: 0,
        }
    }
}

impl EngineConfig {
    /// Resolved process-wide budget: configured value, or a fixed fraction
    /// of system RAM when left at zero, never below the floor.
    pub fn resolved_max_memory(&self) -> usize {
        if self.maxmemory > 0 {
            return self.maxmemory.max(MIN_MEMORY_FLOOR);
        }

        let total = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });

        ((total * AUTO_MEMORY_PERCENT) / 100).max(MIN_MEMORY_FLOOR)
    }

    /// Number of shards this configuration resolves to.
    pub fn resolved_shard_count(&self) -> usize {
        if self.shard_count > 0 {
            return self.shard_count;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// Per-shard slice of the process budget.
    pub fn max_memory_per_shard(&self) -> usize {
        self.resolved_max_memory() / self.resolved_shard_count().max(1)
    }

    /// Heartbeat period derived from `hz`, never below one millisecond.
    pub fn tick(&self) -> Duration {
        let cycle_ms = 1000 / self.hz.max(1);
        Duration::from_millis(cycle_ms.max(1) as u64)
    }
}
