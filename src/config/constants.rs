//! # Engine Configuration Constants
//!
//! This module centralizes all numeric configuration values, grouping
//! interdependent constants together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs, and critical relationships are enforced with compile-time
//! assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! SEG_BUCKETS (56) + STASH_BUCKETS (4)
//!       │
//!       ├─> TOTAL_BUCKETS (60, derived)
//!       │
//!       └─> BUCKET_SLOTS (14)
//!             Segment capacity = TOTAL_BUCKETS * BUCKET_SLOTS slots.
//!             The geometry is chosen so a segment of key/value slots lands
//!             close to the allocator's good-size class; growing a bucket
//!             past 16 slots would overflow the u8 slot ids packed into
//!             traversal cursors.
//!
//! TASK_QUEUE_LEN (64)
//!       │
//!       └─> Bounded per-shard FIFO. Internal wake-ups bypass the bound so
//!           the blocking controller can never deadlock against a full
//!           queue it is draining.
//!
//! DEFAULT_HZ (1000)
//!       │
//!       ├─> One heartbeat tick per millisecond by default
//!       │
//!       └─> HEARTBEAT_STATS_PERIOD (8)
//!             Memory statistics and the TTL reap target are refreshed
//!             every 8th tick; reaping itself runs at that cadence.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `TOTAL_BUCKETS == SEG_BUCKETS + STASH_BUCKETS` (derived correctly)
//! 2. `BUCKET_SLOTS <= 16` (slot ids fit the cursor encoding)
//! 3. `KEY_INLINE_CAP < KEY_INTERN_MAX` (interning only applies to heap keys)
//! 4. `TTL_DELETE_FLOOR >= 1` (the reaper always makes progress)

// ============================================================================
// SEGMENT GEOMETRY
// These constants define the shape of every table segment and are tightly
// coupled - changing one changes the memory profile of every shard
// ============================================================================

/// Regular buckets per segment.
pub const SEG_BUCKETS: usize = 56;

/// Stash buckets per segment, used to absorb overflow from hot buckets.
pub const STASH_BUCKETS: usize = 4;

/// Total buckets per segment.
pub const TOTAL_BUCKETS: usize = SEG_BUCKETS + STASH_BUCKETS;

/// Slots per bucket.
pub const BUCKET_SLOTS: usize = 14;

/// Total slots per segment.
pub const SEGMENT_SLOTS: usize = TOTAL_BUCKETS * BUCKET_SLOTS;

/// Initial directory depth of the prime table (2^3 = 8 segments).
/// Expire and flag tables start at depth 0 since most keys never expire.
pub const PRIME_INIT_DEPTH: u8 = 3;

const _: () = assert!(
    TOTAL_BUCKETS == SEG_BUCKETS + STASH_BUCKETS,
    "TOTAL_BUCKETS derivation mismatch"
);

const _: () = assert!(
    BUCKET_SLOTS <= 16,
    "BUCKET_SLOTS must fit the u8 slot ids packed into cursors"
);

// ============================================================================
// SHARD RUNTIME
// ============================================================================

/// Capacity of the per-shard task queue.
pub const TASK_QUEUE_LEN: usize = 64;

/// Default heartbeat frequency in Hz.
pub const DEFAULT_HZ: u32 = 1000;

/// Cache statistics and TTL reaping run every N-th heartbeat tick.
pub const HEARTBEAT_STATS_PERIOD: u64 = 8;

// ============================================================================
// EXPIRY REAPING
// The reaper adapts its per-tick quota to the observed delete ratio
// ============================================================================

/// Upper bound of the adaptive per-tick reap target.
pub const TTL_DELETE_LIMIT: f64 = 200.0;

/// Lower bound of the per-tick reap target.
pub const TTL_DELETE_FLOOR: u32 = 5;

/// Window length of the moving (traversed, deleted) sums.
pub const TTL_WINDOW: usize = 6;

/// A database is reaped only while its expire table holds more than
/// `prime_size / EXPIRE_PRIME_RATIO` entries.
pub const EXPIRE_PRIME_RATIO: usize = 4;

const _: () = assert!(TTL_DELETE_FLOOR >= 1, "reaper must always make progress");

// ============================================================================
// MEMORY POLICY
// ============================================================================

/// Fraction of the per-shard max memory kept as an eviction redline:
/// when free memory drops below `max / RED_LIMIT_DIVISOR`, the heartbeat
/// triggers eviction to restore the margin (caching mode only).
pub const RED_LIMIT_DIVISOR: usize = 10;

/// Fraction of system RAM claimed when `maxmemory` is left at zero.
pub const AUTO_MEMORY_PERCENT: usize = 80;

/// Floor for the resolved process-wide budget.
pub const MIN_MEMORY_FLOOR: usize = 64 * 1024 * 1024;

// ============================================================================
// KEY AND VALUE ENCODING THRESHOLDS
// ============================================================================

/// Keys up to this length are stored inline inside the table slot.
pub const KEY_INLINE_CAP: usize = 22;

/// Heap keys up to this length go through the shard-local intern pool.
pub const KEY_INTERN_MAX: usize = 64;

/// Byte budget of the intern pool; interning stops when exceeded.
pub const KEY_INTERN_POOL_BYTES: usize = 1 << 20;

/// String payloads up to this length are stored inline in the value.
pub const STR_INLINE_CAP: usize = 16;

/// Collection values switch from the compact vector encoding to the
/// hashed/ordered encoding past this element count.
pub const COMPACT_ENC_MAX_ENTRIES: usize = 128;

/// Elements longer than this force the large encoding regardless of count.
pub const COMPACT_ENC_MAX_ITEM: usize = 64;

const _: () = assert!(
    KEY_INLINE_CAP < KEY_INTERN_MAX,
    "interning applies only to heap-allocated keys"
);

// ============================================================================
// TIERED STORAGE
// ============================================================================

/// Allocation granularity of the backing file.
pub const TIERED_BLOCK_SIZE: u64 = 4096;

/// Initial size of a freshly opened backing file.
pub const TIERED_INITIAL_CAPACITY: u64 = 256 * TIERED_BLOCK_SIZE;
