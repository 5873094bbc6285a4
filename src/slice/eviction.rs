//! # Insertion-Time Eviction and GC Policy
//!
//! The prime table presents its hotspot buckets to this policy whenever an
//! insert runs out of room. Two passes run in order:
//!
//! 1. **GC pass** (always): scan the regular hotspot buckets and erase
//!    entries whose TTL has passed, consulting the shared shard clock.
//!    Regular buckets are scanned rather than stash buckets: stash buckets
//!    fill last, so the chance they hold expired items is much smaller.
//! 2. **Stash eviction** (caching mode only): pick one stash bucket by
//!    `key_hash % stash_count` and evict its last slot - stash slots fill
//!    front to back, so the last slot holds the oldest stashed item. The
//!    bucket is then shifted right to open the front slot.
//!
//! Growth is gated on the memory budget. Below the soft limit the
//! projection is deliberately conservative: it assumes the table will fill
//! to capacity at the current bytes-per-object estimate, even if it is
//! currently sparser.

use crate::config::{BUCKET_SLOTS, STASH_BUCKETS};
use crate::object::{KeyObj, ValueObj};
use crate::table::{BumpPolicy, EvictionPolicy, HotspotBuckets};
use crate::types::ObjType;

use super::stats::{DbTableStats, SliceEvents};
use super::{invalidate_watchers, ExpireTable, McFlagTable, PrimeTable, WatchMap};

/// Snapshot of one entry's stat contributions, captured before erasure so
/// the counters can be updated without aliasing the tables.
pub(crate) struct EntryMeta {
    pub inline: bool,
    pub key_mem: usize,
    pub val_mem: usize,
    pub is_str: bool,
    pub has_flag: bool,
    pub has_expire: bool,
    pub compact: Option<usize>,
    pub external: Option<usize>,
}

pub(crate) fn entry_meta(key: &KeyObj, value: &ValueObj) -> EntryMeta {
    EntryMeta {
        inline: key.is_inline(),
        key_mem: key.mem_usage(),
        val_mem: value.malloc_used(),
        is_str: value.obj_type() == ObjType::String,
        has_flag: value.has_mc_flag(),
        has_expire: key.has_expire(),
        compact: value.compact_footprint(),
        external: value.external_size(),
    }
}

pub(crate) fn deduct_stats_on_delete(stats: &mut DbTableStats, meta: &EntryMeta) {
    stats.inline_keys -= meta.inline as u64;
    stats.obj_memory_usage -= (meta.key_mem + meta.val_mem) as u64;
    if meta.is_str {
        stats.strval_memory_usage -= meta.val_mem as u64;
    }
    if let Some(bytes) = meta.compact {
        stats.compact_blob_cnt -= 1;
        stats.compact_bytes -= bytes as u64;
    }
    if let Some(bytes) = meta.external {
        stats.external_entries -= 1;
        stats.external_size -= bytes as u64;
    }
}

/// Removes one entry from the prime table and its side tables, updating
/// stats. Returns the heap bytes freed.
pub(crate) fn evict_entry(
    prime: &mut PrimeTable,
    expire: &mut ExpireTable,
    mcflag: &mut McFlagTable,
    stats: &mut DbTableStats,
    it: crate::table::SegIter,
) -> usize {
    let Some((key, value)) = prime.entry(it) else {
        return 0;
    };
    let meta = entry_meta(key, value);
    let key_bytes = key.clone_bytes();

    if meta.has_expire {
        let erased = expire.erase_key(key_bytes.as_bytes());
        assert_eq!(erased, 1, "expire entry missing for key flagged has_expire");
    }
    if meta.has_flag {
        mcflag.erase_key(key_bytes.as_bytes());
    }
    deduct_stats_on_delete(stats, &meta);
    prime.erase(it);
    meta.key_mem + meta.val_mem
}

/// Erases the entry at `it` if its TTL has passed; keeps the prime and
/// expire tables consistent either way and marks watchers of the key
/// dirty. Returns whether it expired.
#[allow(clippy::too_many_arguments)]
pub(crate) fn expire_if_needed_parts(
    prime: &mut PrimeTable,
    expire: &mut ExpireTable,
    mcflag: &mut McFlagTable,
    stats: &mut DbTableStats,
    events: &mut SliceEvents,
    watched: &mut WatchMap,
    expire_base: u64,
    now_ms: u64,
    it: crate::table::SegIter,
) -> bool {
    let Some(key) = prime.key(it) else {
        return false;
    };
    if !key.has_expire() {
        return false;
    }
    let key_bytes = key.clone_bytes();
    let exp_it = expire
        .find(key_bytes.as_bytes())
        .expect("expire entry missing for key flagged has_expire");
    let delta = expire
        .value(exp_it)
        .map(|p| p.duration_ms())
        .unwrap_or_default();

    if now_ms < expire_base + delta {
        return false;
    }

    evict_entry(prime, expire, mcflag, stats, it);
    invalidate_watchers(watched, key_bytes.as_bytes());
    events.expired_keys += 1;
    true
}

/// Eviction policy run by every prime-table insert.
pub struct PrimeEvictionPolicy<'a> {
    pub(crate) expire: &'a mut ExpireTable,
    pub(crate) mcflag: &'a mut McFlagTable,
    pub(crate) stats: &'a mut DbTableStats,
    pub(crate) events: &'a mut SliceEvents,
    pub(crate) watched: &'a mut WatchMap,
    expire_base: u64,
    now_ms: u64,
    bytes_per_object: usize,
    mem_budget: i64,
    soft_limit: i64,
    can_evict: bool,
    checked: u32,
    evicted: u32,
}

impl<'a> PrimeEvictionPolicy<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        expire: &'a mut ExpireTable,
        mcflag: &'a mut McFlagTable,
        stats: &'a mut DbTableStats,
        events: &'a mut SliceEvents,
        watched: &'a mut WatchMap,
        expire_base: u64,
        now_ms: u64,
        bytes_per_object: usize,
        mem_budget: i64,
        soft_limit: i64,
        can_evict: bool,
    ) -> Self {
        Self {
            expire,
            mcflag,
            stats,
            events,
            watched,
            expire_base,
            now_ms,
            bytes_per_object,
            mem_budget,
            soft_limit,
            can_evict,
            checked: 0,
            evicted: 0,
        }
    }

    pub fn mem_budget(&self) -> i64 {
        self.mem_budget
    }

    pub fn evicted(&self) -> u32 {
        self.evicted
    }

    pub fn checked(&self) -> u32 {
        self.checked
    }
}

impl EvictionPolicy<KeyObj, ValueObj> for PrimeEvictionPolicy<'_> {
    fn can_grow(&self, tbl: &PrimeTable) -> bool {
        if self.mem_budget > self.soft_limit {
            return true;
        }
        debug_assert!(tbl.size() <= tbl.capacity());

        // Conservative stance: price the split as if the table fills to
        // capacity at the current bytes-per-object, even if it is sparser.
        let available = tbl.capacity() - tbl.size();
        self.mem_budget > (PrimeTable::seg_bytes() + self.bytes_per_object * available) as i64
    }

    fn record_split(&mut self) {
        self.mem_budget -= PrimeTable::seg_bytes() as i64;
        tracing::debug!(budget = self.mem_budget, "prime table segment split");
    }

    fn garbage_collect(&mut self, hb: &HotspotBuckets, tbl: &mut PrimeTable) -> usize {
        let mut reclaimed = 0;
        for &bucket in &hb.regular {
            for it in tbl.bucket_positions(hb.seg, bucket) {
                let flagged = tbl.key(it).is_some_and(|k| k.has_expire());
                if !flagged {
                    continue;
                }
                self.checked += 1;
                self.events.garbage_checked += 1;
                let expired = expire_if_needed_parts(
                    tbl,
                    self.expire,
                    self.mcflag,
                    self.stats,
                    self.events,
                    self.watched,
                    self.expire_base,
                    self.now_ms,
                    it,
                );
                if expired {
                    reclaimed += 1;
                    self.events.garbage_collected += 1;
                }
            }
        }
        reclaimed
    }

    fn evict(&mut self, hb: &HotspotBuckets, tbl: &mut PrimeTable) -> usize {
        if !self.can_evict {
            return 0;
        }

        let stash = hb.stash[(hb.key_hash % STASH_BUCKETS as u64) as usize];
        let Some(it) = tbl.position_at(hb.seg, stash, (BUCKET_SLOTS - 1) as u8) else {
            return 0;
        };
        if tbl.key(it).is_some_and(|k| k.sticky()) {
            return 0;
        }

        evict_entry(tbl, self.expire, self.mcflag, self.stats, it);
        tbl.shift_right(hb.seg, stash);
        self.evicted += 1;
        self.events.evicted_keys += 1;
        1
    }
}

/// Bump policy: a sticky key can never be made less important.
pub struct PrimeBumpPolicy;

impl BumpPolicy<KeyObj> for PrimeBumpPolicy {
    fn can_bump_down(&self, key: &KeyObj) -> bool {
        !key.sticky()
    }
}
