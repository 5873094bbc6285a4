//! # Segmented Open-Addressed Tables
//!
//! `SegTable` is the machinery behind the prime, expire and flag tables: an
//! extendible-hashing directory over fixed-geometry segments
//! ([`segment`]), with bucket-level hooks that let an eviction policy
//! reclaim space while an insert is in flight.
//!
//! ## Layout
//!
//! ```text
//! SegTable
//! ├── dir: Vec<segment id>          (2^global_depth entries, top hash bits)
//! └── segments: Vec<Segment>        (stable ids, splits append)
//!       └── 56 regular + 4 stash buckets x 14 slots
//! ```
//!
//! The directory consumes the top `global_depth` bits of the 64-bit xxh3
//! key hash; bucket selection inside a segment uses the low bits. Segments
//! split on overflow: the directory doubles when the splitting segment is
//! at the global depth, entries are redistributed by their next hash bit,
//! and bucket/slot positions are preserved so per-bucket occupancy never
//! grows during a split.
//!
//! ## Insert and the eviction policy
//!
//! An insert that finds no free slot along its probe sequence presents the
//! probed buckets ([`HotspotBuckets`]) to the [`EvictionPolicy`] and
//! retries after each hook that made progress:
//!
//! 1. `garbage_collect` - erase expired entries from the regular hotspot
//!    buckets (always runs)
//! 2. `evict` - drop one cold entry from a stash bucket (caching mode)
//! 3. split, gated by `can_grow` - the policy consults the memory budget
//! 4. fail with `OutOfMemory`
//!
//! ## Position stability
//!
//! [`SegIter`] is a plain position (segment, bucket, slot) stamped with the
//! table epoch. Erase does not move other entries, so positions survive
//! it; splits, clears and directory growth bump the epoch and invalidate
//! every outstanding position. Callers re-find after structural changes;
//! the slice surfaces stale positions as `WrongKeyEpoch`.
//!
//! Traversal returns an opaque resumable cursor visiting one bucket per
//! call. Traversal is not atomic with respect to mutation on the same
//! shard; the tables are never touched off-shard.

pub mod segment;

use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{
    BUCKET_SLOTS, SEGMENT_SLOTS, SEG_BUCKETS, STASH_BUCKETS, TOTAL_BUCKETS,
};
use crate::types::{OpResult, OpStatus};
use segment::{Bucket, Segment, Slot};

/// Position of an entry, valid until the next structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegIter {
    pub seg: u32,
    pub bucket: u8,
    pub slot: u8,
    epoch: u64,
}

impl SegIter {
    #[inline]
    pub fn in_stash(&self) -> bool {
        (self.bucket as usize) >= SEG_BUCKETS
    }
}

/// The buckets an insertion is probing, handed to the eviction policy.
#[derive(Debug, Clone, Copy)]
pub struct HotspotBuckets {
    pub seg: u32,
    pub key_hash: u64,
    /// Regular buckets on the probe path: home and its right neighbor.
    pub regular: [u8; 2],
    /// All stash buckets of the segment.
    pub stash: [u8; STASH_BUCKETS],
}

/// Hook object consulted by `insert` when a segment runs out of room.
pub trait EvictionPolicy<K, V> {
    /// Whether the table may grow by one segment right now.
    fn can_grow(&self, _tbl: &SegTable<K, V>) -> bool {
        true
    }

    /// Called after every segment split admitted by `can_grow`.
    fn record_split(&mut self) {}

    /// Reclaims expired entries from the hotspot buckets; returns the
    /// number erased.
    fn garbage_collect(&mut self, _hb: &HotspotBuckets, _tbl: &mut SegTable<K, V>) -> usize {
        0
    }

    /// Evicts entries to make room; returns the number evicted.
    fn evict(&mut self, _hb: &HotspotBuckets, _tbl: &mut SegTable<K, V>) -> usize {
        0
    }
}

/// Policy for tables that grow freely and never evict (expire, flags).
pub struct NoopPolicy;

impl<K, V> EvictionPolicy<K, V> for NoopPolicy {}

/// Decides whether an entry may be pushed toward eviction to make room for
/// a bumped-up neighbor.
pub trait BumpPolicy<K> {
    fn can_bump_down(&self, key: &K) -> bool;
}

#[inline]
pub fn hash_key(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Segmented open-addressed hash table. Single-threaded by contract: it is
/// owned by exactly one shard and never touched off-shard.
#[derive(Debug)]
pub struct SegTable<K, V> {
    segments: Vec<Segment<K, V>>,
    dir: Vec<u32>,
    global_depth: u8,
    init_depth: u8,
    size: usize,
    epoch: u64,
    garbage_collected: u64,
    stash_unloaded: u64,
}

impl<K: AsRef<[u8]>, V> SegTable<K, V> {
    /// Creates a table with `2^init_depth` segments.
    pub fn new(init_depth: u8) -> Self {
        let count = 1usize << init_depth;
        Self {
            segments: (0..count).map(|_| Segment::new(init_depth)).collect(),
            dir: (0..count as u32).collect(),
            global_depth: init_depth,
            init_depth,
            size: 0,
            epoch: 0,
            garbage_collected: 0,
            stash_unloaded: 0,
        }
    }

    #[inline]
    fn seg_for(&self, hash: u64) -> u32 {
        if self.global_depth == 0 {
            return self.dir[0];
        }
        let idx = (hash >> (64 - self.global_depth as u32)) as usize;
        self.dir[idx]
    }

    #[inline]
    fn make_iter(&self, seg: u32, bucket: usize, slot: usize) -> SegIter {
        SegIter { seg, bucket: bucket as u8, slot: slot as u8, epoch: self.epoch }
    }

    /// Whether a position is still valid against the current epoch.
    #[inline]
    pub fn is_current(&self, it: SegIter) -> bool {
        it.epoch == self.epoch && (it.seg as usize) < self.segments.len()
    }

    fn slot(&self, it: SegIter) -> Option<&Slot<K, V>> {
        if !self.is_current(it) {
            return None;
        }
        self.segments[it.seg as usize].buckets[it.bucket as usize].slots[it.slot as usize].as_ref()
    }

    fn slot_mut(&mut self, it: SegIter) -> Option<&mut Slot<K, V>> {
        if !self.is_current(it) {
            return None;
        }
        self.segments[it.seg as usize].buckets[it.bucket as usize].slots[it.slot as usize].as_mut()
    }

    pub fn find(&self, key: &[u8]) -> Option<SegIter> {
        let h = hash_key(key);
        let seg_id = self.seg_for(h);
        let (b, s) = self.segments[seg_id as usize].find(h, key)?;
        Some(self.make_iter(seg_id, b, s))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    pub fn entry(&self, it: SegIter) -> Option<(&K, &V)> {
        self.slot(it).map(|s| (&s.key, &s.value))
    }

    pub fn key(&self, it: SegIter) -> Option<&K> {
        self.slot(it).map(|s| &s.key)
    }

    /// Mutable key access for flag updates. Callers must not change the key
    /// bytes; the slot position is derived from them.
    pub fn key_mut(&mut self, it: SegIter) -> Option<&mut K> {
        self.slot_mut(it).map(|s| &mut s.key)
    }

    pub fn value(&self, it: SegIter) -> Option<&V> {
        self.slot(it).map(|s| &s.value)
    }

    pub fn value_mut(&mut self, it: SegIter) -> Option<&mut V> {
        self.slot_mut(it).map(|s| &mut s.value)
    }

    pub fn version(&self, it: SegIter) -> Option<u64> {
        self.slot(it).map(|s| s.version)
    }

    pub fn set_version(&mut self, it: SegIter, version: u64) {
        if let Some(slot) = self.slot_mut(it) {
            slot.version = version;
        }
    }

    /// Inserts or finds. Returns the entry position and whether a new entry
    /// was created. `OutOfMemory` is returned only when the policy both
    /// fails to reclaim space and vetoes growth.
    pub fn insert<P: EvictionPolicy<K, V>>(
        &mut self,
        key: K,
        value: V,
        policy: &mut P,
    ) -> OpResult<(SegIter, bool)> {
        let h = hash_key(key.as_ref());

        if let Some(it) = self.find(key.as_ref()) {
            return Ok((it, false));
        }

        let mut key = Some(key);
        let mut value = Some(value);

        loop {
            let seg_id = self.seg_for(h);
            if let Some((b, s)) = self.segments[seg_id as usize].find_free(h) {
                let seg = &mut self.segments[seg_id as usize];
                seg.buckets[b].slots[s] = Some(Slot {
                    key: key.take().expect("insert retried after success"),
                    value: value.take().expect("insert retried after success"),
                    version: 0,
                });
                seg.live += 1;
                self.size += 1;
                return Ok((self.make_iter(seg_id, b, s), true));
            }

            let hb = self.hotspot(seg_id, h);

            let collected = policy.garbage_collect(&hb, self);
            self.garbage_collected += collected as u64;
            if collected > 0 {
                continue;
            }

            if policy.evict(&hb, self) > 0 {
                continue;
            }

            if policy.can_grow(self) {
                self.split(seg_id);
                policy.record_split();
                continue;
            }

            return Err(OpStatus::OutOfMemory);
        }
    }

    fn hotspot(&self, seg: u32, key_hash: u64) -> HotspotBuckets {
        let home = Segment::<K, V>::home_bucket(key_hash);
        HotspotBuckets {
            seg,
            key_hash,
            regular: [home as u8, ((home + 1) % SEG_BUCKETS) as u8],
            stash: std::array::from_fn(|i| (SEG_BUCKETS + i) as u8),
        }
    }

    /// Removes the entry at `it`, returning it. Positions of other entries
    /// stay valid.
    pub fn erase(&mut self, it: SegIter) -> Option<(K, V)> {
        if !self.is_current(it) {
            return None;
        }
        let seg = &mut self.segments[it.seg as usize];
        let taken = seg.buckets[it.bucket as usize].slots[it.slot as usize].take()?;
        seg.live -= 1;
        self.size -= 1;
        Some((taken.key, taken.value))
    }

    pub fn erase_key(&mut self, key: &[u8]) -> usize {
        match self.find(key) {
            Some(it) => {
                self.erase(it);
                1
            }
            None => 0,
        }
    }

    /// Repositions an entry to make it less likely to be evicted: stash
    /// entries move into their home bucket, regular entries move toward the
    /// front of their bucket. Only entries the policy allows to bump down
    /// are displaced. Returns the (possibly new) position.
    pub fn bump_up<P: BumpPolicy<K>>(&mut self, it: SegIter, policy: &P) -> SegIter {
        let Some(slot) = self.slot(it) else {
            return it;
        };
        let h = hash_key(slot.key.as_ref());
        let home = Segment::<K, V>::home_bucket(h);
        let seg = &mut self.segments[it.seg as usize];

        if it.in_stash() {
            if let Some(free) = seg.buckets[home].first_free() {
                let (stash, home_b) = seg.two_buckets_mut(it.bucket as usize, home);
                home_b.slots[free] = stash.slots[it.slot as usize].take();
                self.stash_unloaded += 1;
                return self.make_iter(it.seg, home, free);
            }
            for s in (0..BUCKET_SLOTS).rev() {
                let bumpable = seg.buckets[home].slots[s]
                    .as_ref()
                    .is_some_and(|victim| policy.can_bump_down(&victim.key));
                if bumpable {
                    let (stash, home_b) = seg.two_buckets_mut(it.bucket as usize, home);
                    std::mem::swap(&mut stash.slots[it.slot as usize], &mut home_b.slots[s]);
                    self.stash_unloaded += 1;
                    return self.make_iter(it.seg, home, s);
                }
            }
            return it;
        }

        if it.slot == 0 {
            return it;
        }
        let bucket = &mut seg.buckets[it.bucket as usize];
        let front_free = bucket.slots[0].is_none();
        let displaceable = front_free
            || bucket.slots[0]
                .as_ref()
                .is_some_and(|front| policy.can_bump_down(&front.key));
        if !displaceable {
            return it;
        }
        if front_free {
            bucket.slots[0] = bucket.slots[it.slot as usize].take();
        } else {
            bucket.slots.swap(0, it.slot as usize);
        }
        self.make_iter(it.seg, it.bucket as usize, 0)
    }

    /// Visits every busy slot of one bucket and returns the cursor for the
    /// next call; 0 means the traversal wrapped around.
    pub fn traverse(&self, cursor: u64, cb: &mut dyn FnMut(SegIter)) -> u64 {
        if self.size == 0 {
            return 0;
        }
        let mut seg = (cursor >> 8) as usize;
        let mut bucket = (cursor & 0xff) as usize;
        if seg >= self.segments.len() || bucket >= TOTAL_BUCKETS {
            seg = 0;
            bucket = 0;
        }

        for (s, slot) in self.segments[seg].buckets[bucket].slots.iter().enumerate() {
            if slot.is_some() {
                cb(self.make_iter(seg as u32, bucket, s));
            }
        }

        bucket += 1;
        if bucket >= TOTAL_BUCKETS {
            bucket = 0;
            seg += 1;
            if seg >= self.segments.len() {
                return 0;
            }
        }
        ((seg as u64) << 8) | bucket as u64
    }

    /// All busy-slot positions of one bucket.
    pub fn bucket_positions(&self, seg: u32, bucket: u8) -> SmallVec<[SegIter; BUCKET_SLOTS]> {
        let mut out = SmallVec::new();
        if (seg as usize) >= self.segments.len() || (bucket as usize) >= TOTAL_BUCKETS {
            return out;
        }
        for (s, slot) in self.segments[seg as usize].buckets[bucket as usize]
            .slots
            .iter()
            .enumerate()
        {
            if slot.is_some() {
                out.push(self.make_iter(seg, bucket as usize, s));
            }
        }
        out
    }

    /// Position at exact coordinates, if busy.
    pub fn position_at(&self, seg: u32, bucket: u8, slot: u8) -> Option<SegIter> {
        let it = self.make_iter(seg, bucket as usize, slot as usize);
        self.slot(it).map(|_| it)
    }

    /// Opens slot 0 of a stash bucket after its last slot was evicted.
    pub fn shift_right(&mut self, seg: u32, bucket: u8) {
        self.segments[seg as usize].shift_right(bucket as usize);
    }

    fn split(&mut self, seg_id: u32) {
        let local_depth = self.segments[seg_id as usize].local_depth;
        if local_depth == self.global_depth {
            let mut doubled = Vec::with_capacity(self.dir.len() * 2);
            for &e in &self.dir {
                doubled.push(e);
                doubled.push(e);
            }
            self.dir = doubled;
            self.global_depth += 1;
        }

        let new_depth = local_depth + 1;
        let new_id = self.segments.len() as u32;
        self.segments.push(Segment::new(new_depth));
        self.segments[seg_id as usize].local_depth = new_depth;

        let shift = self.global_depth - new_depth;
        for i in 0..self.dir.len() {
            if self.dir[i] == seg_id && ((i >> shift) & 1) == 1 {
                self.dir[i] = new_id;
            }
        }

        // Entries keep their bucket/slot coordinates in whichever segment
        // their next hash bit selects.
        let global_depth = self.global_depth;
        let dir = &self.dir;
        let (old_part, new_part) = self.segments.split_at_mut(new_id as usize);
        let old_seg = &mut old_part[seg_id as usize];
        let new_seg = &mut new_part[0];
        for b in 0..TOTAL_BUCKETS {
            for s in 0..BUCKET_SLOTS {
                let belongs_to_new = old_seg.buckets[b].slots[s].as_ref().is_some_and(|slot| {
                    let h = hash_key(slot.key.as_ref());
                    let idx = if global_depth == 0 {
                        0
                    } else {
                        (h >> (64 - global_depth as u32)) as usize
                    };
                    dir[idx] == new_id
                });
                if belongs_to_new {
                    new_seg.buckets[b].slots[s] = old_seg.buckets[b].slots[s].take();
                    old_seg.live -= 1;
                    new_seg.live += 1;
                }
            }
        }

        self.epoch += 1;
    }

    /// Grows until at least `n` slots exist. A sizing hint used before bulk
    /// loads; no eviction policy is consulted.
    pub fn reserve(&mut self, n: usize) {
        while self.capacity() < n {
            let count = self.segments.len() as u32;
            for seg in 0..count {
                self.split(seg);
            }
        }
    }

    pub fn clear(&mut self) {
        let count = 1usize << self.init_depth;
        self.segments = (0..count).map(|_| Segment::new(self.init_depth)).collect();
        self.dir = (0..count as u32).collect();
        self.global_depth = self.init_depth;
        self.size = 0;
        self.epoch += 1;
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.segments.len() * SEGMENT_SLOTS
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.segments.len() * TOTAL_BUCKETS
    }

    /// Heap bytes of one segment; the growth projection in the eviction
    /// policy prices a split with this.
    pub fn seg_bytes() -> usize {
        TOTAL_BUCKETS * std::mem::size_of::<Bucket<K, V>>()
    }

    pub fn mem_usage(&self) -> usize {
        self.segments.len() * Self::seg_bytes() + self.dir.len() * std::mem::size_of::<u32>()
    }

    pub fn garbage_collected(&self) -> u64 {
        self.garbage_collected
    }

    pub fn stash_unloaded(&self) -> u64 {
        self.stash_unloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverSticky;

    impl BumpPolicy<Vec<u8>> for NeverSticky {
        fn can_bump_down(&self, _key: &Vec<u8>) -> bool {
            true
        }
    }

    fn table() -> SegTable<Vec<u8>, u64> {
        SegTable::new(0)
    }

    #[test]
    fn insert_then_find() {
        let mut t = table();
        let (it, inserted) = t.insert(b"alpha".to_vec(), 1, &mut NoopPolicy).unwrap();
        assert!(inserted);
        assert_eq!(t.value(it), Some(&1));
        let found = t.find(b"alpha").unwrap();
        assert_eq!(found, it);
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn insert_existing_returns_old_position() {
        let mut t = table();
        let (first, _) = t.insert(b"k".to_vec(), 1, &mut NoopPolicy).unwrap();
        let (second, inserted) = t.insert(b"k".to_vec(), 2, &mut NoopPolicy).unwrap();
        assert!(!inserted);
        assert_eq!(first, second);
        assert_eq!(t.value(second), Some(&1), "existing value untouched");
    }

    #[test]
    fn erase_keeps_other_positions_valid() {
        let mut t = table();
        let (a, _) = t.insert(b"a".to_vec(), 1, &mut NoopPolicy).unwrap();
        let (b, _) = t.insert(b"b".to_vec(), 2, &mut NoopPolicy).unwrap();
        assert!(t.erase(a).is_some());
        assert_eq!(t.value(b), Some(&2));
        assert_eq!(t.size(), 1);
        assert_eq!(t.erase_key(b"a"), 0);
    }

    #[test]
    fn table_grows_past_one_segment() {
        let mut t = table();
        for i in 0..SEGMENT_SLOTS * 2 {
            let key = format!("key-{i:06}").into_bytes();
            t.insert(key, i as u64, &mut NoopPolicy).unwrap();
        }
        assert!(t.segment_count() > 1);
        assert_eq!(t.size(), SEGMENT_SLOTS * 2);
        for i in 0..SEGMENT_SLOTS * 2 {
            let key = format!("key-{i:06}").into_bytes();
            let it = t.find(&key).expect("key lost after split");
            assert_eq!(t.value(it), Some(&(i as u64)));
        }
    }

    #[test]
    fn split_invalidates_positions() {
        let mut t = table();
        let (it, _) = t.insert(b"pinned".to_vec(), 7, &mut NoopPolicy).unwrap();
        for i in 0..SEGMENT_SLOTS {
            t.insert(format!("fill-{i:06}").into_bytes(), 0, &mut NoopPolicy)
                .unwrap();
        }
        assert!(t.segment_count() > 1);
        assert!(!t.is_current(it));
        assert!(t.entry(it).is_none());
        assert!(t.find(b"pinned").is_some());
    }

    #[test]
    fn growth_denied_surfaces_out_of_memory() {
        struct NoGrow;
        impl EvictionPolicy<Vec<u8>, u64> for NoGrow {
            fn can_grow(&self, _tbl: &SegTable<Vec<u8>, u64>) -> bool {
                false
            }
        }
        let mut t = table();
        let mut failed = false;
        for i in 0..SEGMENT_SLOTS + 1 {
            let key = format!("key-{i:06}").into_bytes();
            if t.insert(key, 0, &mut NoGrow).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "a full segment that may not grow must fail inserts");
        assert_eq!(t.segment_count(), 1);
    }

    #[test]
    fn traverse_visits_every_entry_once_per_pass() {
        let mut t = table();
        for i in 0..500u64 {
            t.insert(format!("k{i}").into_bytes(), i, &mut NoopPolicy).unwrap();
        }
        let mut seen = 0usize;
        let mut cursor = 0u64;
        loop {
            cursor = t.traverse(cursor, &mut |_| seen += 1);
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen, 500);
    }

    #[test]
    fn bump_up_moves_entry_to_front() {
        let mut t = table();
        // Find two keys sharing a home bucket so the second lands in slot 1.
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut i = 0u64;
        while keys.len() < 2 {
            let cand = format!("bump-{i}").into_bytes();
            let h = hash_key(&cand);
            if keys.is_empty()
                || Segment::<Vec<u8>, u64>::home_bucket(hash_key(&keys[0]))
                    == Segment::<Vec<u8>, u64>::home_bucket(h)
            {
                keys.push(cand);
            }
            i += 1;
        }
        t.insert(keys[0].clone(), 0, &mut NoopPolicy).unwrap();
        let (second, _) = t.insert(keys[1].clone(), 1, &mut NoopPolicy).unwrap();
        assert_eq!(second.slot, 1);
        let bumped = t.bump_up(second, &NeverSticky);
        assert_eq!(bumped.slot, 0);
        assert_eq!(t.value(bumped), Some(&1));
    }

    #[test]
    fn reserve_meets_capacity_hint() {
        let mut t = table();
        let want = SEGMENT_SLOTS * 4;
        t.reserve(want);
        assert!(t.capacity() >= want);
    }

    #[test]
    fn clear_resets_to_initial_shape() {
        let mut t = table();
        for i in 0..SEGMENT_SLOTS * 2 {
            t.insert(format!("k{i}").into_bytes(), 0, &mut NoopPolicy).unwrap();
        }
        t.clear();
        assert_eq!(t.size(), 0);
        assert_eq!(t.segment_count(), 1);
        assert!(t.find(b"k0").is_none());
    }

    #[test]
    fn version_roundtrip() {
        let mut t = table();
        let (it, _) = t.insert(b"v".to_vec(), 0, &mut NoopPolicy).unwrap();
        assert_eq!(t.version(it), Some(0));
        t.set_version(it, 42);
        assert_eq!(t.version(it), Some(42));
    }
}
