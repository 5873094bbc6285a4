//! # DbSlice - the Per-Shard Data Surface
//!
//! `DbSlice` is the only entry point through which commands read or mutate
//! per-database state. Every operation is single-threaded by contract: it
//! executes on the owning shard's thread, so nothing here locks.
//!
//! ## Per-Database State
//!
//! Each database index owns a `DbTable`:
//!
//! ```text
//! DbTable
//! ├── prime:        SegTable<KeyObj, ValueObj>     key -> value
//! ├── expire:       SegTable<KeyObj, ExpirePeriod> key -> TTL delta
//! ├── mcflag:       SegTable<KeyObj, u32>          key -> memcached flag
//! ├── trans_locks:  key bytes -> IntentLock
//! ├── watched_keys: key bytes -> weak watcher refs
//! └── stats:        DbTableStats
//! ```
//!
//! ## Invariants
//!
//! 1. A prime entry has `has_expire == true` iff exactly one expire entry
//!    exists for the same key; every expire entry has a prime entry.
//! 2. Stats counters are the exact sum of per-entry contributions, updated
//!    in the same operation as the structural change.
//! 3. A sticky entry is never selected by the GC or any eviction pass.
//! 4. A lock record exists iff its count is >= 1.
//!
//! Violations of these are programming errors and abort the process.
//!
//! ## Expiry
//!
//! TTLs are stored as 32-bit millisecond deltas from the per-database
//! expire base, so the expire table holds long TTLs in 4 bytes. Expiry is
//! enforced inline on every lookup (a dead entry is erased and reported as
//! not found), by the insertion-time GC pass, and by the cursor-driven
//! reaper the shard heartbeat runs.
//!
//! ## Change Callbacks
//!
//! Snapshot producers and replication register ordered `(version,
//! callback)` pairs. Callbacks fire on the shard thread *before* any
//! structural change - with the key name for brand-new keys, or with the
//! pre-image of the entry about to be touched (including bump-up
//! repositioning in caching mode, so snapshotters can record the old
//! location).

pub mod eviction;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::config::{
    BUCKET_SLOTS, EngineConfig, PRIME_INIT_DEPTH, RED_LIMIT_DIVISOR, SEG_BUCKETS, TOTAL_BUCKETS,
};
use crate::lock::{IntentLock, LockMode};
use crate::object::{InternPool, KeyObj, ValueObj};
use crate::table::{NoopPolicy, SegIter, SegTable};
use crate::tiered::TieredStorage;
use crate::types::{DbIndex, KeyLockArgs, ObjType, OpResult, OpStatus, ShardId};

use eviction::{evict_entry, expire_if_needed_parts, PrimeBumpPolicy, PrimeEvictionPolicy};
use stats::{DbStats, DbTableStats, DeleteExpiredStats, SliceEvents, SliceStats};

pub(crate) type WatchMap = HashMap<Vec<u8>, Vec<Weak<ExecWatcher>>>;

pub type PrimeTable = SegTable<KeyObj, ValueObj>;
pub type ExpireTable = SegTable<KeyObj, ExpirePeriod>;
pub type McFlagTable = SegTable<KeyObj, u32>;
pub type PrimeIterator = SegIter;
pub type ExpireIterator = SegIter;

/// TTL stored as a 32-bit millisecond delta from the per-db expire base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirePeriod(u32);

impl ExpirePeriod {
    pub fn new(delta_ms: u64) -> Self {
        Self(delta_ms.min(u32::MAX as u64) as u32)
    }

    pub fn duration_ms(&self) -> u64 {
        self.0 as u64
    }
}

/// Client-side handle of an optimistic-execution session.
///
/// The client owns the strong reference; the watched-key table holds only
/// weak back-references. Any mutation of a watched key flips `dirty` with
/// a release store and drops the back-reference.
#[derive(Debug, Default)]
pub struct ExecWatcher {
    dirty: AtomicBool,
    watched: Mutex<Vec<(DbIndex, Vec<u8>)>>,
}

impl ExecWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn record(&self, db: DbIndex, key: &[u8]) {
        self.watched.lock().push((db, key.to_vec()));
    }

    fn take_watched(&self) -> Vec<(DbIndex, Vec<u8>)> {
        std::mem::take(&mut *self.watched.lock())
    }
}

/// What a change callback observes, before the mutation happens.
pub enum ChangeReq<'a> {
    /// A key about to be inserted for the first time.
    NewKey(&'a [u8]),
    /// Pre-image of an existing entry about to be mutated or repositioned.
    PreImage { it: PrimeIterator, key: &'a KeyObj, value: &'a ValueObj, version: u64 },
}

pub type ChangeCallback = Box<dyn FnMut(DbIndex, &ChangeReq<'_>) + Send>;

/// All tables of one logical database.
pub struct DbTable {
    pub(crate) prime: PrimeTable,
    pub(crate) expire: ExpireTable,
    pub(crate) mcflag: McFlagTable,
    pub(crate) trans_locks: HashMap<Vec<u8>, IntentLock>,
    watched_keys: WatchMap,
    pub(crate) stats: DbTableStats,
    expire_cursor: u64,
    evict_cursor: u64,
}

impl DbTable {
    fn new(prime_depth: u8) -> Self {
        Self {
            prime: PrimeTable::new(prime_depth),
            expire: ExpireTable::new(0),
            mcflag: McFlagTable::new(0),
            trans_locks: HashMap::new(),
            watched_keys: HashMap::new(),
            stats: DbTableStats::default(),
            expire_cursor: 0,
            evict_cursor: 0,
        }
    }

    /// Read access for snapshotters and introspection. Entry iteration
    /// goes through `prime().traverse`.
    pub fn prime(&self) -> &PrimeTable {
        &self.prime
    }

    pub fn expire(&self) -> &ExpireTable {
        &self.expire
    }

    pub fn mcflag(&self) -> &McFlagTable {
        &self.mcflag
    }

    pub fn table_stats(&self) -> &DbTableStats {
        &self.stats
    }

    /// Empties the data tables in place; locks and watches are untouched.
    pub fn clear(&mut self) {
        self.prime.clear();
        self.expire.clear();
        self.mcflag.clear();
        self.stats = DbTableStats::default();
        self.expire_cursor = 0;
        self.evict_cursor = 0;
    }

    /// Releases `count` holds of `mode` on `key`, erasing the record once
    /// free. The record must exist.
    pub fn release_lock(&mut self, mode: LockMode, key: &[u8], count: u32) {
        let lock = self
            .trans_locks
            .get_mut(key)
            .expect("releasing a lock that was never acquired");
        lock.release_count(mode, count);
        if lock.is_free() {
            self.trans_locks.remove(key);
        }
    }
}

pub(crate) fn invalidate_watchers(watched: &mut WatchMap, key: &[u8]) {
    if let Some(list) = watched.remove(key) {
        for w in list {
            if let Some(watcher) = w.upgrade() {
                watcher.dirty.store(true, Ordering::Release);
            }
        }
    }
}

/// The per-shard data surface.
pub struct DbSlice {
    shard_id: ShardId,
    caching_mode: bool,
    prime_depth: u8,
    now_ms: u64,
    expire_base: [u64; 2],
    memory_budget: i64,
    soft_budget_limit: i64,
    bytes_per_object: usize,
    version: u64,
    events: SliceEvents,
    db_arr: Vec<Option<Box<DbTable>>>,
    change_cbs: Vec<(u64, ChangeCallback)>,
    intern_pool: InternPool,
    tiered: Option<TieredStorage>,
}

impl DbSlice {
    pub fn new(shard_id: ShardId, caching_mode: bool, config: &EngineConfig) -> Self {
        Self::with_prime_depth(shard_id, caching_mode, config, PRIME_INIT_DEPTH)
    }

    /// Construction with an explicit initial table depth. Tests use depth 0
    /// so segment-boundary behavior is reachable with few keys.
    pub fn with_prime_depth(
        shard_id: ShardId,
        caching_mode: bool,
        config: &EngineConfig,
        prime_depth: u8,
    ) -> Self {
        let per_shard = config.max_memory_per_shard();
        let mut slice = Self {
            shard_id,
            caching_mode,
            prime_depth,
            now_ms: 0,
            expire_base: [0, 0],
            memory_budget: per_shard as i64,
            soft_budget_limit: (per_shard / RED_LIMIT_DIVISOR) as i64,
            bytes_per_object: 0,
            version: 0,
            events: SliceEvents::default(),
            db_arr: Vec::new(),
            change_cbs: Vec::new(),
            intern_pool: InternPool::new(),
            tiered: None,
        };
        slice.activate_db(0);
        slice
    }

    #[inline]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    #[inline]
    pub fn caching_mode(&self) -> bool {
        self.caching_mode
    }

    pub fn enable_cache_mode_for_tests(&mut self) {
        self.caching_mode = true;
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Publishes the shard clock; all expiry comparisons share it.
    pub fn update_expire_clock(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }

    pub fn update_expire_base(&mut self, base_ms: u64, generation: usize) {
        // Only generation 0 is consulted today; the second slot is reserved
        // for the multi-generation rebase of long-lived servers.
        self.expire_base[generation] = base_ms;
    }

    #[inline]
    pub fn memory_budget(&self) -> i64 {
        self.memory_budget
    }

    #[inline]
    pub fn bytes_per_object(&self) -> usize {
        self.bytes_per_object
    }

    /// Refreshes the cached budget figures from the shard heartbeat.
    pub fn set_cached_params(&mut self, free_mem: i64, bytes_per_object: usize) {
        self.memory_budget = free_mem;
        self.bytes_per_object = bytes_per_object;
    }

    pub fn set_tiered(&mut self, tiered: TieredStorage) {
        self.tiered = Some(tiered);
    }

    pub fn tiered_mut(&mut self) -> Option<&mut TieredStorage> {
        self.tiered.as_mut()
    }

    #[inline]
    pub fn db_array_size(&self) -> usize {
        self.db_arr.len()
    }

    #[inline]
    pub fn is_db_valid(&self, db: DbIndex) -> bool {
        (db as usize) < self.db_arr.len() && self.db_arr[db as usize].is_some()
    }

    /// Lazily creates the database at `db`.
    pub fn activate_db(&mut self, db: DbIndex) {
        let idx = db as usize;
        if self.db_arr.len() <= idx {
            self.db_arr.resize_with(idx + 1, || None);
        }
        if self.db_arr[idx].is_none() {
            self.db_arr[idx] = Some(Box::new(DbTable::new(self.prime_depth)));
        }
    }

    fn table_mut(&mut self, db: DbIndex) -> &mut DbTable {
        self.db_arr[db as usize]
            .as_mut()
            .expect("database not activated")
    }

    pub fn get_table(&self, db: DbIndex) -> Option<&DbTable> {
        self.db_arr.get(db as usize).and_then(|t| t.as_deref())
    }

    /// Prime and expire tables for heartbeat inspection.
    pub fn get_tables(&self, db: DbIndex) -> Option<(&PrimeTable, &ExpireTable)> {
        self.get_table(db).map(|t| (&t.prime, &t.expire))
    }

    pub fn db_size(&self, db: DbIndex) -> usize {
        self.get_table(db).map_or(0, |t| t.prime.size())
    }

    pub fn reserve(&mut self, db: DbIndex, key_count: usize) {
        self.activate_db(db);
        self.table_mut(db).prime.reserve(key_count);
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Mutable value access for command handlers. Every mutation through
    /// this must be bracketed by `pre_update` / `post_update`.
    pub fn value_mut(&mut self, db: DbIndex, it: PrimeIterator) -> Option<&mut ValueObj> {
        self.db_arr
            .get_mut(db as usize)
            .and_then(|t| t.as_mut())
            .and_then(|t| t.prime.value_mut(it))
    }

    pub fn value(&self, db: DbIndex, it: PrimeIterator) -> Option<&ValueObj> {
        self.get_table(db).and_then(|t| t.prime.value(it))
    }

    /// Marks a key sticky (exempt from every eviction policy) or clears
    /// the flag. Returns whether the key exists.
    pub fn set_sticky(&mut self, db: DbIndex, key: &[u8], sticky: bool) -> bool {
        let Some(table) = self.db_arr.get_mut(db as usize).and_then(|t| t.as_mut()) else {
            return false;
        };
        let Some(it) = table.prime.find(key) else {
            return false;
        };
        table
            .prime
            .key_mut(it)
            .expect("found above")
            .set_sticky(sticky);
        true
    }

    /// Validates a previously captured position against the current table
    /// structure.
    pub fn check_iterator(&self, db: DbIndex, it: PrimeIterator) -> OpResult<()> {
        let table = self.get_table(db).ok_or(OpStatus::KeyNotFound)?;
        if !table.prime.is_current(it) {
            return Err(OpStatus::WrongKeyEpoch);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Looks up `key`, enforcing expiry inline and requiring `req_type`.
    pub fn find(&mut self, db: DbIndex, key: &[u8], req_type: ObjType) -> OpResult<PrimeIterator> {
        let (it, _) = self.find_ext(db, key);
        let it = it.ok_or(OpStatus::KeyNotFound)?;
        let obj_type = self
            .get_table(db)
            .and_then(|t| t.prime.value(it))
            .map(|v| v.obj_type())
            .ok_or(OpStatus::KeyNotFound)?;
        if obj_type != req_type {
            return Err(OpStatus::WrongType);
        }
        Ok(it)
    }

    /// Core lookup: enforces inline expiry; in caching mode bumps the entry
    /// up within its segment (never sticky keys), firing pre-bump change
    /// callbacks with the pre-image.
    pub fn find_ext(
        &mut self,
        db: DbIndex,
        key: &[u8],
    ) -> (Option<PrimeIterator>, Option<ExpireIterator>) {
        if !self.is_db_valid(db) {
            return (None, None);
        }
        let now_ms = self.now_ms;
        let base = self.expire_base[0];
        let caching = self.caching_mode;

        let Self { ref mut db_arr, ref mut change_cbs, ref mut events, .. } = *self;
        let table = db_arr[db as usize].as_mut().expect("validated above");
        let DbTable { prime, expire, mcflag, stats, watched_keys, .. } = &mut **table;

        let Some(mut it) = prime.find(key) else {
            return (None, None);
        };

        let mut exp_it = None;
        if prime.key(it).is_some_and(|k| k.has_expire()) {
            let expired = expire_if_needed_parts(
                prime, expire, mcflag, stats, events, watched_keys, base, now_ms, it,
            );
            if expired {
                return (None, None);
            }
            exp_it = expire.find(key);
        }

        if caching {
            if !change_cbs.is_empty() {
                let version = prime.version(it).unwrap_or(0);
                if let Some((k, v)) = prime.entry(it) {
                    let req = ChangeReq::PreImage { it, key: k, value: v, version };
                    for (_, cb) in change_cbs.iter_mut() {
                        cb(db, &req);
                    }
                }
            }
            let sticky = prime.key(it).is_some_and(|k| k.sticky());
            if !sticky {
                it = prime.bump_up(it, &PrimeBumpPolicy);
                events.bumpups += 1;
            }
        }

        (Some(it), exp_it)
    }

    /// First key among `keys` holding a value of `req_type`. Used by
    /// multi-key readers like the list-blocking primitives.
    pub fn find_first(
        &mut self,
        db: DbIndex,
        keys: &[&[u8]],
        req_type: ObjType,
    ) -> OpResult<(PrimeIterator, usize)> {
        debug_assert!(!keys.is_empty());
        for (i, key) in keys.iter().enumerate() {
            match self.find(db, key, req_type) {
                Ok(it) => return Ok((it, i)),
                Err(OpStatus::KeyNotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(OpStatus::KeyNotFound)
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts `key` with an empty value or finds the existing entry.
    /// Returns `(position, inserted)`; an expired existing entry is
    /// recycled in place and reported as inserted.
    pub fn add_or_find(&mut self, db: DbIndex, key: &[u8]) -> OpResult<(PrimeIterator, bool)> {
        self.activate_db(db);

        // With registered change callbacks we must know in advance whether
        // this is a find or an add, so subscribers observe the new-key
        // callback before the insert.
        if !self.change_cbs.is_empty() {
            if let (Some(it), _) = self.find_ext(db, key) {
                return Ok((it, false));
            }
            let Self { ref mut change_cbs, .. } = *self;
            let req = ChangeReq::NewKey(key);
            for (_, cb) in change_cbs.iter_mut() {
                cb(db, &req);
            }
        }

        let caching = self.caching_mode;
        let budget = self.memory_budget - key.len() as i64;
        if !caching && budget < 0 {
            return Err(OpStatus::OutOfMemory);
        }

        let now_ms = self.now_ms;
        let base = self.expire_base[0];
        let bytes_per_object = self.bytes_per_object;
        let soft_limit = self.soft_budget_limit;

        let Self { ref mut db_arr, ref mut events, ref mut intern_pool, ref mut version, .. } =
            *self;
        let key_obj = KeyObj::with_pool(key, intern_pool);
        let table = db_arr[db as usize].as_mut().expect("activated above");
        let DbTable { prime, expire, mcflag, stats, watched_keys, .. } = &mut **table;

        let mut policy = PrimeEvictionPolicy::new(
            expire,
            mcflag,
            stats,
            events,
            watched_keys,
            base,
            now_ms,
            bytes_per_object,
            budget,
            soft_limit,
            caching,
        );
        let insert_res = prime.insert(key_obj, ValueObj::empty(), &mut policy);
        let policy_budget = policy.mem_budget();
        drop(policy);

        // A failed insert leaves no residue: nothing was placed and the
        // expire table was only cleaned of already-dead entries.
        let (it, inserted) = insert_res?;

        // The insert may leave us over budget even without new segments,
        // e.g. when half-full segments keep absorbing growing objects.
        let mut evicted_bytes = 0usize;
        if policy_budget < 0 {
            evicted_bytes = Self::evict_objects_parts(
                prime,
                expire,
                mcflag,
                stats,
                events,
                (-policy_budget) as usize,
                it,
            );
        }

        if inserted {
            let key_ref = prime.key(it).expect("entry just inserted");
            stats.inline_keys += key_ref.is_inline() as u64;
            stats.obj_memory_usage += key_ref.mem_usage() as u64;

            *version += 1;
            prime.set_version(it, *version);
            self.memory_budget = policy_budget + evicted_bytes as i64;
            return Ok((it, true));
        }

        self.memory_budget += evicted_bytes as i64;

        // Existing entry whose TTL already passed: recycle the slot in
        // place instead of erase-and-reinsert.
        let key_ref = prime.key(it).expect("existing entry");
        if key_ref.has_expire() {
            let exp_it = expire
                .find(key)
                .expect("expire entry missing for key flagged has_expire");
            let delta = expire.value(exp_it).map(|p| p.duration_ms()).unwrap_or_default();
            if base + delta <= now_ms {
                expire.erase(exp_it);
                prime.key_mut(it).expect("existing entry").set_has_expire(false);

                let value = prime.value(it).expect("existing entry");
                let val_mem = value.malloc_used();
                let is_str = value.obj_type() == ObjType::String;
                if value.has_mc_flag() {
                    mcflag.erase_key(key);
                }
                if let Some(bytes) = value.compact_footprint() {
                    stats.compact_blob_cnt -= 1;
                    stats.compact_bytes -= bytes as u64;
                }
                stats.obj_memory_usage -= val_mem as u64;
                if is_str {
                    stats.strval_memory_usage -= val_mem as u64;
                }

                prime.value_mut(it).expect("existing entry").reset();
                events.expired_keys += 1;
                return Ok((it, true));
            }
        }

        Ok((it, false))
    }

    /// Inserts or finds, then assigns `value` and (optionally) an absolute
    /// expiry. Returns `(position, inserted)`.
    pub fn add_entry(
        &mut self,
        db: DbIndex,
        key: &[u8],
        value: ValueObj,
        expire_at_ms: u64,
    ) -> OpResult<(PrimeIterator, bool)> {
        let (it, inserted) = self.add_or_find(db, key)?;
        if !inserted {
            return Ok((it, false));
        }

        *self
            .table_mut(db)
            .prime
            .value_mut(it)
            .expect("entry just inserted") = value;
        self.post_update(db, it, key, false);

        if expire_at_ms != 0 {
            self.update_expire(db, it, expire_at_ms);
        }
        Ok((it, true))
    }

    /// `add_entry` that must insert; finding an existing live entry is a
    /// caller bug.
    pub fn add_new(
        &mut self,
        db: DbIndex,
        key: &[u8],
        value: ValueObj,
        expire_at_ms: u64,
    ) -> OpResult<PrimeIterator> {
        let (it, added) = self.add_entry(db, key, value, expire_at_ms)?;
        assert!(added, "add_new on a live key");
        Ok(it)
    }

    // ------------------------------------------------------------------
    // Deletion, expiry, flushing
    // ------------------------------------------------------------------

    /// Removes the entry, its expire entry and its flag entry, updating
    /// stats and invalidating watchers.
    pub fn del(&mut self, db: DbIndex, it: PrimeIterator) -> bool {
        if !self.is_db_valid(db) {
            return false;
        }
        let table = self.table_mut(db);
        let DbTable { prime, expire, mcflag, stats, watched_keys, .. } = &mut *table;

        let Some(key) = prime.key(it) else {
            return false;
        };
        let key_bytes = key.clone_bytes();
        evict_entry(prime, expire, mcflag, stats, it);
        invalidate_watchers(watched_keys, key_bytes.as_bytes());
        true
    }

    /// Sets, changes or clears (at_ms == 0) the expiry of a live entry.
    /// Returns whether the expiry state changed.
    pub fn update_expire(&mut self, db: DbIndex, it: PrimeIterator, at_ms: u64) -> bool {
        let base = self.expire_base[0];
        let table = self.table_mut(db);
        let DbTable { prime, expire, .. } = &mut *table;

        let Some(key) = prime.key(it) else {
            return false;
        };
        let has_expire = key.has_expire();
        let key_bytes = key.clone_bytes();

        if at_ms == 0 {
            if !has_expire {
                return false;
            }
            assert_eq!(expire.erase_key(key_bytes.as_bytes()), 1);
            prime.key_mut(it).expect("live entry").set_has_expire(false);
            return true;
        }

        let delta = at_ms.saturating_sub(base);
        if has_expire {
            let exp_it = expire
                .find(key_bytes.as_bytes())
                .expect("expire entry missing for key flagged has_expire");
            *expire.value_mut(exp_it).expect("expire entry") = ExpirePeriod::new(delta);
        } else {
            let (_, inserted) = expire
                .insert(key_bytes, ExpirePeriod::new(delta), &mut NoopPolicy)
                .expect("expire table insert cannot run out of budget");
            assert!(inserted);
            prime.key_mut(it).expect("live entry").set_has_expire(true);
        }
        true
    }

    /// Absolute expiry time of an entry in shard-clock milliseconds, or
    /// `None` when the entry is persistent.
    pub fn expire_time(&self, db: DbIndex, it: PrimeIterator) -> Option<u64> {
        let table = self.get_table(db)?;
        let key = table.prime.key(it)?;
        if !key.has_expire() {
            return None;
        }
        let exp_it = table.expire.find(key.as_bytes())?;
        let delta = table.expire.value(exp_it)?.duration_ms();
        Some(self.expire_base[0] + delta)
    }

    /// Inline-expiry entry point shared by lookups and the reaper.
    pub fn expire_if_needed(&mut self, db: DbIndex, it: PrimeIterator) -> bool {
        let base = self.expire_base[0];
        let now_ms = self.now_ms;
        let Self { ref mut db_arr, ref mut events, .. } = *self;
        let Some(table) = db_arr.get_mut(db as usize).and_then(|t| t.as_mut()) else {
            return false;
        };
        let DbTable { prime, expire, mcflag, stats, watched_keys, .. } = &mut **table;
        expire_if_needed_parts(
            prime, expire, mcflag, stats, events, watched_keys, base, now_ms, it,
        )
    }

    /// Replaces the database with a fresh empty one. Existing intent locks
    /// carry over; the old tables are destroyed on a background thread so
    /// the shard stays responsive.
    pub fn flush_db(&mut self, db: DbIndex) {
        if !self.is_db_valid(db) {
            return;
        }
        self.invalidate_db_watches(db);

        let mut fresh = Box::new(DbTable::new(self.prime_depth));
        let mut old = self.db_arr[db as usize].take().expect("validated above");
        std::mem::swap(&mut fresh.trans_locks, &mut old.trans_locks);
        self.db_arr[db as usize] = Some(fresh);

        debug!(db, keys = old.prime.size(), "flushing database in background");
        std::thread::spawn(move || drop(old));
    }

    pub fn flush_all(&mut self) {
        for db in 0..self.db_arr.len() as DbIndex {
            if self.is_db_valid(db) {
                self.flush_db(db);
            }
        }
    }

    // ------------------------------------------------------------------
    // Update bracketing
    // ------------------------------------------------------------------

    /// Mandatory prologue of every in-place value mutation: fires change
    /// callbacks with the pre-image, deducts the old footprint and frees
    /// any externalized payload.
    pub fn pre_update(&mut self, db: DbIndex, it: PrimeIterator) {
        let Self { ref mut db_arr, ref mut change_cbs, ref mut tiered, .. } = *self;
        let Some(table) = db_arr.get_mut(db as usize).and_then(|t| t.as_mut()) else {
            return;
        };
        let DbTable { prime, stats, .. } = &mut **table;

        if !change_cbs.is_empty() {
            let version = prime.version(it).unwrap_or(0);
            if let Some((k, v)) = prime.entry(it) {
                let req = ChangeReq::PreImage { it, key: k, value: v, version };
                for (_, cb) in change_cbs.iter_mut() {
                    cb(db, &req);
                }
            }
        }

        let Some(value) = prime.value(it) else {
            return;
        };
        let val_mem = value.malloc_used();
        let is_str = value.obj_type() == ObjType::String;
        let compact = value.compact_footprint();
        let external = value.external_ptr();

        stats.obj_memory_usage -= val_mem as u64;
        stats.update_value_amount -= val_mem as i64;
        if is_str {
            stats.strval_memory_usage -= val_mem as u64;
        }
        if let Some(bytes) = compact {
            stats.compact_blob_cnt -= 1;
            stats.compact_bytes -= bytes as u64;
        }
        if let Some(ptr) = external {
            stats.external_entries -= 1;
            stats.external_size -= ptr.size as u64;
            if let Some(t) = tiered.as_mut() {
                t.free(db, ptr.offset, ptr.size);
            }
            prime.value_mut(it).expect("checked above").reset();
        }
    }

    /// Mandatory epilogue: adds the new footprint, bumps the entry version
    /// and invalidates watchers of `key`.
    pub fn post_update(&mut self, db: DbIndex, it: PrimeIterator, key: &[u8], existing: bool) {
        let Self { ref mut db_arr, ref mut version, .. } = *self;
        let Some(table) = db_arr.get_mut(db as usize).and_then(|t| t.as_mut()) else {
            return;
        };
        let DbTable { prime, stats, watched_keys, .. } = &mut **table;

        let Some(value) = prime.value(it) else {
            return;
        };
        let val_mem = value.malloc_used();
        let is_str = value.obj_type() == ObjType::String;
        let compact = value.compact_footprint();
        let external = value.external_size();

        stats.obj_memory_usage += val_mem as u64;
        if is_str {
            stats.strval_memory_usage += val_mem as u64;
        }
        if existing {
            stats.update_value_amount += val_mem as i64;
        }
        if let Some(bytes) = compact {
            stats.compact_blob_cnt += 1;
            stats.compact_bytes += bytes as u64;
        }
        if let Some(bytes) = external {
            stats.external_entries += 1;
            stats.external_size += bytes as u64;
        }

        *version += 1;
        prime.set_version(it, *version);

        invalidate_watchers(watched_keys, key);
    }

    // ------------------------------------------------------------------
    // Reaping and eviction
    // ------------------------------------------------------------------

    /// One reaper step: samples `count / 3` expire buckets through the
    /// per-db cursor and extends to the full `count` only while the
    /// observed delete ratio exceeds 25%.
    pub fn delete_expired_step(&mut self, db: DbIndex, count: u32) -> DeleteExpiredStats {
        let mut result = DeleteExpiredStats::default();
        if !self.is_db_valid(db) {
            return result;
        }

        let mut i = 0;
        while i < count / 3 {
            self.reap_one_bucket(db, &mut result);
            i += 1;
        }

        // Continue only on a strong deletion rate in the first sample.
        if result.deleted * 4 > result.traversed {
            while i < count {
                self.reap_one_bucket(db, &mut result);
                i += 1;
            }
        }

        result
    }

    fn reap_one_bucket(&mut self, db: DbIndex, out: &mut DeleteExpiredStats) {
        let base = self.expire_base[0];
        let now_ms = self.now_ms;

        let Self { ref mut db_arr, ref mut events, .. } = *self;
        let table = db_arr[db as usize].as_mut().expect("validated by caller");

        let mut sampled: SmallVec<[(KeyObj, u64); BUCKET_SLOTS]> = SmallVec::new();
        {
            let expire = &table.expire;
            let cursor = table.expire_cursor;
            table.expire_cursor = expire.traverse(cursor, &mut |it| {
                if let Some((k, p)) = expire.entry(it) {
                    sampled.push((k.clone_bytes(), p.duration_ms()));
                }
            });
        }

        let DbTable { prime, expire, mcflag, stats, watched_keys, .. } = &mut **table;
        for (key, delta) in sampled {
            out.traversed += 1;
            let deadline = base + delta;
            if deadline > now_ms {
                out.survivor_ttl_sum += deadline - now_ms;
                continue;
            }
            let prime_it = prime
                .find(key.as_bytes())
                .expect("expire entry without a prime entry");
            let expired = expire_if_needed_parts(
                prime, expire, mcflag, stats, events, watched_keys, base, now_ms, prime_it,
            );
            if expired {
                out.deleted += 1;
            }
        }
    }

    /// Background eviction restoring the free-memory margin. A no-op
    /// outside caching mode. Returns the bytes freed.
    pub fn free_mem_with_eviction_step(&mut self, db: DbIndex, increase_goal_bytes: usize) -> usize {
        if !self.caching_mode || !self.is_db_valid(db) {
            return 0;
        }

        const MAX_BUCKETS_PER_STEP: usize = 64;

        let Self { ref mut db_arr, ref mut events, .. } = *self;
        let table = db_arr[db as usize].as_mut().expect("validated above");
        let DbTable { prime, expire, mcflag, stats, evict_cursor, .. } = &mut **table;

        let mut freed = 0usize;
        let mut evicted = 0u64;
        for _ in 0..MAX_BUCKETS_PER_STEP {
            if freed >= increase_goal_bytes {
                break;
            }
            let mut candidates: SmallVec<[SegIter; BUCKET_SLOTS]> = SmallVec::new();
            *evict_cursor = prime.traverse(*evict_cursor, &mut |it| candidates.push(it));
            for it in candidates {
                if prime.key(it).is_some_and(|k| k.sticky()) {
                    continue;
                }
                freed += evict_entry(prime, expire, mcflag, stats, it);
                evicted += 1;
                if freed >= increase_goal_bytes {
                    break;
                }
            }
        }

        if evicted > 0 {
            events.evicted_keys += evicted;
            debug!(db, evicted, freed, "background eviction step");
        }
        freed
    }

    /// Pressure eviction after an insert overran the budget: frees entries
    /// from the segment that absorbed the insert - stash buckets from the
    /// highest slot down (stash slots are oldest), then regular buckets
    /// starting at the insert's bucket, wrapping. Never the kept entry,
    /// never sticky entries.
    fn evict_objects_parts(
        prime: &mut PrimeTable,
        expire: &mut ExpireTable,
        mcflag: &mut McFlagTable,
        stats: &mut DbTableStats,
        events: &mut SliceEvents,
        memory_to_free: usize,
        keep: PrimeIterator,
    ) -> usize {
        let seg = keep.seg;
        let mut freed = 0usize;
        let mut evicted = 0u64;

        'stash: for bucket in SEG_BUCKETS..TOTAL_BUCKETS {
            for slot in (0..BUCKET_SLOTS).rev() {
                let Some(it) = prime.position_at(seg, bucket as u8, slot as u8) else {
                    continue;
                };
                if it == keep || prime.key(it).is_some_and(|k| k.sticky()) {
                    continue;
                }
                freed += evict_entry(prime, expire, mcflag, stats, it);
                evicted += 1;
                if freed > memory_to_free {
                    break 'stash;
                }
            }
        }

        if freed <= memory_to_free {
            'regular: for slot in (0..BUCKET_SLOTS).rev() {
                for offset in 0..SEG_BUCKETS {
                    let bucket = (keep.bucket as usize + offset) % SEG_BUCKETS;
                    let Some(it) = prime.position_at(seg, bucket as u8, slot as u8) else {
                        continue;
                    };
                    if it == keep || prime.key(it).is_some_and(|k| k.sticky()) {
                        continue;
                    }
                    freed += evict_entry(prime, expire, mcflag, stats, it);
                    evicted += 1;
                    if freed > memory_to_free {
                        break 'regular;
                    }
                }
            }
        }

        if evicted > 0 {
            events.evicted_keys += evicted;
            events.hard_evictions += evicted;
            debug!(evicted, freed, "pressure eviction");
        }
        freed
    }

    // ------------------------------------------------------------------
    // Intent locks
    // ------------------------------------------------------------------

    /// Acquires all locks of `args` in one call, deduplicating keys. The
    /// return is the logical AND of the per-key grants: a single contended
    /// key makes the call report "must wait" while every count is held.
    pub fn acquire(&mut self, mode: LockMode, args: &KeyLockArgs) -> bool {
        debug_assert!(!args.keys.is_empty());
        debug_assert!(args.key_step > 0);
        self.activate_db(args.db_index);
        let lt = &mut self.table_mut(args.db_index).trans_locks;

        let mut acquired = true;
        if args.keys.len() == 1 {
            acquired = lt.entry(args.keys[0].clone()).or_default().acquire(mode);
        } else {
            let mut uniq: HashSet<&[u8]> = HashSet::new();
            for i in (0..args.keys.len()).step_by(args.key_step) {
                let key = &args.keys[i];
                if uniq.insert(key.as_slice()) {
                    acquired &= lt.entry(key.clone()).or_default().acquire(mode);
                }
            }
        }

        trace!(mode = mode.name(), acquired, key = ?args.keys.first(), "acquire");
        acquired
    }

    pub fn release(&mut self, mode: LockMode, args: &KeyLockArgs) {
        debug_assert!(!args.keys.is_empty());
        trace!(mode = mode.name(), key = ?args.keys.first(), "release");

        let table = self.table_mut(args.db_index);
        if args.keys.len() == 1 {
            table.release_lock(mode, &args.keys[0], 1);
            return;
        }
        let mut uniq: HashSet<&[u8]> = HashSet::new();
        for i in (0..args.keys.len()).step_by(args.key_step) {
            let key = &args.keys[i];
            if uniq.insert(key.as_slice()) {
                table.release_lock(mode, key, 1);
            }
        }
    }

    /// Non-mutating grantability check over all keys of `args`.
    pub fn check_lock(&self, mode: LockMode, args: &KeyLockArgs) -> bool {
        let Some(table) = self.get_table(args.db_index) else {
            return true;
        };
        for i in (0..args.keys.len()).step_by(args.key_step) {
            if let Some(lock) = table.trans_locks.get(&args.keys[i]) {
                if !lock.check(mode) {
                    return false;
                }
            }
        }
        true
    }

    pub fn lock_count(&self, db: DbIndex) -> usize {
        self.get_table(db).map_or(0, |t| t.trans_locks.len())
    }

    // ------------------------------------------------------------------
    // Watched keys
    // ------------------------------------------------------------------

    pub fn register_watched_key(&mut self, db: DbIndex, key: &[u8], watcher: &Arc<ExecWatcher>) {
        self.activate_db(db);
        self.table_mut(db)
            .watched_keys
            .entry(key.to_vec())
            .or_default()
            .push(Arc::downgrade(watcher));
        watcher.record(db, key);
    }

    /// Removes every back-reference of `watcher`. Idempotent.
    pub fn unregister_connection_watches(&mut self, watcher: &Arc<ExecWatcher>) {
        for (db, key) in watcher.take_watched() {
            let Some(table) = self.db_arr.get_mut(db as usize).and_then(|t| t.as_mut()) else {
                continue;
            };
            if let Some(list) = table.watched_keys.get_mut(&key) {
                list.retain(|w| w.upgrade().is_some_and(|s| !Arc::ptr_eq(&s, watcher)));
                if list.is_empty() {
                    table.watched_keys.remove(&key);
                }
            }
        }
    }

    /// Marks every watcher of `db` dirty; used by flushes.
    pub fn invalidate_db_watches(&mut self, db: DbIndex) {
        let Some(table) = self.db_arr.get_mut(db as usize).and_then(|t| t.as_mut()) else {
            return;
        };
        for list in table.watched_keys.values() {
            for w in list {
                if let Some(watcher) = w.upgrade() {
                    watcher.dirty.store(true, Ordering::Release);
                }
            }
        }
    }

    pub fn is_key_watched(&self, db: DbIndex, key: &[u8]) -> bool {
        self.get_table(db)
            .is_some_and(|t| t.watched_keys.contains_key(key))
    }

    // ------------------------------------------------------------------
    // Change callbacks
    // ------------------------------------------------------------------

    /// Registers an ordered change callback; returns its registration
    /// version. The callback observes every mutation with version >= it.
    pub fn register_on_change(&mut self, cb: ChangeCallback) -> u64 {
        let version = self.next_version();
        self.change_cbs.push((version, cb));
        version
    }

    pub fn unregister_on_change(&mut self, id: u64) {
        match self.change_cbs.iter().position(|(ver, _)| *ver == id) {
            Some(pos) => {
                self.change_cbs.remove(pos);
            }
            None => {
                error!(id, "unregistering unknown change callback");
                debug_assert!(false, "unregistering unknown change callback {id}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Memcached flags
    // ------------------------------------------------------------------

    /// Stores the 32-bit memcached flag for a live entry; zero clears it.
    pub fn set_mc_flag(&mut self, db: DbIndex, key: &[u8], flag: u32) -> bool {
        if !self.is_db_valid(db) {
            return false;
        }
        let table = self.table_mut(db);
        let DbTable { prime, mcflag, .. } = &mut *table;
        let Some(it) = prime.find(key) else {
            return false;
        };

        if flag == 0 {
            if prime.value(it).is_some_and(|v| v.has_mc_flag()) {
                mcflag.erase_key(key);
                prime.value_mut(it).expect("found above").set_has_mc_flag(false);
            }
            return true;
        }

        let key_obj = prime.key(it).expect("found above").clone_bytes();
        let (flag_it, inserted) = mcflag
            .insert(key_obj, flag, &mut NoopPolicy)
            .expect("flag table insert cannot run out of budget");
        if !inserted {
            *mcflag.value_mut(flag_it).expect("inserted or found") = flag;
        }
        prime.value_mut(it).expect("found above").set_has_mc_flag(true);
        true
    }

    pub fn get_mc_flag(&self, db: DbIndex, key: &[u8]) -> u32 {
        let Some(table) = self.get_table(db) else {
            return 0;
        };
        table
            .mcflag
            .find(key)
            .and_then(|it| table.mcflag.value(it))
            .copied()
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn events(&self) -> &SliceEvents {
        &self.events
    }

    pub fn stats(&self) -> SliceStats {
        let mut out = SliceStats {
            db_stats: Vec::with_capacity(self.db_arr.len()),
            events: self.events,
            small_string_bytes: self.intern_pool.small_string_bytes() as u64,
        };
        for table in &self.db_arr {
            let mut db_stats = DbStats::default();
            if let Some(t) = table {
                db_stats.table = t.stats;
                db_stats.key_count = t.prime.size() as u64;
                db_stats.expire_count = t.expire.size() as u64;
                db_stats.bucket_count = t.prime.bucket_count() as u64;
                db_stats.table_mem_usage = (t.prime.mem_usage() + t.expire.mem_usage()) as u64;
            }
            out.db_stats.push(db_stats);
        }
        out
    }

    /// Total bytes attributable to this slice: table structures plus the
    /// heap footprint of keys and values.
    pub fn used_memory(&self) -> usize {
        let mut used = 0usize;
        for table in self.db_arr.iter().flatten() {
            used += table.prime.mem_usage() + table.expire.mem_usage();
            used += table.stats.obj_memory_usage as usize;
        }
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config() -> EngineConfig {
        EngineConfig { maxmemory: 256 << 20, shard_count: 1, ..Default::default() }
    }

    fn slice() -> DbSlice {
        DbSlice::with_prime_depth(0, false, &config(), 0)
    }

    fn caching_slice() -> DbSlice {
        DbSlice::with_prime_depth(0, true, &config(), 0)
    }

    #[test]
    fn add_entry_then_find_roundtrip() {
        let mut s = slice();
        let (it, inserted) = s
            .add_entry(0, b"greeting", ValueObj::string(b"hello"), 0)
            .unwrap();
        assert!(inserted);
        let found = s.find(0, b"greeting", ObjType::String).unwrap();
        assert_eq!(found, it);
        let value = s.get_table(0).unwrap().prime.value(found).unwrap();
        assert_eq!(value.str_bytes(), Some(&b"hello"[..]));
    }

    #[test]
    fn find_wrong_type_is_reported() {
        let mut s = slice();
        s.add_entry(0, b"l", ValueObj::list_from(vec![b"x".to_vec()]), 0)
            .unwrap();
        assert_eq!(s.find(0, b"l", ObjType::String), Err(OpStatus::WrongType));
        assert!(s.find(0, b"l", ObjType::List).is_ok());
    }

    #[test]
    fn find_missing_key_reports_not_found() {
        let mut s = slice();
        assert_eq!(s.find(0, b"absent", ObjType::String), Err(OpStatus::KeyNotFound));
    }

    #[test]
    fn inline_expiry_on_find() {
        let mut s = slice();
        s.update_expire_clock(1_000);
        s.add_entry(0, b"ephemeral", ValueObj::string(b"v"), 1_010)
            .unwrap();
        assert!(s.get_table(0).unwrap().expire.contains(b"ephemeral"));

        s.update_expire_clock(1_020);
        assert_eq!(s.find(0, b"ephemeral", ObjType::String), Err(OpStatus::KeyNotFound));
        assert_eq!(s.events().expired_keys, 1);
        assert!(!s.get_table(0).unwrap().expire.contains(b"ephemeral"));
        assert_eq!(s.db_size(0), 0);
    }

    #[test]
    fn expire_table_agrees_with_flag() {
        let mut s = slice();
        let (it, _) = s.add_entry(0, b"k", ValueObj::string(b"v"), 0).unwrap();
        assert!(!s.get_table(0).unwrap().expire.contains(b"k"));

        assert!(s.update_expire(0, it, 5_000));
        let t = s.get_table(0).unwrap();
        assert!(t.prime.key(it).unwrap().has_expire());
        assert!(t.expire.contains(b"k"));

        assert!(s.update_expire(0, it, 0));
        let t = s.get_table(0).unwrap();
        assert!(!t.prime.key(it).unwrap().has_expire());
        assert!(!t.expire.contains(b"k"));
    }

    #[test]
    fn set_expire_roundtrips_within_clock_precision() {
        let mut s = slice();
        s.update_expire_clock(100);
        let (it, _) = s.add_entry(0, b"k", ValueObj::string(b"v"), 0).unwrap();
        s.update_expire(0, it, 9_999);
        assert_eq!(s.expire_time(0, it), Some(9_999));
    }

    #[test]
    fn del_removes_all_side_entries() {
        let mut s = slice();
        let (it, _) = s.add_entry(0, b"k", ValueObj::string(b"v"), 7_000).unwrap();
        s.set_mc_flag(0, b"k", 42);
        assert!(s.del(0, it));
        let t = s.get_table(0).unwrap();
        assert_eq!(t.prime.size(), 0);
        assert_eq!(t.expire.size(), 0);
        assert_eq!(t.mcflag.size(), 0);
        assert_eq!(t.stats.obj_memory_usage, 0);
    }

    #[test]
    fn stats_track_entry_contributions_exactly() {
        let mut s = slice();
        let payload = vec![9u8; 100];
        s.add_entry(0, b"a", ValueObj::string(&payload), 0).unwrap();
        s.add_entry(0, b"b", ValueObj::string(b"tiny"), 0).unwrap();

        let t = s.get_table(0).unwrap();
        let mut expected = 0u64;
        let mut cursor = 0u64;
        let prime = &t.prime;
        loop {
            cursor = prime.traverse(cursor, &mut |it| {
                let (k, v) = prime.entry(it).unwrap();
                expected += (k.mem_usage() + v.malloc_used()) as u64;
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(t.stats.obj_memory_usage, expected);
        assert_eq!(t.stats.inline_keys, 2);
    }

    #[test]
    fn add_or_find_recycles_expired_entry_in_place() {
        let mut s = slice();
        s.update_expire_clock(50);
        s.add_entry(0, b"k", ValueObj::string(b"old"), 60).unwrap();
        s.update_expire_clock(100);

        let (it, inserted) = s.add_or_find(0, b"k").unwrap();
        assert!(inserted, "expired entry must be handed back as new");
        let t = s.get_table(0).unwrap();
        assert!(!t.prime.key(it).unwrap().has_expire());
        assert!(!t.expire.contains(b"k"));
        assert_eq!(t.prime.value(it).unwrap().size(), 0);
        assert_eq!(s.events().expired_keys, 1);
    }

    #[test]
    fn out_of_memory_insert_leaves_no_residue() {
        let cfg = EngineConfig { maxmemory: 1, shard_count: 1, ..Default::default() };
        let mut s = DbSlice::with_prime_depth(0, false, &cfg, 0);
        // The configured floor still applies process-wide, so force the
        // budget below zero directly, as the heartbeat would under pressure.
        s.set_cached_params(-1, 64);
        let err = s.add_or_find(0, b"k").unwrap_err();
        assert_eq!(err, OpStatus::OutOfMemory);
        let t = s.get_table(0).unwrap();
        assert_eq!(t.prime.size(), 0);
        assert_eq!(t.expire.size(), 0);
    }

    #[test]
    fn caching_mode_insert_survives_negative_budget() {
        let mut s = caching_slice();
        s.set_cached_params(-1, 64);
        let (_, inserted) = s.add_or_find(0, b"k").unwrap();
        assert!(inserted);
    }

    #[test]
    fn flush_db_preserves_locks() {
        let mut s = slice();
        s.add_entry(0, b"k", ValueObj::string(b"v"), 1_000).unwrap();
        let args = KeyLockArgs::new(0, vec![b"locked".to_vec()]);
        assert!(s.acquire(LockMode::Exclusive, &args));

        s.flush_db(0);

        let t = s.get_table(0).unwrap();
        assert_eq!(t.prime.size(), 0);
        assert_eq!(t.expire.size(), 0);
        assert_eq!(s.lock_count(0), 1);
        s.release(LockMode::Exclusive, &args);
        assert_eq!(s.lock_count(0), 0);
    }

    #[test]
    fn acquire_release_restores_lock_table() {
        let mut s = slice();
        let args = KeyLockArgs::with_step(
            0,
            vec![b"a".to_vec(), b"v1".to_vec(), b"b".to_vec(), b"v2".to_vec()],
            2,
        );
        assert!(s.acquire(LockMode::Exclusive, &args));
        assert_eq!(s.lock_count(0), 2, "values must not be locked");
        assert!(!s.check_lock(LockMode::Shared, &args));
        s.release(LockMode::Exclusive, &args);
        assert_eq!(s.lock_count(0), 0);
    }

    #[test]
    fn acquire_dedups_repeated_keys() {
        let mut s = slice();
        let args = KeyLockArgs::new(0, vec![b"k".to_vec(), b"k".to_vec(), b"k".to_vec()]);
        assert!(s.acquire(LockMode::Exclusive, &args));
        // One release of a single hold must fully free the record.
        s.release(LockMode::Exclusive, &args);
        assert_eq!(s.lock_count(0), 0);
    }

    #[test]
    fn contended_acquire_reports_must_wait_but_holds() {
        let mut s = slice();
        let a = KeyLockArgs::new(0, vec![b"k".to_vec()]);
        assert!(s.acquire(LockMode::Exclusive, &a));
        let b = KeyLockArgs::new(0, vec![b"k".to_vec(), b"free".to_vec()]);
        assert!(!s.acquire(LockMode::Shared, &b), "contended key forces wait");
        assert_eq!(s.lock_count(0), 2, "available locks are still held");
    }

    #[test]
    fn watched_key_invalidation_on_mutation() {
        let mut s = slice();
        let (it, _) = s.add_entry(0, b"w", ValueObj::string(b"v"), 0).unwrap();
        let watcher = ExecWatcher::new();
        s.register_watched_key(0, b"w", &watcher);
        assert!(s.is_key_watched(0, b"w"));

        s.pre_update(0, it);
        s.post_update(0, it, b"w", true);

        assert!(watcher.is_dirty());
        assert!(!s.is_key_watched(0, b"w"), "back-references dropped");
    }

    #[test]
    fn watched_key_invalidation_on_del_and_flush() {
        let mut s = slice();
        let (it, _) = s.add_entry(0, b"gone", ValueObj::string(b"v"), 0).unwrap();
        let w1 = ExecWatcher::new();
        s.register_watched_key(0, b"gone", &w1);
        s.del(0, it);
        assert!(w1.is_dirty());

        s.add_entry(0, b"other", ValueObj::string(b"v"), 0).unwrap();
        let w2 = ExecWatcher::new();
        s.register_watched_key(0, b"other", &w2);
        s.flush_db(0);
        assert!(w2.is_dirty());
    }

    #[test]
    fn unregister_connection_watches_is_idempotent() {
        let mut s = slice();
        s.add_entry(0, b"w", ValueObj::string(b"v"), 0).unwrap();
        let watcher = ExecWatcher::new();
        s.register_watched_key(0, b"w", &watcher);
        s.unregister_connection_watches(&watcher);
        assert!(!s.is_key_watched(0, b"w"));
        s.unregister_connection_watches(&watcher);
    }

    #[test]
    fn change_callbacks_fire_before_insert_with_key_name() {
        let mut s = slice();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.register_on_change(Box::new(move |db, req| {
            if let ChangeReq::NewKey(name) = req {
                sink.lock().push((db, name.to_vec()));
            }
        }));

        s.add_entry(0, b"fresh", ValueObj::string(b"v"), 0).unwrap();
        assert_eq!(seen.lock().as_slice(), &[(0, b"fresh".to_vec())]);
    }

    #[test]
    fn change_callbacks_observe_pre_image() {
        let mut s = slice();
        let (it, _) = s.add_entry(0, b"k", ValueObj::string(b"before"), 0).unwrap();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let id = s.register_on_change(Box::new(move |_, req| {
            if let ChangeReq::PreImage { value, .. } = req {
                sink.lock().push(value.str_bytes().unwrap().to_vec());
            }
        }));

        s.pre_update(0, it);
        *s.table_mut(0).prime.value_mut(it).unwrap() = ValueObj::string(b"after");
        s.post_update(0, it, b"k", true);

        assert_eq!(observed.lock().as_slice(), &[b"before".to_vec()]);
        s.unregister_on_change(id);
    }

    #[test]
    fn callback_registration_versions_are_monotonic() {
        let mut s = slice();
        let v1 = s.register_on_change(Box::new(|_, _| {}));
        let v2 = s.register_on_change(Box::new(|_, _| {}));
        assert!(v2 > v1);
    }

    #[test]
    fn mc_flag_side_table_roundtrip() {
        let mut s = slice();
        s.add_entry(0, b"m", ValueObj::string(b"v"), 0).unwrap();
        assert_eq!(s.get_mc_flag(0, b"m"), 0);
        assert!(s.set_mc_flag(0, b"m", 0xdead));
        assert_eq!(s.get_mc_flag(0, b"m"), 0xdead);
        assert!(s.set_mc_flag(0, b"m", 0));
        assert_eq!(s.get_mc_flag(0, b"m"), 0);
        assert_eq!(s.get_table(0).unwrap().mcflag.size(), 0);
    }

    #[test]
    fn find_first_returns_first_matching_index() {
        let mut s = slice();
        s.add_entry(0, b"second", ValueObj::list_from(vec![b"x".to_vec()]), 0)
            .unwrap();
        let (_, idx) = s
            .find_first(0, &[b"missing".as_slice(), b"second".as_slice()], ObjType::List)
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(
            s.find_first(0, &[b"missing".as_slice()], ObjType::List),
            Err(OpStatus::KeyNotFound)
        );
    }

    #[test]
    fn reaper_extends_only_on_high_delete_ratio() {
        let mut s = slice();
        s.update_expire_clock(1_000);
        for i in 0..64u32 {
            let key = format!("live-{i}");
            s.add_entry(0, key.as_bytes(), ValueObj::string(b"v"), 1_000_000)
                .unwrap();
        }
        let result = s.delete_expired_step(0, 90);
        assert_eq!(result.deleted, 0);
        assert!(result.survivor_ttl_sum > 0);

        // All sampled dead: the reaper should extend to the full count.
        let mut s = slice();
        s.update_expire_clock(1_000);
        for i in 0..512u32 {
            let key = format!("dead-{i}");
            s.add_entry(0, key.as_bytes(), ValueObj::string(b"v"), 1_001)
                .unwrap();
        }
        s.update_expire_clock(10_000);
        let before = s.db_size(0);
        let result = s.delete_expired_step(0, 60);
        assert!(result.deleted > 0);
        assert!(s.db_size(0) < before);
        assert_eq!(s.events().expired_keys, result.deleted);
    }

    #[test]
    fn stale_iterator_reports_wrong_key_epoch() {
        let mut s = slice();
        let (it, _) = s.add_entry(0, b"pinned", ValueObj::string(b"v"), 0).unwrap();
        assert!(s.check_iterator(0, it).is_ok());
        // Force a structural change by growing the table.
        s.reserve(0, crate::config::SEGMENT_SLOTS * 4);
        assert_eq!(s.check_iterator(0, it), Err(OpStatus::WrongKeyEpoch));
    }

    #[test]
    fn flush_all_flushes_every_database() {
        let mut s = slice();
        s.activate_db(2);
        s.add_entry(0, b"a", ValueObj::string(b"v"), 0).unwrap();
        s.add_entry(2, b"b", ValueObj::string(b"v"), 0).unwrap();
        s.flush_all();
        assert_eq!(s.db_size(0), 0);
        assert_eq!(s.db_size(2), 0);
    }

    #[test]
    fn bump_up_is_suppressed_for_sticky_keys() {
        let mut s = caching_slice();
        s.add_entry(0, b"pinned", ValueObj::string(b"v"), 0).unwrap();
        s.set_sticky(0, b"pinned", true);
        s.find(0, b"pinned", ObjType::String).unwrap();
        assert_eq!(s.events().bumpups, 0);

        s.set_sticky(0, b"pinned", false);
        s.find(0, b"pinned", ObjType::String).unwrap();
        assert_eq!(s.events().bumpups, 1);
    }

    #[test]
    fn bump_ups_are_counted_in_caching_mode() {
        let mut s = caching_slice();
        s.add_entry(0, b"hot", ValueObj::string(b"v"), 0).unwrap();
        s.find(0, b"hot", ObjType::String).unwrap();
        assert_eq!(s.events().bumpups, 1);

        let drops = Arc::new(AtomicUsize::new(0));
        let sink = drops.clone();
        s.register_on_change(Box::new(move |_, req| {
            if matches!(req, ChangeReq::PreImage { .. }) {
                sink.fetch_add(1, Ordering::Relaxed);
            }
        }));
        s.find(0, b"hot", ObjType::String).unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 1, "pre-bump callback fired");
    }
}
