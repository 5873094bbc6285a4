//! # DbSlice Integration Tests
//!
//! End-to-end behavior of the per-shard data surface, exercised through
//! the public API only.
//!
//! ## Test Coverage
//!
//! 1. Structural invariants
//!    - prime/expire agreement under mixed workloads
//!    - stats counters as exact per-entry sums
//!    - lock table round trips
//!
//! 2. Watched keys (optimistic concurrency)
//!    - invalidation on mutation and removal from the registry
//!
//! 3. Tiered storage hook
//!    - external value freed through pre_update
//!
//! 4. Memcached flag side table

use swiftkv::config::EngineConfig;
use swiftkv::lock::LockMode;
use swiftkv::object::ExternalPtr;
use swiftkv::slice::{DbSlice, ExecWatcher};
use swiftkv::tiered::TieredStorage;
use swiftkv::types::KeyLockArgs;
use swiftkv::{ObjType, ValueObj};

fn config() -> EngineConfig {
    EngineConfig { maxmemory: 256 << 20, shard_count: 1, ..Default::default() }
}

fn slice() -> DbSlice {
    DbSlice::with_prime_depth(0, false, &config(), 0)
}

/// Walks the prime table and checks the paired-table invariant plus the
/// stats sums against per-entry contributions.
fn assert_invariants(s: &DbSlice, db: u32) {
    let table = s.get_table(db).expect("db exists");
    let prime = table.prime();
    let expire = table.expire();

    let mut expire_flagged = 0usize;
    let mut heap_bytes = 0u64;
    let mut inline_keys = 0u64;
    let mut cursor = 0u64;
    loop {
        cursor = prime.traverse(cursor, &mut |it| {
            let (k, v) = prime.entry(it).expect("busy slot");
            if k.has_expire() {
                expire_flagged += 1;
                assert!(
                    expire.contains(k.as_bytes()),
                    "flagged key missing from expire table"
                );
            } else {
                assert!(
                    !expire.contains(k.as_bytes()),
                    "unflagged key present in expire table"
                );
            }
            inline_keys += k.is_inline() as u64;
            heap_bytes += (k.mem_usage() + v.malloc_used()) as u64;
        });
        if cursor == 0 {
            break;
        }
    }

    assert_eq!(expire_flagged, expire.size(), "orphan expire entries");
    assert_eq!(table.table_stats().obj_memory_usage, heap_bytes);
    assert_eq!(table.table_stats().inline_keys, inline_keys);
}

#[test]
fn invariants_hold_under_mixed_workload() {
    let mut s = slice();
    s.update_expire_clock(1_000);

    for i in 0..300u32 {
        let key = format!("key-{i}");
        let expire_at = if i % 3 == 0 || i % 5 == 0 { 5_000 } else { 0 };
        let value = if i % 2 == 0 {
            ValueObj::string(format!("value-{i}").as_bytes())
        } else {
            ValueObj::list_from(vec![b"a".to_vec(), b"b".to_vec()])
        };
        s.add_entry(0, key.as_bytes(), value, expire_at).unwrap();
    }
    assert_invariants(&s, 0);

    // Delete a third, clear some expiries, change others.
    for i in (0..300u32).step_by(3) {
        let key = format!("key-{i}");
        if i % 2 == 0 {
            let (it, _) = s.find_ext(0, key.as_bytes());
            s.del(0, it.unwrap());
        } else {
            let (it, _) = s.find_ext(0, key.as_bytes());
            s.update_expire(0, it.unwrap(), 0);
        }
    }
    assert_invariants(&s, 0);

    // Expire everything left that has a TTL.
    s.update_expire_clock(1_000_000);
    for i in 0..300u32 {
        let key = format!("key-{i}");
        let _ = s.find(0, key.as_bytes(), ObjType::String);
    }
    assert_invariants(&s, 0);
    assert_eq!(s.get_table(0).unwrap().expire().size(), 0);
}

#[test]
fn lock_round_trip_restores_prior_state() {
    let mut s = slice();
    let args = KeyLockArgs::new(0, vec![b"x".to_vec(), b"y".to_vec()]);

    assert!(s.acquire(LockMode::Shared, &args));
    assert!(s.acquire(LockMode::Shared, &args), "shared is self-compatible");
    assert!(!s.check_lock(LockMode::Exclusive, &args));

    s.release(LockMode::Shared, &args);
    s.release(LockMode::Shared, &args);
    assert_eq!(s.lock_count(0), 0);
    assert!(s.check_lock(LockMode::Exclusive, &args));
}

#[test]
fn locks_exist_independent_of_entries() {
    let mut s = slice();
    // Lock a key that has no prime entry at all.
    let args = KeyLockArgs::new(0, vec![b"ghost".to_vec()]);
    assert!(s.acquire(LockMode::Exclusive, &args));
    assert_eq!(s.db_size(0), 0);
    assert_eq!(s.lock_count(0), 1);
    s.release(LockMode::Exclusive, &args);
}

#[test]
fn watched_session_goes_dirty_on_write() {
    let mut s = slice();
    s.add_entry(0, b"balance", ValueObj::string(b"100"), 0).unwrap();

    let session = ExecWatcher::new();
    s.register_watched_key(0, b"balance", &session);
    assert!(!session.is_dirty());

    let (it, _) = s.find_ext(0, b"balance");
    let it = it.unwrap();
    s.pre_update(0, it);
    *s.value_mut(0, it).unwrap() = ValueObj::string(b"90");
    s.post_update(0, it, b"balance", true);

    assert!(session.is_dirty());
    assert!(!s.is_key_watched(0, b"balance"));
}

#[test]
fn watched_session_goes_dirty_on_expiry() {
    let mut s = slice();
    s.update_expire_clock(100);
    s.add_entry(0, b"session", ValueObj::string(b"v"), 150).unwrap();

    let session = ExecWatcher::new();
    s.register_watched_key(0, b"session", &session);

    s.update_expire_clock(200);
    assert!(s.find(0, b"session", ObjType::String).is_err());
    assert!(session.is_dirty());
}

#[test]
fn external_value_is_freed_on_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("tier");
    let mut s = slice();
    s.set_tiered(TieredStorage::open(&prefix, 0).unwrap());

    let (it, _) = s.add_entry(0, b"cold", ValueObj::string(b""), 0).unwrap();
    let offset = s.tiered_mut().unwrap().reserve(64 << 10).unwrap();
    s.tiered_mut().unwrap().write(offset, &vec![7u8; 64 << 10]).unwrap();

    s.pre_update(0, it);
    *s.value_mut(0, it).unwrap() =
        ValueObj::external(ExternalPtr { offset, size: 64 << 10 });
    s.post_update(0, it, b"cold", true);

    let table_stats = *s.get_table(0).unwrap().table_stats();
    assert_eq!(table_stats.external_entries, 1);
    assert_eq!(table_stats.external_size, 64 << 10);
    let reserved_before = s.tiered_mut().unwrap().stats().storage_reserved;
    assert!(reserved_before > 0);

    // Overwriting the externalized value must free the blob.
    s.pre_update(0, it);
    *s.value_mut(0, it).unwrap() = ValueObj::string(b"warm");
    s.post_update(0, it, b"cold", true);

    let table_stats = *s.get_table(0).unwrap().table_stats();
    assert_eq!(table_stats.external_entries, 0);
    assert_eq!(table_stats.external_size, 0);
    let reserved_after = s.tiered_mut().unwrap().stats().storage_reserved;
    assert!(reserved_after < reserved_before);
}

#[test]
fn mc_flag_follows_entry_lifetime() {
    let mut s = slice();
    s.update_expire_clock(100);
    s.add_entry(0, b"memc", ValueObj::string(b"v"), 150).unwrap();
    s.set_mc_flag(0, b"memc", 7);
    assert_eq!(s.get_mc_flag(0, b"memc"), 7);

    // Expiry removes the flag entry together with the prime entry.
    s.update_expire_clock(200);
    assert!(s.find(0, b"memc", ObjType::String).is_err());
    assert_eq!(s.get_mc_flag(0, b"memc"), 0);
    assert_eq!(s.get_table(0).unwrap().mcflag().size(), 0);
}

#[test]
fn stats_report_covers_all_databases() {
    let mut s = slice();
    s.activate_db(3);
    s.add_entry(0, b"a", ValueObj::string(b"v"), 0).unwrap();
    s.add_entry(3, b"b", ValueObj::string(b"v"), 1_000_000).unwrap();

    let stats = s.stats();
    assert_eq!(stats.db_stats.len(), 4);
    assert_eq!(stats.db_stats[0].key_count, 1);
    assert_eq!(stats.db_stats[3].key_count, 1);
    assert_eq!(stats.db_stats[3].expire_count, 1);
    assert!(stats.db_stats[0].table_mem_usage > 0);
}

#[test]
fn sticky_flag_survives_api_round_trip() {
    let mut s = slice();
    s.add_entry(0, b"pin", ValueObj::string(b"v"), 0).unwrap();
    assert!(s.set_sticky(0, b"pin", true));
    let it = s.find(0, b"pin", ObjType::String).unwrap();
    assert!(s.get_table(0).unwrap().prime().key(it).unwrap().sticky());
    assert!(s.set_sticky(0, b"pin", false));
    assert!(!s.set_sticky(0, b"absent", true));
}
