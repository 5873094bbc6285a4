//! # Eviction and GC Policy Tests
//!
//! Boundary behavior of the insertion-time policies under a constrained
//! memory budget:
//!
//! 1. GC before growth: expired entries are reclaimed in place of a
//!    segment split when the budget vetoes growth.
//! 2. Sticky exemption: no eviction path ever removes a sticky entry.
//! 3. Pressure eviction: an over-budget insert frees other entries and
//!    raises the hard-eviction counters.
//! 4. Split gating: a full segment splits iff the policy admits growth.

use swiftkv::config::{EngineConfig, BUCKET_SLOTS, SEGMENT_SLOTS, SEG_BUCKETS, STASH_BUCKETS};
use swiftkv::slice::DbSlice;
use swiftkv::table::hash_key;
use swiftkv::{ObjType, ValueObj};

fn config() -> EngineConfig {
    EngineConfig { maxmemory: 256 << 20, shard_count: 1, ..Default::default() }
}

/// Keys whose home bucket (at table depth 0) is `bucket`, so they probe
/// one known bucket chain: home, neighbor, then the stash buckets.
fn keys_for_bucket(bucket: u64, count: usize) -> Vec<String> {
    let mut keys = Vec::with_capacity(count);
    let mut i = 0u64;
    while keys.len() < count {
        let key = format!("probe-{i:08}");
        if hash_key(key.as_bytes()) % SEG_BUCKETS as u64 == bucket {
            keys.push(key);
        }
        i += 1;
    }
    keys
}

#[test]
fn gc_reclaims_expired_entries_instead_of_splitting() {
    let mut s = DbSlice::with_prime_depth(0, false, &config(), 0);
    s.update_expire_clock(1_000);

    // Fill one bucket chain completely: home and neighbor half expired,
    // half live, then every stash slot with expiring keys.
    let chain = 2 * BUCKET_SLOTS + STASH_BUCKETS * BUCKET_SLOTS;
    let keys = keys_for_bucket(0, chain);
    for (i, key) in keys.iter().enumerate() {
        let expire_at = if i >= 2 * BUCKET_SLOTS || i % 2 == 0 { 1_500 } else { 0 };
        s.add_entry(0, key.as_bytes(), ValueObj::string(b"v"), expire_at)
            .unwrap();
    }
    assert_eq!(s.get_table(0).unwrap().prime().segment_count(), 1);
    let dead_in_regular = (2 * BUCKET_SLOTS).div_ceil(2) as u64;

    // Advance past the TTLs and deny growth: the next insert into this
    // chain must reclaim the expired entries rather than split.
    s.update_expire_clock(10_000);
    s.set_cached_params(1_000, 64);

    let trigger = keys_for_bucket(0, chain + 1).pop().unwrap();
    s.add_entry(0, trigger.as_bytes(), ValueObj::string(b"v"), 0)
        .unwrap();

    let table = s.get_table(0).unwrap();
    assert_eq!(table.prime().segment_count(), 1, "GC made room without a split");
    assert_eq!(s.events().garbage_collected, dead_in_regular);
    assert!(s.events().garbage_checked >= s.events().garbage_collected);
    // The GC pass scans regular buckets only; stash entries stay put.
    assert_eq!(
        table.expire().size() as usize,
        STASH_BUCKETS * BUCKET_SLOTS
    );
    assert!(s.find(0, trigger.as_bytes(), ObjType::String).is_ok());
    for (i, key) in keys.iter().enumerate().take(2 * BUCKET_SLOTS) {
        if i % 2 == 1 {
            assert!(
                s.find(0, key.as_bytes(), ObjType::String).is_ok(),
                "live key {key} lost"
            );
        }
    }
}

#[test]
fn eviction_never_selects_sticky_entries() {
    let mut s = DbSlice::with_prime_depth(0, true, &config(), 0);
    s.update_expire_clock(1_000);

    let payload = vec![1u8; 128];
    for i in 0..500u32 {
        let key = format!("key-{i:04}");
        s.add_entry(0, key.as_bytes(), ValueObj::string(&payload), 0)
            .unwrap();
        if i % 2 == 0 {
            s.set_sticky(0, key.as_bytes(), true);
        }
    }

    // Drive the budget negative so the next inserts trigger stash and
    // pressure eviction.
    s.set_cached_params(-4_000, 64);
    for i in 0..8u32 {
        let key = format!("trigger-{i}");
        s.add_entry(0, key.as_bytes(), ValueObj::string(&payload), 0)
            .unwrap();
        s.set_cached_params(-4_000, 64);
    }

    assert!(s.events().evicted_keys > 0, "pressure must evict something");
    for i in (0..500u32).step_by(2) {
        let key = format!("key-{i:04}");
        assert!(
            s.find(0, key.as_bytes(), ObjType::String).is_ok(),
            "sticky key {key} was evicted"
        );
    }
}

#[test]
fn pressure_eviction_raises_hard_eviction_counters() {
    let mut s = DbSlice::with_prime_depth(0, true, &config(), 0);
    let payload = vec![2u8; 256];
    for i in 0..200u32 {
        let key = format!("filler-{i:04}");
        s.add_entry(0, key.as_bytes(), ValueObj::string(&payload), 0)
            .unwrap();
    }

    s.set_cached_params(-2_000, 64);
    s.add_entry(0, b"straw", ValueObj::string(&payload), 0).unwrap();

    let events = s.events();
    assert!(events.hard_evictions > 0);
    assert!(events.evicted_keys >= events.hard_evictions);
    assert!(
        s.find(0, b"straw", ObjType::String).is_ok(),
        "the entry that triggered eviction must survive"
    );
}

#[test]
fn full_segment_splits_only_when_growth_is_admitted() {
    // Generous budget: the table grows freely.
    let mut s = DbSlice::with_prime_depth(0, false, &config(), 0);
    for i in 0..SEGMENT_SLOTS + 64 {
        let key = format!("grow-{i:06}");
        s.add_entry(0, key.as_bytes(), ValueObj::string(b"v"), 0)
            .unwrap();
    }
    assert!(s.get_table(0).unwrap().prime().segment_count() > 1);

    // Denied budget, nothing expired, nothing evictable: inserts fail
    // once the probe paths fill, and the table must not have grown.
    let mut s = DbSlice::with_prime_depth(0, false, &config(), 0);
    s.set_cached_params(1_000, 64);
    let mut failed = false;
    for i in 0..SEGMENT_SLOTS + 1 {
        let key = format!("deny-{i:06}");
        if s.add_entry(0, key.as_bytes(), ValueObj::string(b"v"), 0).is_err() {
            failed = true;
            break;
        }
    }
    assert!(failed, "denied growth must surface OutOfMemory");
    assert_eq!(s.get_table(0).unwrap().prime().segment_count(), 1);
}
