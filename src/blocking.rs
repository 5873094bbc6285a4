//! # Blocking Controller
//!
//! Lazily-created per-shard structure tracking transactions parked on keys
//! of blocking commands (BLPOP-style). Writers notify it after
//! `post_update`; it picks the earliest (lowest txid) parked transaction
//! whose key just became ready, flips it to the awaked state and hands it
//! back to the shard runtime, which re-arms it through the task queue.
//!
//! Deadlines are tracked in a side index keyed by `(deadline_ms, txid)`;
//! the heartbeat drains due entries and resumes them with the expired flag
//! set so the transaction completes with a "timed out" outcome. There is
//! no pre-emptive cancellation of in-flight work.
//!
//! The controller holds only weak references; the coordinator owns the
//! transactions. Dead weaks are pruned lazily.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use tracing::trace;

use crate::txn::{Transaction, AWAKED_Q};
use crate::types::{DbIndex, ShardId, TxId};

type KeyWaiters = BTreeMap<TxId, Weak<Transaction>>;

pub struct BlockingController {
    shard_id: ShardId,
    watched: HashMap<DbIndex, HashMap<Vec<u8>, KeyWaiters>>,
    /// Reverse index so `remove` does not scan every key.
    registered: HashMap<TxId, Vec<(DbIndex, Vec<u8>)>>,
    deadlines: BTreeMap<(u64, TxId), Weak<Transaction>>,
    awaked: Vec<Weak<Transaction>>,
}

impl BlockingController {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            watched: HashMap::new(),
            registered: HashMap::new(),
            deadlines: BTreeMap::new(),
            awaked: Vec::new(),
        }
    }

    /// Parks `trans` on `keys` of `db`, optionally with a wall-clock
    /// deadline in shard-clock milliseconds.
    pub fn add_watched(
        &mut self,
        db: DbIndex,
        keys: &[&[u8]],
        deadline_ms: Option<u64>,
        trans: &Arc<Transaction>,
    ) {
        let txid = trans.txid();
        trans.set_mask(self.shard_id, crate::txn::SUSPENDED_Q);

        let per_db = self.watched.entry(db).or_default();
        let reg = self.registered.entry(txid).or_default();
        for key in keys {
            per_db
                .entry(key.to_vec())
                .or_default()
                .insert(txid, Arc::downgrade(trans));
            reg.push((db, key.to_vec()));
        }
        if let Some(at) = deadline_ms {
            self.deadlines.insert((at, txid), Arc::downgrade(trans));
        }
        trace!(txid, db, keys = keys.len(), "transaction parked");
    }

    /// Forgets every registration of `trans`. Idempotent.
    pub fn remove(&mut self, trans: &Arc<Transaction>) {
        let txid = trans.txid();
        let Some(entries) = self.registered.remove(&txid) else {
            return;
        };
        for (db, key) in entries {
            if let Some(per_db) = self.watched.get_mut(&db) {
                if let Some(waiters) = per_db.get_mut(&key) {
                    waiters.remove(&txid);
                    if waiters.is_empty() {
                        per_db.remove(&key);
                    }
                }
                if per_db.is_empty() {
                    self.watched.remove(&db);
                }
            }
        }
        self.deadlines.retain(|&(_, t), _| t != txid);
    }

    /// A writer made `key` ready: wakes the earliest parked transaction,
    /// stamping it with the shard's committed txid. The caller re-arms the
    /// returned transaction through the shard task queue.
    pub fn notify_key_ready(
        &mut self,
        db: DbIndex,
        key: &[u8],
        committed_txid: TxId,
    ) -> Option<Arc<Transaction>> {
        let per_db = self.watched.get_mut(&db)?;
        let waiters = per_db.get_mut(key)?;

        // Earliest live waiter wins; dead weaks are dropped on the way.
        let mut woken = None;
        while let Some((&txid, weak)) = waiters.iter().next() {
            match weak.upgrade() {
                Some(t) => {
                    woken = Some((txid, t));
                    break;
                }
                None => {
                    waiters.remove(&txid);
                }
            }
        }
        let (txid, trans) = woken?;

        trans.set_awaked(self.shard_id, committed_txid);
        self.awaked.push(Arc::downgrade(&trans));
        trace!(txid, db, "transaction awaked by writer");

        self.remove(&trans);
        Some(trans)
    }

    /// Drains deadlines due at `now_ms`; each returned transaction is
    /// awaked with the expired flag set.
    pub fn notify_deadlines(&mut self, now_ms: u64, committed_txid: TxId) -> Vec<Arc<Transaction>> {
        let mut due = Vec::new();
        while let Some((&(at, txid), weak)) = self.deadlines.iter().next() {
            if at > now_ms {
                break;
            }
            let weak = weak.clone();
            self.deadlines.remove(&(at, txid));
            if let Some(trans) = weak.upgrade() {
                trans.set_expired(self.shard_id);
                trans.set_awaked(self.shard_id, committed_txid);
                self.awaked.push(Arc::downgrade(&trans));
                trace!(txid, at, "blocking deadline fired");
                self.remove(&trans);
                due.push(trans);
            }
        }
        due
    }

    /// Whether an awaked transaction exists that has not run yet. The
    /// queue-head path is skipped while one is pending.
    pub fn has_awaked_transaction(&mut self) -> bool {
        self.awaked.retain(|w| {
            w.upgrade()
                .is_some_and(|t| t.local_mask(self.shard_id) & AWAKED_Q != 0)
        });
        !self.awaked.is_empty()
    }

    /// Keys of `db` with at least one parked transaction.
    pub fn get_watched_keys(&self, db: DbIndex) -> Vec<Vec<u8>> {
        self.watched
            .get(&db)
            .map(|per_db| per_db.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{RunOutcome, EXPIRED_Q, SUSPENDED_Q};

    fn trans(txid: TxId) -> Arc<Transaction> {
        Transaction::new(txid, 1, Box::new(|_, _| RunOutcome::Done))
    }

    #[test]
    fn wake_picks_lowest_txid() {
        let mut bc = BlockingController::new(0);
        let t5 = trans(5);
        let t3 = trans(3);
        bc.add_watched(0, &[b"list".as_slice()], None, &t5);
        bc.add_watched(0, &[b"list".as_slice()], None, &t3);

        let woken = bc.notify_key_ready(0, b"list", 10).unwrap();
        assert_eq!(woken.txid(), 3);
        assert_eq!(woken.notify_txid(), 10);
        assert!(bc.has_awaked_transaction());

        let next = bc.notify_key_ready(0, b"list", 11).unwrap();
        assert_eq!(next.txid(), 5);
        assert!(bc.notify_key_ready(0, b"list", 12).is_none());
    }

    #[test]
    fn parked_transaction_is_suspended() {
        let mut bc = BlockingController::new(0);
        let t = trans(1);
        bc.add_watched(0, &[b"k".as_slice()], None, &t);
        assert_ne!(t.local_mask(0) & SUSPENDED_Q, 0);
        assert_eq!(bc.get_watched_keys(0), vec![b"k".to_vec()]);
    }

    #[test]
    fn deadline_fires_with_expired_flag() {
        let mut bc = BlockingController::new(0);
        let t = trans(7);
        bc.add_watched(0, &[b"k".as_slice()], Some(1_000), &t);

        assert!(bc.notify_deadlines(999, 4).is_empty());
        let due = bc.notify_deadlines(1_000, 4);
        assert_eq!(due.len(), 1);
        assert_ne!(t.local_mask(0) & EXPIRED_Q, 0);
        assert!(t.is_armed_in_shard(0));
        assert!(bc.get_watched_keys(0).is_empty(), "registration removed");
    }

    #[test]
    fn remove_is_idempotent_and_clears_deadlines() {
        let mut bc = BlockingController::new(0);
        let t = trans(2);
        bc.add_watched(0, &[b"a".as_slice(), b"b".as_slice()], Some(500), &t);
        bc.remove(&t);
        bc.remove(&t);
        assert!(bc.get_watched_keys(0).is_empty());
        assert!(bc.notify_deadlines(1_000, 0).is_empty());
    }

    #[test]
    fn dead_waiters_are_pruned() {
        let mut bc = BlockingController::new(0);
        {
            let t = trans(9);
            bc.add_watched(0, &[b"k".as_slice()], None, &t);
        }
        assert!(bc.notify_key_ready(0, b"k", 1).is_none());
        assert!(!bc.has_awaked_transaction());
    }
}
