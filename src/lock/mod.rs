//! Row-level lock manager: real shared / upgradable / exclusive locking
//! keyed by `(index_id, key)`, bucketed by the same Wang-Jenkins scrambler
//! [`crate::hash`] uses for the node cache's hash table, with deadlock
//! detection via a wait-for graph walk.
//!
//! These are the locks that actually gate concurrent writers: a
//! [`crate::txn::Transaction`] holds its row locks for its entire lifetime,
//! so two transactions touching disjoint keys run fully concurrently, and
//! two touching the same key in conflicting modes block (or deadlock) here
//! rather than ever reaching the B-tree. The registry's own lock is taken
//! only for the brief span of one structural mutation (see DESIGN.md).

pub mod deadlock;

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::{IndexId, Key, TxnId};
use crate::error::{DeadlockSet, Error, LockInfo, Result};
use crate::hash::{combine, hash_bytes};

use deadlock::WaitForGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Upgradable,
    Exclusive,
}

#[derive(Default)]
struct LockState {
    shared: HashSet<TxnId>,
    upgradable: Option<TxnId>,
    exclusive: Option<TxnId>,
}

impl LockState {
    /// Returns the id of a conflicting owner, if `txn` can't be granted
    /// `mode` right now.
    fn conflict(&self, txn: TxnId, mode: LockMode) -> Option<TxnId> {
        match mode {
            LockMode::Shared => self.exclusive.filter(|&o| o != txn),
            LockMode::Upgradable => self
                .exclusive
                .filter(|&o| o != txn)
                .or_else(|| self.upgradable.filter(|&o| o != txn)),
            LockMode::Exclusive => self
                .exclusive
                .filter(|&o| o != txn)
                .or_else(|| self.upgradable.filter(|&o| o != txn))
                .or_else(|| self.shared.iter().find(|&&o| o != txn).copied()),
        }
    }

    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.insert(txn);
            }
            LockMode::Upgradable => {
                self.upgradable = Some(txn);
            }
            LockMode::Exclusive => {
                self.shared.remove(&txn);
                if self.upgradable == Some(txn) {
                    self.upgradable = None;
                }
                self.exclusive = Some(txn);
            }
        }
    }

    fn release(&mut self, txn: TxnId) {
        self.shared.remove(&txn);
        if self.upgradable == Some(txn) {
            self.upgradable = None;
        }
        if self.exclusive == Some(txn) {
            self.exclusive = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.upgradable.is_none() && self.exclusive.is_none()
    }
}

struct Bucket {
    locks: Mutex<HashMap<(IndexId, Key), LockState>>,
    cv: Condvar,
}

/// Buckets lock state by `(index_id, key_hash, key)`. Each bucket is an
/// independent `Mutex` + `Condvar` pair so unrelated keys never contend with
/// one another.
pub struct LockManager {
    buckets: Vec<Bucket>,
    waits: Mutex<WaitForGraph>,
    attachments: Mutex<HashMap<TxnId, String>>,
}

impl LockManager {
    pub fn new(bucket_count: usize) -> LockManager {
        let n = bucket_count.max(1);
        LockManager {
            buckets: (0..n).map(|_| Bucket { locks: Mutex::new(HashMap::new()), cv: Condvar::new() }).collect(),
            waits: Mutex::new(WaitForGraph::new()),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    /// Associates a human-readable name with a transaction id, surfaced in
    /// `Error::Deadlock`/`Error::LockTimeout` for diagnostics.
    pub fn set_attachment(&self, txn: TxnId, name: impl Into<String>) {
        self.attachments.lock().unwrap().insert(txn, name.into());
    }

    pub fn clear_attachment(&self, txn: TxnId) {
        self.attachments.lock().unwrap().remove(&txn);
    }

    fn bucket_for(&self, index_id: IndexId, key: &[u8]) -> &Bucket {
        let h = combine(index_id, hash_bytes(key));
        &self.buckets[h as usize % self.buckets.len()]
    }

    fn attachment_of(&self, txn: TxnId) -> Option<String> {
        self.attachments.lock().unwrap().get(&txn).cloned()
    }

    fn build_deadlock(&self, index_id: IndexId, key: &[u8], cycle: Vec<TxnId>) -> Error {
        let attachments = self.attachments.lock().unwrap();
        let surviving = cycle.first().and_then(|t| attachments.get(t).cloned());
        let participants = cycle
            .into_iter()
            .map(|t| LockInfo { index_id, key: key.to_vec(), owner_attachment: attachments.get(&t).cloned() })
            .collect();
        Error::Deadlock(DeadlockSet { participants, surviving_owner_attachment: surviving })
    }

    fn acquire(&self, txn: TxnId, index_id: IndexId, key: &[u8], mode: LockMode, timeout: Duration) -> Result<()> {
        let bucket = self.bucket_for(index_id, key);
        let bucket_key = (index_id, key.to_vec());
        let deadline = Instant::now() + timeout;
        let mut locks = bucket.locks.lock().unwrap();
        loop {
            let conflict = locks.entry(bucket_key.clone()).or_default().conflict(txn, mode);
            match conflict {
                None => {
                    locks.entry(bucket_key.clone()).or_default().grant(txn, mode);
                    self.waits.lock().unwrap().remove_wait(txn);
                    return Ok(());
                }
                Some(owner) => {
                    {
                        let mut waits = self.waits.lock().unwrap();
                        if let Some(cycle) = waits.would_cycle(txn, owner) {
                            waits.remove_wait(txn);
                            drop(waits);
                            return Err(self.build_deadlock(index_id, key, cycle));
                        }
                        waits.add_wait(txn, owner);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        self.waits.lock().unwrap().remove_wait(txn);
                        return Err(Error::LockTimeout {
                            nanos: timeout.as_nanos() as i64,
                            attachment: self.attachment_of(owner),
                        });
                    }
                    let (guard, result) = bucket.cv.wait_timeout(locks, deadline.duration_since(now)).unwrap();
                    locks = guard;
                    if result.timed_out() {
                        self.waits.lock().unwrap().remove_wait(txn);
                        return Err(Error::LockTimeout {
                            nanos: timeout.as_nanos() as i64,
                            attachment: self.attachment_of(owner),
                        });
                    }
                }
            }
        }
    }

    pub fn lock_shared(&self, txn: TxnId, index_id: IndexId, key: &[u8], timeout: Duration) -> Result<()> {
        self.acquire(txn, index_id, key, LockMode::Shared, timeout)
    }

    pub fn lock_upgradable(&self, txn: TxnId, index_id: IndexId, key: &[u8], timeout: Duration) -> Result<()> {
        self.acquire(txn, index_id, key, LockMode::Upgradable, timeout)
    }

    pub fn lock_exclusive(&self, txn: TxnId, index_id: IndexId, key: &[u8], timeout: Duration) -> Result<()> {
        self.acquire(txn, index_id, key, LockMode::Exclusive, timeout)
    }

    /// Releases whatever lock `txn` holds on `(index_id, key)`, if any.
    pub fn unlock(&self, txn: TxnId, index_id: IndexId, key: &[u8]) {
        let bucket = self.bucket_for(index_id, key);
        let bucket_key = (index_id, key.to_vec());
        let mut locks = bucket.locks.lock().unwrap();
        if let Some(state) = locks.get_mut(&bucket_key) {
            state.release(txn);
            if state.is_empty() {
                locks.remove(&bucket_key);
            }
        }
        drop(locks);
        bucket.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_locks_do_not_conflict() {
        let mgr = LockManager::new(4);
        mgr.lock_shared(1, 0, b"k", Duration::from_millis(100)).unwrap();
        mgr.lock_shared(2, 0, b"k", Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn exclusive_blocks_until_timeout() {
        let mgr = LockManager::new(4);
        mgr.lock_exclusive(1, 0, b"k", Duration::from_millis(100)).unwrap();
        let err = mgr.lock_exclusive(2, 0, b"k", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
    }

    #[test]
    fn unlock_wakes_waiter() {
        let mgr = Arc::new(LockManager::new(4));
        mgr.lock_exclusive(1, 0, b"k", Duration::from_millis(500)).unwrap();
        let mgr2 = mgr.clone();
        let handle = thread::spawn(move || mgr2.lock_exclusive(2, 0, b"k", Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(30));
        mgr.unlock(1, 0, b"k");
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn two_cycle_deadlock_is_detected() {
        let mgr = Arc::new(LockManager::new(4));
        mgr.lock_exclusive(1, 0, b"a", Duration::from_secs(5)).unwrap();
        mgr.lock_exclusive(2, 0, b"b", Duration::from_secs(5)).unwrap();

        let mgr_a = mgr.clone();
        let t1 = thread::spawn(move || mgr_a.lock_exclusive(1, 0, b"b", Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));

        let err = mgr.lock_exclusive(2, 0, b"a", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Deadlock(_)));

        mgr.unlock(1, 0, b"a");
        mgr.unlock(2, 0, b"b");
        let _ = t1.join();
    }
}
