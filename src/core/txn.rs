//! Purpose: Hand out snapshot timestamps and commit write transactions atomically.
//! Exports: `TransactionManager`, `Transaction`, `CommitStamp`, `StampState`.
//! Role: Minimal MVCC clock for the block store; not a full concurrency-control layer.
//! Invariants: A transaction sees exactly the versions committed at or before its start.
//! Invariants: All versions of one transaction become visible at a single instant.
//! Invariants: A transaction dropped without commit is aborted and deregistered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::core::error::{Error, ErrorKind};

const UNCOMMITTED: u64 = u64::MAX;
const ABORTED: u64 = u64::MAX - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StampState {
    Pending,
    Aborted,
    Committed(u64),
}

/// Commit timestamp shared by every version a transaction writes.
#[derive(Debug)]
pub struct CommitStamp(AtomicU64);

impl CommitStamp {
    fn pending() -> Self {
        Self(AtomicU64::new(UNCOMMITTED))
    }

    #[cfg(test)]
    pub(crate) fn committed(ts: u64) -> Self {
        Self(AtomicU64::new(ts))
    }

    pub fn state(&self) -> StampState {
        match self.0.load(Ordering::Acquire) {
            UNCOMMITTED => StampState::Pending,
            ABORTED => StampState::Aborted,
            ts => StampState::Committed(ts),
        }
    }
}

#[derive(Debug)]
struct ManagerInner {
    clock: AtomicU64,
    next_txn_id: AtomicU64,
    commit_latch: RwLock<()>,
    active: Mutex<BTreeMap<u64, usize>>,
}

impl ManagerInner {
    fn deregister(&self, start_ts: u64) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&start_ts) {
            *count -= 1;
            if *count == 0 {
                active.remove(&start_ts);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                clock: AtomicU64::new(0),
                next_txn_id: AtomicU64::new(1),
                commit_latch: RwLock::new(()),
                active: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn begin(&self) -> Transaction {
        // Holding the latch shared keeps a start timestamp from landing in the
        // middle of a commit that has taken its timestamp but not published it.
        let _latch = self.inner.commit_latch.read();
        let start_ts = self.inner.clock.load(Ordering::Acquire);
        *self.inner.active.lock().entry(start_ts).or_insert(0) += 1;
        Transaction {
            manager: Arc::clone(&self.inner),
            id: self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed),
            start_ts,
            stamp: Arc::new(CommitStamp::pending()),
            writes: 0,
            finished: false,
        }
    }

    /// Commits `txn` and runs `post_commit` once its effects are visible.
    /// Read-only transactions take no timestamp and return their start.
    pub fn commit<F>(&self, mut txn: Transaction, post_commit: F) -> Result<u64, Error>
    where
        F: FnOnce(),
    {
        self.ensure_owned(&txn)?;
        let ts = if txn.is_read_only() {
            txn.start_ts
        } else {
            let _latch = self.inner.commit_latch.write();
            let ts = self.inner.clock.load(Ordering::Acquire) + 1;
            txn.stamp.0.store(ts, Ordering::Release);
            self.inner.clock.store(ts, Ordering::Release);
            ts
        };
        txn.finish();
        post_commit();
        Ok(ts)
    }

    pub fn abort(&self, mut txn: Transaction) -> Result<(), Error> {
        self.ensure_owned(&txn)?;
        txn.stamp.0.store(ABORTED, Ordering::Release);
        txn.finish();
        Ok(())
    }

    /// Start timestamp of the oldest running transaction, or the current
    /// clock when none are running. Versions superseded at or before this
    /// point are invisible to every present and future reader.
    pub fn oldest_active_start(&self) -> u64 {
        let _latch = self.inner.commit_latch.read();
        let active = self.inner.active.lock();
        match active.keys().next() {
            Some(ts) => *ts,
            None => self.inner.clock.load(Ordering::Acquire),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().values().sum()
    }

    pub fn current_timestamp(&self) -> u64 {
        self.inner.clock.load(Ordering::Acquire)
    }

    pub(crate) fn owns(&self, txn: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &txn.manager)
    }

    fn ensure_owned(&self, txn: &Transaction) -> Result<(), Error> {
        if self.owns(txn) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Visibility)
                .with_message("transaction belongs to another manager"))
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    manager: Arc<ManagerInner>,
    id: u64,
    start_ts: u64,
    stamp: Arc<CommitStamp>,
    writes: usize,
    finished: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn is_read_only(&self) -> bool {
        self.writes == 0
    }

    pub(crate) fn stamp(&self) -> Arc<CommitStamp> {
        Arc::clone(&self.stamp)
    }

    pub(crate) fn record_write(&mut self) {
        self.writes += 1;
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.manager.deregister(self.start_ts);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.stamp.0.store(ABORTED, Ordering::Release);
            self.finish();
        }
    }
}
