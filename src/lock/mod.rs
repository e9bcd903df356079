// Multi-granularity lock manager.
//
// Three layers, all keyed by transaction id:
//
//   - intent locks at (db, table): IS / IX / S / SIX / X with the standard
//     compatibility matrix;
//   - record locks at (db, table, index, key): S / X;
//   - gap locks at (db, table, index, (lo, hi]): shared insert-blockers
//     that conflict only with inserts into the gap. A next-key lock is a
//     record lock plus the gap ending at its key.
//
// Blocked acquisitions wait on a condvar with a deadline and register
// wait-for edges; a detected cycle aborts the youngest member with
// `Deadlock`, which the caller turns into a rollback.

pub mod deadlock;

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::common::TransactionId;
use crate::error::{DbError, Result};
use crate::metrics::Metrics;
use crate::table::key::CompositeKey;
use deadlock::{DeadlockDetector, VictimPolicy};

/// Lock modes for the table/intent layer. Record locks use only `Shared`
/// and `Exclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Standard multi-granularity compatibility matrix.
    pub fn is_compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (IntentionExclusive, _) | (_, IntentionExclusive) => false,
            (Shared, Shared) => true,
            (Shared, _) | (_, Shared) => false,
            // SIX vs SIX / X, and anything vs X.
            _ => false,
        }
    }

    /// Least mode covering both `self` and `other`, for upgrades.
    pub fn supremum(self, other: LockMode) -> LockMode {
        use LockMode::*;
        if self == other {
            return self;
        }
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => Exclusive,
            (SharedIntentionExclusive, _) | (_, SharedIntentionExclusive) => {
                SharedIntentionExclusive
            }
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => {
                SharedIntentionExclusive
            }
            (Shared, _) | (_, Shared) => Shared,
            (IntentionExclusive, _) | (_, IntentionExclusive) => IntentionExclusive,
            _ => IntentionShared,
        }
    }
}

/// Table-layer resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRes {
    pub db: String,
    pub table: String,
}

/// Record-layer resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRes {
    pub db: String,
    pub table: String,
    pub index: String,
    pub key: CompositeKey,
}

/// Index identity for the gap layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexRes {
    pub db: String,
    pub table: String,
    pub index: String,
}

/// One gap lock over (lo, hi].
#[derive(Debug, Clone)]
struct GapLock {
    hi: CompositeKey,
    tx_id: TransactionId,
    next_key: bool,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: Vec<(TransactionId, LockMode)>,
}

impl LockEntry {
    /// Attempts the grant; returns conflicting holders on failure.
    fn try_grant(
        &mut self,
        tx_id: TransactionId,
        mode: LockMode,
    ) -> std::result::Result<(), Vec<TransactionId>> {
        let requested = match self.holders.iter().position(|(id, _)| *id == tx_id) {
            Some(pos) => {
                let current = self.holders[pos].1;
                let target = current.supremum(mode);
                if target == current {
                    return Ok(());
                }
                target
            }
            None => mode,
        };

        let conflicts: Vec<TransactionId> = self
            .holders
            .iter()
            .filter(|(id, held)| *id != tx_id && !requested.is_compatible(*held))
            .map(|(id, _)| *id)
            .collect();
        if !conflicts.is_empty() {
            return Err(conflicts);
        }

        match self.holders.iter().position(|(id, _)| *id == tx_id) {
            Some(pos) => self.holders[pos].1 = requested,
            None => self.holders.push((tx_id, requested)),
        }
        Ok(())
    }

    fn release(&mut self, tx_id: TransactionId) {
        self.holders.retain(|(id, _)| *id != tx_id);
    }
}

/// A granted next-key lock, reported by `acquire_range`.
#[derive(Debug, Clone, PartialEq)]
pub struct NextKeyLock {
    pub key: CompositeKey,
    pub gap_lo: Option<CompositeKey>,
}

#[derive(Debug, Default)]
struct TxLockSet {
    tables: HashSet<TableRes>,
    records: HashSet<RecordRes>,
    gap_indexes: HashSet<IndexRes>,
}

/// Lock manager shared by every transaction.
pub struct LockManager {
    tables: DashMap<TableRes, LockEntry>,
    records: DashMap<RecordRes, LockEntry>,
    /// Gap locks per index, keyed by gap low bound for range probes.
    gaps: DashMap<IndexRes, BTreeMap<CompositeKey, Vec<GapLock>>>,
    held: DashMap<TransactionId, TxLockSet>,
    detector: DeadlockDetector,
    victims: Mutex<HashSet<TransactionId>>,
    wait_lock: Mutex<()>,
    wait_condvar: Condvar,
    timeout: Duration,
    metrics: Metrics,
}

impl LockManager {
    pub fn new(timeout: Duration, metrics: Metrics) -> Self {
        Self {
            tables: DashMap::new(),
            records: DashMap::new(),
            gaps: DashMap::new(),
            held: DashMap::new(),
            detector: DeadlockDetector::new(VictimPolicy::Youngest),
            victims: Mutex::new(HashSet::new()),
            wait_lock: Mutex::new(()),
            wait_condvar: Condvar::new(),
            timeout,
            metrics,
        }
    }

    /// Acquires (or upgrades) an intent/table lock, blocking up to the
    /// configured timeout.
    pub fn acquire_table(
        &self,
        tx_id: TransactionId,
        db: &str,
        table: &str,
        mode: LockMode,
    ) -> Result<()> {
        let res = TableRes {
            db: db.to_string(),
            table: table.to_string(),
        };
        self.acquire_blocking(tx_id, move |this, tx| {
            let granted = this
                .tables
                .entry(res.clone())
                .or_default()
                .try_grant(tx, mode);
            if granted.is_ok() {
                this.held.entry(tx).or_default().tables.insert(res.clone());
            }
            granted
        })
    }

    /// Acquires (or upgrades) a record lock at (db, table, index, key).
    pub fn acquire_record(
        &self,
        tx_id: TransactionId,
        db: &str,
        table: &str,
        index: &str,
        key: &CompositeKey,
        mode: LockMode,
    ) -> Result<()> {
        let res = RecordRes {
            db: db.to_string(),
            table: table.to_string(),
            index: index.to_string(),
            key: key.clone(),
        };
        self.acquire_blocking(tx_id, move |this, tx| {
            let granted = this
                .records
                .entry(res.clone())
                .or_default()
                .try_grant(tx, mode);
            if granted.is_ok() {
                this.held.entry(tx).or_default().records.insert(res.clone());
            }
            granted
        })
    }

    /// Takes a gap lock over (lo, hi]. Gap locks are shared: they never
    /// conflict with each other, only with inserts into the gap, so the
    /// grant is immediate.
    pub fn acquire_gap(
        &self,
        tx_id: TransactionId,
        db: &str,
        table: &str,
        index: &str,
        lo: CompositeKey,
        hi: CompositeKey,
        next_key: bool,
    ) -> Result<()> {
        let res = IndexRes {
            db: db.to_string(),
            table: table.to_string(),
            index: index.to_string(),
        };
        self.gaps
            .entry(res.clone())
            .or_default()
            .entry(lo)
            .or_default()
            .push(GapLock {
                hi,
                tx_id,
                next_key,
            });
        self.held.entry(tx_id).or_default().gap_indexes.insert(res);
        Ok(())
    }

    /// Locks a scanned key range with next-key locks: a record lock on
    /// every key plus the gap from its predecessor. `keys` must be the
    /// scan result in index order. The first key's gap starts at the
    /// NULL-low minimum key, which bounds it below every real key.
    pub fn acquire_range(
        &self,
        tx_id: TransactionId,
        db: &str,
        table: &str,
        index: &str,
        keys: &[CompositeKey],
        mode: LockMode,
    ) -> Result<Vec<NextKeyLock>> {
        let mut granted = Vec::with_capacity(keys.len());
        let floor = CompositeKey::single(crate::table::value::Value::Null);
        let mut prev: Option<&CompositeKey> = None;
        for key in keys {
            self.acquire_record(tx_id, db, table, index, key, mode)?;
            let lo = prev.cloned().unwrap_or_else(|| floor.clone());
            self.acquire_gap(tx_id, db, table, index, lo.clone(), key.clone(), true)?;
            granted.push(NextKeyLock {
                key: key.clone(),
                gap_lo: Some(lo),
            });
            prev = Some(key);
        }
        Ok(granted)
    }

    /// Whether an insert of `key` by `tx_id` is blocked by another
    /// transaction's gap lock over a range containing the key.
    pub fn is_insert_blocked(
        &self,
        db: &str,
        table: &str,
        index: &str,
        key: &CompositeKey,
        tx_id: TransactionId,
    ) -> bool {
        !self.gap_blockers(db, table, index, key, tx_id).is_empty()
    }

    fn gap_blockers(
        &self,
        db: &str,
        table: &str,
        index: &str,
        key: &CompositeKey,
        tx_id: TransactionId,
    ) -> Vec<TransactionId> {
        let res = IndexRes {
            db: db.to_string(),
            table: table.to_string(),
            index: index.to_string(),
        };
        let Some(index_gaps) = self.gaps.get(&res) else {
            return Vec::new();
        };
        // (lo, hi] contains key iff lo < key <= hi; only entries with
        // lo < key can match, which the ordered map narrows for us.
        index_gaps
            .range(..key.clone())
            .flat_map(|(_, locks)| locks.iter())
            .filter(|gap| gap.tx_id != tx_id && *key <= gap.hi)
            .map(|gap| gap.tx_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect()
    }

    /// Blocks until no other transaction holds a gap lock covering `key`.
    /// This is the insert-intention wait.
    pub fn acquire_insert_intention(
        &self,
        tx_id: TransactionId,
        db: &str,
        table: &str,
        index: &str,
        key: &CompositeKey,
    ) -> Result<()> {
        self.acquire_blocking(tx_id, move |this, tx| {
            let blockers = this.gap_blockers(db, table, index, key, tx);
            if blockers.is_empty() {
                Ok(())
            } else {
                Err(blockers)
            }
        })
    }

    /// Shared blocking loop: retry `try_fn` until granted, timeout, or
    /// deadlock victimhood.
    fn acquire_blocking<F>(&self, tx_id: TransactionId, try_fn: F) -> Result<()>
    where
        F: Fn(&Self, TransactionId) -> std::result::Result<(), Vec<TransactionId>>,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.victims.lock().remove(&tx_id) {
                self.detector.remove_waiter(tx_id);
                self.metrics.counter("lock.deadlock_victims", 1);
                return Err(DbError::Deadlock);
            }

            match try_fn(self, tx_id) {
                Ok(()) => {
                    self.detector.remove_waiter(tx_id);
                    return Ok(());
                }
                Err(holders) => {
                    self.detector.remove_waiter(tx_id);
                    self.detector.add_waits(tx_id, &holders);
                    if let Some(victim) = self.detector.detect(tx_id) {
                        warn!(tx_id, victim, "deadlock cycle detected");
                        self.metrics.counter("lock.deadlocks", 1);
                        if victim == tx_id {
                            self.detector.remove_waiter(tx_id);
                            return Err(DbError::Deadlock);
                        }
                        self.victims.lock().insert(victim);
                        self.wait_condvar.notify_all();
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.detector.remove_waiter(tx_id);
                self.metrics.counter("lock.timeouts", 1);
                return Err(DbError::LockTimeout);
            }
            let mut guard = self.wait_lock.lock();
            self.wait_condvar.wait_for(&mut guard, deadline - now);
        }
    }

    /// Releases every lock held by `tx_id` and wakes waiters.
    pub fn release_all(&self, tx_id: TransactionId) {
        if let Some((_, held)) = self.held.remove(&tx_id) {
            for res in held.tables {
                if let Some(mut entry) = self.tables.get_mut(&res) {
                    entry.release(tx_id);
                }
            }
            for res in held.records {
                if let Some(mut entry) = self.records.get_mut(&res) {
                    entry.release(tx_id);
                }
            }
            for res in held.gap_indexes {
                if let Some(mut index_gaps) = self.gaps.get_mut(&res) {
                    for locks in index_gaps.values_mut() {
                        locks.retain(|gap| gap.tx_id != tx_id);
                    }
                    index_gaps.retain(|_, locks| !locks.is_empty());
                }
            }
        }
        self.detector.remove_transaction(tx_id);
        self.victims.lock().remove(&tx_id);
        self.wait_condvar.notify_all();
        debug!(tx_id, "released all locks");
    }

    /// Modes currently held by `tx_id` on a table, for diagnostics.
    pub fn table_lock_of(&self, tx_id: TransactionId, db: &str, table: &str) -> Option<LockMode> {
        let res = TableRes {
            db: db.to_string(),
            table: table.to_string(),
        };
        self.tables.get(&res).and_then(|entry| {
            entry
                .holders
                .iter()
                .find(|(id, _)| *id == tx_id)
                .map(|(_, mode)| *mode)
        })
    }
}
