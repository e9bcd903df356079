// Transaction manager.
//
// Owns transaction handles from begin to commit/abort, hands out read
// views per isolation level, and drives the commit and rollback protocols
// against the WAL, the undo log, and the lock manager. It is also the
// startup recovery entry point: `recover` runs the analysis, redo, and
// undo passes over the WAL through caller-supplied appliers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::common::{Lsn, TransactionId, UndoPtr};
use crate::config::IsolationLevel;
use crate::error::{DbError, Result};
use crate::lock::LockManager;
use crate::metrics::Metrics;
use crate::mvcc::{ReadView, UndoLog, UndoRecordType};
use crate::transaction::{CompensationApply, Transaction, TransactionState};
use crate::wal::log::Wal;
use crate::wal::record::{WalRecord, WalRecordType};

/// Result of the three recovery passes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    pub records_redone: usize,
    pub losers_rolled_back: usize,
    pub max_tx_id: TransactionId,
}

/// Lifecycle owner for all transactions.
pub struct TransactionManager {
    next_tx_id: AtomicU64,
    active: DashMap<TransactionId, Arc<Transaction>>,
    locks: Arc<LockManager>,
    wal: Arc<Wal>,
    undo: Arc<UndoLog>,
    default_isolation: IsolationLevel,
    /// Transactions below this id are committed or aborted; undo purge
    /// may reclaim their records.
    purge_low_water: AtomicU64,
    metrics: Metrics,
}

impl TransactionManager {
    pub fn new(
        wal: Arc<Wal>,
        undo: Arc<UndoLog>,
        locks: Arc<LockManager>,
        default_isolation: IsolationLevel,
        metrics: Metrics,
    ) -> Self {
        Self {
            next_tx_id: AtomicU64::new(1),
            active: DashMap::new(),
            locks,
            wal,
            undo,
            default_isolation,
            purge_low_water: AtomicU64::new(1),
            metrics,
        }
    }

    /// Starts a transaction, logging its Begin record.
    pub fn begin(&self, isolation: Option<IsolationLevel>) -> Result<Arc<Transaction>> {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let begin_lsn = self.wal.write_begin(id)?;
        let tx = Arc::new(Transaction::new(
            id,
            isolation.unwrap_or(self.default_isolation),
            begin_lsn,
        ));
        self.active.insert(id, tx.clone());
        self.metrics.counter("txn.begin", 1);
        debug!(tx = id, "transaction started");
        Ok(tx)
    }

    /// Ids of currently active transactions.
    pub fn active_tx_ids(&self) -> Vec<TransactionId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Next id the allocator would hand out.
    pub fn next_tx_id(&self) -> TransactionId {
        self.next_tx_id.load(Ordering::SeqCst)
    }

    /// Begin-record LSN of the oldest active transaction; WAL segments at
    /// or above it must survive truncation.
    pub fn oldest_active_first_lsn(&self) -> Option<Lsn> {
        self.active.iter().map(|entry| entry.value().first_lsn()).min()
    }

    /// (tx id, undo chain head) of every active transaction. Checkpoints
    /// persist this so recovery can roll back transactions whose Begin
    /// predates the WAL scan floor.
    pub fn active_undo_heads(&self) -> Vec<(TransactionId, UndoPtr)> {
        self.active
            .iter()
            .map(|entry| (*entry.key(), entry.value().undo_head()))
            .collect()
    }

    /// The read view a statement in `tx` should use, or `None` for
    /// Read-Uncommitted (which reads latest versions directly).
    /// Read-Committed takes a fresh snapshot per call; Repeatable-Read and
    /// Serializable pin the first snapshot for the transaction's life.
    pub fn read_view(&self, tx: &Transaction) -> Option<Arc<ReadView>> {
        match tx.isolation() {
            IsolationLevel::ReadUncommitted => None,
            IsolationLevel::ReadCommitted => Some(Arc::new(ReadView::create(
                &self.active_tx_ids(),
                self.next_tx_id(),
                tx.id(),
            ))),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                if let Some(view) = tx.cached_view() {
                    return Some(view);
                }
                let view = Arc::new(ReadView::create(
                    &self.active_tx_ids(),
                    self.next_tx_id(),
                    tx.id(),
                ));
                tx.cache_view(view.clone());
                Some(view)
            }
        }
    }

    /// Commit: make the commit record durable, then release everything.
    pub fn commit(&self, tx: &Transaction) -> Result<()> {
        if !tx.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "commit of finished transaction {}",
                tx.id()
            )));
        }
        let commit_lsn = self.wal.write_commit(tx.id())?;
        self.wal.flush_to(commit_lsn)?;

        tx.set_state(TransactionState::Committed);
        self.locks.release_all(tx.id());
        tx.clear_view();
        self.active.remove(&tx.id());
        self.advance_low_water();
        self.metrics.counter("txn.commit", 1);
        debug!(tx = tx.id(), commit_lsn, "transaction committed");
        Ok(())
    }

    /// Rollback: walk the undo chain newest-first applying compensations
    /// (each emits a CLR), then log Abort and release.
    pub fn rollback(&self, tx: &Transaction, applier: &dyn CompensationApply) -> Result<()> {
        if !tx.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "rollback of finished transaction {}",
                tx.id()
            )));
        }
        self.apply_undo_chain(tx, applier)?;

        let abort_lsn = self.wal.write_abort(tx.id())?;
        self.wal.flush_to(abort_lsn)?;

        tx.set_state(TransactionState::Aborted);
        self.locks.release_all(tx.id());
        tx.clear_view();
        self.active.remove(&tx.id());
        self.advance_low_water();
        self.metrics.counter("txn.rollback", 1);
        debug!(tx = tx.id(), "transaction rolled back");
        Ok(())
    }

    /// Applies compensations for every record on `tx`'s undo chain,
    /// newest first. Rollback and the recovery undo pass both come
    /// through here.
    pub fn apply_undo_chain(&self, tx: &Transaction, applier: &dyn CompensationApply) -> Result<()> {
        let chain = self.undo.read_chain(tx.id(), tx.undo_head())?;
        for record in &chain {
            match record.record_type {
                UndoRecordType::Insert => applier.undo_insert(
                    tx,
                    record.table_id,
                    record.row_id,
                    &record.primary_key()?,
                )?,
                UndoRecordType::Update => {
                    applier.undo_update(tx, record.table_id, record.row_id, &record.payload)?
                }
                UndoRecordType::Delete => {
                    applier.undo_delete(tx, record.table_id, record.row_id, &record.payload)?
                }
            }
        }
        Ok(())
    }

    /// Durably flushes the WAL and the undo log.
    pub fn flush(&self) -> Result<()> {
        self.wal.flush()?;
        self.undo.flush()?;
        Ok(())
    }

    fn advance_low_water(&self) {
        // A live snapshot may still need pre-images from transactions far
        // below its own id, so the floor is the minimum over each active
        // transaction's id and its pinned view's oldest visible writer.
        let low = self
            .active
            .iter()
            .map(|entry| {
                let tx = entry.value();
                match tx.cached_view() {
                    Some(view) => view.min_active().min(tx.id()),
                    None => tx.id(),
                }
            })
            .min()
            .unwrap_or_else(|| self.next_tx_id());
        self.purge_low_water.store(low, Ordering::SeqCst);
        // Opportunistic purge; a mixed segment simply stays.
        if let Err(e) = self.undo.purge(low) {
            warn!(error = %e, "undo purge failed");
        }
    }

    pub fn purge_low_water(&self) -> TransactionId {
        self.purge_low_water.load(Ordering::SeqCst)
    }

    /// Startup recovery: analysis, redo, undo over the WAL from
    /// `start_lsn`.
    ///
    /// - Analysis rebuilds the transaction table (a Begin without a
    ///   matching Commit/Abort stays a loser) and each loser's undo chain
    ///   head from the `undo_ptr` carried by its DML records.
    /// - Redo feeds every page record to `redo_fn` in LSN order; the
    ///   applier reports whether it actually replayed the record.
    /// - Undo feeds each loser to `undo_fn` (which applies compensations
    ///   through its undo chain), then logs its Abort.
    ///
    /// Finally the id allocator is advanced past every id seen.
    pub fn recover<R, U>(
        &self,
        start_lsn: Lsn,
        seed_losers: &[(TransactionId, UndoPtr)],
        mut redo_fn: R,
        mut undo_fn: U,
    ) -> Result<RecoveryReport>
    where
        R: FnMut(&WalRecord) -> Result<bool>,
        U: FnMut(TransactionId, UndoPtr) -> Result<()>,
    {
        let mut report = RecoveryReport::default();
        // Transactions active at the last checkpoint start out as losers;
        // the scan clears the ones that committed later.
        let mut losers: HashMap<TransactionId, UndoPtr> =
            seed_losers.iter().copied().collect();

        // Analysis.
        for record in self.wal.read_from(start_lsn)? {
            let record = record?;
            report.records_scanned += 1;
            report.max_tx_id = report.max_tx_id.max(record.tx_id);
            match record.record_type {
                WalRecordType::Begin => {
                    losers.insert(record.tx_id, 0);
                }
                WalRecordType::Commit | WalRecordType::Abort => {
                    losers.remove(&record.tx_id);
                }
                WalRecordType::Insert | WalRecordType::Update | WalRecordType::Delete => {
                    if let crate::wal::record::WalPayload::PageImage { undo_ptr, .. } =
                        &record.payload
                    {
                        if *undo_ptr != 0 {
                            losers.insert(record.tx_id, *undo_ptr);
                        }
                    }
                }
                _ => {}
            }
        }

        // Redo.
        for record in self.wal.read_from(start_lsn)? {
            let record = record?;
            if record.record_type.is_page_record() && redo_fn(&record)? {
                report.records_redone += 1;
            }
        }

        // Undo losers, oldest id first for deterministic CLR order.
        let mut loser_ids: Vec<(TransactionId, UndoPtr)> = losers.into_iter().collect();
        loser_ids.sort_unstable();
        for (tx_id, undo_head) in loser_ids {
            info!(tx = tx_id, "rolling back loser transaction");
            undo_fn(tx_id, undo_head)?;
            self.wal.write_abort(tx_id)?;
            report.losers_rolled_back += 1;
        }
        self.wal.flush()?;

        if report.max_tx_id >= self.next_tx_id.load(Ordering::SeqCst) {
            self.next_tx_id.store(report.max_tx_id + 1, Ordering::SeqCst);
        }
        self.purge_low_water
            .store(self.next_tx_id.load(Ordering::SeqCst), Ordering::SeqCst);
        info!(
            scanned = report.records_scanned,
            redone = report.records_redone,
            losers = report.losers_rolled_back,
            "recovery passes complete"
        );
        Ok(report)
    }

    /// Materializes a handle for a transaction found in the WAL during
    /// recovery, so compensations can run under its identity.
    pub fn recovered_transaction(
        &self,
        id: TransactionId,
        undo_head: UndoPtr,
    ) -> Arc<Transaction> {
        let tx = Arc::new(Transaction::new(id, self.default_isolation, 0));
        tx.set_undo_head(undo_head);
        tx
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn undo_log(&self) -> &Arc<UndoLog> {
        &self.undo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{RowId, TableId};
    use crate::table::key::CompositeKey;
    use crate::table::value::Value;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        tm: TransactionManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(Wal::open(&dir.path().join("wal"), 1 << 20).unwrap());
        let undo = Arc::new(UndoLog::open(&dir.path().join("undo")).unwrap());
        let locks = Arc::new(LockManager::new(
            Duration::from_millis(200),
            crate::metrics::noop(),
        ));
        let tm = TransactionManager::new(
            wal,
            undo,
            locks,
            IsolationLevel::RepeatableRead,
            crate::metrics::noop(),
        );
        Fixture { _dir: dir, tm }
    }

    #[derive(Default)]
    struct RecordingApplier {
        calls: Mutex<Vec<(String, TableId, RowId)>>,
    }

    impl CompensationApply for RecordingApplier {
        fn undo_insert(
            &self,
            _tx: &Transaction,
            table_id: TableId,
            row_id: RowId,
            _pk: &CompositeKey,
        ) -> Result<()> {
            self.calls.lock().push(("insert".into(), table_id, row_id));
            Ok(())
        }
        fn undo_update(
            &self,
            _tx: &Transaction,
            table_id: TableId,
            row_id: RowId,
            _old: &[u8],
        ) -> Result<()> {
            self.calls.lock().push(("update".into(), table_id, row_id));
            Ok(())
        }
        fn undo_delete(
            &self,
            _tx: &Transaction,
            table_id: TableId,
            row_id: RowId,
            _old: &[u8],
        ) -> Result<()> {
            self.calls.lock().push(("delete".into(), table_id, row_id));
            Ok(())
        }
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let f = fixture();
        let a = f.tm.begin(None).unwrap();
        let b = f.tm.begin(None).unwrap();
        assert!(b.id() > a.id());
        assert_eq!(f.tm.active_tx_ids().len(), 2);
    }

    #[test]
    fn test_commit_flushes_wal_and_releases() {
        let f = fixture();
        let tx = f.tm.begin(None).unwrap();
        f.tm.lock_manager()
            .acquire_table(tx.id(), "db", "t", crate::lock::LockMode::Exclusive)
            .unwrap();

        f.tm.commit(&tx).unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(f.tm.active_tx_ids().is_empty());
        assert!(f.tm.wal().flushed_lsn() >= 2);

        // The table lock is gone: a new transaction can take X.
        let tx2 = f.tm.begin(None).unwrap();
        f.tm.lock_manager()
            .acquire_table(tx2.id(), "db", "t", crate::lock::LockMode::Exclusive)
            .unwrap();
    }

    #[test]
    fn test_double_commit_is_usage_error() {
        let f = fixture();
        let tx = f.tm.begin(None).unwrap();
        f.tm.commit(&tx).unwrap();
        assert!(matches!(
            f.tm.commit(&tx),
            Err(DbError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_rollback_applies_compensations_newest_first() {
        let f = fixture();
        let tx = f.tm.begin(None).unwrap();
        let key = CompositeKey::single(Value::Int32(1));

        // Simulate two DML steps: insert then update of the same row.
        let p1 = f
            .tm
            .undo_log()
            .write_insert(tx.id(), 7, RowId::new(2, 0), &key, tx.undo_head())
            .unwrap();
        tx.set_undo_head(p1);
        let p2 = f
            .tm
            .undo_log()
            .write_update(tx.id(), 7, RowId::new(2, 0), vec![1, 2, 3], 0, tx.undo_head())
            .unwrap();
        tx.set_undo_head(p2);

        let applier = RecordingApplier::default();
        f.tm.rollback(&tx, &applier).unwrap();

        let calls = applier.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "update");
        assert_eq!(calls[1].0, "insert");
        assert_eq!(tx.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_read_view_semantics_per_isolation() {
        let f = fixture();
        let ru = f.tm.begin(Some(IsolationLevel::ReadUncommitted)).unwrap();
        assert!(f.tm.read_view(&ru).is_none());

        let rr = f.tm.begin(Some(IsolationLevel::RepeatableRead)).unwrap();
        let v1 = f.tm.read_view(&rr).unwrap();
        // A new transaction starting does not change RR's pinned view.
        let _noise = f.tm.begin(None).unwrap();
        let v2 = f.tm.read_view(&rr).unwrap();
        assert_eq!(v1, v2);

        let rc = f.tm.begin(Some(IsolationLevel::ReadCommitted)).unwrap();
        let c1 = f.tm.read_view(&rc).unwrap();
        let noise2 = f.tm.begin(None).unwrap();
        f.tm.commit(&noise2).unwrap();
        let c2 = f.tm.read_view(&rc).unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_recover_classifies_losers() {
        let f = fixture();
        // tx1 commits, tx2 does not.
        let tx1 = f.tm.begin(None).unwrap();
        let tx2 = f.tm.begin(None).unwrap();
        f.tm.commit(&tx1).unwrap();
        let tx2_id = tx2.id();
        drop(tx2);

        let mut undone = Vec::new();
        let report = f
            .tm
            .recover(
                1,
                &[],
                |_record| Ok(false),
                |tx_id, _head| {
                    undone.push(tx_id);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(report.losers_rolled_back, 1);
        assert_eq!(undone, vec![tx2_id]);
        assert!(f.tm.next_tx_id() > tx2_id);
    }
}
