// Table heap.
//
// A table wraps one tablespace file of Data pages and exposes row-level
// operations that compose the substrate contracts:
//
//   write path: intent lock -> record/gap locks -> undo record -> page
//   edit -> mini-transaction commit (WAL group + dirty registration);
//   read path: ReadView -> stored version -> roll-pointer chain.
//
// Delete is an MVCC delete-mark (the row stays in its slot for readers of
// older snapshots); physical slot removal happens only when an insert is
// rolled back or during purge.

pub mod key;
pub mod row;
pub mod value;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::catalog::{Schema, TableMeta};
use crate::common::{PageId, RowId, TableId};
use crate::config::IsolationLevel;
use crate::error::{DbError, Result};
use crate::lock::{LockManager, LockMode};
use crate::metrics::Metrics;
use crate::mvcc::{resolve_visible, UndoLog};
use crate::storage::buffer_pool::{BufferPool, Frame};
use crate::storage::page::PageType;
use crate::storage::page_manager::PageManager;
use crate::table::key::CompositeKey;
use crate::table::row::Row;
use crate::table::value::Value;
use crate::transaction::manager::TransactionManager;
use crate::transaction::Transaction;
use crate::wal::log::Wal;
use crate::wal::mtr::MiniTransaction;
use crate::wal::record::{WalPayload, WalRecord, WalRecordType};

/// Name of the implicit primary-key index in the lock hierarchy.
pub const PRIMARY_INDEX: &str = "PRIMARY";

/// Row-level façade over one heap file.
pub struct Table {
    meta: TableMeta,
    pm: Arc<PageManager>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    undo: Arc<UndoLog>,
    locks: Arc<LockManager>,
    tm: Arc<TransactionManager>,
    metrics: Metrics,
    /// Last page that had insert room; scanning starts here.
    insert_hint: AtomicU32,
}

impl Table {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta: TableMeta,
        pm: Arc<PageManager>,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        undo: Arc<UndoLog>,
        locks: Arc<LockManager>,
        tm: Arc<TransactionManager>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            pm,
            pool,
            wal,
            undo,
            locks,
            tm,
            metrics,
            insert_hint: AtomicU32::new(1),
        })
    }

    pub fn id(&self) -> TableId {
        self.meta.id
    }

    pub fn db(&self) -> &str {
        &self.meta.db
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn schema(&self) -> &Schema {
        &self.meta.schema
    }

    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.pm
    }

    fn require_active(tx: &Transaction) -> Result<()> {
        if !tx.is_active() {
            return Err(DbError::InvalidOperation(format!(
                "operation on finished transaction {}",
                tx.id()
            )));
        }
        Ok(())
    }

    // ---- write path ----

    /// Inserts a row: IX on the table, insert-intention + X record lock on
    /// the primary key, uniqueness probe, undo record, page edit, one
    /// mini-transaction commit.
    pub fn insert(&self, tx: &Transaction, mut row: Row) -> Result<RowId> {
        Self::require_active(tx)?;
        self.meta.schema.validate_row(&row)?;

        self.locks
            .acquire_table(tx.id(), &self.meta.db, &self.meta.name, LockMode::IntentionExclusive)?;
        let pk = row.primary_key(&self.meta.schema);
        self.locks.acquire_insert_intention(
            tx.id(),
            &self.meta.db,
            &self.meta.name,
            PRIMARY_INDEX,
            &pk,
        )?;
        self.locks.acquire_record(
            tx.id(),
            &self.meta.db,
            &self.meta.name,
            PRIMARY_INDEX,
            &pk,
            LockMode::Exclusive,
        )?;
        if self.find_latest_by_pk(&pk)?.is_some() {
            return Err(DbError::ConstraintViolation(format!(
                "duplicate primary key {pk} in {}.{}",
                self.meta.db, self.meta.name
            )));
        }

        row.trx_id = tx.id();
        row.roll_ptr = 0;
        row.deleted = false;
        let bytes = row.serialize(&self.meta.schema)?;

        let frame = self.find_insert_page(bytes.len())?;
        let page_id = frame.page_id();
        let slot = frame
            .page()
            .write()
            .insert(&bytes)
            .ok_or_else(|| DbError::Internal("insert page lost its free space".into()))?;
        let row_id = RowId::new(page_id, slot);

        let undo_ptr =
            self.undo
                .write_insert(tx.id(), self.meta.id, row_id, &pk, tx.undo_head())?;
        tx.set_undo_head(undo_ptr);

        let mut mtr = MiniTransaction::begin(&self.wal);
        mtr.record(
            tx.id(),
            self.meta.id,
            WalRecordType::Insert,
            page_id,
            slot,
            undo_ptr,
            None,
            Some(bytes),
        )?;
        if let Err(e) = mtr.commit(&self.wal, &self.pool, &self.pm) {
            // Nothing was logged; take the in-memory edit back out.
            frame.page().write().delete(slot);
            self.pool.unpin(&self.pm, page_id, false)?;
            return Err(e);
        }
        self.pool.unpin(&self.pm, page_id, false)?;

        self.metrics.counter("table.insert", 1);
        trace!(table = %self.meta.name, %row_id, "inserted row");
        Ok(row_id)
    }

    /// Updates a row in place. The primary key must be unchanged.
    pub fn update(&self, tx: &Transaction, row_id: RowId, new_values: Vec<Value>) -> Result<()> {
        Self::require_active(tx)?;
        self.locks
            .acquire_table(tx.id(), &self.meta.db, &self.meta.name, LockMode::IntentionExclusive)?;

        let frame = self.pin_row_page(row_id)?;
        let result = self.update_pinned(tx, &frame, row_id, new_values);
        self.pool.unpin(&self.pm, row_id.page_id, false)?;
        result
    }

    fn update_pinned(
        &self,
        tx: &Transaction,
        frame: &Arc<Frame>,
        row_id: RowId,
        new_values: Vec<Value>,
    ) -> Result<()> {
        let stored = self
            .stored_row(frame, row_id)?
            .ok_or_else(|| DbError::NotFound(format!("row {row_id}")))?;
        let pk = stored.primary_key(&self.meta.schema);
        self.locks.acquire_record(
            tx.id(),
            &self.meta.db,
            &self.meta.name,
            PRIMARY_INDEX,
            &pk,
            LockMode::Exclusive,
        )?;

        // Re-read after the lock wait: the row may have changed meanwhile.
        let stored = self
            .stored_row(frame, row_id)?
            .ok_or_else(|| DbError::NotFound(format!("row {row_id}")))?;
        if stored.deleted {
            return Err(DbError::NotFound(format!("row {row_id}")));
        }

        let new_row = Row::new(new_values);
        self.meta.schema.validate_row(&new_row)?;
        if new_row.primary_key(&self.meta.schema) != pk {
            return Err(DbError::ConstraintViolation(
                "primary key columns cannot be updated in place".into(),
            ));
        }

        let old_bytes = stored.serialize(&self.meta.schema)?;
        let undo_ptr = self.undo.write_update(
            tx.id(),
            self.meta.id,
            row_id,
            old_bytes.clone(),
            stored.roll_ptr,
            tx.undo_head(),
        )?;
        tx.set_undo_head(undo_ptr);

        let mut replacement = new_row;
        replacement.trx_id = tx.id();
        replacement.roll_ptr = undo_ptr;
        let new_bytes = replacement.serialize(&self.meta.schema)?;
        frame.page().write().install(row_id.slot, Some(&new_bytes))?;

        let mut mtr = MiniTransaction::begin(&self.wal);
        mtr.record(
            tx.id(),
            self.meta.id,
            WalRecordType::Update,
            row_id.page_id,
            row_id.slot,
            undo_ptr,
            Some(old_bytes),
            Some(new_bytes),
        )?;
        mtr.commit(&self.wal, &self.pool, &self.pm)?;
        self.metrics.counter("table.update", 1);
        Ok(())
    }

    /// Delete-marks a row, keeping the slot for older snapshots.
    pub fn delete(&self, tx: &Transaction, row_id: RowId) -> Result<()> {
        Self::require_active(tx)?;
        self.locks
            .acquire_table(tx.id(), &self.meta.db, &self.meta.name, LockMode::IntentionExclusive)?;

        let frame = self.pin_row_page(row_id)?;
        let result = self.delete_pinned(tx, &frame, row_id);
        self.pool.unpin(&self.pm, row_id.page_id, false)?;
        result
    }

    fn delete_pinned(&self, tx: &Transaction, frame: &Arc<Frame>, row_id: RowId) -> Result<()> {
        let stored = self
            .stored_row(frame, row_id)?
            .ok_or_else(|| DbError::NotFound(format!("row {row_id}")))?;
        let pk = stored.primary_key(&self.meta.schema);
        self.locks.acquire_record(
            tx.id(),
            &self.meta.db,
            &self.meta.name,
            PRIMARY_INDEX,
            &pk,
            LockMode::Exclusive,
        )?;

        let stored = self
            .stored_row(frame, row_id)?
            .ok_or_else(|| DbError::NotFound(format!("row {row_id}")))?;
        if stored.deleted {
            return Err(DbError::NotFound(format!("row {row_id}")));
        }

        let old_bytes = stored.serialize(&self.meta.schema)?;
        let undo_ptr = self.undo.write_delete(
            tx.id(),
            self.meta.id,
            row_id,
            old_bytes.clone(),
            stored.roll_ptr,
            tx.undo_head(),
        )?;
        tx.set_undo_head(undo_ptr);

        let mut marked = stored;
        marked.trx_id = tx.id();
        marked.roll_ptr = undo_ptr;
        marked.deleted = true;
        let new_bytes = marked.serialize(&self.meta.schema)?;
        frame.page().write().install(row_id.slot, Some(&new_bytes))?;

        let mut mtr = MiniTransaction::begin(&self.wal);
        mtr.record(
            tx.id(),
            self.meta.id,
            WalRecordType::Delete,
            row_id.page_id,
            row_id.slot,
            undo_ptr,
            Some(old_bytes),
            Some(new_bytes),
        )?;
        mtr.commit(&self.wal, &self.pool, &self.pm)?;
        self.metrics.counter("table.delete", 1);
        Ok(())
    }

    // ---- read path ----

    /// Snapshot read of one row.
    pub fn get(&self, tx: &Transaction, row_id: RowId) -> Result<Option<Row>> {
        Self::require_active(tx)?;
        if row_id.page_id == 0 || row_id.page_id >= self.pm.page_count() {
            return Err(DbError::OutOfRange(format!(
                "row {row_id} in {}.{}",
                self.meta.db, self.meta.name
            )));
        }
        let frame = self.pool.get(&self.pm, row_id.page_id)?;
        let stored = self.stored_row(&frame, row_id)?;
        self.pool.unpin(&self.pm, row_id.page_id, false)?;

        let Some(stored) = stored else {
            return Ok(None);
        };
        self.resolve(tx, stored)
    }

    /// Locking (current) read: takes the requested record lock and returns
    /// the latest committed version.
    pub fn get_row_locked(
        &self,
        tx: &Transaction,
        row_id: RowId,
        mode: LockMode,
    ) -> Result<Option<Row>> {
        Self::require_active(tx)?;
        let table_mode = match mode {
            LockMode::Exclusive => LockMode::IntentionExclusive,
            _ => LockMode::IntentionShared,
        };
        self.locks
            .acquire_table(tx.id(), &self.meta.db, &self.meta.name, table_mode)?;

        let frame = self.pin_row_page(row_id)?;
        let stored = self.stored_row(&frame, row_id)?;
        let result = match stored {
            None => Ok(None),
            Some(stored) => {
                let pk = stored.primary_key(&self.meta.schema);
                self.locks.acquire_record(
                    tx.id(),
                    &self.meta.db,
                    &self.meta.name,
                    PRIMARY_INDEX,
                    &pk,
                    mode,
                )?;
                // Re-read under the lock.
                match self.stored_row(&frame, row_id)? {
                    Some(current) if !current.deleted => Ok(Some(current)),
                    _ => Ok(None),
                }
            }
        };
        self.pool.unpin(&self.pm, row_id.page_id, false)?;
        result
    }

    /// Full snapshot scan in heap order. Serializable transactions leave
    /// next-key locks behind on every scanned key, closing the gaps
    /// against phantoms.
    pub fn scan(&self, tx: &Transaction) -> Result<Vec<(RowId, Row)>> {
        Self::require_active(tx)?;
        self.locks
            .acquire_table(tx.id(), &self.meta.db, &self.meta.name, LockMode::IntentionShared)?;

        let mut out = Vec::new();
        for page_id in 1..self.pm.page_count() {
            let frame = self.pool.get(&self.pm, page_id)?;
            let page = frame.page().read();
            for (slot, bytes) in page.enumerate() {
                let stored = Row::deserialize(bytes, &self.meta.schema)?;
                if let Some(visible) = self.resolve(tx, stored)? {
                    out.push((RowId::new(page_id, slot), visible));
                }
            }
            drop(page);
            self.pool.unpin(&self.pm, page_id, false)?;
        }

        if tx.isolation() == IsolationLevel::Serializable {
            let mut keys: Vec<CompositeKey> = out
                .iter()
                .map(|(_, row)| row.primary_key(&self.meta.schema))
                .collect();
            keys.sort();
            self.locks.acquire_range(
                tx.id(),
                &self.meta.db,
                &self.meta.name,
                PRIMARY_INDEX,
                &keys,
                LockMode::Shared,
            )?;
        }
        self.metrics.counter("table.scan", 1);
        Ok(out)
    }

    /// MVCC-visible lookup by primary key.
    pub fn find_by_pk(&self, tx: &Transaction, pk: &CompositeKey) -> Result<Option<(RowId, Row)>> {
        Ok(self
            .scan(tx)?
            .into_iter()
            .find(|(_, row)| &row.primary_key(&self.meta.schema) == pk))
    }

    fn resolve(&self, tx: &Transaction, stored: Row) -> Result<Option<Row>> {
        match self.tm.read_view(tx) {
            None => Ok(if stored.deleted { None } else { Some(stored) }),
            Some(view) => resolve_visible(&view, &stored, &self.undo, &self.meta.schema),
        }
    }

    /// Latest version (regardless of visibility) with the given primary
    /// key; the uniqueness probe.
    fn find_latest_by_pk(&self, pk: &CompositeKey) -> Result<Option<RowId>> {
        for page_id in 1..self.pm.page_count() {
            let frame = self.pool.get(&self.pm, page_id)?;
            let page = frame.page().read();
            let mut hit = None;
            for (slot, bytes) in page.enumerate() {
                let row = Row::deserialize(bytes, &self.meta.schema)?;
                if !row.deleted && &row.primary_key(&self.meta.schema) == pk {
                    hit = Some(RowId::new(page_id, slot));
                    break;
                }
            }
            drop(page);
            self.pool.unpin(&self.pm, page_id, false)?;
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    // ---- rollback compensations (each emits a CLR) ----

    /// Undo of an insert: physically remove the slot.
    pub fn rollback_insert(&self, tx: &Transaction, row_id: RowId) -> Result<()> {
        let frame = self.pin_row_page(row_id)?;
        let before = frame
            .page()
            .read()
            .get(row_id.slot)
            .map(|bytes| bytes.to_vec());
        frame.page().write().delete(row_id.slot);

        let mut mtr = MiniTransaction::begin(&self.wal);
        mtr.record(
            tx.id(),
            self.meta.id,
            WalRecordType::Clr,
            row_id.page_id,
            row_id.slot,
            0,
            before,
            None,
        )?;
        let result = mtr.commit(&self.wal, &self.pool, &self.pm);
        self.pool.unpin(&self.pm, row_id.page_id, false)?;
        result.map(|_| ())
    }

    /// Undo of an update or delete: write the pre-image back.
    pub fn rollback_overwrite(
        &self,
        tx: &Transaction,
        row_id: RowId,
        old_row_bytes: &[u8],
    ) -> Result<()> {
        let frame = self.pin_row_page(row_id)?;
        let before = frame
            .page()
            .read()
            .get(row_id.slot)
            .map(|bytes| bytes.to_vec());
        frame
            .page()
            .write()
            .install(row_id.slot, Some(old_row_bytes))?;

        let mut mtr = MiniTransaction::begin(&self.wal);
        mtr.record(
            tx.id(),
            self.meta.id,
            WalRecordType::Clr,
            row_id.page_id,
            row_id.slot,
            0,
            before,
            Some(old_row_bytes.to_vec()),
        )?;
        let result = mtr.commit(&self.wal, &self.pool, &self.pm);
        self.pool.unpin(&self.pm, row_id.page_id, false)?;
        result.map(|_| ())
    }

    // ---- recovery ----

    /// Replays one WAL page record if it is newer than the page. Returns
    /// whether the record was applied.
    pub fn apply_redo(&self, record: &WalRecord) -> Result<bool> {
        let WalPayload::PageImage {
            page_id,
            slot,
            after,
            ..
        } = &record.payload
        else {
            return Ok(false);
        };
        self.pm.ensure_allocated(*page_id, PageType::Data)?;
        let frame = self.pool.get(&self.pm, *page_id)?;
        let applied = {
            let mut page = frame.page().write();
            if page.lsn() >= record.lsn {
                false
            } else {
                page.install(*slot, after.as_deref())?;
                page.set_lsn(record.lsn);
                true
            }
        };
        if applied {
            self.pool
                .stamp_page_lsn(&self.pm, *page_id, record.lsn, record.lsn)?;
        }
        self.pool.unpin(&self.pm, *page_id, false)?;
        Ok(applied)
    }

    /// Flushes every dirty page of this table.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all(&self.pm)
    }

    // ---- helpers ----

    fn pin_row_page(&self, row_id: RowId) -> Result<Arc<Frame>> {
        if row_id.page_id == 0 || row_id.page_id >= self.pm.page_count() {
            return Err(DbError::OutOfRange(format!(
                "row {row_id} in {}.{}",
                self.meta.db, self.meta.name
            )));
        }
        self.pool.get(&self.pm, row_id.page_id)
    }

    fn stored_row(&self, frame: &Arc<Frame>, row_id: RowId) -> Result<Option<Row>> {
        let page = frame.page().read();
        match page.get(row_id.slot) {
            Some(bytes) => Ok(Some(Row::deserialize(bytes, &self.meta.schema)?)),
            None => Ok(None),
        }
    }

    fn find_insert_page(&self, len: usize) -> Result<Arc<Frame>> {
        let hint = self.insert_hint.load(Ordering::Relaxed);
        if hint > 0 && hint < self.pm.page_count() {
            let frame = self.pool.get(&self.pm, hint)?;
            if frame.page().read().can_fit(len) {
                return Ok(frame);
            }
            self.pool.unpin(&self.pm, hint, false)?;
        }
        for page_id in 1..self.pm.page_count() {
            if page_id == hint {
                continue;
            }
            let frame = self.pool.get(&self.pm, page_id)?;
            if frame.page().read().can_fit(len) {
                self.insert_hint.store(page_id, Ordering::Relaxed);
                return Ok(frame);
            }
            self.pool.unpin(&self.pm, page_id, false)?;
        }
        let frame = self.pool.new_page(&self.pm, PageType::Data)?;
        self.insert_hint.store(frame.page_id(), Ordering::Relaxed);
        Ok(frame)
    }
}
