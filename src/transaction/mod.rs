// Transaction lifecycle: the transaction handle itself, the manager that
// owns all live transactions, and the compensation interface rollback
// drives against the table layer.

pub mod manager;

pub use manager::{RecoveryReport, TransactionManager};

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use std::sync::Arc;

use crate::common::{Lsn, RowId, TableId, TransactionId, UndoPtr};
use crate::config::IsolationLevel;
use crate::error::Result;
use crate::mvcc::ReadView;
use crate::table::key::CompositeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// One user transaction. Handles are shared (`Arc`) between the caller and
/// the manager; interior state is latched.
pub struct Transaction {
    id: TransactionId,
    isolation: IsolationLevel,
    state: Mutex<TransactionState>,
    read_view: Mutex<Option<Arc<ReadView>>>,
    /// Head of this transaction's undo chain (newest record).
    undo_head: AtomicU64,
    /// LSN of the Begin record; recovery truncation keeps segments at or
    /// above the oldest active transaction's first LSN.
    first_lsn: AtomicU64,
}

impl Transaction {
    fn new(id: TransactionId, isolation: IsolationLevel, first_lsn: Lsn) -> Self {
        Self {
            id,
            isolation,
            state: Mutex::new(TransactionState::Active),
            read_view: Mutex::new(None),
            undo_head: AtomicU64::new(0),
            first_lsn: AtomicU64::new(first_lsn),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub fn undo_head(&self) -> UndoPtr {
        self.undo_head.load(Ordering::SeqCst)
    }

    /// Moves the undo chain head after a new undo record was written.
    pub fn set_undo_head(&self, ptr: UndoPtr) {
        self.undo_head.store(ptr, Ordering::SeqCst);
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn cached_view(&self) -> Option<Arc<ReadView>> {
        self.read_view.lock().clone()
    }

    pub(crate) fn cache_view(&self, view: Arc<ReadView>) {
        *self.read_view.lock() = Some(view);
    }

    pub(crate) fn clear_view(&self) {
        *self.read_view.lock() = None;
    }
}

/// Compensating actions rollback applies through the table layer. Each
/// implementation must emit a CLR so the rollback itself replays after a
/// crash.
pub trait CompensationApply: Send + Sync {
    /// Undo of an insert: physically remove the row.
    fn undo_insert(
        &self,
        tx: &Transaction,
        table_id: TableId,
        row_id: RowId,
        primary_key: &CompositeKey,
    ) -> Result<()>;

    /// Undo of an update: write the pre-image back.
    fn undo_update(
        &self,
        tx: &Transaction,
        table_id: TableId,
        row_id: RowId,
        old_row_bytes: &[u8],
    ) -> Result<()>;

    /// Undo of a delete: clear the delete mark, restoring the pre-image.
    fn undo_delete(
        &self,
        tx: &Transaction,
        table_id: TableId,
        row_id: RowId,
        old_row_bytes: &[u8],
    ) -> Result<()>;
}
