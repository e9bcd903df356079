// Mini-transactions.
//
// A mini-transaction bundles the page modifications of one logical step
// (a row insert, a split, an undo write-back) so they reach the WAL as a
// single contiguous group with one commit LSN. It is the unit of page
// atomicity with respect to recovery, not a user transaction: nothing is
// durable until `commit`, and a dropped or rolled-back mini-transaction
// emits no log records at all.

use tracing::debug;

use crate::common::{Lsn, PageId, SlotId, TableId, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::page_manager::PageManager;
use crate::wal::log::Wal;
use crate::wal::record::{WalPayload, WalRecordType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MtrState {
    Active,
    Committed,
    RolledBack,
}

struct RecordedMod {
    tx_id: TransactionId,
    table_id: TableId,
    record_type: WalRecordType,
    page_id: PageId,
    slot: SlotId,
    undo_ptr: u64,
    before: Option<Vec<u8>>,
    after: Option<Vec<u8>>,
}

/// Atomic multi-page modification unit.
pub struct MiniTransaction {
    id: u64,
    state: MtrState,
    mods: Vec<RecordedMod>,
}

impl MiniTransaction {
    /// Starts a new mini-transaction with a unique id.
    pub fn begin(wal: &Wal) -> Self {
        Self {
            id: wal.next_mini_tx_id(),
            state: MtrState::Active,
            mods: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.state == MtrState::Active
    }

    /// Records one slot modification. `after = None` means the slot is
    /// delete-flagged; `before` carries the pre-image and `undo_ptr` the
    /// undo record written for this change (0 when none).
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        tx_id: TransactionId,
        table_id: TableId,
        record_type: WalRecordType,
        page_id: PageId,
        slot: SlotId,
        undo_ptr: u64,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    ) -> Result<()> {
        if self.state != MtrState::Active {
            return Err(DbError::InvalidOperation(
                "record on a finished mini-transaction".into(),
            ));
        }
        if !record_type.is_page_record() {
            return Err(DbError::InvalidOperation(format!(
                "{:?} is not a page modification record",
                record_type
            )));
        }
        self.mods.push(RecordedMod {
            tx_id,
            table_id,
            record_type,
            page_id,
            slot,
            undo_ptr,
            before,
            after,
        });
        Ok(())
    }

    /// Writes the group to the WAL, stamps every touched page with the
    /// group's commit LSN, and registers the pages dirty. Returns the
    /// commit LSN (0 for an empty group).
    pub fn commit(&mut self, wal: &Wal, pool: &BufferPool, pm: &PageManager) -> Result<Lsn> {
        if self.state != MtrState::Active {
            return Err(DbError::InvalidOperation(
                "mini-transaction already committed".into(),
            ));
        }
        self.state = MtrState::Committed;
        if self.mods.is_empty() {
            return Ok(0);
        }

        let entries = self
            .mods
            .iter()
            .map(|m| {
                (
                    m.tx_id,
                    m.table_id,
                    m.record_type,
                    WalPayload::PageImage {
                        page_id: m.page_id,
                        slot: m.slot,
                        undo_ptr: m.undo_ptr,
                        before: m.before.clone(),
                        after: m.after.clone(),
                    },
                )
            })
            .collect();
        let (first_lsn, commit_lsn) = wal.append_group(entries)?;

        let mut stamped: Vec<PageId> = Vec::new();
        for m in &self.mods {
            if stamped.contains(&m.page_id) {
                continue;
            }
            pool.stamp_page_lsn(pm, m.page_id, commit_lsn, first_lsn)?;
            stamped.push(m.page_id);
        }
        self.mods.clear();
        Ok(commit_lsn)
    }

    /// Discards the recorded modifications without logging anything. The
    /// caller is responsible for undoing any in-memory page edits before
    /// releasing its pins.
    pub fn rollback(&mut self) {
        self.state = MtrState::RolledBack;
        self.mods.clear();
    }
}

impl Drop for MiniTransaction {
    fn drop(&mut self) {
        if self.state == MtrState::Active && !self.mods.is_empty() {
            debug!(mtr = self.id, mods = self.mods.len(), "mini-transaction dropped while active");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::doublewrite::DoublewriteBuffer;
    use crate::storage::flush_list::FlushList;
    use crate::storage::page::PageType;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 4096;

    struct Fixture {
        _dir: TempDir,
        wal: Arc<Wal>,
        pool: BufferPool,
        pm: PageManager,
        flush_list: Arc<FlushList>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(Wal::open(&dir.path().join("wal"), 1 << 20).unwrap());
        let dw = Arc::new(
            DoublewriteBuffer::open(&dir.path().join("doublewrite.buf"), PAGE_SIZE, 16).unwrap(),
        );
        let flush_list = Arc::new(FlushList::new());
        let pm = PageManager::open(&dir.path().join("t.cdb"), PAGE_SIZE, true).unwrap();
        let pool = BufferPool::new(
            16,
            5.0 / 8.0,
            Duration::from_millis(1000),
            wal.clone(),
            dw,
            flush_list.clone(),
            crate::metrics::noop(),
        );
        Fixture {
            _dir: dir,
            wal,
            pool,
            pm,
            flush_list,
        }
    }

    #[test]
    fn test_commit_stamps_pages_and_dirty_state() {
        let f = fixture();
        let frame = f.pool.new_page(&f.pm, PageType::Data).unwrap();
        let page_id = frame.page_id();
        let slot = frame.page().write().insert(b"row").unwrap();

        let mut mtr = MiniTransaction::begin(&f.wal);
        mtr.record(1, 9, WalRecordType::Insert, page_id, slot, 0, None, Some(b"row".to_vec()))
            .unwrap();
        let lsn = mtr.commit(&f.wal, &f.pool, &f.pm).unwrap();

        assert!(lsn > 0);
        assert_eq!(frame.page().read().lsn(), lsn);
        assert!(frame.is_dirty());
        assert_eq!(f.flush_list.get(f.pm.file_id(), page_id).unwrap().oldest_lsn, lsn);
        f.pool.unpin(&f.pm, page_id, false).unwrap();
    }

    #[test]
    fn test_group_is_contiguous_with_single_commit_lsn() {
        let f = fixture();
        let a = f.pool.new_page(&f.pm, PageType::Data).unwrap();
        let b = f.pool.new_page(&f.pm, PageType::Data).unwrap();
        a.page().write().insert(b"left").unwrap();
        b.page().write().insert(b"right").unwrap();

        let mut mtr = MiniTransaction::begin(&f.wal);
        mtr.record(1, 9, WalRecordType::Insert, a.page_id(), 0, 0, None, Some(b"left".to_vec()))
            .unwrap();
        mtr.record(1, 9, WalRecordType::Insert, b.page_id(), 0, 0, None, Some(b"right".to_vec()))
            .unwrap();
        let lsn = mtr.commit(&f.wal, &f.pool, &f.pm).unwrap();

        // Both pages carry the same commit LSN.
        assert_eq!(a.page().read().lsn(), lsn);
        assert_eq!(b.page().read().lsn(), lsn);
        // And the flush floor is the first LSN of the group.
        let floor = f.flush_list.get(f.pm.file_id(), a.page_id()).unwrap().oldest_lsn;
        assert_eq!(floor, lsn - 1);
    }

    #[test]
    fn test_commit_after_commit_is_usage_error() {
        let f = fixture();
        let mut mtr = MiniTransaction::begin(&f.wal);
        mtr.commit(&f.wal, &f.pool, &f.pm).unwrap();
        assert!(matches!(
            mtr.commit(&f.wal, &f.pool, &f.pm),
            Err(DbError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_rollback_emits_nothing() {
        let f = fixture();
        let frame = f.pool.new_page(&f.pm, PageType::Data).unwrap();
        let before_lsn = f.wal.current_lsn();

        let mut mtr = MiniTransaction::begin(&f.wal);
        mtr.record(1, 9, WalRecordType::Insert, frame.page_id(), 0, 0, None, Some(b"x".to_vec()))
            .unwrap();
        mtr.rollback();
        assert_eq!(f.wal.current_lsn(), before_lsn);
        assert!(mtr.record(1, 9, WalRecordType::Insert, 1, 0, 0, None, None).is_err());
    }

    #[test]
    fn test_unique_ids() {
        let f = fixture();
        let a = MiniTransaction::begin(&f.wal);
        let b = MiniTransaction::begin(&f.wal);
        assert_ne!(a.id(), b.id());
    }
}
