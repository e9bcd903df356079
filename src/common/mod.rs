// Shared identifier types used across all storage-engine modules.
//
// Every persistent entity (page, slot, table, transaction, log position,
// undo position) is addressed by a plain numeric id; containers store ids,
// never back-pointers.

use serde::{Deserialize, Serialize};

/// Page number within a single tablespace file. Page 0 is the file header.
pub type PageId = u32;

/// Slot number within a slotted page.
pub type SlotId = u16;

/// Stable numeric id of a table in the catalog arena.
pub type TableId = u64;

/// Stable numeric id of an index in the catalog arena.
pub type IndexId = u64;

/// Monotonically increasing transaction id.
pub type TransactionId = u64;

/// Log sequence number; a total order over WAL records.
pub type Lsn = u64;

/// Byte offset into the undo log. `0` means "no previous version".
pub type UndoPtr = u64;

/// Stable id of an open tablespace file, derived from its path.
pub type FileId = u64;

/// Physical address of a record: page plus slot. Stable for the life of
/// the record on that page (delete keeps the slot allocated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub page_id: PageId,
    pub slot: SlotId,
}

impl RowId {
    pub fn new(page_id: PageId, slot: SlotId) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_id_ordering_is_page_major() {
        let a = RowId::new(1, 9);
        let b = RowId::new(2, 0);
        assert!(a < b);
        assert_eq!(RowId::new(3, 4).to_string(), "3:4");
    }
}
