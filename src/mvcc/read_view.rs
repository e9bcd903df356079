// MVCC read views.
//
// A read view is an immutable snapshot of the transaction-id space taken
// at statement or transaction start. Visibility of a row version is a pure
// function of (creator, max, min_active, active_set) and the version's
// writer id; nothing here consults the clock.

use crate::common::TransactionId;

/// Snapshot of the active-transaction set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadView {
    /// Transaction the view belongs to; its own writes are visible.
    creator: TransactionId,
    /// Next id at snapshot time; ids at or above started later.
    max_tx_id: TransactionId,
    /// Smallest id still active at snapshot time; ids below committed
    /// before the snapshot.
    min_active: TransactionId,
    /// Sorted active ids, creator excluded.
    active: Vec<TransactionId>,
}

impl ReadView {
    /// Builds a view from the active set and the id allocator position.
    pub fn create(
        active_tx_ids: &[TransactionId],
        next_tx_id: TransactionId,
        creator: TransactionId,
    ) -> Self {
        let mut active: Vec<TransactionId> = active_tx_ids
            .iter()
            .copied()
            .filter(|id| *id != creator)
            .collect();
        active.sort_unstable();
        let min_active = active_tx_ids.iter().copied().min().unwrap_or(next_tx_id);
        Self {
            creator,
            max_tx_id: next_tx_id,
            min_active,
            active,
        }
    }

    pub fn creator(&self) -> TransactionId {
        self.creator
    }

    /// Oldest transaction this view may still need pre-images from.
    /// Undo purge must stay below the minimum over all live views.
    pub fn min_active(&self) -> TransactionId {
        self.min_active
    }

    /// Whether a row version written by `tx_id` is visible to this view.
    pub fn is_visible(&self, tx_id: TransactionId) -> bool {
        if tx_id == self.creator {
            return true;
        }
        if tx_id >= self.max_tx_id {
            return false;
        }
        if tx_id < self.min_active {
            return true;
        }
        self.active.binary_search(&tx_id).is_err()
    }
}
