// Startup recovery driver.
//
// Runs at engine open, before any transaction starts:
//
//   1. doublewrite repair: every staged page is checked against its
//      target; torn targets get the staged copy back, so page checksums
//      hold for the redo pass;
//   2. analysis + redo + undo via `TransactionManager::recover`, replaying
//      page records newer than the on-disk page LSN and rolling back every
//      transaction without a Commit/Abort, with CLRs;
//   3. flush everything replayed, truncate the WAL below the new floor,
//      and clear the doublewrite staging area.

use std::sync::Arc;

use tracing::info;

use crate::catalog::Catalog;
use crate::error::Result;
use crate::recovery::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::storage::doublewrite::DoublewriteBuffer;
use crate::transaction::manager::{RecoveryReport, TransactionManager};

/// Borrows the subsystems recovery needs; built by the engine at open.
pub struct RecoveryDriver<'a> {
    pub tm: &'a Arc<TransactionManager>,
    pub catalog: &'a Arc<Catalog>,
    pub doublewrite: &'a Arc<DoublewriteBuffer>,
    pub checkpoints: &'a Arc<CheckpointManager>,
}

impl RecoveryDriver<'_> {
    /// Runs the full recovery sequence. Returns the pass report.
    pub fn run(&self) -> Result<RecoveryReport> {
        let meta = CheckpointManager::load_meta(self.checkpoints.meta_path())?;
        let start_lsn = match &meta {
            Some(CheckpointMeta {
                flush_oldest_lsn, ..
            }) => (*flush_oldest_lsn).max(1),
            None => 1,
        };
        let seed_losers: Vec<_> = meta
            .as_ref()
            .map(|m| m.active_txs.clone())
            .unwrap_or_default();
        if let Some(m) = &meta {
            self.checkpoints.note_persisted_floor(m.flush_oldest_lsn);
        }
        info!(start_lsn, had_checkpoint = meta.is_some(), "starting recovery");

        // Torn-page repair first, so redo reads verify.
        let mut repaired = 0;
        for table_id in self.catalog.open_table_ids() {
            let table = self.catalog.table(table_id)?;
            repaired += self
                .doublewrite
                .recover(table.page_manager().path())?;
        }
        if repaired > 0 {
            info!(repaired, "doublewrite repaired torn pages");
        }

        let catalog = self.catalog;
        let tm = self.tm;
        let report = tm.recover(
            start_lsn,
            &seed_losers,
            |record| {
                if record.table_id == 0 {
                    return Ok(false);
                }
                match catalog.table(record.table_id) {
                    Ok(table) => table.apply_redo(record),
                    // A table dropped after the record was written; its
                    // pages are gone with it.
                    Err(_) => Ok(false),
                }
            },
            |tx_id, undo_head| {
                let tx = tm.recovered_transaction(tx_id, undo_head);
                tm.apply_undo_chain(&tx, catalog.as_ref())
            },
        )?;

        // Make the recovered state durable before truncating anything.
        for table_id in self.catalog.open_table_ids() {
            self.catalog.table(table_id)?.flush()?;
        }
        self.checkpoints.truncate_wal();
        self.doublewrite.clear()?;

        info!(
            redone = report.records_redone,
            losers = report.losers_rolled_back,
            "recovery finished"
        );
        Ok(report)
    }
}
