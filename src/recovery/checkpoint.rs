// Fuzzy checkpoints.
//
// A checkpoint snapshots the active-transaction set and the flush-list
// floor, flushes a bounded batch of the oldest dirty pages, logs a
// Checkpoint record, and atomically rewrites the checkpoint metadata file
// (temp + rename). Writers are never blocked; pages dirtied mid-checkpoint
// are covered by the WAL scan at recovery.
//
// A background thread drives periodic checkpoints off a crossbeam channel:
// it fires on the configured interval or once enough WAL bytes have
// accumulated, and shuts down through a message, not a flag poll.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::common::{FileId, Lsn, TransactionId};
use crate::error::{DbError, Result};
use crate::metrics::Metrics;
use crate::mvcc::UndoLog;
use crate::storage::buffer_pool::BufferPool;
use crate::storage::flush_list::FlushList;
use crate::storage::page_manager::PageManager;
use crate::transaction::manager::TransactionManager;
use crate::wal::log::Wal;
use crate::wal::record::{WalPayload, WalRecordType};

/// Pages flushed per checkpoint pass.
const CHECKPOINT_FLUSH_BATCH: usize = 64;

/// Durable checkpoint state, serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMeta {
    pub checkpoint_lsn: Lsn,
    /// Where the recovery WAL scan starts.
    pub flush_oldest_lsn: Lsn,
    /// Active transactions with their undo chain heads; recovery seeds
    /// its loser table from this.
    pub active_txs: Vec<(TransactionId, u64)>,
    pub taken_at: DateTime<Utc>,
}

/// Coordinator for checkpoints and WAL truncation.
pub struct CheckpointManager {
    meta_path: PathBuf,
    wal: Arc<Wal>,
    flush_list: Arc<FlushList>,
    undo: Arc<UndoLog>,
    pool: Arc<BufferPool>,
    tm: Arc<TransactionManager>,
    catalog: Arc<Catalog>,
    metrics: Metrics,
    /// Scan floor of the last persisted checkpoint metadata. Truncation
    /// never removes segments recovery would still scan from.
    persisted_floor: AtomicU64,
}

impl CheckpointManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta_path: PathBuf,
        wal: Arc<Wal>,
        flush_list: Arc<FlushList>,
        undo: Arc<UndoLog>,
        pool: Arc<BufferPool>,
        tm: Arc<TransactionManager>,
        catalog: Arc<Catalog>,
        metrics: Metrics,
    ) -> Self {
        Self {
            meta_path,
            wal,
            flush_list,
            undo,
            pool,
            tm,
            catalog,
            metrics,
            persisted_floor: AtomicU64::new(u64::MAX),
        }
    }

    /// Records the scan floor found in existing checkpoint metadata at
    /// startup.
    pub fn note_persisted_floor(&self, floor: Lsn) {
        self.persisted_floor.store(floor, Ordering::SeqCst);
    }

    /// Takes one fuzzy checkpoint.
    pub fn checkpoint(&self) -> Result<CheckpointMeta> {
        // Undo records must be durable before any page referencing them
        // can be trusted on disk.
        self.undo.flush()?;

        // Everything after `snapshot_lsn` (commits of the snapshotted
        // actives included) must stay inside the recovery scan, so the
        // floor never moves past it.
        let snapshot_lsn = self.wal.current_lsn();
        let active_txs = self.tm.active_undo_heads();
        self.flush_oldest_pages(CHECKPOINT_FLUSH_BATCH);

        let flush_oldest_lsn = self
            .flush_list
            .oldest_lsn()
            .unwrap_or(u64::MAX)
            .min(snapshot_lsn + 1);
        let checkpoint_lsn = self.wal.append(
            0,
            0,
            WalRecordType::Checkpoint,
            WalPayload::Checkpoint {
                active_txs: active_txs.iter().map(|(id, _)| *id).collect(),
                flush_oldest_lsn,
            },
        )?;
        self.wal.flush_to(checkpoint_lsn)?;

        let meta = CheckpointMeta {
            checkpoint_lsn,
            flush_oldest_lsn,
            active_txs,
            taken_at: Utc::now(),
        };
        self.persist_meta(&meta)?;
        self.persisted_floor.store(flush_oldest_lsn, Ordering::SeqCst);
        self.wal.reset_bytes_since_checkpoint();
        self.truncate_wal();

        self.metrics.counter("checkpoint.taken", 1);
        info!(
            checkpoint_lsn,
            flush_oldest_lsn,
            active = meta.active_txs.len(),
            "fuzzy checkpoint complete"
        );
        Ok(meta)
    }

    /// Flushes up to `max_pages` of the oldest dirty pages through the
    /// owning tablespaces.
    fn flush_oldest_pages(&self, max_pages: usize) {
        let flushed = self.flush_list.flush(max_pages, |file_id, page_id| {
            let pm = self
                .resolve_pm(file_id)
                .ok_or_else(|| DbError::Internal(format!("no tablespace for file {file_id}")))?;
            self.pool.flush_page(&pm, page_id)
        });
        if flushed > 0 {
            self.metrics.counter("checkpoint.pages_flushed", flushed as u64);
        }
    }

    fn resolve_pm(&self, file_id: FileId) -> Option<Arc<PageManager>> {
        for table_id in self.catalog.open_table_ids() {
            if let Ok(table) = self.catalog.table(table_id) {
                if table.page_manager().file_id() == file_id {
                    return Some(table.page_manager().clone());
                }
            }
        }
        None
    }

    /// Atomic metadata rewrite: temp file, fsync, rename.
    fn persist_meta(&self, meta: &CheckpointMeta) -> Result<()> {
        let tmp = self.meta_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }

    /// Loads the last persisted checkpoint, if any.
    pub fn load_meta(path: &Path) -> Result<Option<CheckpointMeta>> {
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        let meta = serde_json::from_str(&json)
            .map_err(|e| DbError::Corrupted(format!("checkpoint metadata: {e}")))?;
        Ok(Some(meta))
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Drops WAL segments wholly below the truncation floor: the older of
    /// the flush-list floor and the oldest active transaction's first LSN.
    pub fn truncate_wal(&self) {
        let flush_floor = self
            .flush_list
            .oldest_lsn()
            .unwrap_or_else(|| self.wal.current_lsn() + 1);
        let tx_floor = self
            .tm
            .oldest_active_first_lsn()
            .unwrap_or_else(|| self.wal.current_lsn() + 1);
        let floor = flush_floor
            .min(tx_floor)
            .min(self.persisted_floor.load(Ordering::SeqCst));
        match self.wal.truncate_below(floor) {
            Ok(removed) if removed > 0 => {
                info!(floor, removed, "truncated WAL segments");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "WAL truncation failed"),
        }
    }

    /// Starts the periodic checkpoint thread. It fires when the interval
    /// elapses or the WAL grows past `log_bytes_threshold` (0 disables the
    /// byte trigger), and stops when the handle shuts down.
    pub fn start_background(
        self: &Arc<Self>,
        interval: Duration,
        log_bytes_threshold: u64,
    ) -> CheckpointHandle {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let manager = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("checkpointer".into())
            .spawn(move || {
                let poll_every = if interval.is_zero() {
                    Duration::from_millis(500)
                } else {
                    interval.min(Duration::from_millis(500))
                };
                let mut last = Instant::now();
                loop {
                    match shutdown_rx.recv_timeout(poll_every) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let interval_due = !interval.is_zero() && last.elapsed() >= interval;
                    let bytes_due = log_bytes_threshold > 0
                        && manager.wal.bytes_since_checkpoint() >= log_bytes_threshold;
                    if !interval_due && !bytes_due {
                        continue;
                    }
                    if let Err(e) = manager.checkpoint() {
                        warn!(error = %e, "periodic checkpoint failed");
                    }
                    last = Instant::now();
                }
            })
            .expect("spawn checkpointer thread");
        CheckpointHandle {
            shutdown: shutdown_tx,
            thread: Some(thread),
        }
    }
}

/// Owner handle for the background checkpoint thread.
pub struct CheckpointHandle {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl CheckpointHandle {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CheckpointHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
