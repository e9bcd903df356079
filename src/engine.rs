// Engine façade.
//
// Opens the data directory, wires the subsystems together in dependency
// order (WAL and undo before the buffer pool, catalog and tables before
// recovery), runs crash recovery, and then starts the background
// checkpointer. All executor-facing entry points live here.
//
// On-disk layout under the data directory:
//
//   catalog.sys          serialized catalog pages
//   <db>/<table>.cdb     per-table heap file
//   wal/wal-NNNNNN.log   log segments (archive/ holds gzipped ones)
//   undo/undo-NNNNNN.seg undo segments
//   doublewrite.buf      torn-page staging file
//   checkpoint           checkpoint metadata (atomically rewritten)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::catalog::{Catalog, Schema, TableMeta};
use crate::config::{EngineConfig, IsolationLevel};
use crate::error::Result;
use crate::lock::LockManager;
use crate::metrics::{self, Metrics};
use crate::mvcc::UndoLog;
use crate::recovery::{CheckpointHandle, CheckpointManager, RecoveryDriver};
use crate::storage::buffer_pool::{BufferPool, BufferPoolStats};
use crate::storage::doublewrite::DoublewriteBuffer;
use crate::storage::flush_list::FlushList;
use crate::storage::page_manager::PageManager;
use crate::table::Table;
use crate::transaction::manager::{RecoveryReport, TransactionManager};
use crate::transaction::Transaction;
use crate::wal::log::Wal;

/// A fully wired storage engine instance.
pub struct Engine {
    config: EngineConfig,
    metrics: Metrics,
    wal: Arc<Wal>,
    undo: Arc<UndoLog>,
    doublewrite: Arc<DoublewriteBuffer>,
    flush_list: Arc<FlushList>,
    pool: Arc<BufferPool>,
    locks: Arc<LockManager>,
    catalog: Arc<Catalog>,
    tm: Arc<TransactionManager>,
    checkpoints: Arc<CheckpointManager>,
    checkpoint_thread: Option<CheckpointHandle>,
    recovery_report: RecoveryReport,
}

impl Engine {
    /// Opens the engine with a no-op metrics sink.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_metrics(config, metrics::noop())
    }

    /// Opens the engine: builds every subsystem, opens all tables named by
    /// the catalog, runs recovery, and starts the checkpointer.
    pub fn open_with_metrics(config: EngineConfig, metrics: Metrics) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let wal = Arc::new(Wal::open(
            &config.data_dir.join("wal"),
            config.wal_segment_size,
        )?);
        let undo = Arc::new(UndoLog::open(&config.data_dir.join("undo"))?);
        let doublewrite = Arc::new(DoublewriteBuffer::open(
            &config.data_dir.join("doublewrite.buf"),
            config.page_size,
            config.doublewrite_pages,
        )?);
        let flush_list = Arc::new(FlushList::new());
        let pool = Arc::new(BufferPool::new(
            config.buffer_pool_size_pages,
            config.buffer_pool_young_ratio,
            Duration::from_millis(config.old_block_time_ms),
            wal.clone(),
            doublewrite.clone(),
            flush_list.clone(),
            metrics.clone(),
        ));
        let locks = Arc::new(LockManager::new(
            Duration::from_millis(config.lock_wait_timeout_ms),
            metrics.clone(),
        ));

        let catalog_pm = Arc::new(PageManager::open(
            &config.data_dir.join("catalog.sys"),
            config.page_size,
            true,
        )?);
        let catalog = Arc::new(Catalog::open(catalog_pm)?);

        let tm = Arc::new(TransactionManager::new(
            wal.clone(),
            undo.clone(),
            locks.clone(),
            config.default_isolation,
            metrics.clone(),
        ));

        let mut engine = Self {
            checkpoints: Arc::new(CheckpointManager::new(
                config.data_dir.join("checkpoint"),
                wal.clone(),
                flush_list.clone(),
                undo.clone(),
                pool.clone(),
                tm.clone(),
                catalog.clone(),
                metrics.clone(),
            )),
            config,
            metrics,
            wal,
            undo,
            doublewrite,
            flush_list,
            pool,
            locks,
            catalog,
            tm,
            checkpoint_thread: None,
            recovery_report: RecoveryReport::default(),
        };

        // Open every table the catalog knows, so recovery can address
        // them by id.
        for db in engine.catalog.list_dbs() {
            for meta in engine.catalog.list_tables(&db) {
                engine.open_table(&meta)?;
            }
        }

        engine.recovery_report = RecoveryDriver {
            tm: &engine.tm,
            catalog: &engine.catalog,
            doublewrite: &engine.doublewrite,
            checkpoints: &engine.checkpoints,
        }
        .run()?;

        engine.checkpoint_thread = Some(engine.checkpoints.start_background(
            Duration::from_millis(engine.config.checkpoint_interval_ms),
            engine.config.checkpoint_log_bytes,
        ));

        info!(
            data_dir = %engine.config.data_dir.display(),
            "engine open"
        );
        Ok(engine)
    }

    fn table_path(&self, db: &str, name: &str) -> PathBuf {
        self.config.data_dir.join(db).join(format!("{name}.cdb"))
    }

    fn open_table(&self, meta: &TableMeta) -> Result<Arc<Table>> {
        let path = self.table_path(&meta.db, &meta.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pm = Arc::new(PageManager::open(&path, self.config.page_size, true)?);
        let table = Table::new(
            meta.clone(),
            pm,
            self.pool.clone(),
            self.wal.clone(),
            self.undo.clone(),
            self.locks.clone(),
            self.tm.clone(),
            self.metrics.clone(),
        );
        self.catalog.register_table(table.clone());
        Ok(table)
    }

    // ---- transactions ----

    pub fn begin(&self) -> Result<Arc<Transaction>> {
        self.tm.begin(None)
    }

    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<Arc<Transaction>> {
        self.tm.begin(Some(isolation))
    }

    pub fn commit(&self, tx: &Transaction) -> Result<()> {
        self.tm.commit(tx)
    }

    pub fn rollback(&self, tx: &Transaction) -> Result<()> {
        self.tm.rollback(tx, self.catalog.as_ref())
    }

    /// Runs one statement in its own transaction: begin, apply, commit,
    /// rolling back on failure. This is the autocommit contract the
    /// executor builds on.
    pub fn autocommit<T>(
        &self,
        f: impl FnOnce(&Arc<Transaction>) -> Result<T>,
    ) -> Result<T> {
        let tx = self.begin()?;
        match f(&tx) {
            Ok(value) => {
                self.commit(&tx)?;
                Ok(value)
            }
            Err(e) => {
                // Deadlock and timeout victims may already be released;
                // the rollback result is secondary to the original error.
                let _ = self.tm.rollback(&tx, self.catalog.as_ref());
                Err(e)
            }
        }
    }

    // ---- DDL ----

    pub fn create_db(&self, name: &str) -> Result<()> {
        self.catalog.create_db(name)
    }

    pub fn drop_db(&self, name: &str) -> Result<()> {
        for meta in self.catalog.list_tables(name) {
            if let Ok(table) = self.catalog.table(meta.id) {
                self.pool.discard_file(table.page_manager().file_id());
            }
        }
        self.catalog.drop_db(name)?;
        let dir = self.config.data_dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn create_table(&self, db: &str, name: &str, schema: Schema) -> Result<Arc<Table>> {
        let meta = self.catalog.create_table(db, name, schema)?;
        self.open_table(&meta)
    }

    pub fn drop_table(&self, db: &str, name: &str) -> Result<()> {
        let meta = self.catalog.get_table(db, name)?;
        if let Ok(table) = self.catalog.table(meta.id) {
            self.pool.discard_file(table.page_manager().file_id());
        }
        self.catalog.drop_table(db, name)?;
        let path = self.table_path(db, name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn table(&self, db: &str, name: &str) -> Result<Arc<Table>> {
        let meta = self.catalog.get_table(db, name)?;
        self.catalog.table(meta.id)
    }

    // ---- maintenance ----

    /// Takes a fuzzy checkpoint now.
    pub fn checkpoint(&self) -> Result<()> {
        self.checkpoints.checkpoint().map(|_| ())
    }

    /// Flushes WAL, undo, and every open table.
    pub fn flush(&self) -> Result<()> {
        self.tm.flush()?;
        for table_id in self.catalog.open_table_ids() {
            self.catalog.table(table_id)?.flush()?;
        }
        Ok(())
    }

    /// Clean shutdown: stop the checkpointer, checkpoint, flush.
    pub fn close(mut self) -> Result<()> {
        if let Some(handle) = self.checkpoint_thread.take() {
            handle.stop();
        }
        self.checkpoints.checkpoint()?;
        self.flush()?;
        info!("engine closed");
        Ok(())
    }

    // ---- introspection ----

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn buffer_pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    pub fn dirty_page_count(&self) -> usize {
        self.flush_list.len()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("dirty_pages", &self.flush_list.len())
            .finish()
    }
}
