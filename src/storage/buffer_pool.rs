// Buffer pool with a young/old LRU.
//
// Frames are keyed by (file_id, page_id). A freshly loaded page enters at
// the head of the old region; it is promoted to the young region only when
// re-accessed after `old_block_time`, which keeps one long sequential scan
// from flushing the working set. Eviction walks the old tail first, then
// the young tail, skipping pinned frames.
//
// The WAL rule is enforced here: no dirty frame reaches its tablespace
// file until the log is durable through the frame's last-modification LSN,
// and every tablespace write goes through the doublewrite buffer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::common::{FileId, Lsn, PageId};
use crate::error::{DbError, Result};
use crate::metrics::Metrics;
use crate::storage::doublewrite::DoublewriteBuffer;
use crate::storage::flush_list::FlushList;
use crate::storage::page::{Page, PageType};
use crate::storage::page_manager::PageManager;
use crate::wal::log::Wal;

/// One resident page plus its cache bookkeeping.
pub struct Frame {
    file_id: FileId,
    page_id: PageId,
    page: RwLock<Page>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    /// LSN of the last modification, used by the WAL-rule check on flush.
    last_lsn: AtomicU64,
    loaded_at: Instant,
}

impl Frame {
    fn new(file_id: FileId, page: Page) -> Self {
        Self {
            file_id,
            page_id: page.id(),
            page: RwLock::new(page),
            pin_count: AtomicU32::new(1),
            dirty: AtomicBool::new(false),
            last_lsn: AtomicU64::new(0),
            loaded_at: Instant::now(),
        }
    }

    pub fn page(&self) -> &RwLock<Page> {
        &self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Young,
    Old,
}

struct LruState {
    /// Head = most recently promoted; eviction scans from the back.
    young: VecDeque<(FileId, PageId)>,
    old: VecDeque<(FileId, PageId)>,
    young_to_old: u64,
    old_to_young: u64,
}

impl LruState {
    fn region_of(&self, key: (FileId, PageId)) -> Option<Region> {
        if self.young.contains(&key) {
            Some(Region::Young)
        } else if self.old.contains(&key) {
            Some(Region::Old)
        } else {
            None
        }
    }

    fn unlink(&mut self, key: (FileId, PageId)) {
        self.young.retain(|k| *k != key);
        self.old.retain(|k| *k != key);
    }
}

/// Point-in-time counters exposed to operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPoolStats {
    pub capacity: usize,
    pub count: usize,
    pub hit_ratio: f64,
    pub young_count: usize,
    pub old_count: usize,
    pub young_to_old: u64,
    pub old_to_young: u64,
}

/// Bounded page cache shared by every tablespace file.
pub struct BufferPool {
    capacity: usize,
    young_capacity: usize,
    old_block_time: Duration,
    frames: DashMap<(FileId, PageId), Arc<Frame>>,
    /// Tablespace paths by file id, so eviction can write a dirty victim
    /// without the owning PageManager in hand.
    paths: DashMap<FileId, PathBuf>,
    lru: Mutex<LruState>,
    wal: Arc<Wal>,
    doublewrite: Arc<DoublewriteBuffer>,
    flush_list: Arc<FlushList>,
    metrics: Metrics,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new(
        capacity: usize,
        young_ratio: f64,
        old_block_time: Duration,
        wal: Arc<Wal>,
        doublewrite: Arc<DoublewriteBuffer>,
        flush_list: Arc<FlushList>,
        metrics: Metrics,
    ) -> Self {
        let young_capacity = ((capacity as f64) * young_ratio).max(1.0) as usize;
        Self {
            capacity,
            young_capacity,
            old_block_time,
            frames: DashMap::new(),
            paths: DashMap::new(),
            lru: Mutex::new(LruState {
                young: VecDeque::new(),
                old: VecDeque::new(),
                young_to_old: 0,
                old_to_young: 0,
            }),
            wal,
            doublewrite,
            flush_list,
            metrics,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Allocates a fresh page in `pm` and returns it pinned.
    pub fn new_page(&self, pm: &PageManager, page_type: PageType) -> Result<Arc<Frame>> {
        self.register_file(pm);
        self.make_room()?;
        let page = pm.allocate(page_type)?;
        let key = (pm.file_id(), page.id());
        let frame = Arc::new(Frame::new(pm.file_id(), page));
        self.frames.insert(key, frame.clone());
        self.lru.lock().old.push_front(key);
        Ok(frame)
    }

    /// Fetches a page, loading it from `pm` on a miss. The returned frame
    /// is pinned; callers pair every `get` with an `unpin`.
    pub fn get(&self, pm: &PageManager, page_id: PageId) -> Result<Arc<Frame>> {
        self.register_file(pm);
        let key = (pm.file_id(), page_id);

        if let Some(frame) = self.frames.get(&key).map(|f| f.value().clone()) {
            frame.pin_count.fetch_add(1, Ordering::SeqCst);
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.counter("buffer_pool.hit", 1);
            self.touch(key, &frame);
            return Ok(frame);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.counter("buffer_pool.miss", 1);
        self.make_room()?;
        let page = pm.read(page_id)?;
        let frame = Arc::new(Frame::new(pm.file_id(), page));
        // A racing loader may have inserted the frame meanwhile; reuse it.
        match self.frames.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let winner = existing.get().clone();
                winner.pin_count.fetch_add(1, Ordering::SeqCst);
                return Ok(winner);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(frame.clone());
            }
        }
        self.lru.lock().old.push_front(key);
        Ok(frame)
    }

    /// Releases one pin. `dirty = true` records a modification at the
    /// WAL's current LSN.
    pub fn unpin(&self, pm: &PageManager, page_id: PageId, dirty: bool) -> Result<()> {
        let key = (pm.file_id(), page_id);
        let frame = self
            .frames
            .get(&key)
            .map(|f| f.value().clone())
            .ok_or_else(|| DbError::InvalidOperation(format!("unpin of non-resident page {page_id}")))?;
        if dirty {
            let lsn = self.wal.current_lsn();
            self.stamp_dirty_frame(&frame, lsn, lsn);
        }
        if frame.pin_count.load(Ordering::SeqCst) == 0 {
            return Err(DbError::InvalidOperation(format!(
                "unpin of unpinned page {page_id}"
            )));
        }
        frame.pin_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_file(&self, pm: &PageManager) {
        self.paths
            .entry(pm.file_id())
            .or_insert_with(|| pm.path().to_path_buf());
    }

    /// Marks a resident page dirty at the WAL's current LSN.
    pub fn mark_dirty(&self, pm: &PageManager, page_id: PageId) -> Result<()> {
        let key = (pm.file_id(), page_id);
        let frame = self
            .frames
            .get(&key)
            .map(|f| f.value().clone())
            .ok_or_else(|| DbError::InvalidOperation(format!("mark_dirty of non-resident page {page_id}")))?;
        let lsn = self.wal.current_lsn();
        self.stamp_dirty_frame(&frame, lsn, lsn);
        Ok(())
    }

    /// Stamps a mini-transaction's commit LSN onto a page: sets the page
    /// LSN, marks the frame dirty, and registers it on the flush list with
    /// the group's first LSN as the flush floor.
    pub fn stamp_page_lsn(
        &self,
        pm: &PageManager,
        page_id: PageId,
        stamp_lsn: Lsn,
        oldest_lsn: Lsn,
    ) -> Result<()> {
        let key = (pm.file_id(), page_id);
        let frame = self
            .frames
            .get(&key)
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                DbError::InvalidOperation(format!("LSN stamp of non-resident page {page_id}"))
            })?;
        frame.page.write().set_lsn(stamp_lsn);
        self.stamp_dirty_frame(&frame, stamp_lsn, oldest_lsn);
        Ok(())
    }

    fn stamp_dirty_frame(&self, frame: &Frame, lsn: Lsn, oldest_lsn: Lsn) {
        frame.dirty.store(true, Ordering::SeqCst);
        frame.last_lsn.store(lsn, Ordering::SeqCst);
        self.flush_list.add(frame.file_id, frame.page_id, oldest_lsn);
    }

    /// Flushes one page if dirty: WAL first, then doublewrite into the
    /// tablespace.
    pub fn flush_page(&self, pm: &PageManager, page_id: PageId) -> Result<()> {
        let key = (pm.file_id(), page_id);
        let Some(frame) = self.frames.get(&key).map(|f| f.value().clone()) else {
            return Ok(());
        };
        self.flush_frame(pm, &frame)
    }

    fn flush_frame(&self, pm: &PageManager, frame: &Frame) -> Result<()> {
        if !frame.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        // WAL rule: log must be durable through the page's LSN.
        self.wal.flush_to(frame.last_lsn.load(Ordering::SeqCst))?;

        let mut page = frame.page.write();
        page.update_checksum();
        self.doublewrite.write_page(
            page.as_bytes(),
            pm.path(),
            pm.offset_of(frame.page_id),
        )?;
        frame.dirty.store(false, Ordering::SeqCst);
        drop(page);
        self.flush_list.remove(frame.file_id, frame.page_id);
        Ok(())
    }

    /// Flushes every dirty frame belonging to `pm`.
    pub fn flush_all(&self, pm: &PageManager) -> Result<()> {
        let file_id = pm.file_id();
        let targets: Vec<Arc<Frame>> = self
            .frames
            .iter()
            .filter(|entry| entry.key().0 == file_id)
            .map(|entry| entry.value().clone())
            .collect();
        for frame in targets {
            self.flush_frame(pm, &frame)?;
        }
        pm.flush()?;
        Ok(())
    }

    /// LRU touch on a hit. Old-region frames are promoted to the young
    /// head only after surviving `old_block_time` in the pool.
    fn touch(&self, key: (FileId, PageId), frame: &Frame) {
        let mut lru = self.lru.lock();
        match lru.region_of(key) {
            Some(Region::Old) => {
                if frame.loaded_at.elapsed() >= self.old_block_time {
                    lru.old.retain(|k| *k != key);
                    lru.young.push_front(key);
                    lru.old_to_young += 1;
                    self.metrics.counter("buffer_pool.old_to_young", 1);
                    self.rebalance(&mut lru);
                }
            }
            Some(Region::Young) => {
                lru.young.retain(|k| *k != key);
                lru.young.push_front(key);
            }
            None => {}
        }
    }

    fn rebalance(&self, lru: &mut LruState) {
        while lru.young.len() > self.young_capacity {
            if let Some(key) = lru.young.pop_back() {
                lru.old.push_front(key);
                lru.young_to_old += 1;
                self.metrics.counter("buffer_pool.young_to_old", 1);
            }
        }
    }

    fn make_room(&self) -> Result<()> {
        while self.frames.len() >= self.capacity {
            self.evict_one()?;
        }
        Ok(())
    }

    /// Evicts the first unpinned frame found scanning the old tail, then
    /// the young tail. Dirty victims are flushed first.
    fn evict_one(&self) -> Result<()> {
        let candidate = {
            let lru = self.lru.lock();
            lru.old
                .iter()
                .rev()
                .chain(lru.young.iter().rev())
                .find(|key| {
                    self.frames
                        .get(key)
                        .map(|f| f.pin_count.load(Ordering::SeqCst) == 0)
                        .unwrap_or(false)
                })
                .copied()
        };

        let Some(key) = candidate else {
            return Err(DbError::NoFreeFrames);
        };
        let Some(frame) = self.frames.get(&key).map(|f| f.value().clone()) else {
            self.lru.lock().unlink(key);
            return Ok(());
        };

        // Hold an eviction pin so nobody else evicts the frame while the
        // flush I/O runs outside the LRU latch.
        if frame
            .pin_count
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Pinned between candidate selection and here; retry.
            return Ok(());
        }

        if frame.dirty.load(Ordering::SeqCst) {
            if let Err(e) = self.write_back(&frame) {
                // Drop the eviction pin so the frame stays evictable.
                frame.pin_count.store(0, Ordering::SeqCst);
                return Err(e);
            }
        }

        let mut lru = self.lru.lock();
        lru.unlink(key);
        drop(lru);
        self.frames.remove(&key);
        trace!(file = key.0, page = key.1, "evicted frame");
        self.metrics.counter("buffer_pool.evictions", 1);
        Ok(())
    }

    /// Writes a dirty frame back through doublewrite without the owning
    /// PageManager in hand (eviction path).
    fn write_back(&self, frame: &Frame) -> Result<()> {
        self.wal.flush_to(frame.last_lsn.load(Ordering::SeqCst))?;
        let mut page = frame.page.write();
        page.update_checksum();
        let path = self
            .paths
            .get(&frame.file_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| {
                DbError::Internal(format!("no path registered for file {}", frame.file_id))
            })?;
        self.doublewrite.write_page(
            page.as_bytes(),
            &path,
            frame.page_id as u64 * page.size() as u64,
        )?;
        frame.dirty.store(false, Ordering::SeqCst);
        drop(page);
        self.flush_list.remove(frame.file_id, frame.page_id);
        Ok(())
    }

    /// Drops every frame of a tablespace without flushing, along with its
    /// flush-list entries. Used when the file itself is being removed.
    pub fn discard_file(&self, file_id: FileId) {
        let keys: Vec<(FileId, PageId)> = self
            .frames
            .iter()
            .filter(|entry| entry.key().0 == file_id)
            .map(|entry| *entry.key())
            .collect();
        let mut lru = self.lru.lock();
        for key in keys {
            lru.unlink(key);
            self.frames.remove(&key);
            self.flush_list.remove(key.0, key.1);
        }
        drop(lru);
        self.paths.remove(&file_id);
    }

    pub fn stats(&self) -> BufferPoolStats {
        let lru = self.lru.lock();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        BufferPoolStats {
            capacity: self.capacity,
            count: self.frames.len(),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            young_count: lru.young.len(),
            old_count: lru.old.len(),
            young_to_old: lru.young_to_old,
            old_to_young: lru.old_to_young,
        }
    }
}
