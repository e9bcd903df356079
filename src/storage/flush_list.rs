// Dirty-page index ordered by oldest-modification LSN.
//
// Every page dirtied by a mini-transaction lands here. The entry's
// `oldest_lsn` is pinned at the first modification and never moves forward
// while the entry exists; it is the floor below which the WAL may be
// truncated at checkpoint time.

use std::collections::BTreeSet;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::common::{FileId, Lsn, PageId};
use crate::error::Result;

/// Per-page dirty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushEntry {
    /// LSN of the first unflushed modification.
    pub oldest_lsn: Lsn,
    /// LSN of the most recent modification.
    pub newest_lsn: Lsn,
}

/// Concurrent dirty-page table plus an ordering on `oldest_lsn`.
pub struct FlushList {
    entries: DashMap<(FileId, PageId), FlushEntry>,
    by_oldest: Mutex<BTreeSet<(Lsn, FileId, PageId)>>,
}

impl FlushList {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_oldest: Mutex::new(BTreeSet::new()),
        }
    }

    /// Records a modification at `lsn`. For pages already present only
    /// `newest_lsn` advances.
    pub fn add(&self, file: FileId, page: PageId, lsn: Lsn) {
        let mut ordered = self.by_oldest.lock();
        match self.entries.get_mut(&(file, page)) {
            Some(mut entry) => {
                entry.newest_lsn = entry.newest_lsn.max(lsn);
            }
            None => {
                self.entries.insert(
                    (file, page),
                    FlushEntry {
                        oldest_lsn: lsn,
                        newest_lsn: lsn,
                    },
                );
                ordered.insert((lsn, file, page));
            }
        }
    }

    /// Drops a page from the list, typically after it was flushed.
    pub fn remove(&self, file: FileId, page: PageId) {
        let mut ordered = self.by_oldest.lock();
        if let Some((_, entry)) = self.entries.remove(&(file, page)) {
            ordered.remove(&(entry.oldest_lsn, file, page));
        }
    }

    pub fn get(&self, file: FileId, page: PageId) -> Option<FlushEntry> {
        self.entries.get(&(file, page)).map(|e| *e)
    }

    /// LSN of the oldest unflushed modification across all dirty pages.
    pub fn oldest_lsn(&self) -> Option<Lsn> {
        self.by_oldest.lock().first().map(|(lsn, _, _)| *lsn)
    }

    /// Pages whose oldest modification predates `lsn`, oldest first.
    pub fn get_older_than(&self, lsn: Lsn) -> Vec<(FileId, PageId)> {
        self.by_oldest
            .lock()
            .iter()
            .take_while(|(oldest, _, _)| *oldest < lsn)
            .map(|(_, file, page)| (*file, *page))
            .collect()
    }

    /// Flushes up to `max_n` of the oldest dirty pages through `flush_fn`,
    /// returning the number flushed. A failing page stays on the list and
    /// ends the pass.
    pub fn flush<F>(&self, max_n: usize, mut flush_fn: F) -> usize
    where
        F: FnMut(FileId, PageId) -> Result<()>,
    {
        let targets: Vec<(FileId, PageId)> = {
            self.by_oldest
                .lock()
                .iter()
                .take(max_n)
                .map(|(_, file, page)| (*file, *page))
                .collect()
        };

        let mut flushed = 0;
        for (file, page) in targets {
            match flush_fn(file, page) {
                Ok(()) => {
                    self.remove(file, page);
                    flushed += 1;
                }
                Err(e) => {
                    warn!(file, page, error = %e, "flush-list pass stopped");
                    break;
                }
            }
        }
        flushed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FlushList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_lsn_is_pinned() {
        let list = FlushList::new();
        list.add(1, 10, 100);
        list.add(1, 10, 300);
        let entry = list.get(1, 10).unwrap();
        assert_eq!(entry.oldest_lsn, 100);
        assert_eq!(entry.newest_lsn, 300);
        assert_eq!(list.oldest_lsn(), Some(100));
    }

    #[test]
    fn test_ordering_across_pages() {
        let list = FlushList::new();
        list.add(1, 5, 200);
        list.add(1, 6, 50);
        list.add(2, 5, 120);
        assert_eq!(list.oldest_lsn(), Some(50));
        assert_eq!(list.get_older_than(150), vec![(1, 6), (2, 5)]);

        list.remove(1, 6);
        assert_eq!(list.oldest_lsn(), Some(120));
    }

    #[test]
    fn test_flush_stops_on_failure() {
        let list = FlushList::new();
        list.add(1, 1, 10);
        list.add(1, 2, 20);
        list.add(1, 3, 30);

        let flushed = list.flush(10, |_, page| {
            if page == 2 {
                Err(crate::error::DbError::Internal("disk unhappy".into()))
            } else {
                Ok(())
            }
        });
        assert_eq!(flushed, 1);
        // The failed page and everything younger remain.
        assert_eq!(list.len(), 2);
        assert_eq!(list.oldest_lsn(), Some(20));
    }

    #[test]
    fn test_flush_respects_max_n() {
        let list = FlushList::new();
        for page in 0..8 {
            list.add(1, page, 100 + page as u64);
        }
        let flushed = list.flush(3, |_, _| Ok(()));
        assert_eq!(flushed, 3);
        assert_eq!(list.oldest_lsn(), Some(103));
    }
}
