// File-backed page allocator.
//
// One PageManager owns one tablespace file. Page 0 is a header page
// carrying the file magic, layout version, and page count; data pages
// follow at page-aligned offsets. All reads verify the page checksum.

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{FileId, PageId};
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageType, PAGE_HEADER_SIZE};

const FILE_MAGIC: u32 = 0x5346_5047; // "SFPG"
const FILE_VERSION: u16 = 1;

// Header page payload offsets (after the standard page header).
const OFF_MAGIC: usize = PAGE_HEADER_SIZE;
const OFF_VERSION: usize = PAGE_HEADER_SIZE + 4;
const OFF_PAGE_COUNT: usize = PAGE_HEADER_SIZE + 6;

/// Owner of a single tablespace file and its page allocation state.
pub struct PageManager {
    path: PathBuf,
    file_id: FileId,
    page_size: usize,
    file: Mutex<File>,
    page_count: AtomicU32,
}

impl PageManager {
    /// Opens a tablespace file, creating it with a fresh header page when
    /// `create_if_missing` is set.
    pub fn open(path: &Path, page_size: usize, create_if_missing: bool) -> Result<Self> {
        let exists = path.exists();
        if !exists && !create_if_missing {
            return Err(DbError::NotFound(format!(
                "tablespace {}",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(path)?;

        let manager = Self {
            path: path.to_path_buf(),
            file_id: file_id_for(path),
            page_size,
            file: Mutex::new(file),
            page_count: AtomicU32::new(1),
        };

        if exists {
            manager.load_header()?;
        } else {
            let mut header = Page::new(0, PageType::Meta, page_size);
            write_header_fields(&mut header, 1);
            manager.write_at(0, &mut header)?;
            manager.file.lock().sync_all()?;
        }
        Ok(manager)
    }

    fn load_header(&self) -> Result<()> {
        let header = self.read_page_at(0)?;
        let magic = u32::from_le_bytes(header.as_bytes()[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != FILE_MAGIC {
            return Err(DbError::Corrupted(format!(
                "{}: bad file magic {:#x}",
                self.path.display(),
                magic
            )));
        }
        let version =
            u16::from_le_bytes(header.as_bytes()[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap());
        if version != FILE_VERSION {
            return Err(DbError::Corrupted(format!(
                "{}: unsupported layout version {}",
                self.path.display(),
                version
            )));
        }
        let count = u32::from_le_bytes(
            header.as_bytes()[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].try_into().unwrap(),
        );
        self.page_count.store(count, Ordering::SeqCst);
        Ok(())
    }

    fn persist_header(&self) -> Result<()> {
        let mut header = self.read_page_at(0)?;
        write_header_fields(&mut header, self.page_count.load(Ordering::SeqCst));
        self.write_at(0, &mut header)
    }

    /// Allocates a fresh zeroed page of the given type at the end of the
    /// file and persists the new page count.
    pub fn allocate(&self, page_type: PageType) -> Result<Page> {
        let page_id = self.page_count.fetch_add(1, Ordering::SeqCst);
        let mut page = Page::new(page_id, page_type, self.page_size);
        self.write_at(page_id, &mut page)?;
        self.persist_header()?;
        Ok(page)
    }

    /// Extends the file so `page_id` is allocated. Recovery replays records
    /// into pages whose allocation never reached the header before a crash.
    pub fn ensure_allocated(&self, page_id: PageId, page_type: PageType) -> Result<()> {
        while self.page_count.load(Ordering::SeqCst) <= page_id {
            self.allocate(page_type)?;
        }
        Ok(())
    }

    /// Reads and checksum-verifies a page.
    pub fn read(&self, page_id: PageId) -> Result<Page> {
        self.check_range(page_id)?;
        let page = self.read_page_at(page_id)?;
        if !page.verify_checksum() {
            return Err(DbError::Corrupted(format!(
                "{}: checksum mismatch on page {}",
                self.path.display(),
                page_id
            )));
        }
        Ok(page)
    }

    /// Reads a page without verifying its checksum. The doublewrite scan
    /// uses this to inspect potentially torn pages.
    pub fn read_unverified(&self, page_id: PageId) -> Result<Page> {
        self.check_range(page_id)?;
        self.read_page_at(page_id)
    }

    /// Stamps the checksum and writes the page at its aligned offset.
    pub fn write(&self, page: &mut Page) -> Result<()> {
        let page_id = page.id();
        self.check_range(page_id)?;
        self.write_at(page_id, page)
    }

    /// Writes a raw page image. Used by doublewrite recovery, where the
    /// buffered copy already carries a valid checksum.
    pub fn write_raw(&self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.page_size {
            return Err(DbError::InvalidOperation(format!(
                "raw write of {} bytes into {}-byte pages",
                bytes.len(),
                self.page_size
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset_of(page_id)))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Durably flushes the file, including the header page.
    pub fn flush(&self) -> Result<()> {
        self.persist_header()?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Shrinks the file to `n_pages` pages (header page included).
    pub fn truncate(&self, n_pages: u32) -> Result<()> {
        if n_pages == 0 {
            return Err(DbError::InvalidOperation(
                "cannot truncate away the header page".into(),
            ));
        }
        {
            let file = self.file.lock();
            file.set_len(n_pages as u64 * self.page_size as u64)?;
        }
        self.page_count.store(n_pages, Ordering::SeqCst);
        self.persist_header()?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Byte offset of a page within the file.
    pub fn offset_of(&self, page_id: PageId) -> u64 {
        page_id as u64 * self.page_size as u64
    }

    fn check_range(&self, page_id: PageId) -> Result<()> {
        if page_id >= self.page_count.load(Ordering::SeqCst) {
            return Err(DbError::OutOfRange(format!(
                "{}: page {} beyond page count {}",
                self.path.display(),
                page_id,
                self.page_count()
            )));
        }
        Ok(())
    }

    fn read_page_at(&self, page_id: PageId) -> Result<Page> {
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset_of(page_id)))?;
        file.read_exact(&mut buf)?;
        Ok(Page::from_raw(buf))
    }

    fn write_at(&self, page_id: PageId, page: &mut Page) -> Result<()> {
        page.update_checksum();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset_of(page_id)))?;
        file.write_all(page.as_bytes())?;
        Ok(())
    }
}

/// Stable file id derived from the path. Buffer-pool frames and the flush
/// list key on `(file_id, page_id)`.
pub fn file_id_for(path: &Path) -> FileId {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

fn write_header_fields(header: &mut Page, page_count: u32) {
    let raw = header.as_bytes_mut();
    raw[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
    raw[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&FILE_VERSION.to_le_bytes());
    raw[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].copy_from_slice(&page_count.to_le_bytes());
}
