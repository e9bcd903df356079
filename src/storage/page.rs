// Slotted page layout.
//
// A page is a fixed-size byte block: a 32-byte header, a slot directory
// growing forward from the header, and record payloads growing backward
// from the end of the page. Slots are never reclaimed while the page lives
// so record addresses ({page_id, slot}) stay stable; deleted record space
// is recovered by `compact`, which rewrites live payloads contiguously
// without renumbering slots.

use crate::common::{Lsn, PageId, SlotId};
use crate::error::{DbError, Result};
use crate::storage::checksum::page_checksum;

/// Byte size of the fixed page header.
pub const PAGE_HEADER_SIZE: usize = 32;
/// Byte size of one slot directory entry: offset, length, flags.
pub const SLOT_SIZE: usize = 6;

// Header field offsets.
const OFF_PAGE_ID: usize = 0; // u32
const OFF_PAGE_TYPE: usize = 4; // u8
const OFF_LSN: usize = 5; // u64
const OFF_SLOT_COUNT: usize = 13; // u16
const OFF_FREE_START: usize = 15; // u16
const OFF_FREE_END: usize = 17; // u16
const OFF_CHECKSUM: usize = 19; // u32
// 23..32 reserved.

/// Slot flag: record is deleted and its payload is garbage.
const SLOT_FLAG_DELETED: u16 = 0x0001;

/// Role of a page within a tablespace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Meta,
    Data,
    Index,
    Undo,
    FreeSpaceMap,
}

impl PageType {
    pub fn as_u8(self) -> u8 {
        match self {
            PageType::Meta => 0,
            PageType::Data => 1,
            PageType::Index => 2,
            PageType::Undo => 3,
            PageType::FreeSpaceMap => 4,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Meta),
            1 => Ok(PageType::Data),
            2 => Ok(PageType::Index),
            3 => Ok(PageType::Undo),
            4 => Ok(PageType::FreeSpaceMap),
            v => Err(DbError::Corrupted(format!("unknown page type {}", v))),
        }
    }
}

/// A fixed-size slotted page held in memory.
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    /// Creates an empty page of `size` bytes.
    pub fn new(id: PageId, page_type: PageType, size: usize) -> Self {
        let mut page = Self { data: vec![0; size] };
        page.write_u32(OFF_PAGE_ID, id);
        page.data[OFF_PAGE_TYPE] = page_type.as_u8();
        page.set_free_start(PAGE_HEADER_SIZE as u16);
        page.set_free_end(size as u16);
        page
    }

    /// Wraps a raw on-disk image. The caller decides whether to verify the
    /// checksum (reads do, the doublewrite scan handles failures itself).
    pub fn from_raw(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn id(&self) -> PageId {
        self.read_u32(OFF_PAGE_ID)
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_u8(self.data[OFF_PAGE_TYPE])
    }

    /// LSN of the last WAL record that modified this page.
    pub fn lsn(&self) -> Lsn {
        self.read_u64(OFF_LSN)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.write_u64(OFF_LSN, lsn);
    }

    pub fn slot_count(&self) -> u16 {
        self.read_u16(OFF_SLOT_COUNT)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw mutable access for header-page payloads that live outside the
    /// slot machinery.
    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn free_start(&self) -> u16 {
        self.read_u16(OFF_FREE_START)
    }

    fn free_end(&self) -> u16 {
        self.read_u16(OFF_FREE_END)
    }

    fn set_free_start(&mut self, v: u16) {
        self.write_u16(OFF_FREE_START, v);
    }

    fn set_free_end(&mut self, v: u16) {
        self.write_u16(OFF_FREE_END, v);
    }

    /// Free bytes between the slot directory and the record area.
    pub fn free_space(&self) -> usize {
        (self.free_end() - self.free_start()) as usize
    }

    /// Whether a record of `len` bytes (plus its slot entry) fits.
    pub fn can_fit(&self, len: usize) -> bool {
        self.free_space() >= len + SLOT_SIZE
    }

    /// Inserts a record, returning its slot number, or `None` when the slot
    /// directory plus record area cannot grow by `len + SLOT_SIZE`.
    pub fn insert(&mut self, bytes: &[u8]) -> Option<SlotId> {
        if !self.can_fit(bytes.len()) {
            return None;
        }
        let slot = self.slot_count();
        let record_off = self.free_end() as usize - bytes.len();
        self.data[record_off..record_off + bytes.len()].copy_from_slice(bytes);
        self.set_free_end(record_off as u16);
        self.write_slot(slot, record_off as u16, bytes.len() as u16, 0);
        self.write_u16(OFF_SLOT_COUNT, slot + 1);
        self.set_free_start((PAGE_HEADER_SIZE + (slot as usize + 1) * SLOT_SIZE) as u16);
        Some(slot)
    }

    /// Returns the payload at `slot`, or `None` for out-of-range or deleted
    /// slots.
    pub fn get(&self, slot: SlotId) -> Option<&[u8]> {
        let (offset, len, flags) = self.read_slot(slot)?;
        if flags & SLOT_FLAG_DELETED != 0 {
            return None;
        }
        Some(&self.data[offset as usize..offset as usize + len as usize])
    }

    /// Overwrites the record at `slot`. Shrinking updates happen in place;
    /// growing updates move the payload to a fresh region and leave the old
    /// bytes as garbage for `compact`. Returns `false` when the slot does
    /// not exist, is deleted, or the grown payload does not fit.
    pub fn update(&mut self, slot: SlotId, bytes: &[u8]) -> bool {
        let Some((offset, len, flags)) = self.read_slot(slot) else {
            return false;
        };
        if flags & SLOT_FLAG_DELETED != 0 {
            return false;
        }
        if bytes.len() <= len as usize {
            let off = offset as usize;
            self.data[off..off + bytes.len()].copy_from_slice(bytes);
            self.write_slot(slot, offset, bytes.len() as u16, flags);
            return true;
        }
        if self.free_space() < bytes.len() {
            return false;
        }
        let record_off = self.free_end() as usize - bytes.len();
        self.data[record_off..record_off + bytes.len()].copy_from_slice(bytes);
        self.set_free_end(record_off as u16);
        self.write_slot(slot, record_off as u16, bytes.len() as u16, flags);
        true
    }

    /// Flags the slot deleted. The slot entry itself survives so later
    /// records keep their numbers.
    pub fn delete(&mut self, slot: SlotId) -> bool {
        let Some((offset, len, flags)) = self.read_slot(slot) else {
            return false;
        };
        if flags & SLOT_FLAG_DELETED != 0 {
            return false;
        }
        self.write_slot(slot, offset, len, flags | SLOT_FLAG_DELETED);
        true
    }

    /// Iterates the live records as `(slot, payload)` pairs.
    pub fn enumerate(&self) -> impl Iterator<Item = (SlotId, &[u8])> {
        (0..self.slot_count()).filter_map(move |slot| self.get(slot).map(|bytes| (slot, bytes)))
    }

    /// Rewrites live records contiguously at the high end of the page,
    /// reclaiming garbage left by deletes and moved updates. Slot numbering
    /// is preserved.
    pub fn compact(&mut self) {
        let size = self.data.len();
        let mut scratch = Vec::with_capacity(size - self.free_end() as usize);
        let mut live: Vec<(SlotId, u16, u16, usize)> = Vec::new();

        for slot in 0..self.slot_count() {
            let Some((offset, len, flags)) = self.read_slot(slot) else {
                continue;
            };
            if flags & SLOT_FLAG_DELETED != 0 {
                continue;
            }
            let start = scratch.len();
            scratch.extend_from_slice(&self.data[offset as usize..(offset + len) as usize]);
            live.push((slot, len, flags, start));
        }

        let new_end = size - scratch.len();
        self.data[new_end..].copy_from_slice(&scratch);
        self.set_free_end(new_end as u16);
        for (slot, len, flags, start) in live {
            self.write_slot(slot, (new_end + start) as u16, len, flags);
        }
    }

    /// Installs `bytes` at a specific slot, growing the slot directory with
    /// dead slots as needed. Used by redo, which replays records into the
    /// slots they originally occupied; `None` delete-flags the slot.
    pub fn install(&mut self, slot: SlotId, bytes: Option<&[u8]>) -> Result<()> {
        while self.slot_count() <= slot {
            let next = self.slot_count();
            if self.free_space() < SLOT_SIZE {
                return Err(DbError::Corrupted(format!(
                    "page {}: no room to replay slot {}",
                    self.id(),
                    slot
                )));
            }
            self.write_slot(next, 0, 0, SLOT_FLAG_DELETED);
            self.write_u16(OFF_SLOT_COUNT, next + 1);
            self.set_free_start((PAGE_HEADER_SIZE + (next as usize + 1) * SLOT_SIZE) as u16);
        }

        let Some(bytes) = bytes else {
            let (offset, len, flags) = self.read_slot(slot).expect("slot exists");
            self.write_slot(slot, offset, len, flags | SLOT_FLAG_DELETED);
            return Ok(());
        };

        let (offset, len, _flags) = self.read_slot(slot).expect("slot exists");
        if len as usize >= bytes.len() && len != 0 {
            let off = offset as usize;
            self.data[off..off + bytes.len()].copy_from_slice(bytes);
            self.write_slot(slot, offset, bytes.len() as u16, 0);
            return Ok(());
        }
        if self.free_space() < bytes.len() {
            self.compact();
        }
        if self.free_space() < bytes.len() {
            return Err(DbError::Corrupted(format!(
                "page {}: no room to replay {} bytes into slot {}",
                self.id(),
                bytes.len(),
                slot
            )));
        }
        let record_off = self.free_end() as usize - bytes.len();
        self.data[record_off..record_off + bytes.len()].copy_from_slice(bytes);
        self.set_free_end(record_off as u16);
        self.write_slot(slot, record_off as u16, bytes.len() as u16, 0);
        Ok(())
    }

    /// Recomputes the page checksum over the full image with the checksum
    /// field zeroed, then writes it back.
    pub fn update_checksum(&mut self) {
        self.write_u32(OFF_CHECKSUM, 0);
        let sum = page_checksum(&self.data);
        self.write_u32(OFF_CHECKSUM, sum);
    }

    /// Verifies the stored checksum against the page image.
    pub fn verify_checksum(&self) -> bool {
        let stored = self.read_u32(OFF_CHECKSUM);
        let mut copy = self.data.clone();
        copy[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&[0; 4]);
        stored == page_checksum(&copy)
    }

    fn read_slot(&self, slot: SlotId) -> Option<(u16, u16, u16)> {
        if slot >= self.slot_count() {
            return None;
        }
        let base = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        Some((
            self.read_u16(base),
            self.read_u16(base + 2),
            self.read_u16(base + 4),
        ))
    }

    fn write_slot(&mut self, slot: SlotId, offset: u16, len: u16, flags: u16) {
        let base = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        self.write_u16(base, offset);
        self.write_u16(base + 2, len);
        self.write_u16(base + 4, flags);
    }

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes(self.data[at..at + 2].try_into().unwrap())
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    fn read_u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(self.data[at..at + 8].try_into().unwrap())
    }

    fn write_u16(&mut self, at: usize, v: u16) {
        self.data[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn write_u32(&mut self, at: usize, v: u32) {
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, at: usize, v: u64) {
        self.data[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }
}
