// Undo log.
//
// Pre-images of displaced row versions live in an append-only segment
// file, addressed by byte offset (`UndoPtr`, 0 = none). Each record links
// two chains:
//
//   - `prev_version_ptr` follows a single row's version history backward;
//     readers walk it until they hit a version their ReadView accepts.
//   - `prev_tx_ptr` links all records of one transaction; rollback and the
//     recovery undo pass walk it newest-first.
//
// Record framing at offset `ptr`:
//
//   u32 len | u8 type | u64 tx_id | u64 table_id | u32 page | u16 slot |
//   u64 prev_version_ptr | u64 prev_tx_ptr | u32 payload_len | payload |
//   u32 crc

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::catalog::Schema;
use crate::common::{RowId, TableId, TransactionId, UndoPtr};
use crate::error::{DbError, Result};
use crate::storage::checksum::record_crc;
use crate::table::key::CompositeKey;
use crate::table::row::Row;

const UNDO_MAGIC: &[u8; 8] = b"SFUNDO01";
const HEADER_SIZE: u64 = 8;
const FRAME_HEAD: usize = 1 + 8 + 8 + 4 + 2 + 8 + 8 + 4;
/// Bounded read-cache capacity.
const CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoRecordType {
    Insert,
    Update,
    Delete,
}

impl UndoRecordType {
    fn as_u8(self) -> u8 {
        match self {
            UndoRecordType::Insert => 0,
            UndoRecordType::Update => 1,
            UndoRecordType::Delete => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(UndoRecordType::Insert),
            1 => Ok(UndoRecordType::Update),
            2 => Ok(UndoRecordType::Delete),
            other => Err(DbError::Corrupted(format!(
                "unknown undo record type {other}"
            ))),
        }
    }
}

/// One undo record. For Insert the payload is the primary key (rollback
/// locates the row to physically delete); for Update and Delete it is the
/// full pre-image row in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoRecord {
    pub record_type: UndoRecordType,
    pub tx_id: TransactionId,
    pub table_id: TableId,
    pub row_id: RowId,
    pub prev_version_ptr: UndoPtr,
    pub prev_tx_ptr: UndoPtr,
    pub payload: Vec<u8>,
}

impl UndoRecord {
    /// Decodes the Insert payload back into the primary key.
    pub fn primary_key(&self) -> Result<CompositeKey> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Decodes an Update/Delete payload back into the pre-image row.
    pub fn pre_image(&self, schema: &Schema) -> Result<Row> {
        Row::deserialize(&self.payload, schema)
    }
}

/// A reconstructed older version pulled off a row's version chain.
#[derive(Debug, Clone)]
pub struct RowVersion {
    pub tx_id: TransactionId,
    pub is_deleted: bool,
    pub row: Row,
    pub prev_ptr: UndoPtr,
}

struct UndoTail {
    file: File,
    next_ptr: u64,
}

struct UndoCache {
    records: HashMap<UndoPtr, UndoRecord>,
    order: VecDeque<UndoPtr>,
}

impl UndoCache {
    fn insert(&mut self, ptr: UndoPtr, record: UndoRecord) {
        if self.records.len() >= CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.records.remove(&evicted);
            }
        }
        if self.records.insert(ptr, record).is_none() {
            self.order.push_back(ptr);
        }
    }
}

/// Persistent undo log over one segment file.
pub struct UndoLog {
    tail: Mutex<UndoTail>,
    reader: Mutex<File>,
    cache: Mutex<UndoCache>,
    /// Highest tx id with records in the file, for purge decisions.
    latest_tx: AtomicU64,
}

impl UndoLog {
    /// Opens the undo segment under `dir`, creating it when absent.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("undo-000001.seg");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            file.write_all(UNDO_MAGIC)?;
            file.sync_all()?;
        } else {
            let mut magic = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if &magic != UNDO_MAGIC {
                return Err(DbError::Corrupted(format!(
                    "{}: bad undo segment magic",
                    path.display()
                )));
            }
        }
        let next_ptr = file.metadata()?.len().max(HEADER_SIZE);
        file.seek(SeekFrom::Start(next_ptr))?;
        let reader = OpenOptions::new().read(true).open(&path)?;

        Ok(Self {
            tail: Mutex::new(UndoTail { file, next_ptr }),
            reader: Mutex::new(reader),
            cache: Mutex::new(UndoCache {
                records: HashMap::new(),
                order: VecDeque::new(),
            }),
            latest_tx: AtomicU64::new(0),
        })
    }

    /// Logs an insert: payload is the primary key so rollback can find and
    /// physically remove the row.
    pub fn write_insert(
        &self,
        tx_id: TransactionId,
        table_id: TableId,
        row_id: RowId,
        primary_key: &CompositeKey,
        prev_tx_ptr: UndoPtr,
    ) -> Result<UndoPtr> {
        let payload = bincode::serialize(primary_key)?;
        self.append(UndoRecord {
            record_type: UndoRecordType::Insert,
            tx_id,
            table_id,
            row_id,
            prev_version_ptr: 0,
            prev_tx_ptr,
            payload,
        })
    }

    /// Logs an update: payload is the displaced row version.
    pub fn write_update(
        &self,
        tx_id: TransactionId,
        table_id: TableId,
        row_id: RowId,
        old_row_bytes: Vec<u8>,
        prev_version_ptr: UndoPtr,
        prev_tx_ptr: UndoPtr,
    ) -> Result<UndoPtr> {
        self.append(UndoRecord {
            record_type: UndoRecordType::Update,
            tx_id,
            table_id,
            row_id,
            prev_version_ptr,
            prev_tx_ptr,
            payload: old_row_bytes,
        })
    }

    /// Logs a delete: payload is the full row as it stood before the
    /// delete mark.
    pub fn write_delete(
        &self,
        tx_id: TransactionId,
        table_id: TableId,
        row_id: RowId,
        deleted_row_bytes: Vec<u8>,
        prev_version_ptr: UndoPtr,
        prev_tx_ptr: UndoPtr,
    ) -> Result<UndoPtr> {
        self.append(UndoRecord {
            record_type: UndoRecordType::Delete,
            tx_id,
            table_id,
            row_id,
            prev_version_ptr,
            prev_tx_ptr,
            payload: deleted_row_bytes,
        })
    }

    fn append(&self, record: UndoRecord) -> Result<UndoPtr> {
        let mut body = Vec::with_capacity(FRAME_HEAD + record.payload.len());
        body.push(record.record_type.as_u8());
        body.extend_from_slice(&record.tx_id.to_le_bytes());
        body.extend_from_slice(&record.table_id.to_le_bytes());
        body.extend_from_slice(&record.row_id.page_id.to_le_bytes());
        body.extend_from_slice(&record.row_id.slot.to_le_bytes());
        body.extend_from_slice(&record.prev_version_ptr.to_le_bytes());
        body.extend_from_slice(&record.prev_tx_ptr.to_le_bytes());
        body.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&record.payload);
        let crc = record_crc(&body);

        let mut tail = self.tail.lock();
        let ptr = tail.next_ptr;
        tail.file.seek(SeekFrom::Start(ptr))?;
        tail.file.write_all(&(body.len() as u32 + 4).to_le_bytes())?;
        tail.file.write_all(&body)?;
        tail.file.write_all(&crc.to_le_bytes())?;
        tail.next_ptr += 4 + body.len() as u64 + 4;
        drop(tail);

        self.latest_tx.fetch_max(record.tx_id, Ordering::SeqCst);
        self.cache.lock().insert(ptr, record);
        Ok(ptr)
    }

    /// Reads the record at `ptr`; 0 reads as "no record".
    pub fn read(&self, ptr: UndoPtr) -> Result<Option<UndoRecord>> {
        if ptr == 0 {
            return Ok(None);
        }
        if let Some(record) = self.cache.lock().records.get(&ptr) {
            return Ok(Some(record.clone()));
        }

        let next_ptr = self.tail.lock().next_ptr;
        if ptr >= next_ptr {
            return Err(DbError::OutOfRange(format!(
                "undo pointer {ptr} beyond segment end {next_ptr}"
            )));
        }

        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(ptr))?;
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let total = u32::from_le_bytes(len_buf) as usize;
        if total < FRAME_HEAD + 4 {
            return Err(DbError::Corrupted(format!(
                "undo record at {ptr} has impossible length {total}"
            )));
        }
        let mut buf = vec![0u8; total];
        reader.read_exact(&mut buf)?;
        drop(reader);

        let body = &buf[..total - 4];
        let stored_crc = u32::from_le_bytes(buf[total - 4..].try_into().unwrap());
        if record_crc(body) != stored_crc {
            return Err(DbError::Corrupted(format!(
                "undo record at {ptr} failed its CRC"
            )));
        }

        let record_type = UndoRecordType::from_u8(body[0])?;
        let tx_id = u64::from_le_bytes(body[1..9].try_into().unwrap());
        let table_id = u64::from_le_bytes(body[9..17].try_into().unwrap());
        let page_id = u32::from_le_bytes(body[17..21].try_into().unwrap());
        let slot = u16::from_le_bytes(body[21..23].try_into().unwrap());
        let prev_version_ptr = u64::from_le_bytes(body[23..31].try_into().unwrap());
        let prev_tx_ptr = u64::from_le_bytes(body[31..39].try_into().unwrap());
        let payload_len = u32::from_le_bytes(body[39..43].try_into().unwrap()) as usize;
        if FRAME_HEAD + payload_len != body.len() {
            return Err(DbError::Corrupted(format!(
                "undo record at {ptr} has inconsistent payload length"
            )));
        }

        let record = UndoRecord {
            record_type,
            tx_id,
            table_id,
            row_id: RowId::new(page_id, slot),
            prev_version_ptr,
            prev_tx_ptr,
            payload: body[FRAME_HEAD..].to_vec(),
        };
        self.cache.lock().insert(ptr, record.clone());
        Ok(Some(record))
    }

    /// Walks a transaction's undo chain newest-first from `head_ptr`.
    pub fn read_chain(
        &self,
        tx_id: TransactionId,
        head_ptr: UndoPtr,
    ) -> Result<Vec<UndoRecord>> {
        let mut chain = Vec::new();
        let mut ptr = head_ptr;
        while let Some(record) = self.read(ptr)? {
            if record.tx_id != tx_id {
                break;
            }
            ptr = record.prev_tx_ptr;
            chain.push(record);
        }
        Ok(chain)
    }

    /// Reconstructs the older version addressed by a roll pointer. Returns
    /// `None` for insert records: the row simply did not exist before.
    pub fn read_version(&self, ptr: UndoPtr, schema: &Schema) -> Result<Option<RowVersion>> {
        let Some(record) = self.read(ptr)? else {
            return Ok(None);
        };
        if record.record_type == UndoRecordType::Insert {
            return Ok(None);
        }
        let row = record.pre_image(schema)?;
        Ok(Some(RowVersion {
            tx_id: row.trx_id,
            is_deleted: row.deleted,
            prev_ptr: row.roll_ptr,
            row,
        }))
    }

    /// Durably flushes the segment file.
    pub fn flush(&self) -> Result<()> {
        self.tail.lock().file.sync_all()?;
        Ok(())
    }

    /// Reclaims the segment once every record in it belongs to a
    /// transaction below `up_to_tx` (the committed low-water mark). The
    /// whole segment is truncated in one step; a mixed segment is left
    /// alone until the mark passes it.
    pub fn purge(&self, up_to_tx: TransactionId) -> Result<bool> {
        let mut tail = self.tail.lock();
        if tail.next_ptr == HEADER_SIZE {
            return Ok(false);
        }
        if self.latest_tx.load(Ordering::SeqCst) >= up_to_tx {
            return Ok(false);
        }
        tail.file.set_len(HEADER_SIZE)?;
        tail.file.sync_all()?;
        tail.next_ptr = HEADER_SIZE;
        drop(tail);

        let mut cache = self.cache.lock();
        cache.records.clear();
        cache.order.clear();
        info!(up_to_tx, "purged undo segment");
        Ok(true)
    }

    /// Current append position; useful to tests and diagnostics.
    pub fn tail_ptr(&self) -> u64 {
        self.tail.lock().next_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::table::value::{DataType, Value};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema {
            columns: vec![
                Column::new("id", DataType::Int32, false),
                Column::new("name", DataType::VarChar(50), true),
            ],
            primary_key: vec![0],
        }
    }

    fn row(id: i32, name: &str, trx: u64, roll: u64) -> Row {
        let mut r = Row::new(vec![Value::Int32(id), Value::String(name.into())]);
        r.trx_id = trx;
        r.roll_ptr = roll;
        r
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let key = CompositeKey::single(Value::Int32(1));

        let ptr = undo
            .write_insert(5, 2, RowId::new(3, 0), &key, 0)
            .unwrap();
        assert!(ptr >= HEADER_SIZE);

        let record = undo.read(ptr).unwrap().unwrap();
        assert_eq!(record.record_type, UndoRecordType::Insert);
        assert_eq!(record.tx_id, 5);
        assert_eq!(record.primary_key().unwrap(), key);
        assert_eq!(undo.read(0).unwrap(), None);
    }

    #[test]
    fn test_transaction_chain_walks_newest_first() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let schema = schema();
        let key = CompositeKey::single(Value::Int32(1));

        let p1 = undo.write_insert(7, 1, RowId::new(2, 0), &key, 0).unwrap();
        let old = row(1, "before", 7, 0).serialize(&schema).unwrap();
        let p2 = undo
            .write_update(7, 1, RowId::new(2, 0), old, p1, p1)
            .unwrap();

        let chain = undo.read_chain(7, p2).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].record_type, UndoRecordType::Update);
        assert_eq!(chain[1].record_type, UndoRecordType::Insert);

        // A foreign head pointer yields that transaction's records only.
        let other = undo.write_insert(9, 1, RowId::new(2, 1), &key, 0).unwrap();
        assert_eq!(undo.read_chain(9, other).unwrap().len(), 1);
    }

    #[test]
    fn test_version_chain_reconstruction() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let schema = schema();

        // tx 5 wrote version A; tx 8 displaced it with version B.
        let version_a = row(1, "A", 5, 0).serialize(&schema).unwrap();
        let ptr = undo
            .write_update(8, 1, RowId::new(2, 0), version_a, 0, 0)
            .unwrap();

        let version = undo.read_version(ptr, &schema).unwrap().unwrap();
        assert_eq!(version.tx_id, 5);
        assert!(!version.is_deleted);
        assert_eq!(version.row.values[1], Value::String("A".into()));
        assert_eq!(version.prev_ptr, 0);
    }

    #[test]
    fn test_insert_record_ends_version_chain() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let key = CompositeKey::single(Value::Int32(1));
        let ptr = undo.write_insert(5, 1, RowId::new(2, 0), &key, 0).unwrap();
        assert!(undo.read_version(ptr, &schema()).unwrap().is_none());
    }

    #[test]
    fn test_pointers_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let key = CompositeKey::single(Value::Int32(42));
        let ptr = {
            let undo = UndoLog::open(dir.path()).unwrap();
            let p = undo.write_insert(3, 1, RowId::new(1, 0), &key, 0).unwrap();
            undo.flush().unwrap();
            p
        };
        let undo = UndoLog::open(dir.path()).unwrap();
        let record = undo.read(ptr).unwrap().unwrap();
        assert_eq!(record.primary_key().unwrap(), key);
    }

    #[test]
    fn test_purge_respects_live_transactions() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let key = CompositeKey::single(Value::Int32(1));
        undo.write_insert(10, 1, RowId::new(1, 0), &key, 0).unwrap();

        // tx 10 is not yet below the mark.
        assert!(!undo.purge(10).unwrap());
        assert!(undo.purge(11).unwrap());
        assert_eq!(undo.tail_ptr(), HEADER_SIZE);
    }
}
