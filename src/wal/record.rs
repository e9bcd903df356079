// WAL record framing.
//
// Wire form of one record:
//
//   u32 length  (bytes after this field)
//   u8  type
//   u64 lsn
//   u64 tx_id
//   u64 table_id (0 when not applicable)
//   u32 payload_len
//   payload (bincode)
//   u32 crc  (over type..payload)

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::common::{Lsn, PageId, SlotId, TableId, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::checksum::record_crc;

/// Fixed framing bytes: type + lsn + tx_id + table_id + payload_len.
const FRAME_HEAD: usize = 1 + 8 + 8 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordType {
    Begin,
    Commit,
    Abort,
    Insert,
    Update,
    Delete,
    PageMod,
    Checkpoint,
    Clr,
}

impl WalRecordType {
    pub fn as_u8(self) -> u8 {
        match self {
            WalRecordType::Begin => 0,
            WalRecordType::Commit => 1,
            WalRecordType::Abort => 2,
            WalRecordType::Insert => 3,
            WalRecordType::Update => 4,
            WalRecordType::Delete => 5,
            WalRecordType::PageMod => 6,
            WalRecordType::Checkpoint => 7,
            WalRecordType::Clr => 8,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => WalRecordType::Begin,
            1 => WalRecordType::Commit,
            2 => WalRecordType::Abort,
            3 => WalRecordType::Insert,
            4 => WalRecordType::Update,
            5 => WalRecordType::Delete,
            6 => WalRecordType::PageMod,
            7 => WalRecordType::Checkpoint,
            8 => WalRecordType::Clr,
            other => {
                return Err(DbError::Corrupted(format!(
                    "unknown WAL record type {}",
                    other
                )))
            }
        })
    }

    /// Records that modify a page and participate in redo.
    pub fn is_page_record(self) -> bool {
        matches!(
            self,
            WalRecordType::Insert
                | WalRecordType::Update
                | WalRecordType::Delete
                | WalRecordType::PageMod
                | WalRecordType::Clr
        )
    }
}

/// Typed payload carried by a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalPayload {
    None,
    /// Physical slot image: `after = None` delete-flags the slot.
    /// `undo_ptr` is the undo record written alongside a DML change (0 for
    /// CLRs and raw page modifications); recovery's analysis pass uses the
    /// newest one per transaction as that transaction's undo chain head.
    PageImage {
        page_id: PageId,
        slot: SlotId,
        undo_ptr: u64,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    },
    /// Fuzzy checkpoint snapshot. The record's own LSN is the checkpoint
    /// LSN; `flush_oldest_lsn` is where a recovery scan must start.
    Checkpoint {
        active_txs: Vec<TransactionId>,
        flush_oldest_lsn: Lsn,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub tx_id: TransactionId,
    pub table_id: TableId,
    pub record_type: WalRecordType,
    pub payload: WalPayload,
}

/// Outcome of pulling one record off a segment stream.
pub enum ReadOutcome {
    Record(WalRecord),
    /// Clean end of segment.
    Eof,
    /// Partial or CRC-failing bytes at the stream position. The caller
    /// decides whether this is tail truncation or corruption.
    Truncated,
}

impl WalRecord {
    pub fn new(
        lsn: Lsn,
        tx_id: TransactionId,
        table_id: TableId,
        record_type: WalRecordType,
        payload: WalPayload,
    ) -> Self {
        Self {
            lsn,
            tx_id,
            table_id,
            record_type,
            payload,
        }
    }

    /// Encodes the record into its framed wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&self.payload)?;
        let body_len = FRAME_HEAD + payload.len() + 4;
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.push(self.record_type.as_u8());
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&self.tx_id.to_le_bytes());
        out.extend_from_slice(&self.table_id.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        let crc = record_crc(&out[4..4 + FRAME_HEAD + payload.len()]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Encoded size of this record on disk.
    pub fn encoded_len(&self) -> Result<u64> {
        let payload = bincode::serialize(&self.payload)?;
        Ok((4 + FRAME_HEAD + payload.len() + 4) as u64)
    }

    /// Decodes the next record from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<ReadOutcome> {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(reader, &mut len_buf)? {
            ReadFill::Eof => return Ok(ReadOutcome::Eof),
            ReadFill::Partial => return Ok(ReadOutcome::Truncated),
            ReadFill::Full => {}
        }
        let body_len = u32::from_le_bytes(len_buf) as usize;
        if body_len < FRAME_HEAD + 4 || body_len > 64 * 1024 * 1024 {
            return Ok(ReadOutcome::Truncated);
        }

        let mut body = vec![0u8; body_len];
        match read_exact_or_eof(reader, &mut body)? {
            ReadFill::Full => {}
            _ => return Ok(ReadOutcome::Truncated),
        }

        let stored_crc = u32::from_le_bytes(body[body_len - 4..].try_into().unwrap());
        if record_crc(&body[..body_len - 4]) != stored_crc {
            return Ok(ReadOutcome::Truncated);
        }

        let record_type = WalRecordType::from_u8(body[0])?;
        let lsn = u64::from_le_bytes(body[1..9].try_into().unwrap());
        let tx_id = u64::from_le_bytes(body[9..17].try_into().unwrap());
        let table_id = u64::from_le_bytes(body[17..25].try_into().unwrap());
        let payload_len = u32::from_le_bytes(body[25..29].try_into().unwrap()) as usize;
        if FRAME_HEAD + payload_len + 4 != body_len {
            return Ok(ReadOutcome::Truncated);
        }
        let payload: WalPayload = bincode::deserialize(&body[29..29 + payload_len])?;

        Ok(ReadOutcome::Record(WalRecord {
            lsn,
            tx_id,
            table_id,
            record_type,
            payload,
        }))
    }

    /// Page touched by this record, for redo and dirty-page analysis.
    pub fn page_id(&self) -> Option<PageId> {
        match &self.payload {
            WalPayload::PageImage { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }
}

enum ReadFill {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadFill> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadFill::Eof
            } else {
                ReadFill::Partial
            });
        }
        filled += n;
    }
    Ok(ReadFill::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> WalRecord {
        WalRecord::new(
            42,
            7,
            3,
            WalRecordType::Update,
            WalPayload::PageImage {
                page_id: 5,
                slot: 2,
                undo_ptr: 96,
                before: Some(vec![1, 2, 3]),
                after: Some(vec![4, 5, 6, 7]),
            },
        )
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let record = sample();
        let bytes = record.encode().unwrap();
        assert_eq!(bytes.len() as u64, record.encoded_len().unwrap());

        let mut cursor = Cursor::new(bytes);
        match WalRecord::read_from(&mut cursor).unwrap() {
            ReadOutcome::Record(decoded) => assert_eq!(decoded, record),
            _ => panic!("expected a record"),
        }
        assert!(matches!(
            WalRecord::read_from(&mut cursor).unwrap(),
            ReadOutcome::Eof
        ));
    }

    #[test]
    fn test_truncated_tail_is_not_corruption() {
        let bytes = sample().encode().unwrap();
        let cut = bytes.len() - 6;
        let mut cursor = Cursor::new(&bytes[..cut]);
        assert!(matches!(
            WalRecord::read_from(&mut cursor).unwrap(),
            ReadOutcome::Truncated
        ));
    }

    #[test]
    fn test_crc_mismatch_is_flagged() {
        let mut bytes = sample().encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            WalRecord::read_from(&mut cursor).unwrap(),
            ReadOutcome::Truncated
        ));
    }

    #[test]
    fn test_checkpoint_payload_round_trip() {
        let record = WalRecord::new(
            100,
            0,
            0,
            WalRecordType::Checkpoint,
            WalPayload::Checkpoint {
                active_txs: vec![3, 9],
                flush_oldest_lsn: 55,
            },
        );
        let bytes = record.encode().unwrap();
        let mut cursor = Cursor::new(bytes);
        match WalRecord::read_from(&mut cursor).unwrap() {
            ReadOutcome::Record(decoded) => assert_eq!(decoded, record),
            _ => panic!("expected a record"),
        }
    }
}
