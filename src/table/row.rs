// Row wire format.
//
// A stored row is:
//
//   u8  flags          (bit 0: delete-marked)
//   u64 trx_id         (transaction that last wrote this version)
//   u64 roll_ptr       (undo pointer to the displaced version, 0 = none)
//   null bitmap        (ceil(columns / 8) bytes, bit set = NULL)
//   payloads           (non-null columns in schema order)
//
// The two system fields drive MVCC: readers check `trx_id` against their
// ReadView and follow `roll_ptr` into the undo log when the version is
// invisible.

use crate::catalog::Schema;
use crate::common::{TransactionId, UndoPtr};
use crate::error::{DbError, Result};
use crate::table::key::CompositeKey;
use crate::table::value::Value;

const ROW_FLAG_DELETED: u8 = 0x01;
/// flags + trx_id + roll_ptr.
pub const ROW_HEADER_SIZE: usize = 1 + 8 + 8;

/// One row version, materialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<Value>,
    pub trx_id: TransactionId,
    pub roll_ptr: UndoPtr,
    pub deleted: bool,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            trx_id: 0,
            roll_ptr: 0,
            deleted: false,
        }
    }

    /// Extracts this row's primary key per the schema.
    pub fn primary_key(&self, schema: &Schema) -> CompositeKey {
        CompositeKey::new(
            schema
                .primary_key
                .iter()
                .map(|&i| self.values[i].clone())
                .collect(),
        )
    }

    /// Serializes to the wire format.
    pub fn serialize(&self, schema: &Schema) -> Result<Vec<u8>> {
        if self.values.len() != schema.columns.len() {
            return Err(DbError::Serialization(format!(
                "row has {} values for {} columns",
                self.values.len(),
                schema.columns.len()
            )));
        }

        let bitmap_len = schema.columns.len().div_ceil(8);
        let mut out = Vec::with_capacity(ROW_HEADER_SIZE + bitmap_len + 16);
        let mut flags = 0u8;
        if self.deleted {
            flags |= ROW_FLAG_DELETED;
        }
        out.push(flags);
        out.extend_from_slice(&self.trx_id.to_le_bytes());
        out.extend_from_slice(&self.roll_ptr.to_le_bytes());

        let mut bitmap = vec![0u8; bitmap_len];
        for (i, value) in self.values.iter().enumerate() {
            if value.is_null() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        out.extend_from_slice(&bitmap);

        for (value, column) in self.values.iter().zip(&schema.columns) {
            if value.is_null() {
                continue;
            }
            value.encode(&column.data_type, &mut out)?;
        }
        Ok(out)
    }

    /// Deserializes from the wire format.
    pub fn deserialize(bytes: &[u8], schema: &Schema) -> Result<Row> {
        let bitmap_len = schema.columns.len().div_ceil(8);
        if bytes.len() < ROW_HEADER_SIZE + bitmap_len {
            return Err(DbError::Corrupted("row shorter than its header".into()));
        }
        let flags = bytes[0];
        let trx_id = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        let roll_ptr = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
        let bitmap = &bytes[ROW_HEADER_SIZE..ROW_HEADER_SIZE + bitmap_len];

        let mut at = ROW_HEADER_SIZE + bitmap_len;
        let mut values = Vec::with_capacity(schema.columns.len());
        for (i, column) in schema.columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(Value::Null);
                continue;
            }
            let (value, consumed) = Value::decode(&column.data_type, bytes, at)?;
            values.push(value);
            at += consumed;
        }

        Ok(Row {
            values,
            trx_id,
            roll_ptr,
            deleted: flags & ROW_FLAG_DELETED != 0,
        })
    }

    /// Reads just the MVCC header from a stored row: (deleted, trx_id,
    /// roll_ptr). Visibility checks use this to avoid decoding payloads.
    pub fn peek_header(bytes: &[u8]) -> Result<(bool, TransactionId, UndoPtr)> {
        if bytes.len() < ROW_HEADER_SIZE {
            return Err(DbError::Corrupted("row shorter than its header".into()));
        }
        Ok((
            bytes[0] & ROW_FLAG_DELETED != 0,
            u64::from_le_bytes(bytes[1..9].try_into().unwrap()),
            u64::from_le_bytes(bytes[9..17].try_into().unwrap()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::table::value::DataType;

    fn schema() -> Schema {
        Schema {
            columns: vec![
                Column::new("id", DataType::Int32, false),
                Column::new("name", DataType::VarChar(100), true),
                Column::new("score", DataType::Double, true),
            ],
            primary_key: vec![0],
        }
    }

    #[test]
    fn test_round_trip() {
        let schema = schema();
        let mut row = Row::new(vec![
            Value::Int32(1),
            Value::String("Alice".into()),
            Value::Double(9.75),
        ]);
        row.trx_id = 42;
        row.roll_ptr = 1024;

        let bytes = row.serialize(&schema).unwrap();
        let back = Row::deserialize(&bytes, &schema).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_null_bitmap() {
        let schema = schema();
        let row = Row::new(vec![Value::Int32(2), Value::Null, Value::Null]);
        let bytes = row.serialize(&schema).unwrap();
        let back = Row::deserialize(&bytes, &schema).unwrap();
        assert_eq!(back.values[1], Value::Null);
        assert_eq!(back.values[2], Value::Null);
        // Only the non-null int32 payload follows header + bitmap.
        assert_eq!(bytes.len(), ROW_HEADER_SIZE + 1 + 4);
    }

    #[test]
    fn test_delete_mark_round_trip() {
        let schema = schema();
        let mut row = Row::new(vec![Value::Int32(3), Value::Null, Value::Null]);
        row.deleted = true;
        row.trx_id = 7;
        let bytes = row.serialize(&schema).unwrap();

        let (deleted, trx, roll) = Row::peek_header(&bytes).unwrap();
        assert!(deleted);
        assert_eq!(trx, 7);
        assert_eq!(roll, 0);
        assert!(Row::deserialize(&bytes, &schema).unwrap().deleted);
    }

    #[test]
    fn test_primary_key_extraction() {
        let schema = schema();
        let row = Row::new(vec![Value::Int32(9), Value::Null, Value::Null]);
        assert_eq!(row.primary_key(&schema), CompositeKey::single(Value::Int32(9)));
    }

    #[test]
    fn test_truncated_row_is_corruption() {
        let schema = schema();
        let row = Row::new(vec![Value::Int32(1), Value::String("x".into()), Value::Null]);
        let bytes = row.serialize(&schema).unwrap();
        assert!(matches!(
            Row::deserialize(&bytes[..bytes.len() - 2], &schema),
            Err(DbError::Corrupted(_))
        ));
    }
}
