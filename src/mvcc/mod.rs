// Multi-version concurrency control: read views, the undo log, and the
// version-chain walk that resolves which row version a snapshot sees.

pub mod read_view;
pub mod undo;

pub use read_view::ReadView;
pub use undo::{RowVersion, UndoLog, UndoRecord, UndoRecordType};

use crate::catalog::Schema;
use crate::error::Result;
use crate::table::row::Row;

/// Resolves the version of `stored` visible to `view`, walking the roll
/// pointer chain through the undo log when the latest version is invisible
/// or delete-marked. Returns `None` when no visible live version exists.
pub fn resolve_visible(
    view: &ReadView,
    stored: &Row,
    undo: &UndoLog,
    schema: &Schema,
) -> Result<Option<Row>> {
    if view.is_visible(stored.trx_id) {
        return Ok(if stored.deleted {
            None
        } else {
            Some(stored.clone())
        });
    }

    let mut ptr = stored.roll_ptr;
    while ptr != 0 {
        let Some(version) = undo.read_version(ptr, schema)? else {
            // An insert record: the row did not exist at snapshot time.
            return Ok(None);
        };
        if view.is_visible(version.tx_id) {
            return Ok(if version.is_deleted {
                None
            } else {
                Some(version.row)
            });
        }
        ptr = version.prev_ptr;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::common::RowId;
    use crate::table::key::CompositeKey;
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
    fn test_latest_version_visible() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let schema = schema();
        let stored = row(1, "current", 5, 0);

        let view = ReadView::create(&[], 10, 9);
        let resolved = resolve_visible(&view, &stored, &undo, &schema).unwrap();
        assert_eq!(resolved.unwrap().values[1], Value::String("current".into()));
    }

    #[test]
    fn test_invisible_writer_falls_back_to_old_version() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let schema = schema();

        // tx 5 wrote "old"; tx 8 (still active) overwrote with "new".
        let old_bytes = row(1, "old", 5, 0).serialize(&schema).unwrap();
        let ptr = undo
            .write_update(8, 1, RowId::new(2, 0), old_bytes, 0, 0)
            .unwrap();
        let stored = row(1, "new", 8, ptr);

        let view = ReadView::create(&[8], 9, 6);
        let resolved = resolve_visible(&view, &stored, &undo, &schema).unwrap();
        assert_eq!(resolved.unwrap().values[1], Value::String("old".into()));
    }

    #[test]
    fn test_uncommitted_insert_invisible_to_others() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let schema = schema();

        let key = CompositeKey::single(Value::Int32(1));
        let ptr = undo.write_insert(8, 1, RowId::new(2, 0), &key, 0).unwrap();
        let stored = row(1, "phantom", 8, ptr);

        let view = ReadView::create(&[8], 9, 6);
        assert!(resolve_visible(&view, &stored, &undo, &schema)
            .unwrap()
            .is_none());
        // The inserting transaction itself sees the row.
        let own = ReadView::create(&[8], 9, 8);
        assert!(resolve_visible(&own, &stored, &undo, &schema)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_delete_marked_row_invisible_but_old_version_reachable() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let schema = schema();

        // tx 5 wrote the row; tx 8 delete-marked it and committed.
        let pre_image = row(1, "alive", 5, 0).serialize(&schema).unwrap();
        let ptr = undo
            .write_delete(8, 1, RowId::new(2, 0), pre_image, 0, 0)
            .unwrap();
        let mut stored = row(1, "alive", 8, ptr);
        stored.deleted = true;

        // A snapshot from before the delete still sees the row.
        let before = ReadView::create(&[8], 9, 6);
        assert!(resolve_visible(&before, &stored, &undo, &schema)
            .unwrap()
            .is_some());
        // A snapshot after the commit does not.
        let after = ReadView::create(&[], 9, 8);
        assert!(resolve_visible(&after, &stored, &undo, &schema)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_three_version_chain() {
        let dir = TempDir::new().unwrap();
        let undo = UndoLog::open(dir.path()).unwrap();
        let schema = schema();

        let v1_bytes = row(1, "v1", 3, 0).serialize(&schema).unwrap();
        let p1 = undo
            .write_update(5, 1, RowId::new(2, 0), v1_bytes, 0, 0)
            .unwrap();
        let v2_bytes = row(1, "v2", 5, p1).serialize(&schema).unwrap();
        let p2 = undo
            .write_update(9, 1, RowId::new(2, 0), v2_bytes, p1, 0)
            .unwrap();
        let stored = row(1, "v3", 9, p2);

        // Snapshot that saw only tx 3 commit.
        let view = ReadView::create(&[5, 9], 10, 4);
        let resolved = resolve_visible(&view, &stored, &undo, &schema).unwrap();
        assert_eq!(resolved.unwrap().values[1], Value::String("v1".into()));
    }
}
