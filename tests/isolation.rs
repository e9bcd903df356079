// Isolation and locking scenarios driven through the full engine:
// repeatable-read snapshots, read-committed statement views, serializable
// phantom protection, constraint enforcement, and deadlock victims.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stonefort::catalog::{Column, Schema};
use stonefort::common::RowId;
use stonefort::table::row::Row;
use stonefort::table::value::{DataType, Value};
use stonefort::{DbError, Engine, EngineConfig, IsolationLevel};
use tempfile::TempDir;

fn config(dir: &Path, lock_timeout_ms: u64) -> EngineConfig {
    EngineConfig {
        data_dir: dir.join("data"),
        page_size: 4096,
        buffer_pool_size_pages: 64,
        lock_wait_timeout_ms: lock_timeout_ms,
        checkpoint_interval_ms: 3_600_000,
        checkpoint_log_bytes: u64::MAX / 2,
        wal_segment_size: 1 << 20,
        doublewrite_pages: 32,
        ..Default::default()
    }
}

fn users_schema() -> Schema {
    Schema::new(
        vec![
            Column::new("id", DataType::Int32, false),
            Column::new("name", DataType::VarChar(100), true),
        ],
        vec![0],
    )
}

fn user(id: i32, name: &str) -> Row {
    Row::new(vec![Value::Int32(id), Value::String(name.into())])
}

fn open_with_users(dir: &TempDir, lock_timeout_ms: u64) -> Engine {
    let engine = Engine::open(config(dir.path(), lock_timeout_ms)).unwrap();
    engine.create_db("app").unwrap();
    engine.create_table("app", "users", users_schema()).unwrap();
    engine
}

fn name_of(row: &Row) -> String {
    match &row.values[1] {
        Value::String(s) => s.clone(),
        other => panic!("unexpected name value {other}"),
    }
}

#[test]
fn test_repeatable_read_pins_first_snapshot() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let setup = engine.begin().unwrap();
    let row_id = table.insert(&setup, user(1, "X")).unwrap();
    engine.commit(&setup).unwrap();

    let tx1 = engine
        .begin_with_isolation(IsolationLevel::RepeatableRead)
        .unwrap();
    let first = table.get(&tx1, row_id).unwrap().unwrap();
    assert_eq!(name_of(&first), "X");

    // tx2 updates and commits mid-flight.
    let tx2 = engine.begin().unwrap();
    table
        .update(&tx2, row_id, vec![Value::Int32(1), Value::String("Y".into())])
        .unwrap();
    engine.commit(&tx2).unwrap();

    // tx1 still sees its snapshot.
    let again = table.get(&tx1, row_id).unwrap().unwrap();
    assert_eq!(name_of(&again), "X");
    engine.commit(&tx1).unwrap();

    // A fresh transaction sees the new value.
    let tx3 = engine.begin().unwrap();
    let fresh = table.get(&tx3, row_id).unwrap().unwrap();
    assert_eq!(name_of(&fresh), "Y");
    engine.commit(&tx3).unwrap();
}

#[test]
fn test_read_committed_sees_commits_per_statement() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let setup = engine.begin().unwrap();
    let row_id = table.insert(&setup, user(1, "before")).unwrap();
    engine.commit(&setup).unwrap();

    let rc = engine
        .begin_with_isolation(IsolationLevel::ReadCommitted)
        .unwrap();
    assert_eq!(name_of(&table.get(&rc, row_id).unwrap().unwrap()), "before");

    let writer = engine.begin().unwrap();
    table
        .update(
            &writer,
            row_id,
            vec![Value::Int32(1), Value::String("after".into())],
        )
        .unwrap();
    engine.commit(&writer).unwrap();

    // Same transaction, new statement: the commit is visible.
    assert_eq!(name_of(&table.get(&rc, row_id).unwrap().unwrap()), "after");
    engine.commit(&rc).unwrap();
}

#[test]
fn test_uncommitted_writes_invisible_to_snapshot_readers() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let writer = engine.begin().unwrap();
    table.insert(&writer, user(5, "phantom")).unwrap();

    let reader = engine.begin().unwrap();
    assert!(table.scan(&reader).unwrap().is_empty());

    // The writer itself reads its own row.
    let own = table.scan(&writer).unwrap();
    assert_eq!(own.len(), 1);

    engine.commit(&writer).unwrap();
    // The reader's snapshot predates the commit.
    assert!(table.scan(&reader).unwrap().is_empty());
    engine.commit(&reader).unwrap();
}

#[test]
fn test_read_uncommitted_sees_dirty_rows() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let writer = engine.begin().unwrap();
    table.insert(&writer, user(9, "dirty")).unwrap();

    let reader = engine
        .begin_with_isolation(IsolationLevel::ReadUncommitted)
        .unwrap();
    let rows = table.scan(&reader).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(name_of(&rows[0].1), "dirty");

    engine.rollback(&writer).unwrap();
    assert!(table.scan(&reader).unwrap().is_empty());
    engine.commit(&reader).unwrap();
}

#[test]
fn test_serializable_scan_blocks_phantom_insert() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 300);
    let table = engine.table("app", "users").unwrap();

    let setup = engine.begin().unwrap();
    table.insert(&setup, user(10, "a")).unwrap();
    table.insert(&setup, user(30, "b")).unwrap();
    engine.commit(&setup).unwrap();

    let scanner = engine
        .begin_with_isolation(IsolationLevel::Serializable)
        .unwrap();
    assert_eq!(table.scan(&scanner).unwrap().len(), 2);

    // An insert into the scanned range hits the gap lock and times out.
    let inserter = engine.begin().unwrap();
    match table.insert(&inserter, user(20, "phantom")) {
        Err(DbError::LockTimeout) => {}
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    engine.rollback(&inserter).unwrap();

    // After the scanner commits, the same insert succeeds.
    engine.commit(&scanner).unwrap();
    let retry = engine.begin().unwrap();
    table.insert(&retry, user(20, "phantom")).unwrap();
    engine.commit(&retry).unwrap();
}

#[test]
fn test_duplicate_primary_key_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let tx = engine.begin().unwrap();
    table.insert(&tx, user(1, "first")).unwrap();
    match table.insert(&tx, user(1, "second")) {
        Err(DbError::ConstraintViolation(_)) => {}
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
    // The transaction stays alive and may retry with a fresh key.
    table.insert(&tx, user(2, "second")).unwrap();
    engine.commit(&tx).unwrap();
}

#[test]
fn test_not_null_and_type_checks() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let tx = engine.begin().unwrap();
    let null_pk = Row::new(vec![Value::Null, Value::String("x".into())]);
    assert!(matches!(
        table.insert(&tx, null_pk),
        Err(DbError::ConstraintViolation(_))
    ));
    let wrong_type = Row::new(vec![Value::Int32(1), Value::Int64(2)]);
    assert!(matches!(
        table.insert(&tx, wrong_type),
        Err(DbError::ConstraintViolation(_))
    ));
    engine.commit(&tx).unwrap();
}

#[test]
fn test_rollback_restores_all_row_states() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let setup = engine.begin().unwrap();
    let updated = table.insert(&setup, user(1, "old")).unwrap();
    let deleted = table.insert(&setup, user(2, "back")).unwrap();
    engine.commit(&setup).unwrap();

    let tx = engine.begin().unwrap();
    table.insert(&tx, user(3, "ephemeral")).unwrap();
    table
        .update(&tx, updated, vec![Value::Int32(1), Value::String("new".into())])
        .unwrap();
    table.delete(&tx, deleted).unwrap();
    engine.rollback(&tx).unwrap();

    let check = engine.begin().unwrap();
    let rows = table.scan(&check).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(name_of(&table.get(&check, updated).unwrap().unwrap()), "old");
    assert_eq!(name_of(&table.get(&check, deleted).unwrap().unwrap()), "back");
    engine.commit(&check).unwrap();
}

#[test]
fn test_deadlock_victim_is_rolled_back_and_survivor_completes() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(open_with_users(&dir, 10_000));
    let table = engine.table("app", "users").unwrap();

    let setup = engine.begin().unwrap();
    let row_a = table.insert(&setup, user(1, "A")).unwrap();
    let row_b = table.insert(&setup, user(2, "B")).unwrap();
    engine.commit(&setup).unwrap();

    let tx1 = engine.begin().unwrap();
    let tx2 = engine.begin().unwrap();

    // tx1 locks A, tx2 locks B.
    table
        .update(&tx1, row_a, vec![Value::Int32(1), Value::String("A1".into())])
        .unwrap();
    table
        .update(&tx2, row_b, vec![Value::Int32(2), Value::String("B2".into())])
        .unwrap();

    // tx1 now wants B (blocks); tx2 wants A (cycle).
    let engine1 = engine.clone();
    let table1 = table.clone();
    let tx1_thread = thread::spawn(move || {
        let result = table1.update(
            &tx1,
            row_b,
            vec![Value::Int32(2), Value::String("B1".into())],
        );
        match result {
            Ok(()) => {
                engine1.commit(&tx1).unwrap();
                Ok(())
            }
            Err(e) => {
                engine1.rollback(&tx1).unwrap();
                Err(e)
            }
        }
    });

    thread::sleep(Duration::from_millis(100));
    let tx2_result = table.update(
        &tx2,
        row_a,
        vec![Value::Int32(1), Value::String("A2".into())],
    );
    let tx2_outcome = match tx2_result {
        Ok(()) => {
            engine.commit(&tx2).unwrap();
            Ok(())
        }
        Err(e) => {
            engine.rollback(&tx2).unwrap();
            Err(e)
        }
    };
    let tx1_outcome = tx1_thread.join().unwrap();

    // Exactly one side dies, with Deadlock.
    let failures: Vec<&DbError> = [&tx1_outcome, &tx2_outcome]
        .into_iter()
        .filter_map(|r| r.as_ref().err())
        .collect();
    assert_eq!(failures.len(), 1, "exactly one victim expected");
    assert!(matches!(failures[0], DbError::Deadlock));
    assert!(failures[0].is_retryable());

    // The survivor's effects are present; the victim's are gone.
    let check = engine.begin().unwrap();
    let a = name_of(&table.get(&check, row_a).unwrap().unwrap());
    let b = name_of(&table.get(&check, row_b).unwrap().unwrap());
    if tx1_outcome.is_ok() {
        assert_eq!((a.as_str(), b.as_str()), ("A1", "B1"));
    } else {
        assert_eq!((a.as_str(), b.as_str()), ("A2", "B2"));
    }
    engine.commit(&check).unwrap();
}

#[test]
fn test_locking_read_returns_latest_committed() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let setup = engine.begin().unwrap();
    let row_id = table.insert(&setup, user(1, "committed")).unwrap();
    engine.commit(&setup).unwrap();

    // A repeatable-read snapshot from before sees the old world, but a
    // locking read always fetches the current row.
    let rr = engine
        .begin_with_isolation(IsolationLevel::RepeatableRead)
        .unwrap();
    let _pin_snapshot = table.scan(&rr).unwrap();

    let writer = engine.begin().unwrap();
    table
        .update(
            &writer,
            row_id,
            vec![Value::Int32(1), Value::String("current".into())],
        )
        .unwrap();
    engine.commit(&writer).unwrap();

    let locked = table
        .get_row_locked(&rr, row_id, stonefort::lock::LockMode::Shared)
        .unwrap()
        .unwrap();
    assert_eq!(name_of(&locked), "current");
    engine.commit(&rr).unwrap();
}

#[test]
fn test_autocommit_wraps_statement() {
    let dir = TempDir::new().unwrap();
    let engine = open_with_users(&dir, 2_000);
    let table = engine.table("app", "users").unwrap();

    let row_id: RowId = engine
        .autocommit(|tx| table.insert(tx, user(42, "auto")))
        .unwrap();

    // Failure inside the closure rolls everything back.
    let result: stonefort::Result<()> = engine.autocommit(|tx| {
        table.insert(tx, user(43, "doomed"))?;
        Err(DbError::Internal("statement failed".into()))
    });
    assert!(result.is_err());

    let check = engine.begin().unwrap();
    let rows = table.scan(&check).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, row_id);
    engine.commit(&check).unwrap();
}
