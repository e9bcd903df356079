// Catalog: schema metadata for databases, tables, indexes, foreign keys,
// views, and stored procedures.
//
// Entities live in an arena keyed by stable numeric id; containers hold
// ids, never back-pointers, so the table/index/fk graph stays acyclic in
// memory. The whole catalog serializes into system pages of catalog.sys
// (a length header page followed by chunk pages) and is rewritten on every
// DDL change.
//
// The catalog also owns the runtime registry of open `Table` handles and
// dispatches rollback compensations to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{IndexId, RowId, TableId};
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageType, PAGE_HEADER_SIZE, SLOT_SIZE};
use crate::storage::page_manager::PageManager;
use crate::table::row::Row;
use crate::table::value::{DataType, Value};
use crate::table::Table;
use crate::transaction::{CompensationApply, Transaction};

/// Foreign-key cascade traversal bound; deeper graphs surface
/// `CascadeTooDeep` instead of walking further.
const MAX_CASCADE_DEPTH: usize = 64;

/// Column definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default: Option<Value>,
}

impl Column {
    pub fn new(name: &str, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable,
            default: None,
        }
    }
}

/// Table schema: columns plus primary-key column positions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    pub columns: Vec<Column>,
    pub primary_key: Vec<usize>,
}

impl Schema {
    pub fn new(columns: Vec<Column>, primary_key: Vec<usize>) -> Self {
        Self {
            columns,
            primary_key,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Validates a row against column count, NOT NULL, and value types.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(DbError::ConstraintViolation(format!(
                "expected {} columns, got {}",
                self.columns.len(),
                row.values.len()
            )));
        }
        for (i, (value, column)) in row.values.iter().zip(&self.columns).enumerate() {
            if value.is_null() {
                if !column.nullable || self.primary_key.contains(&i) {
                    return Err(DbError::ConstraintViolation(format!(
                        "column `{}` does not accept NULL",
                        column.name
                    )));
                }
                continue;
            }
            if !value.matches_type(&column.data_type) {
                return Err(DbError::ConstraintViolation(format!(
                    "value {} does not fit column `{}` ({:?})",
                    value, column.name, column.data_type
                )));
            }
        }
        Ok(())
    }
}

/// Referential action on delete/update of a referenced row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FkAction {
    Restrict,
    Cascade,
    SetNull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: TableId,
    pub db: String,
    pub name: String,
    pub schema: Schema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub id: IndexId,
    pub table_id: TableId,
    pub name: String,
    pub columns: Vec<usize>,
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyMeta {
    pub id: u64,
    pub name: String,
    pub table_id: TableId,
    pub columns: Vec<usize>,
    pub ref_table_id: TableId,
    pub ref_columns: Vec<usize>,
    pub on_delete: FkAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewMeta {
    pub id: u64,
    pub db: String,
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureMeta {
    pub id: u64,
    pub db: String,
    pub name: String,
    pub body: String,
}

/// The serialized arena.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogData {
    next_id: u64,
    databases: BTreeMap<String, ()>,
    tables: BTreeMap<TableId, TableMeta>,
    indexes: BTreeMap<IndexId, IndexMeta>,
    foreign_keys: BTreeMap<u64, ForeignKeyMeta>,
    views: BTreeMap<u64, ViewMeta>,
    procedures: BTreeMap<u64, ProcedureMeta>,
}

impl CatalogData {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Metadata store plus the runtime table registry.
pub struct Catalog {
    data: RwLock<CatalogData>,
    pm: Arc<PageManager>,
    open_tables: DashMap<TableId, Arc<Table>>,
}

impl Catalog {
    /// Opens (or creates) catalog.sys and loads the arena.
    pub fn open(pm: Arc<PageManager>) -> Result<Self> {
        let catalog = Self {
            data: RwLock::new(CatalogData::default()),
            pm,
            open_tables: DashMap::new(),
        };
        if catalog.pm.page_count() > 1 {
            catalog.load()?;
        } else {
            catalog.save()?;
        }
        Ok(catalog)
    }

    fn chunk_capacity(&self) -> usize {
        self.pm.page_size() - PAGE_HEADER_SIZE - SLOT_SIZE - 8
    }

    /// Serializes the arena into system pages: page 1 holds the byte
    /// length, pages 2.. hold the chunks.
    fn save(&self) -> Result<()> {
        let bytes = bincode::serialize(&*self.data.read())?;
        let chunk_capacity = self.chunk_capacity();
        let chunks: Vec<&[u8]> = bytes.chunks(chunk_capacity).collect();

        let needed_pages = 2 + chunks.len() as u32;
        while self.pm.page_count() < needed_pages {
            self.pm.allocate(PageType::Meta)?;
        }

        let mut header = Page::new(1, PageType::Meta, self.pm.page_size());
        header.insert(&(bytes.len() as u64).to_le_bytes());
        self.pm.write(&mut header)?;

        for (i, chunk) in chunks.iter().enumerate() {
            let mut page = Page::new(2 + i as u32, PageType::Meta, self.pm.page_size());
            page.insert(chunk);
            self.pm.write(&mut page)?;
        }
        self.pm.flush()?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let header = self.pm.read(1)?;
        let len_bytes = header
            .get(0)
            .ok_or_else(|| DbError::Corrupted("catalog header page is empty".into()))?;
        let total = u64::from_le_bytes(
            len_bytes
                .try_into()
                .map_err(|_| DbError::Corrupted("catalog header record malformed".into()))?,
        ) as usize;

        let mut bytes = Vec::with_capacity(total);
        let mut page_id = 2;
        while bytes.len() < total {
            let page = self.pm.read(page_id)?;
            let chunk = page
                .get(0)
                .ok_or_else(|| DbError::Corrupted(format!("catalog chunk page {page_id} empty")))?;
            bytes.extend_from_slice(chunk);
            page_id += 1;
        }
        bytes.truncate(total);

        *self.data.write() = bincode::deserialize(&bytes)?;
        Ok(())
    }

    // ---- databases ----

    pub fn create_db(&self, name: &str) -> Result<()> {
        {
            let mut data = self.data.write();
            if data.databases.contains_key(name) {
                return Err(DbError::AlreadyExists(format!("database {name}")));
            }
            data.databases.insert(name.to_string(), ());
        }
        self.save()?;
        info!(db = name, "created database");
        Ok(())
    }

    pub fn drop_db(&self, name: &str) -> Result<()> {
        {
            let mut data = self.data.write();
            if data.databases.remove(name).is_none() {
                return Err(DbError::NotFound(format!("database {name}")));
            }
            let doomed: Vec<TableId> = data
                .tables
                .values()
                .filter(|t| t.db == name)
                .map(|t| t.id)
                .collect();
            for id in &doomed {
                data.tables.remove(id);
                data.indexes.retain(|_, idx| idx.table_id != *id);
                data.foreign_keys
                    .retain(|_, fk| fk.table_id != *id && fk.ref_table_id != *id);
            }
            data.views.retain(|_, v| v.db != name);
            data.procedures.retain(|_, p| p.db != name);
            for id in doomed {
                self.open_tables.remove(&id);
            }
        }
        self.save()
    }

    pub fn list_dbs(&self) -> Vec<String> {
        self.data.read().databases.keys().cloned().collect()
    }

    // ---- tables ----

    pub fn create_table(&self, db: &str, name: &str, schema: Schema) -> Result<TableMeta> {
        let meta = {
            let mut data = self.data.write();
            if !data.databases.contains_key(db) {
                return Err(DbError::NotFound(format!("database {db}")));
            }
            if data.tables.values().any(|t| t.db == db && t.name == name) {
                return Err(DbError::AlreadyExists(format!("table {db}.{name}")));
            }
            for &pk in &schema.primary_key {
                if pk >= schema.columns.len() {
                    return Err(DbError::InvalidOperation(format!(
                        "primary key column index {pk} out of range"
                    )));
                }
            }
            let id = data.allocate_id();
            let meta = TableMeta {
                id,
                db: db.to_string(),
                name: name.to_string(),
                schema,
            };
            data.tables.insert(id, meta.clone());
            meta
        };
        self.save()?;
        info!(db, table = name, id = meta.id, "created table");
        Ok(meta)
    }

    pub fn drop_table(&self, db: &str, name: &str) -> Result<TableMeta> {
        let meta = {
            let mut data = self.data.write();
            let id = data
                .tables
                .values()
                .find(|t| t.db == db && t.name == name)
                .map(|t| t.id)
                .ok_or_else(|| DbError::NotFound(format!("table {db}.{name}")))?;
            if let Some(fk) = data
                .foreign_keys
                .values()
                .find(|fk| fk.ref_table_id == id && fk.table_id != id)
            {
                return Err(DbError::ConstraintViolation(format!(
                    "table {db}.{name} is referenced by foreign key {}",
                    fk.name
                )));
            }
            let meta = data.tables.remove(&id).expect("table present");
            data.indexes.retain(|_, idx| idx.table_id != id);
            data.foreign_keys.retain(|_, fk| fk.table_id != id);
            meta
        };
        self.open_tables.remove(&meta.id);
        self.save()?;
        Ok(meta)
    }

    pub fn get_table(&self, db: &str, name: &str) -> Result<TableMeta> {
        self.data
            .read()
            .tables
            .values()
            .find(|t| t.db == db && t.name == name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("table {db}.{name}")))
    }

    pub fn get_table_by_id(&self, id: TableId) -> Result<TableMeta> {
        self.data
            .read()
            .tables
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("table id {id}")))
    }

    pub fn list_tables(&self, db: &str) -> Vec<TableMeta> {
        self.data
            .read()
            .tables
            .values()
            .filter(|t| t.db == db)
            .cloned()
            .collect()
    }

    // ---- indexes ----

    pub fn create_index(
        &self,
        table_id: TableId,
        name: &str,
        columns: Vec<usize>,
        unique: bool,
    ) -> Result<IndexMeta> {
        let meta = {
            let mut data = self.data.write();
            if !data.tables.contains_key(&table_id) {
                return Err(DbError::NotFound(format!("table id {table_id}")));
            }
            if data
                .indexes
                .values()
                .any(|i| i.table_id == table_id && i.name == name)
            {
                return Err(DbError::AlreadyExists(format!("index {name}")));
            }
            let id = data.allocate_id();
            let meta = IndexMeta {
                id,
                table_id,
                name: name.to_string(),
                columns,
                unique,
            };
            data.indexes.insert(id, meta.clone());
            meta
        };
        self.save()?;
        Ok(meta)
    }

    pub fn list_indexes(&self, table_id: TableId) -> Vec<IndexMeta> {
        self.data
            .read()
            .indexes
            .values()
            .filter(|i| i.table_id == table_id)
            .cloned()
            .collect()
    }

    // ---- foreign keys ----

    pub fn create_foreign_key(
        &self,
        name: &str,
        table_id: TableId,
        columns: Vec<usize>,
        ref_table_id: TableId,
        ref_columns: Vec<usize>,
        on_delete: FkAction,
    ) -> Result<ForeignKeyMeta> {
        let meta = {
            let mut data = self.data.write();
            if !data.tables.contains_key(&table_id) {
                return Err(DbError::NotFound(format!("table id {table_id}")));
            }
            if !data.tables.contains_key(&ref_table_id) {
                return Err(DbError::NotFound(format!("table id {ref_table_id}")));
            }
            if columns.len() != ref_columns.len() {
                return Err(DbError::InvalidOperation(
                    "foreign key column count mismatch".into(),
                ));
            }
            let id = data.allocate_id();
            let meta = ForeignKeyMeta {
                id,
                name: name.to_string(),
                table_id,
                columns,
                ref_table_id,
                ref_columns,
                on_delete,
            };
            data.foreign_keys.insert(id, meta.clone());
            meta
        };
        // A cascade chain deeper than the bound is rejected up front.
        self.check_cascade_depth(meta.table_id)?;
        self.save()?;
        Ok(meta)
    }

    pub fn foreign_keys_of(&self, table_id: TableId) -> Vec<ForeignKeyMeta> {
        self.data
            .read()
            .foreign_keys
            .values()
            .filter(|fk| fk.table_id == table_id)
            .cloned()
            .collect()
    }

    pub fn foreign_keys_referencing(&self, table_id: TableId) -> Vec<ForeignKeyMeta> {
        self.data
            .read()
            .foreign_keys
            .values()
            .filter(|fk| fk.ref_table_id == table_id)
            .cloned()
            .collect()
    }

    /// Walks the cascade graph from `table_id`; exceeding the depth bound
    /// fails with `CascadeTooDeep`.
    pub fn check_cascade_depth(&self, table_id: TableId) -> Result<()> {
        let data = self.data.read();
        let mut frontier = vec![(table_id, 0usize)];
        let mut seen = std::collections::HashSet::new();
        while let Some((table, depth)) = frontier.pop() {
            if depth > MAX_CASCADE_DEPTH {
                return Err(DbError::CascadeTooDeep);
            }
            if !seen.insert(table) {
                continue;
            }
            for fk in data.foreign_keys.values() {
                if fk.ref_table_id == table && fk.on_delete == FkAction::Cascade {
                    frontier.push((fk.table_id, depth + 1));
                }
            }
        }
        Ok(())
    }

    // ---- views ----

    pub fn create_view(&self, db: &str, name: &str, query: &str) -> Result<ViewMeta> {
        let meta = {
            let mut data = self.data.write();
            if data.views.values().any(|v| v.db == db && v.name == name) {
                return Err(DbError::AlreadyExists(format!("view {db}.{name}")));
            }
            let id = data.allocate_id();
            let meta = ViewMeta {
                id,
                db: db.to_string(),
                name: name.to_string(),
                query: query.to_string(),
            };
            data.views.insert(id, meta.clone());
            meta
        };
        self.save()?;
        Ok(meta)
    }

    pub fn get_view(&self, db: &str, name: &str) -> Result<ViewMeta> {
        self.data
            .read()
            .views
            .values()
            .find(|v| v.db == db && v.name == name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("view {db}.{name}")))
    }

    pub fn drop_view(&self, db: &str, name: &str) -> Result<()> {
        {
            let mut data = self.data.write();
            let id = data
                .views
                .values()
                .find(|v| v.db == db && v.name == name)
                .map(|v| v.id)
                .ok_or_else(|| DbError::NotFound(format!("view {db}.{name}")))?;
            data.views.remove(&id);
        }
        self.save()
    }

    // ---- procedures ----

    pub fn create_procedure(&self, db: &str, name: &str, body: &str) -> Result<ProcedureMeta> {
        let meta = {
            let mut data = self.data.write();
            if data.procedures.values().any(|p| p.db == db && p.name == name) {
                return Err(DbError::AlreadyExists(format!("procedure {db}.{name}")));
            }
            let id = data.allocate_id();
            let meta = ProcedureMeta {
                id,
                db: db.to_string(),
                name: name.to_string(),
                body: body.to_string(),
            };
            data.procedures.insert(id, meta.clone());
            meta
        };
        self.save()?;
        Ok(meta)
    }

    /// Script bodies are stored but not executable until an interpreter is
    /// integrated.
    pub fn execute_procedure(&self, db: &str, name: &str) -> Result<()> {
        let data = self.data.read();
        if !data.procedures.values().any(|p| p.db == db && p.name == name) {
            return Err(DbError::NotFound(format!("procedure {db}.{name}")));
        }
        Err(DbError::Unsupported(format!(
            "stored procedure execution ({db}.{name})"
        )))
    }

    // ---- runtime table registry ----

    pub fn register_table(&self, table: Arc<Table>) {
        self.open_tables.insert(table.id(), table);
    }

    pub fn table(&self, id: TableId) -> Result<Arc<Table>> {
        self.open_tables
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or_else(|| DbError::NotFound(format!("open table id {id}")))
    }

    pub fn open_table_ids(&self) -> Vec<TableId> {
        self.open_tables.iter().map(|e| *e.key()).collect()
    }
}

impl CompensationApply for Catalog {
    fn undo_insert(
        &self,
        tx: &Transaction,
        table_id: TableId,
        row_id: RowId,
        _primary_key: &crate::table::key::CompositeKey,
    ) -> Result<()> {
        self.table(table_id)?.rollback_insert(tx, row_id)
    }

    fn undo_update(
        &self,
        tx: &Transaction,
        table_id: TableId,
        row_id: RowId,
        old_row_bytes: &[u8],
    ) -> Result<()> {
        self.table(table_id)?.rollback_overwrite(tx, row_id, old_row_bytes)
    }

    fn undo_delete(
        &self,
        tx: &Transaction,
        table_id: TableId,
        row_id: RowId,
        old_row_bytes: &[u8],
    ) -> Result<()> {
        self.table(table_id)?.rollback_overwrite(tx, row_id, old_row_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 4096;

    fn open(dir: &TempDir) -> Catalog {
        let pm = Arc::new(
            PageManager::open(&dir.path().join("catalog.sys"), PAGE_SIZE, true).unwrap(),
        );
        Catalog::open(pm).unwrap()
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

    #[test]
    fn test_create_and_duplicate_db() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        catalog.create_db("app").unwrap();
        assert!(matches!(
            catalog.create_db("app"),
            Err(DbError::AlreadyExists(_))
        ));
        assert_eq!(catalog.list_dbs(), vec!["app".to_string()]);
    }

    #[test]
    fn test_table_lifecycle() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        catalog.create_db("app").unwrap();
        let meta = catalog.create_table("app", "users", users_schema()).unwrap();
        assert!(meta.id > 0);

        assert!(matches!(
            catalog.create_table("app", "users", users_schema()),
            Err(DbError::AlreadyExists(_))
        ));
        assert_eq!(catalog.get_table("app", "users").unwrap().id, meta.id);

        catalog.drop_table("app", "users").unwrap();
        assert!(matches!(
            catalog.get_table("app", "users"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let table_id = {
            let catalog = open(&dir);
            catalog.create_db("app").unwrap();
            let meta = catalog.create_table("app", "users", users_schema()).unwrap();
            catalog.create_view("app", "v_users", "SELECT * FROM users").unwrap();
            meta.id
        };

        let catalog = open(&dir);
        assert_eq!(catalog.get_table("app", "users").unwrap().id, table_id);
        assert_eq!(
            catalog.get_view("app", "v_users").unwrap().query,
            "SELECT * FROM users"
        );
    }

    #[test]
    fn test_drop_table_with_inbound_fk_is_restricted() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        catalog.create_db("app").unwrap();
        let users = catalog.create_table("app", "users", users_schema()).unwrap();
        let orders = catalog
            .create_table(
                "app",
                "orders",
                Schema::new(
                    vec![
                        Column::new("id", DataType::Int32, false),
                        Column::new("user_id", DataType::Int32, false),
                    ],
                    vec![0],
                ),
            )
            .unwrap();
        catalog
            .create_foreign_key(
                "fk_orders_user",
                orders.id,
                vec![1],
                users.id,
                vec![0],
                FkAction::Restrict,
            )
            .unwrap();

        assert!(matches!(
            catalog.drop_table("app", "users"),
            Err(DbError::ConstraintViolation(_))
        ));
        catalog.drop_table("app", "orders").unwrap();
        catalog.drop_table("app", "users").unwrap();
    }

    #[test]
    fn test_schema_validation() {
        let schema = users_schema();
        let ok = Row::new(vec![Value::Int32(1), Value::String("ann".into())]);
        schema.validate_row(&ok).unwrap();

        let null_pk = Row::new(vec![Value::Null, Value::Null]);
        assert!(matches!(
            schema.validate_row(&null_pk),
            Err(DbError::ConstraintViolation(_))
        ));

        let wrong_type = Row::new(vec![Value::Int32(1), Value::Int64(5)]);
        assert!(matches!(
            schema.validate_row(&wrong_type),
            Err(DbError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_procedure_execution_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        catalog.create_db("app").unwrap();
        catalog
            .create_procedure("app", "nightly", "script body")
            .unwrap();
        assert!(matches!(
            catalog.execute_procedure("app", "nightly"),
            Err(DbError::Unsupported(_))
        ));
        assert!(matches!(
            catalog.execute_procedure("app", "absent"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_large_catalog_spans_chunk_pages() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = open(&dir);
            catalog.create_db("app").unwrap();
            for i in 0..60 {
                let mut columns = vec![Column::new("id", DataType::Int32, false)];
                for c in 0..20 {
                    columns.push(Column::new(
                        &format!("col_with_a_reasonably_long_name_{c}"),
                        DataType::VarChar(255),
                        true,
                    ));
                }
                catalog
                    .create_table("app", &format!("wide_table_{i}"), Schema::new(columns, vec![0]))
                    .unwrap();
            }
        }
        let catalog = open(&dir);
        assert_eq!(catalog.list_tables("app").len(), 60);
    }
}
