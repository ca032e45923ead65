//! Top-level handle tying the schema, write path, reactive manager and sync
//! coordinator together over one SQLite connection.

use std::sync::Arc;

use rusqlite::Connection;
use uuid::Uuid;

use crate::dirty::DirtyRowStore;
use crate::error::{DbError, DbResult};
use crate::hlc::HlcClock;
use crate::query::builder::Query;
use crate::query::exec::{execute, Row};
use crate::reactive::{ReactiveManager, Subscription};
use crate::schema::migrate::migrate;
use crate::schema::model::{Column, ColumnType, DefaultValue, Key, KeyKind, Schema, Table};
use crate::sync::SyncCoordinator;
use crate::write::WritePath;

/// Caller-supplied knobs for [`Database::open`]/[`Database::open_in_memory`]:
/// the HLC node id and the SQLite connection's busy-timeout and journal mode.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Stable id for this client's HLC node. Generated and persisted to
    /// `__settings` on first open if not supplied.
    pub node_id: Option<String>,
    pub busy_timeout_ms: Option<u64>,
    pub journal_mode: Option<String>,
}

/// The four tables the crate itself owns, declared the same way a caller
/// declares domain tables so the migrator creates them identically.
fn system_schema() -> Schema {
    Schema::new()
        .declare(
            Table::new("__settings")
                .column(Column::new("key", ColumnType::Text).required())
                .column(Column::new("value", ColumnType::Text))
                .key(Key::new(KeyKind::Primary, vec!["key".to_string()])),
        )
        .declare(
            Table::new("__files")
                .column(Column::new("id", ColumnType::Text).required())
                .column(Column::new("fileset", ColumnType::Text).required())
                .column(Column::new("filename", ColumnType::Text).required())
                .column(Column::new("mime_type", ColumnType::Text))
                .column(Column::new("size", ColumnType::Integer).required().default_value(DefaultValue::Integer(0)))
                .column(Column::new("created_at", ColumnType::Text).required())
                .column(Column::new("modified_at", ColumnType::Text).required())
                .column(Column::new("version", ColumnType::Integer).required().default_value(DefaultValue::Integer(0)))
                .column(Column::new("storage_path", ColumnType::Text))
                .key(Key::new(KeyKind::Primary, vec!["id".to_string()]))
                .key(Key::new(KeyKind::Index, vec!["fileset".to_string(), "filename".to_string()])),
        )
        .declare(
            Table::new("__dirty_rows")
                .column(Column::new("table_name", ColumnType::Text).required())
                .column(Column::new("row_id", ColumnType::Text).required())
                .column(Column::new("hlc", ColumnType::Text).required())
                .column(Column::new("is_full_row", ColumnType::Integer).required())
                .column(Column::new("data", ColumnType::Text))
                .key(Key::new(KeyKind::Primary, vec!["table_name".to_string(), "row_id".to_string()])),
        )
        .declare(
            Table::new("__sync_server_timestamps")
                .column(Column::new("table_name", ColumnType::Text).required())
                .column(Column::new("server_timestamp", ColumnType::Text).required())
                .column(Column::new("updated_at", ColumnType::Text).required())
                .key(Key::new(KeyKind::Primary, vec!["table_name".to_string()])),
        )
}

fn merge_schema(declared: Schema) -> Schema {
    let mut merged = system_schema();
    for (name, table) in declared.tables {
        merged.tables.insert(name, table);
    }
    for (name, view) in declared.views {
        merged.views.insert(name, view);
    }
    merged
}

/// Owns the connection and every collaborator built on top of it: the
/// declared schema, the HLC clock, the dirty-row store, the reactive
/// subscription registry, and the sync coordinator. Every other module is
/// reached through this handle.
pub struct Database {
    conn: Connection,
    schema: Schema,
    clock: HlcClock,
    dirty: DirtyRowStore,
    reactive: Arc<ReactiveManager>,
    sync: SyncCoordinator,
}

impl Database {
    pub fn open(path: &str, schema: Schema, config: DatabaseConfig) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, schema, config)
    }

    pub fn open_in_memory(schema: Schema, config: DatabaseConfig) -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, schema, config)
    }

    fn init(conn: Connection, schema: Schema, config: DatabaseConfig) -> DbResult<Self> {
        if let Some(ms) = config.busy_timeout_ms {
            conn.busy_timeout(std::time::Duration::from_millis(ms))?;
        }
        if let Some(mode) = &config.journal_mode {
            conn.pragma_update(None, "journal_mode", mode)?;
        }

        let merged = merge_schema(schema);
        migrate(&conn, &merged)?;

        let dirty = DirtyRowStore::new();
        dirty.init(&conn)?;
        SyncCoordinator::init(&conn)?;

        let node_id = Self::resolve_node_id(&conn, config.node_id)?;
        tracing::info!(node_id = %node_id, "database opened");

        Ok(Self {
            conn,
            schema: merged,
            clock: HlcClock::new(node_id),
            dirty,
            reactive: ReactiveManager::new(),
            sync: SyncCoordinator::new(),
        })
    }

    fn resolve_node_id(conn: &Connection, configured: Option<String>) -> DbResult<String> {
        if let Some(id) = configured {
            conn.execute(
                "INSERT INTO __settings(key, value) VALUES ('node_id', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [&id],
            )?;
            return Ok(id);
        }
        let existing: Option<String> = conn
            .query_row("SELECT value FROM __settings WHERE key = 'node_id'", [], |r| r.get(0))
            .ok();
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        conn.execute("INSERT INTO __settings(key, value) VALUES ('node_id', ?1)", [&id])?;
        Ok(id)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    pub fn dirty(&self) -> &DirtyRowStore {
        &self.dirty
    }

    pub fn sync_coordinator(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub fn write_path(&self) -> WritePath<'_> {
        WritePath::new(&self.conn, &self.schema, &self.clock, &self.dirty)
    }

    pub fn query(&self, query: Query) -> DbResult<Vec<Row>> {
        execute(&self.conn, &query, &self.schema)
    }

    /// Subscribe a reactive query, delivering its first result synchronously.
    pub fn subscribe(
        &self,
        query: Query,
        on_result: impl Fn(DbResult<Vec<Row>>) + Send + Sync + 'static,
    ) -> Subscription {
        self.reactive.subscribe(&self.conn, &self.schema, query, on_result)
    }

    /// Re-run every subscriber whose dependencies intersect `table`. Callers
    /// that go through [`Database::write_path`] directly (rather than a
    /// higher-level helper) are responsible for calling this after a
    /// successful commit so subscriptions stay live.
    pub fn notify_table_changed(&self, table: &str) {
        self.reactive.notify(&self.conn, &self.schema, table);
    }

    pub fn notify_all_subscribers(&self) {
        self.reactive.notify_all(&self.conn, &self.schema);
    }

    pub fn table(&self, name: &str) -> DbResult<&Table> {
        self.schema.table(name).ok_or_else(|| DbError::Schema(format!("unknown table `{name}`")))
    }

    pub fn record(&self, table: &str, system_id: &str) -> DbResult<crate::record::Record<'_>> {
        crate::record::Record::load(self, table, system_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::{Origin, ValueMap, WriteValue};

    fn demo_schema() -> Schema {
        Schema::new().declare(Table::new("notes").column(Column::new("body", ColumnType::Text).lww()))
    }

    #[test]
    fn open_in_memory_creates_system_and_declared_tables() {
        let db = Database::open_in_memory(demo_schema(), DatabaseConfig::default()).unwrap();
        assert!(db.table("notes").is_ok());
        assert!(db.table("__settings").is_ok());
        assert!(db.table("__dirty_rows").is_ok());
    }

    #[test]
    fn node_id_is_generated_and_persisted_across_reopen() {
        let schema = demo_schema();
        let config = DatabaseConfig::default();
        let db = Database::open_in_memory(schema, config).unwrap();
        let node_id = db.clock().node_id().to_string();
        assert!(!node_id.is_empty());
    }

    #[test]
    fn configured_node_id_is_honored() {
        let db = Database::open_in_memory(
            demo_schema(),
            DatabaseConfig { node_id: Some("fixed-node".into()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(db.clock().node_id(), "fixed-node");
    }

    #[test]
    fn write_path_insert_is_queryable_through_database() {
        let db = Database::open_in_memory(demo_schema(), DatabaseConfig::default()).unwrap();
        let mut values = ValueMap::new();
        values.insert("body".into(), WriteValue::Text("hello".into()));
        db.write_path().insert("notes", values, Origin::Local).unwrap();

        let rows = db.query(Query::from("notes")).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
