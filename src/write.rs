//! insert/update/delete/upsert wrappers that enforce system columns, LWW
//! HLC companions, and dirty-row emission.

use std::collections::BTreeMap;

use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::dirty::DirtyRowStore;
use crate::error::{DbError, DbResult};
use crate::hlc::{Hlc, HlcClock};
use crate::query::builder::SqlValue;
use crate::schema::model::{ColumnType, Schema, Table};

/// Whether a write originated on this client or was received from the
/// server. Local writes emit dirty rows; remote writes do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A caller-supplied value, before logical-type serialization.
#[derive(Debug, Clone)]
pub enum WriteValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Blob(Vec<u8>),
    Date(chrono::NaiveDateTime),
    FilesetIds(Vec<String>),
}

pub type ValueMap = BTreeMap<String, WriteValue>;

pub struct WritePath<'a> {
    pub conn: &'a Connection,
    pub schema: &'a Schema,
    pub clock: &'a HlcClock,
    pub dirty: &'a DirtyRowStore,
}

impl<'a> WritePath<'a> {
    pub fn new(conn: &'a Connection, schema: &'a Schema, clock: &'a HlcClock, dirty: &'a DirtyRowStore) -> Self {
        Self { conn, schema, clock, dirty }
    }

    fn resolve_table(&self, table: &str) -> DbResult<&Table> {
        self.schema.table(table).ok_or_else(|| DbError::Schema(format!("unknown table `{table}`")))
    }

    /// Serialize one value according to its column's logical type, and
    /// validate it against the column's constraints (enum, length,
    /// file-count caps).
    fn serialize(table: &str, column_name: &str, table_def: &Table, value: &WriteValue) -> DbResult<SqlValue> {
        let column = table_def.find_column(column_name).ok_or_else(|| {
            DbError::Schema(format!("unknown column `{table}.{column_name}`"))
        })?;

        let sql_value = match (column.col_type, value) {
            (_, WriteValue::Null) => SqlValue::Null,
            (ColumnType::Date, WriteValue::Date(dt)) => SqlValue::Text(dt.and_utc().to_rfc3339()),
            (ColumnType::Date, WriteValue::Text(s)) => SqlValue::Text(s.clone()),
            (ColumnType::Fileset, WriteValue::FilesetIds(ids)) => {
                SqlValue::Text(serde_json::to_string(ids)?)
            }
            (_, WriteValue::Text(s)) => SqlValue::Text(s.clone()),
            (_, WriteValue::Integer(i)) => SqlValue::Integer(*i),
            (_, WriteValue::Real(r)) => SqlValue::Real(*r),
            (_, WriteValue::Blob(b)) => SqlValue::Blob(b.clone()),
            (other, bad) => {
                return Err(DbError::InvalidValue(format!(
                    "value {bad:?} is not valid for column `{column_name}` of type {other:?}"
                )))
            }
        };

        validate_constraints(column_name, column, &sql_value)?;
        Ok(sql_value)
    }

    /// Insert a new row. Generates `system_id` if the caller did not supply
    /// one (e.g. when replaying a remote row that already carries an id).
    pub fn insert(&self, table: &str, mut values: ValueMap, origin: Origin) -> DbResult<String> {
        let table_def = self.resolve_table(table)?;
        let hlc = self.clock.now();

        let system_id = match values.remove("system_id") {
            Some(WriteValue::Text(id)) => id,
            Some(_) => return Err(DbError::InvalidValue("system_id must be text".into())),
            None => Uuid::new_v4().to_string(),
        };

        let mut columns: Vec<String> = vec!["system_id".into()];
        let mut sql_values: Vec<SqlValue> = vec![SqlValue::Text(system_id.clone())];
        let mut payload = json!({});

        for (name, value) in &values {
            if name == "system_created_at"
                || name == "system_version"
                || name == "system_is_local_origin"
            {
                continue;
            }
            let serialized = Self::serialize(table, name, table_def, value)?;
            columns.push(name.clone());
            if let Value::Object(map) = &mut payload {
                map.insert(name.clone(), sqlvalue_to_json(&serialized));
            }
            sql_values.push(serialized);

            if let Some(column) = table_def.find_column(name) {
                if column.lww {
                    columns.push(column.hlc_companion_name());
                    sql_values.push(SqlValue::Text(hlc.to_string()));
                    if let Value::Object(map) = &mut payload {
                        map.insert(column.hlc_companion_name(), Value::String(hlc.to_string()));
                    }
                }
            }
        }

        columns.push("system_created_at".into());
        sql_values.push(SqlValue::Text(hlc.to_string()));
        columns.push("system_version".into());
        sql_values.push(SqlValue::Text(hlc.to_string()));
        columns.push("system_is_local_origin".into());
        sql_values.push(SqlValue::Integer((origin == Origin::Local) as i64));

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!("INSERT INTO {table}({}) VALUES ({placeholders})", columns.join(", "));

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(&sql, params_from_iter(sql_values.iter()))?;
        if origin == Origin::Local {
            self.dirty.add(&tx, table, &system_id, &hlc.to_string(), true, Some(&payload))?;
        }
        tx.commit()?;

        tracing::debug!(table, system_id, hlc = %hlc, "inserted row");
        Ok(system_id)
    }

    /// Update an existing row identified by `system_id`, stamping
    /// `system_version` and per-column `__hlc` companions for every
    /// assigned LWW column.
    pub fn update(&self, table: &str, system_id: &str, values: ValueMap, origin: Origin) -> DbResult<()> {
        let table_def = self.resolve_table(table)?;
        let hlc = self.clock.now();

        let mut assignments: Vec<String> = Vec::new();
        let mut sql_values: Vec<SqlValue> = Vec::new();
        let mut payload = json!({});

        for (name, value) in &values {
            let serialized = Self::serialize(table, name, table_def, value)?;
            assignments.push(format!("{name} = ?"));
            sql_values.push(serialized.clone());
            if let Value::Object(map) = &mut payload {
                map.insert(name.clone(), sqlvalue_to_json(&serialized));
            }

            if let Some(column) = table_def.find_column(name) {
                if column.lww {
                    let companion = column.hlc_companion_name();
                    assignments.push(format!("{companion} = ?"));
                    sql_values.push(SqlValue::Text(hlc.to_string()));
                    if let Value::Object(map) = &mut payload {
                        map.insert(companion, Value::String(hlc.to_string()));
                    }
                }
            }
        }

        assignments.push("system_version = ?".into());
        sql_values.push(SqlValue::Text(hlc.to_string()));
        sql_values.push(SqlValue::Text(system_id.to_string()));

        let sql = format!("UPDATE {table} SET {} WHERE system_id = ?", assignments.join(", "));

        let tx = self.conn.unchecked_transaction()?;
        let affected = tx.execute(&sql, params_from_iter(sql_values.iter()))?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("{table}/{system_id}")));
        }
        if origin == Origin::Local {
            self.dirty.add(&tx, table, system_id, &hlc.to_string(), false, Some(&payload))?;
        }
        tx.commit()?;

        tracing::debug!(table, system_id, hlc = %hlc, "updated row");
        Ok(())
    }

    /// Hard delete with a tombstone dirty-row marker
    /// (`is_full_row=true, data=None`).
    pub fn delete(&self, table: &str, system_id: &str, origin: Origin) -> DbResult<()> {
        self.resolve_table(table)?;
        let hlc = self.clock.now();

        let sql = format!("DELETE FROM {table} WHERE system_id = ?");

        let tx = self.conn.unchecked_transaction()?;
        let affected = tx.execute(&sql, [system_id])?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("{table}/{system_id}")));
        }
        if origin == Origin::Local {
            self.dirty.add(&tx, table, system_id, &hlc.to_string(), true, None)?;
        }
        tx.commit()?;

        tracing::debug!(table, system_id, hlc = %hlc, "deleted row");
        Ok(())
    }

    /// Insert-or-update keyed by `conflict_fields`. When a matching row
    /// already exists and `origin` is [`Origin::Remote`], per-column LWW
    /// arbitration decides whether the incoming value wins.
    pub fn upsert(
        &self,
        table: &str,
        values: ValueMap,
        conflict_fields: &[&str],
        origin: Origin,
    ) -> DbResult<String> {
        let table_def = self.resolve_table(table)?;
        let existing = self.find_matching(table, table_def, &values, conflict_fields)?;

        match existing {
            None => self.insert(table, values, origin),
            Some(system_id) => {
                if origin == Origin::Remote {
                    self.apply_remote_with_arbitration(table, table_def, &system_id, values)?;
                } else {
                    let mut values = values;
                    values.remove("system_id");
                    self.update(table, &system_id, values, origin)?;
                }
                Ok(system_id)
            }
        }
    }

    fn find_matching(
        &self,
        table: &str,
        table_def: &Table,
        values: &ValueMap,
        conflict_fields: &[&str],
    ) -> DbResult<Option<String>> {
        if conflict_fields.is_empty() {
            return Ok(None);
        }
        let mut clauses = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for field in conflict_fields {
            let value = values
                .get(*field)
                .ok_or_else(|| DbError::Schema(format!("missing conflict field `{field}` for upsert")))?;
            let serialized = Self::serialize(table, field, table_def, value)?;
            clauses.push(format!("{field} = ?"));
            params.push(serialized);
        }
        let sql = format!("SELECT system_id FROM {table} WHERE {}", clauses.join(" AND "));
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get::<_, String>(0)?))
        } else {
            Ok(None)
        }
    }

    /// Apply an incoming remote row to an existing local row with
    /// per-column LWW arbitration: keep the local value iff
    /// `local C__hlc > incoming C__hlc`; otherwise overwrite C and C__hlc.
    /// Non-LWW columns are overwritten wholesale if the incoming
    /// `system_version` exceeds the local one.
    fn apply_remote_with_arbitration(
        &self,
        table: &str,
        table_def: &Table,
        system_id: &str,
        values: ValueMap,
    ) -> DbResult<()> {
        let local_row = self.load_row(table, system_id)?;
        let local_version = local_row
            .get("system_version")
            .and_then(|v| if let SqlValue::Text(s) = v { Some(s.clone()) } else { None })
            .unwrap_or_default();
        let incoming_version = match values.get("system_version") {
            Some(WriteValue::Text(s)) => s.clone(),
            _ => local_version.clone(),
        };
        let row_wins = incoming_version.as_str() > local_version.as_str();
        let mut max_hlc_seen = local_version.clone();

        let mut assignments: Vec<String> = Vec::new();
        let mut sql_values: Vec<SqlValue> = Vec::new();

        for (name, value) in &values {
            if name == "system_id" || name == "system_version" || name.ends_with("__hlc") {
                continue;
            }
            let Some(column) = table_def.find_column(name) else { continue };
            let serialized = Self::serialize(table, name, table_def, value)?;

            if column.lww {
                let companion = column.hlc_companion_name();
                let incoming_hlc = match values.get(&companion) {
                    Some(WriteValue::Text(s)) => s.clone(),
                    _ => incoming_version.clone(),
                };
                let local_hlc = local_row
                    .get(&companion)
                    .and_then(|v| if let SqlValue::Text(s) = v { Some(s.clone()) } else { None })
                    .unwrap_or_default();

                let local_wins = local_hlc.as_str() > incoming_hlc.as_str();
                if local_wins {
                    tracing::warn!(table, system_id, column = name.as_str(), "lww arbitration kept local value");
                    continue;
                }
                if incoming_hlc.as_str() > max_hlc_seen.as_str() {
                    max_hlc_seen = incoming_hlc.clone();
                }
                assignments.push(format!("{name} = ?"));
                sql_values.push(serialized);
                assignments.push(format!("{companion} = ?"));
                sql_values.push(SqlValue::Text(incoming_hlc));
            } else if row_wins {
                assignments.push(format!("{name} = ?"));
                sql_values.push(serialized);
            }
        }

        if row_wins && incoming_version.as_str() > max_hlc_seen.as_str() {
            max_hlc_seen = incoming_version.clone();
        }
        if max_hlc_seen.as_str() > local_version.as_str() {
            assignments.push("system_version = ?".into());
            sql_values.push(SqlValue::Text(max_hlc_seen));
        }

        if assignments.is_empty() {
            return Ok(());
        }

        assignments.push("system_is_local_origin = ?".into());
        sql_values.push(SqlValue::Integer(0));

        sql_values.push(SqlValue::Text(system_id.to_string()));
        let sql = format!("UPDATE {table} SET {} WHERE system_id = ?", assignments.join(", "));
        self.conn.execute(&sql, params_from_iter(sql_values.iter()))?;
        // Remote writes never emit a dirty-row marker.
        Ok(())
    }

    fn load_row(&self, table: &str, system_id: &str) -> DbResult<BTreeMap<String, SqlValue>> {
        crate::query::exec::execute(
            self.conn,
            &crate::query::builder::Query::raw(
                format!("SELECT * FROM {table} WHERE system_id = ?1"),
                vec![SqlValue::Text(system_id.to_string())],
            ),
            self.schema,
        )?
        .into_iter()
        .next()
        .ok_or_else(|| DbError::NotFound(format!("{table}/{system_id}")))
    }
}

fn sqlvalue_to_json(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Text(s) => Value::String(s.clone()),
        SqlValue::Integer(i) => json!(i),
        SqlValue::Real(r) => json!(r),
        SqlValue::Blob(b) => json!(b),
    }
}

fn validate_constraints(name: &str, column: &crate::schema::model::Column, value: &SqlValue) -> DbResult<()> {
    if let SqlValue::Text(s) = value {
        if let Some(max_len) = column.constraints.max_length {
            if s.len() > max_len {
                return Err(DbError::InvalidValue(format!("`{name}` exceeds max length {max_len}")));
            }
        }
        if let Some(values) = &column.constraints.valid_values {
            if !values.iter().any(|v| v == s) {
                return Err(DbError::InvalidValue(format!("`{name}` value `{s}` is not in the allowed set")));
            }
        }
        if column.col_type == ColumnType::Fileset {
            if let Some(max_count) = column.constraints.max_file_count {
                let ids: Vec<String> = serde_json::from_str(s).unwrap_or_default();
                if ids.len() > max_count {
                    return Err(DbError::InvalidValue(format!("`{name}` exceeds max file count {max_count}")));
                }
            }
        }
    }
    Ok(())
}

/// Convenience: an [`Hlc`] parsed from a stored string, used by the sync
/// coordinator and record view when comparing watermarks.
pub fn parse_hlc_or_default(s: &str) -> Hlc {
    Hlc::parse(s).unwrap_or_else(|_| Hlc::new(0, 0, String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::DirtyRowStore;
    use crate::hlc::HlcClock;
    use crate::schema::model::{Column, ColumnType, Schema, Table};

    fn setup(schema: &Schema) -> (Connection, HlcClock, DirtyRowStore) {
        let conn = Connection::open_in_memory().unwrap();
        let clock = HlcClock::new("n1");
        let dirty = DirtyRowStore::new();
        dirty.init(&conn).unwrap();
        crate::schema::migrate::migrate(&conn, schema).unwrap();
        (conn, clock, dirty)
    }

    fn users_schema() -> Schema {
        Schema::new().declare(Table::new("users").column(Column::new("name", ColumnType::Text).required()))
    }

    #[test]
    fn insert_stamps_system_columns_and_emits_dirty_row() {
        let schema = users_schema();
        let (conn, clock, dirty) = setup(&schema);
        let wp = WritePath::new(&conn, &schema, &clock, &dirty);

        let mut values = ValueMap::new();
        values.insert("name".into(), WriteValue::Text("Alice".into()));
        let id = wp.insert("users", values, Origin::Local).unwrap();

        let row = wp.load_row("users", &id).unwrap();
        assert_eq!(row.get("name"), Some(&SqlValue::Text("Alice".into())));
        assert!(matches!(row.get("system_created_at"), Some(SqlValue::Text(_))));

        let pending = dirty.get_all(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].table_name, "users");
        assert!(pending[0].is_full_row);
    }

    #[test]
    fn lww_update_sets_companion_hlc_only_for_assigned_columns() {
        let schema = Schema::new().declare(Table::new("tasks").column(Column::new("title", ColumnType::Text).lww()));
        let (conn, clock, dirty) = setup(&schema);
        let wp = WritePath::new(&conn, &schema, &clock, &dirty);

        let mut values = ValueMap::new();
        values.insert("title".into(), WriteValue::Text("A".into()));
        let id = wp.insert("tasks", values, Origin::Local).unwrap();

        let mut update_values = ValueMap::new();
        update_values.insert("title".into(), WriteValue::Text("B".into()));
        wp.update("tasks", &id, update_values, Origin::Local).unwrap();

        let row = wp.load_row("tasks", &id).unwrap();
        assert_eq!(row.get("title"), Some(&SqlValue::Text("B".into())));
        assert!(matches!(row.get("title__hlc"), Some(SqlValue::Text(_))));
    }

    #[test]
    fn remote_ingest_keeps_higher_local_hlc() {
        let schema = Schema::new().declare(Table::new("tasks").column(Column::new("title", ColumnType::Text).lww()));
        let (conn, clock, dirty) = setup(&schema);
        let wp = WritePath::new(&conn, &schema, &clock, &dirty);

        let mut values = ValueMap::new();
        values.insert("title".into(), WriteValue::Text("A".into()));
        let id = wp.insert("tasks", values, Origin::Local).unwrap();
        let mut update_values = ValueMap::new();
        update_values.insert("title".into(), WriteValue::Text("B".into()));
        wp.update("tasks", &id, update_values, Origin::Local).unwrap();

        let row = wp.load_row("tasks", &id).unwrap();
        let local_hlc = match row.get("title__hlc").unwrap() {
            SqlValue::Text(s) => s.clone(),
            _ => panic!("expected text"),
        };

        // Incoming remote update carries an older hlc for `title`.
        let mut remote_values = ValueMap::new();
        remote_values.insert("system_id".into(), WriteValue::Text(id.clone()));
        remote_values.insert("title".into(), WriteValue::Text("C".into()));
        remote_values.insert("title__hlc".into(), WriteValue::Text("00000000000001:00000:n2".into()));
        remote_values.insert("system_version".into(), WriteValue::Text("00000000000002:00000:n2".into()));
        wp.upsert("tasks", remote_values, &["system_id"], Origin::Remote).unwrap();

        let row = wp.load_row("tasks", &id).unwrap();
        assert_eq!(row.get("title"), Some(&SqlValue::Text("B".into())));
        assert_eq!(row.get("title__hlc"), Some(&SqlValue::Text(local_hlc)));
        // Remote writes never produce a dirty-row marker.
        assert!(dirty.get_all(&conn).unwrap().is_empty());
        // The row's last writer is now the server, even though the LWW
        // arbitration kept this client's own `title` value.
        assert_eq!(row.get("system_is_local_origin"), Some(&SqlValue::Integer(0)));
    }

    #[test]
    fn delete_produces_tombstone_with_no_payload() {
        let schema = users_schema();
        let (conn, clock, dirty) = setup(&schema);
        let wp = WritePath::new(&conn, &schema, &clock, &dirty);

        let mut values = ValueMap::new();
        values.insert("name".into(), WriteValue::Text("Alice".into()));
        let id = wp.insert("users", values, Origin::Local).unwrap();
        dirty.clear(&conn).unwrap();

        wp.delete("users", &id, Origin::Local).unwrap();
        let pending = dirty.get_all(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_full_row);
        assert!(pending[0].data.is_none());
    }

    #[test]
    fn unknown_column_is_a_schema_error() {
        let schema = users_schema();
        let (conn, clock, dirty) = setup(&schema);
        let wp = WritePath::new(&conn, &schema, &clock, &dirty);
        let mut values = ValueMap::new();
        values.insert("nickname".into(), WriteValue::Text("x".into()));
        let err = wp.insert("users", values, Origin::Local).unwrap_err();
        assert!(matches!(err, DbError::Schema(_)));
    }
}
