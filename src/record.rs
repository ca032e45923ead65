//! Typed read/write row wrapper with change tracking. Pure data carrier: no
//! validation or conflict logic of its own, all of that lives in
//! [`crate::write::WritePath`].

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};

use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::query::builder::{Query, SqlValue};
use crate::write::{Origin, ValueMap, WriteValue};

/// One row, loaded by `system_id`, with an `original` snapshot retained so
/// [`Record::modified_fields`] and [`Record::save`] only touch what changed.
pub struct Record<'a> {
    db: &'a Database,
    table: String,
    system_id: String,
    original: BTreeMap<String, SqlValue>,
    current: BTreeMap<String, SqlValue>,
}

impl<'a> Record<'a> {
    pub fn load(db: &'a Database, table: &str, system_id: &str) -> DbResult<Self> {
        let row = db
            .query(Query::raw(
                format!("SELECT * FROM {table} WHERE system_id = ?1"),
                vec![SqlValue::Text(system_id.to_string())],
            ))?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("{table}/{system_id}")))?;
        Ok(Self { db, table: table.to_string(), system_id: system_id.to_string(), original: row.clone(), current: row })
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.current.get(column)
    }

    pub fn get_text(&self, column: &str) -> Option<&str> {
        match self.current.get(column) {
            Some(SqlValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_integer(&self, column: &str) -> Option<i64> {
        match self.current.get(column) {
            Some(SqlValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_real(&self, column: &str) -> Option<f64> {
        match self.current.get(column) {
            Some(SqlValue::Real(r)) => Some(*r),
            _ => None,
        }
    }

    /// DATE columns are stored as RFC 3339 text; this parses them back into
    /// a naive timestamp.
    pub fn get_date(&self, column: &str) -> DbResult<Option<NaiveDateTime>> {
        match self.current.get(column) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(SqlValue::Text(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.naive_utc()))
                .map_err(|e| DbError::InvalidValue(format!("`{column}` is not a valid date: {e}"))),
            Some(other) => Err(DbError::InvalidValue(format!("`{column}` is not a date column: {other:?}"))),
        }
    }

    /// FILESET columns are stored as a JSON array of file ids.
    pub fn get_fileset(&self, column: &str) -> DbResult<Vec<String>> {
        match self.current.get(column) {
            None | Some(SqlValue::Null) => Ok(Vec::new()),
            Some(SqlValue::Text(s)) => serde_json::from_str(s).map_err(Into::into),
            Some(other) => Err(DbError::InvalidValue(format!("`{column}` is not a fileset column: {other:?}"))),
        }
    }

    pub fn set_text(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.current.insert(column.into(), SqlValue::Text(value.into()));
    }

    pub fn set_integer(&mut self, column: impl Into<String>, value: i64) {
        self.current.insert(column.into(), SqlValue::Integer(value));
    }

    pub fn set_real(&mut self, column: impl Into<String>, value: f64) {
        self.current.insert(column.into(), SqlValue::Real(value));
    }

    pub fn set_null(&mut self, column: impl Into<String>) {
        self.current.insert(column.into(), SqlValue::Null);
    }

    pub fn set_date(&mut self, column: impl Into<String>, value: NaiveDateTime) {
        self.current.insert(column.into(), SqlValue::Text(value.and_utc().to_rfc3339()));
    }

    pub fn set_fileset(&mut self, column: impl Into<String>, ids: &[String]) -> DbResult<()> {
        let encoded = serde_json::to_string(ids)?;
        self.current.insert(column.into(), SqlValue::Text(encoded));
        Ok(())
    }

    /// Columns whose value differs from the snapshot taken at load time.
    pub fn modified_fields(&self) -> Vec<String> {
        self.current
            .iter()
            .filter(|(name, value)| name.as_str() != "system_id" && self.original.get(*name) != Some(value))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Persist every modified field through the write path, then reset the
    /// snapshot to match. A no-op if nothing changed.
    pub fn save(&mut self, origin: Origin) -> DbResult<()> {
        let fields = self.modified_fields();
        if fields.is_empty() {
            return Ok(());
        }
        let mut values = ValueMap::new();
        for field in &fields {
            let value = self.current.get(field).expect("field came from current map");
            values.insert(field.clone(), sqlvalue_to_write_value(value));
        }
        self.db.write_path().update(&self.table, &self.system_id, values, origin)?;
        self.original = self.current.clone();
        self.db.notify_table_changed(&self.table);
        Ok(())
    }

    /// Delete the underlying row through the write path.
    pub fn delete(self, origin: Origin) -> DbResult<()> {
        self.db.write_path().delete(&self.table, &self.system_id, origin)?;
        self.db.notify_table_changed(&self.table);
        Ok(())
    }
}

fn sqlvalue_to_write_value(value: &SqlValue) -> WriteValue {
    match value {
        SqlValue::Null => WriteValue::Null,
        SqlValue::Text(s) => WriteValue::Text(s.clone()),
        SqlValue::Integer(i) => WriteValue::Integer(*i),
        SqlValue::Real(r) => WriteValue::Real(*r),
        SqlValue::Blob(b) => WriteValue::Blob(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;
    use crate::schema::model::{Column, ColumnType, Schema, Table};

    fn schema() -> Schema {
        Schema::new().declare(
            Table::new("tasks")
                .column(Column::new("title", ColumnType::Text).lww())
                .column(Column::new("due", ColumnType::Date)),
        )
    }

    fn seeded_db() -> (Database, String) {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        let mut values = ValueMap::new();
        values.insert("title".into(), WriteValue::Text("first draft".into()));
        let id = db.write_path().insert("tasks", values, Origin::Local).unwrap();
        (db, id)
    }

    #[test]
    fn modified_fields_is_empty_until_a_setter_is_called() {
        let (db, id) = seeded_db();
        let record = Record::load(&db, "tasks", &id).unwrap();
        assert!(record.modified_fields().is_empty());
    }

    #[test]
    fn save_persists_only_modified_fields() {
        let (db, id) = seeded_db();
        let mut record = Record::load(&db, "tasks", &id).unwrap();
        record.set_text("title", "final draft");
        assert_eq!(record.modified_fields(), vec!["title".to_string()]);
        record.save(Origin::Local).unwrap();

        let reloaded = Record::load(&db, "tasks", &id).unwrap();
        assert_eq!(reloaded.get_text("title"), Some("final draft"));
        assert!(reloaded.modified_fields().is_empty());
    }

    #[test]
    fn date_round_trips_through_set_and_get() {
        let (db, id) = seeded_db();
        let mut record = Record::load(&db, "tasks", &id).unwrap();
        let due = chrono::NaiveDate::from_ymd_opt(2030, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap();
        record.set_date("due", due);
        record.save(Origin::Local).unwrap();

        let reloaded = Record::load(&db, "tasks", &id).unwrap();
        assert_eq!(reloaded.get_date("due").unwrap(), Some(due));
    }

    #[test]
    fn delete_removes_the_row() {
        let (db, id) = seeded_db();
        let record = Record::load(&db, "tasks", &id).unwrap();
        record.delete(Origin::Local).unwrap();
        assert!(Record::load(&db, "tasks", &id).is_err());
    }
}
