//! Executes a compiled [`Query`] against a live connection, returning each
//! row as a `column -> value` map.

use std::collections::BTreeMap;

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::DbResult;
use crate::query::builder::{Query, SqlValue};
use crate::schema::model::Schema;

pub type Row = BTreeMap<String, SqlValue>;

pub fn execute(conn: &Connection, query: &Query, schema: &Schema) -> DbResult<Vec<Row>> {
    let (sql, params) = query.compile(schema)?;
    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        let mut out = Row::new();
        for (idx, name) in column_names.iter().enumerate() {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => SqlValue::Null,
                ValueRef::Integer(i) => SqlValue::Integer(i),
                ValueRef::Real(r) => SqlValue::Real(r),
                ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    })?;

    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{Column, ColumnType, Table};

    #[test]
    fn executes_and_maps_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users(name TEXT, age INTEGER); INSERT INTO users VALUES ('Alice', 30);").unwrap();
        let schema = Schema::new().declare(
            Table::new("users").column(Column::new("name", ColumnType::Text)).column(Column::new("age", ColumnType::Integer)),
        );
        let q = Query::from("users");
        let rows = execute(&conn, &q, &schema).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&SqlValue::Text("Alice".into())));
        assert_eq!(rows[0].get("age"), Some(&SqlValue::Integer(30)));
    }
}
