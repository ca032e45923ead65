//! Reads the live SQLite schema (`sqlite_master` + `PRAGMA`) into a model
//! shaped like [`crate::schema::model`] but carrying raw type/default text
//! for the differ to compare against.

use rusqlite::Connection;

use crate::error::DbResult;
use crate::schema::model::KeyKind;

#[derive(Debug, Clone, PartialEq)]
pub struct LiveColumn {
    pub name: String,
    /// Raw SQLite type affinity text, e.g. "TEXT", "INTEGER".
    pub raw_type: String,
    pub required: bool,
    /// Raw default expression text as stored by SQLite, if any.
    pub raw_default: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveKey {
    pub name: String,
    pub columns: Vec<String>,
    pub kind: KeyKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveTable {
    pub name: String,
    pub columns: Vec<LiveColumn>,
    pub keys: Vec<LiveKey>,
}

impl LiveTable {
    pub fn find_column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveView {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct LiveSchema {
    pub tables: Vec<LiveTable>,
    pub views: Vec<LiveView>,
}

/// Enumerate tables and views from `sqlite_master`, skipping SQLite-internal
/// and Android-internal names.
pub fn introspect(conn: &Connection) -> DbResult<LiveSchema> {
    let mut tables = Vec::new();
    let mut views = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT name, type, sql FROM sqlite_master \
         WHERE type IN ('table','view') \
         AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
         AND name != 'android_metadata' \
         ORDER BY name",
    )?;
    let rows: Vec<(String, String, Option<String>)> = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
        })?
        .collect::<Result<_, _>>()?;

    for (name, kind, sql) in rows {
        if kind == "view" {
            views.push(LiveView { name, sql: sql.unwrap_or_default() });
        } else {
            let columns = introspect_columns(conn, &name)?;
            let keys = introspect_keys(conn, &name)?;
            tables.push(LiveTable { name, columns, keys });
        }
    }

    Ok(LiveSchema { tables, views })
}

fn introspect_columns(conn: &Connection, table: &str) -> DbResult<Vec<LiveColumn>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get("name")?;
            let raw_type: String = row.get("type")?;
            let notnull: i64 = row.get("notnull")?;
            let dflt: Option<String> = row.get("dflt_value")?;
            Ok(LiveColumn { name, raw_type, required: notnull != 0, raw_default: dflt })
        })?
        .collect::<Result<_, _>>()?;
    Ok(columns)
}

fn introspect_keys(conn: &Connection, table: &str) -> DbResult<Vec<LiveKey>> {
    let mut keys = Vec::new();

    // Primary key, derived from table_info (pk column ordinal > 0).
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let mut pk_cols: Vec<(i64, String)> = stmt
        .query_map([], |row| {
            let name: String = row.get("name")?;
            let pk: i64 = row.get("pk")?;
            Ok((pk, name))
        })?
        .collect::<Result<_, _>>()?;
    pk_cols.retain(|(pk, _)| *pk > 0);
    pk_cols.sort_by_key(|(pk, _)| *pk);
    if !pk_cols.is_empty() {
        keys.push(LiveKey {
            name: format!("pk_{table}"),
            columns: pk_cols.into_iter().map(|(_, n)| n).collect(),
            kind: KeyKind::Primary,
        });
    }

    let sql = format!("PRAGMA index_list({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let indexes: Vec<(String, i64, String)> = stmt
        .query_map([], |row| {
            let name: String = row.get("name")?;
            let unique: i64 = row.get("unique")?;
            let origin: String = row.get("origin")?;
            Ok((name, unique, origin))
        })?
        .collect::<Result<_, _>>()?;

    for (index_name, unique, origin) in indexes {
        // Skip the autoindex SQLite creates for an inline PRIMARY KEY; we
        // already captured the PK above.
        if origin == "pk" {
            continue;
        }
        let info_sql = format!("PRAGMA index_info({})", quote_ident(&index_name));
        let mut info_stmt = conn.prepare(&info_sql)?;
        let mut cols: Vec<(i64, String)> = info_stmt
            .query_map([], |row| {
                let seqno: i64 = row.get("seqno")?;
                let name: String = row.get("name")?;
                Ok((seqno, name))
            })?
            .collect::<Result<_, _>>()?;
        cols.sort_by_key(|(seqno, _)| *seqno);
        keys.push(LiveKey {
            name: index_name,
            columns: cols.into_iter().map(|(_, n)| n).collect(),
            kind: if unique != 0 { KeyKind::Unique } else { KeyKind::Index },
        });
    }

    Ok(keys)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn introspects_table_columns_and_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items(id TEXT PRIMARY KEY, name TEXT NOT NULL, qty INTEGER DEFAULT 0);
             CREATE INDEX idx_items_name ON items(name);",
        )
        .unwrap();
        let live = introspect(&conn).unwrap();
        let table = live.tables.iter().find(|t| t.name == "items").unwrap();
        assert!(table.find_column("name").unwrap().required);
        assert_eq!(table.find_column("qty").unwrap().raw_default.as_deref(), Some("0"));
        assert!(table.keys.iter().any(|k| k.name == "idx_items_name"));
        assert!(table.keys.iter().any(|k| k.kind == KeyKind::Primary && k.columns == ["id"]));
    }

    #[test]
    fn skips_sqlite_internal_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT);").unwrap();
        let live = introspect(&conn).unwrap();
        assert!(!live.tables.iter().any(|t| t.name.starts_with("sqlite_")));
    }
}
