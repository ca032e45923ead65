//! Turns a [`SchemaChange`] list into ordered DDL and applies it.

use rusqlite::Connection;

use crate::error::{DbError, DbResult};
use crate::schema::differ::{diff, ColumnChange, KeyChange, SchemaChange};
use crate::schema::introspect::{introspect, LiveColumn, LiveTable};
use crate::schema::model::{Column, DefaultValue, Key, KeyKind, Schema, Table, View};

/// Render one key as a `CREATE [UNIQUE] INDEX` statement.
fn create_index_sql(table: &str, key: &Key) -> String {
    let unique = if key.kind == KeyKind::Unique { "UNIQUE " } else { "" };
    format!(
        "CREATE {unique}INDEX {} ON {table}({});",
        key.derived_name(table),
        key.columns.join(", ")
    )
}

/// Render a full `CREATE TABLE` plus one index statement per non-primary key.
fn create_table_sql(table: &Table) -> Vec<String> {
    let mut stmts = Vec::new();
    let mut col_ddls: Vec<String> = table.columns.iter().map(|c| c.ddl()).collect();

    if let Some(pk) = table.keys.iter().find(|k| k.kind == KeyKind::Primary) {
        col_ddls.push(format!("PRIMARY KEY({})", pk.columns.join(", ")));
    }

    stmts.push(format!("CREATE TABLE {}({});", table.name, col_ddls.join(", ")));

    for key in table.keys.iter().filter(|k| k.kind != KeyKind::Primary) {
        stmts.push(create_index_sql(&table.name, key));
    }
    stmts
}

/// Compute the `SELECT` expression used to populate column `target` during a
/// rebuild-and-copy.
fn select_expr(target: &Column, live: &LiveTable) -> String {
    match live.find_column(&target.name) {
        None => {
            // Brand-new column: substitute its literal default if required.
            match &target.default {
                Some(default) => default.sql_literal(),
                None => "NULL".to_string(),
            }
        }
        Some(live_col) => {
            if target.required && !live_col.required {
                let default = target
                    .default
                    .as_ref()
                    .map(DefaultValue::sql_literal)
                    .unwrap_or_else(|| "NULL".to_string());
                format!("IFNULL({}, {})", target.name, default)
            } else {
                target.name.clone()
            }
        }
    }
}

/// Decide whether an `AlterTable` can use additive `ALTER TABLE ADD COLUMN`
/// statements, or must fall back to rebuild-and-copy.
fn only_additive(col_changes: &[ColumnChange], key_changes: &[KeyChange]) -> bool {
    key_changes.is_empty() && col_changes.iter().all(|c| matches!(c, ColumnChange::AddColumn(_)))
}

fn rebuild_table_sql(
    live: &LiveTable,
    declared: &Table,
) -> DbResult<Vec<String>> {
    let mut stmts = Vec::new();
    let old_name = format!("old_{}", declared.name);
    stmts.push(format!("ALTER TABLE {} RENAME TO {old_name};", declared.name));
    stmts.extend(create_table_sql(declared));

    // Validate every declared column can be populated: a type narrowing or a
    // newly-required column with no viable default fails loudly rather than
    // truncating silently.
    let mut select_exprs = Vec::with_capacity(declared.columns.len());
    for col in &declared.columns {
        if live.find_column(&col.name).is_none() && col.required && col.default.is_none() {
            return Err(DbError::Schema(format!(
                "migration requires a default for new required column `{}.{}`",
                declared.name, col.name
            )));
        }
        select_exprs.push(select_expr(col, live));
    }

    let target_cols: Vec<&str> = declared.columns.iter().map(|c| c.name.as_str()).collect();
    stmts.push(format!(
        "INSERT INTO {}({}) SELECT {} FROM {old_name};",
        declared.name,
        target_cols.join(", "),
        select_exprs.join(", ")
    ));
    stmts.push(format!("DROP TABLE {old_name};"));
    Ok(stmts)
}

fn alter_table_sql(
    live: &LiveTable,
    declared: &Table,
    col_changes: &[ColumnChange],
    key_changes: &[KeyChange],
) -> DbResult<Vec<String>> {
    if only_additive(col_changes, key_changes) {
        let mut stmts = Vec::new();
        for change in col_changes {
            if let ColumnChange::AddColumn(col) = change {
                stmts.push(format!("ALTER TABLE {} ADD COLUMN {};", declared.name, col.ddl()));
            }
        }
        Ok(stmts)
    } else {
        rebuild_table_sql(live, declared)
    }
}

/// Compute the ordered DDL statements for one [`SchemaChange`].
pub fn emit(change: &SchemaChange) -> DbResult<Vec<String>> {
    match change {
        SchemaChange::CreateTable(table) => Ok(create_table_sql(table)),
        SchemaChange::DropTable(live) => Ok(vec![format!("DROP TABLE {};", live.name)]),
        SchemaChange::AlterTable(live, declared, col_changes, key_changes) => {
            alter_table_sql(live, declared, col_changes, key_changes)
        }
        SchemaChange::CreateView(view) => Ok(vec![format!("CREATE VIEW {} AS {};", view.name, view.sql)]),
        SchemaChange::AlterView(live, view) => Ok(vec![
            format!("DROP VIEW {};", live.name),
            format!("CREATE VIEW {} AS {};", view.name, view.sql),
        ]),
        SchemaChange::DropView(live) => Ok(vec![format!("DROP VIEW {};", live.name)]),
    }
}

/// Diff and apply the declared schema against the live database, in one
/// transaction. Returns the statements that were executed (useful for
/// logging/tests); idempotent (invariant 6 / testable property 6).
pub fn migrate(conn: &Connection, declared: &Schema) -> DbResult<Vec<String>> {
    let live = introspect(conn)?;
    let changes = diff(&live, declared);

    let mut all_statements = Vec::new();
    let tx = conn.unchecked_transaction()?;
    for change in &changes {
        let statements = emit(change)?;
        for stmt in &statements {
            tracing::info!(sql = %stmt, "applying migration statement");
            tx.execute_batch(stmt)?;
        }
        all_statements.extend(statements);
    }
    tx.commit()?;
    Ok(all_statements)
}
