//! Structural diff between the declared [`Schema`] and an introspected
//! [`LiveSchema`].

use crate::schema::introspect::{LiveColumn, LiveKey, LiveSchema, LiveTable, LiveView};
use crate::schema::model::{Column, Key, KeyKind, Schema, Table, View};

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnChange {
    AddColumn(Column),
    DropColumn(LiveColumn),
    AlterColumn(LiveColumn, Column),
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyChange {
    AddKey(Key),
    DropKey(LiveKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    CreateTable(Table),
    DropTable(LiveTable),
    AlterTable(LiveTable, Table, Vec<ColumnChange>, Vec<KeyChange>),
    CreateView(View),
    AlterView(LiveView, View),
    DropView(LiveView),
}

/// Compare [`Column`] to [`LiveColumn`] on logical type, required flag and
/// default value.
fn column_equal(live: &LiveColumn, declared: &Column) -> bool {
    if live.raw_type.to_uppercase() != declared.col_type.sql_type() {
        return false;
    }
    if live.required != declared.required {
        return false;
    }
    let declared_default = declared.default.as_ref().map(|d| d.sql_literal());
    live.raw_default == declared_default
}

fn keys_equal(live: &LiveKey, declared: &Key, table: &str) -> bool {
    live.columns == declared.columns && live.kind == declared.kind
        && (live.kind == KeyKind::Primary || live.name == declared.derived_name(table))
}

/// Diff one table. Returns `None` if there is nothing to change.
fn diff_table(live: &LiveTable, declared: &Table) -> (Vec<ColumnChange>, Vec<KeyChange>) {
    let mut column_changes = Vec::new();
    for declared_col in &declared.columns {
        match live.find_column(&declared_col.name) {
            None => column_changes.push(ColumnChange::AddColumn(declared_col.clone())),
            Some(live_col) => {
                if !column_equal(live_col, declared_col) {
                    column_changes.push(ColumnChange::AlterColumn(live_col.clone(), declared_col.clone()));
                }
            }
        }
    }
    for live_col in &live.columns {
        if declared.find_column(&live_col.name).is_none() {
            column_changes.push(ColumnChange::DropColumn(live_col.clone()));
        }
    }

    let mut key_changes = Vec::new();
    // Only non-primary keys are diffed explicitly; primary keys are part of
    // CREATE TABLE / rebuild and are never altered in place.
    let declared_non_pk: Vec<&Key> = declared.keys.iter().filter(|k| k.kind != KeyKind::Primary).collect();
    let live_non_pk: Vec<&LiveKey> = live.keys.iter().filter(|k| k.kind != KeyKind::Primary).collect();

    for declared_key in &declared_non_pk {
        let exists = live_non_pk.iter().any(|lk| keys_equal(lk, declared_key, &declared.name));
        if !exists {
            key_changes.push(KeyChange::AddKey((*declared_key).clone()));
        }
    }
    for live_key in &live_non_pk {
        let exists = declared_non_pk.iter().any(|dk| keys_equal(live_key, dk, &declared.name));
        if !exists {
            key_changes.push(KeyChange::DropKey((*live_key).clone()));
        }
    }

    (column_changes, key_changes)
}

/// Produce the ordered change list: tables then views; within tables,
/// creates, alters, drops.
pub fn diff(live: &LiveSchema, declared: &Schema) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    let mut creates = Vec::new();
    let mut alters = Vec::new();
    let mut drops = Vec::new();

    for (name, table) in &declared.tables {
        match live.tables.iter().find(|t| &t.name == name) {
            None => creates.push(SchemaChange::CreateTable(table.clone())),
            Some(live_table) => {
                let (col_changes, key_changes) = diff_table(live_table, table);
                if !col_changes.is_empty() || !key_changes.is_empty() {
                    alters.push(SchemaChange::AlterTable(live_table.clone(), table.clone(), col_changes, key_changes));
                }
            }
        }
    }
    for live_table in &live.tables {
        if !declared.tables.contains_key(&live_table.name) {
            drops.push(SchemaChange::DropTable(live_table.clone()));
        }
    }

    changes.extend(creates);
    changes.extend(alters);
    changes.extend(drops);

    let mut view_creates = Vec::new();
    let mut view_alters = Vec::new();
    let mut view_drops = Vec::new();

    for (name, view) in &declared.views {
        match live.views.iter().find(|v| &v.name == name) {
            None => view_creates.push(SchemaChange::CreateView(view.clone())),
            Some(live_view) => {
                if !view_sql_equivalent(&live_view.sql, &view.sql) {
                    view_alters.push(SchemaChange::AlterView(live_view.clone(), view.clone()));
                }
            }
        }
    }
    for live_view in &live.views {
        if !declared.views.contains_key(&live_view.name) {
            view_drops.push(SchemaChange::DropView(live_view.clone()));
        }
    }

    changes.extend(view_creates);
    changes.extend(view_alters);
    changes.extend(view_drops);

    changes
}

fn view_sql_equivalent(live_sql: &str, declared_sql: &str) -> bool {
    normalize_sql(live_sql) == normalize_sql(declared_sql)
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}
