//! In-memory schema model: tables, columns, keys, views.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Logical column type. Maps onto a concrete SQLite storage class plus,
/// for `Date`/`Fileset`, an application-level encoding handled by the write
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Guid,
    Date,
    Fileset,
}

impl ColumnType {
    /// The raw SQLite column type used in emitted DDL.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
            ColumnType::Guid => "TEXT",
            ColumnType::Date => "TEXT",
            ColumnType::Fileset => "TEXT",
        }
    }
}

/// A literal or generated default value for a column.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

impl DefaultValue {
    /// Render as a SQL literal suitable for `DEFAULT <literal>` / column-fill
    /// substitution in a rebuild `SELECT`.
    pub fn sql_literal(&self) -> String {
        match self {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Real(r) => r.to_string(),
        }
    }
}

/// Optional validation caps/enumerations attached to a column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnConstraints {
    pub max_length: Option<usize>,
    pub max_file_count: Option<usize>,
    pub max_file_size: Option<u64>,
    pub valid_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub col_type: ColumnType,
    pub required: bool,
    pub default: Option<DefaultValue>,
    pub lww: bool,
    pub constraints: ColumnConstraints,
}

impl Column {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            required: false,
            default: None,
            lww: false,
            constraints: ColumnConstraints::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn lww(mut self) -> Self {
        self.lww = true;
        self
    }

    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Name of this column's implicit HLC companion (never exposed to callers
    /// as a user-visible field).
    pub fn hlc_companion_name(&self) -> String {
        format!("{}__hlc", self.name)
    }

    /// Full column DDL fragment: `name TYPE [NOT NULL] [DEFAULT x]`.
    pub fn ddl(&self) -> String {
        let mut out = format!("{} {}", self.name, self.col_type.sql_type());
        if self.required {
            out.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            out.push_str(" DEFAULT ");
            out.push_str(&default.sql_literal());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Primary,
    Unique,
    Index,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub columns: Vec<String>,
    pub kind: KeyKind,
    pub explicit_name: Option<String>,
}

impl Key {
    pub fn new(kind: KeyKind, columns: Vec<String>) -> Self {
        Self { columns, kind, explicit_name: None }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.explicit_name = Some(name.into());
        self
    }

    /// Derive the index name, auto-generating `idx_<table>_<cols>` /
    /// `uniq_<table>_<cols>` and falling back to a sha1-truncated form when
    /// that would exceed 62 characters.
    pub fn derived_name(&self, table: &str) -> String {
        if let Some(name) = &self.explicit_name {
            return name.clone();
        }
        let prefix = match self.kind {
            KeyKind::Unique => "uniq",
            _ => "idx",
        };
        let cols = self.columns.join("_");
        let full = format!("{prefix}_{table}_{cols}");
        if full.len() <= 62 {
            return full;
        }
        let mut hasher = Sha1::new();
        hasher.update(full.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{prefix}_{table}_{}", &hex[..10])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub name: String,
    pub sql: String,
}

/// A table definition as declared by the caller, *before* system columns are
/// injected. Use [`Table::with_system_columns`] (called automatically by
/// [`Schema::declare`]) to get the fully-expanded version the migrator and
/// write path operate on.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub keys: Vec<Key>,
    pub system: bool,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let system = name.starts_with("__");
        Self { name, columns: Vec::new(), keys: Vec::new(), system }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn key(mut self, key: Key) -> Self {
        self.keys.push(key);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Expand with the four system columns and the `__hlc` companions for
    /// every LWW column. No-op for system tables.
    pub fn with_system_columns(mut self) -> Self {
        if self.system {
            return self;
        }
        if self.find_column("system_id").is_none() {
            self.columns.insert(0, Column::new("system_id", ColumnType::Guid).required());
        }
        for name in ["system_created_at", "system_version"] {
            if self.find_column(name).is_none() {
                self.columns.push(Column::new(name, ColumnType::Text).required());
            }
        }
        if self.find_column("system_is_local_origin").is_none() {
            self.columns.push(Column::new("system_is_local_origin", ColumnType::Integer).required());
        }
        let lww_cols: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.lww && !c.name.ends_with("__hlc"))
            .map(|c| c.hlc_companion_name())
            .collect();
        for hlc_name in lww_cols {
            if self.find_column(&hlc_name).is_none() {
                self.columns.push(Column::new(hlc_name, ColumnType::Text));
            }
        }
        self
    }
}

/// The full declared schema: tables (system columns already expanded) plus
/// views.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: BTreeMap<String, Table>,
    pub views: BTreeMap<String, View>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table, injecting system columns as a side effect.
    pub fn declare(mut self, table: Table) -> Self {
        let expanded = table.with_system_columns();
        self.tables.insert(expanded.name.clone(), expanded);
        self
    }

    pub fn declare_view(mut self, view: View) -> Self {
        self.views.insert(view.name.clone(), view);
        self
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_columns_are_injected_once() {
        let t = Table::new("tasks")
            .column(Column::new("title", ColumnType::Text).lww())
            .with_system_columns();
        assert!(t.find_column("system_id").is_some());
        assert!(t.find_column("system_created_at").is_some());
        assert!(t.find_column("system_version").is_some());
        assert!(t.find_column("system_is_local_origin").is_some());
        assert!(t.find_column("title__hlc").is_some());
        // idempotent
        let t2 = t.clone().with_system_columns();
        assert_eq!(t.columns.len(), t2.columns.len());
    }

    #[test]
    fn system_tables_are_not_expanded() {
        let t = Table::new("__settings")
            .column(Column::new("key", ColumnType::Text).required())
            .with_system_columns();
        assert!(t.find_column("system_id").is_none());
    }

    #[test]
    fn long_index_name_falls_back_to_sha1() {
        let key = Key::new(
            KeyKind::Index,
            vec!["a_very_long_column_name_that_pushes_us_over_the_limit".to_string()],
        );
        let name = key.derived_name("a_table_with_a_very_long_name_too");
        assert!(name.len() <= 62);
        assert!(name.starts_with("idx_a_table_with_a_very_long_name_too_"));
    }
}
