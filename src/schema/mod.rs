pub mod differ;
pub mod introspect;
pub mod migrate;
pub mod model;

pub use differ::{diff, ColumnChange, KeyChange, SchemaChange};
pub use introspect::{introspect, LiveColumn, LiveKey, LiveSchema, LiveTable, LiveView};
pub use migrate::migrate;
pub use model::{Column, ColumnConstraints, ColumnType, DefaultValue, Key, KeyKind, Schema, Table, View};
