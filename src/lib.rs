//! Offline-first relational store on SQLite: declarative schema with
//! automatic migration, hybrid-logical-clock/last-write-wins CRDT semantics
//! per column, a dirty-row delta sync log, and reactive query streams.

pub mod database;
pub mod dirty;
pub mod error;
pub mod hlc;
pub mod query;
pub mod reactive;
pub mod record;
pub mod schema;
pub mod sync;
pub mod write;

pub use database::{Database, DatabaseConfig};
pub use error::{DbError, DbResult};
pub use hlc::{Hlc, HlcClock};
pub use query::{CompareOp, Condition, JoinClause, Query, Row, SortDirection, SqlValue};
pub use reactive::{ReactiveManager, Subscription};
pub use record::Record;
pub use schema::{Column, ColumnType, Key, KeyKind, Schema, Table, View};
pub use sync::SyncCoordinator;
pub use write::{Origin, ValueMap, WriteValue, WritePath};
