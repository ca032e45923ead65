pub mod builder;
pub mod deps;
pub mod exec;

pub use builder::{CompareOp, Condition, JoinClause, Query, SortDirection, SqlValue};
pub use deps::{dependencies_of, intersects, UNKNOWN_SOURCE};
pub use exec::{execute, Row};
