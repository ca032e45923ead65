//! Typed expression tree compiling to parameterized SQL.

use rusqlite::types::{ToSqlOutput, Value as SqliteValue};
use rusqlite::ToSql;

use crate::error::{DbError, DbResult};
use crate::schema::model::Schema;

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Text(s) => ToSqlOutput::Owned(SqliteValue::Text(s.clone())),
            SqlValue::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(SqliteValue::Real(*r)),
            SqlValue::Blob(b) => ToSqlOutput::Owned(SqliteValue::Blob(b.clone())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

/// A leaf or composite boolean condition.
#[derive(Debug, Clone)]
pub enum Condition {
    Compare { column: String, op: CompareOp, value: SqlValue },
    In { column: String, values: Vec<SqlValue> },
    Between { column: String, low: SqlValue, high: SqlValue },
    IsNull { column: String, negate: bool },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: SqlValue) -> Self {
        Condition::Compare { column: column.into(), op: CompareOp::Eq, value }
    }
    pub fn neq(column: impl Into<String>, value: SqlValue) -> Self {
        Condition::Compare { column: column.into(), op: CompareOp::Neq, value }
    }
    pub fn gt(column: impl Into<String>, value: SqlValue) -> Self {
        Condition::Compare { column: column.into(), op: CompareOp::Gt, value }
    }
    pub fn gte(column: impl Into<String>, value: SqlValue) -> Self {
        Condition::Compare { column: column.into(), op: CompareOp::Gte, value }
    }
    pub fn lt(column: impl Into<String>, value: SqlValue) -> Self {
        Condition::Compare { column: column.into(), op: CompareOp::Lt, value }
    }
    pub fn lte(column: impl Into<String>, value: SqlValue) -> Self {
        Condition::Compare { column: column.into(), op: CompareOp::Lte, value }
    }
    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Condition::Compare { column: column.into(), op: CompareOp::Like, value: SqlValue::Text(pattern.into()) }
    }
    pub fn in_(column: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Condition::In { column: column.into(), values }
    }
    pub fn between(column: impl Into<String>, low: SqlValue, high: SqlValue) -> Self {
        Condition::Between { column: column.into(), low, high }
    }
    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::IsNull { column: column.into(), negate: false }
    }
    pub fn is_not_null(column: impl Into<String>) -> Self {
        Condition::IsNull { column: column.into(), negate: true }
    }
    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }
    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    fn referenced_columns(&self, out: &mut Vec<String>) {
        match self {
            Condition::Compare { column, .. } => out.push(column.clone()),
            Condition::In { column, .. } => out.push(column.clone()),
            Condition::Between { column, .. } => out.push(column.clone()),
            Condition::IsNull { column, .. } => out.push(column.clone()),
            Condition::And(a, b) | Condition::Or(a, b) => {
                a.referenced_columns(out);
                b.referenced_columns(out);
            }
        }
    }

    fn compile(&self, params: &mut Vec<SqlValue>) -> String {
        match self {
            Condition::Compare { column, op, value } => {
                let op_str = match op {
                    CompareOp::Eq => "=",
                    CompareOp::Neq => "!=",
                    CompareOp::Gt => ">",
                    CompareOp::Gte => ">=",
                    CompareOp::Lt => "<",
                    CompareOp::Lte => "<=",
                    CompareOp::Like => "LIKE",
                };
                params.push(value.clone());
                format!("{column} {op_str} ?")
            }
            Condition::In { column, values } => {
                let placeholders = vec!["?"; values.len()].join(", ");
                params.extend(values.iter().cloned());
                format!("{column} IN ({placeholders})")
            }
            Condition::Between { column, low, high } => {
                params.push(low.clone());
                params.push(high.clone());
                format!("{column} BETWEEN ? AND ?")
            }
            Condition::IsNull { column, negate } => {
                if *negate {
                    format!("{column} IS NOT NULL")
                } else {
                    format!("{column} IS NULL")
                }
            }
            Condition::And(a, b) => format!("({}) AND ({})", a.compile(params), b.compile(params)),
            Condition::Or(a, b) => format!("({}) OR ({})", a.compile(params), b.compile(params)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct JoinClause {
    pub table: String,
    pub on: Condition,
}

/// A source query draws from: either a declared table/view or an opaque raw
/// SQL fragment whose dependencies cannot be narrowed.
#[derive(Debug, Clone)]
pub enum Query {
    Structured {
        from: String,
        joins: Vec<JoinClause>,
        projection: Option<Vec<String>>,
        filter: Option<Condition>,
        order_by: Vec<(String, SortDirection)>,
        limit: Option<i64>,
    },
    Raw {
        sql: String,
        params: Vec<SqlValue>,
    },
}

impl Query {
    pub fn from(table: impl Into<String>) -> Self {
        Query::Structured {
            from: table.into(),
            joins: Vec::new(),
            projection: None,
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Free-form SQL escape hatch. Treated as opaque for dependency analysis,
    /// so it always re-runs on any table change.
    pub fn raw(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Query::Raw { sql: sql.into(), params }
    }

    pub fn join(mut self, table: impl Into<String>, on: Condition) -> Self {
        if let Query::Structured { joins, .. } = &mut self {
            joins.push(JoinClause { table: table.into(), on });
        }
        self
    }

    pub fn where_(mut self, condition: Condition) -> Self {
        if let Query::Structured { filter, .. } = &mut self {
            *filter = Some(condition);
        }
        self
    }

    pub fn select(mut self, columns: Vec<String>) -> Self {
        if let Query::Structured { projection, .. } = &mut self {
            *projection = Some(columns);
        }
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        if let Query::Structured { order_by, .. } = &mut self {
            order_by.push((column.into(), direction));
        }
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        if let Query::Structured { limit, .. } = &mut self {
            *limit = Some(n);
        }
        self
    }

    /// The `from` source name, for dependency analysis. `None` for raw
    /// queries.
    pub fn primary_source(&self) -> Option<&str> {
        match self {
            Query::Structured { from, .. } => Some(from),
            Query::Raw { .. } => None,
        }
    }

    pub fn joined_sources(&self) -> Vec<&str> {
        match self {
            Query::Structured { joins, .. } => joins.iter().map(|j| j.table.as_str()).collect(),
            Query::Raw { .. } => Vec::new(),
        }
    }

    /// Compile into `(sql, positional_args)`. Validates that every
    /// referenced column exists on the source table (or, for joins, on one
    /// of the joined tables) before compiling.
    pub fn compile(&self, schema: &Schema) -> DbResult<(String, Vec<SqlValue>)> {
        match self {
            Query::Raw { sql, params } => Ok((sql.clone(), params.clone())),
            Query::Structured { from, joins, projection, filter, order_by, limit } => {
                self.validate_columns(schema, from, joins, projection, filter)?;

                let projection_sql = match projection {
                    Some(cols) if !cols.is_empty() => cols.join(", "),
                    _ => "*".to_string(),
                };

                let mut sql = format!("SELECT {projection_sql} FROM {from}");
                let mut params = Vec::new();
                for join in joins {
                    let on_sql = join.on.compile(&mut params);
                    sql.push_str(&format!(" JOIN {} ON {on_sql}", join.table));
                }

                if let Some(cond) = filter {
                    let where_sql = cond.compile(&mut params);
                    sql.push_str(&format!(" WHERE {where_sql}"));
                }

                if !order_by.is_empty() {
                    let parts: Vec<String> = order_by
                        .iter()
                        .map(|(col, dir)| {
                            let dir_str = match dir {
                                SortDirection::Asc => "ASC",
                                SortDirection::Desc => "DESC",
                            };
                            format!("{col} {dir_str}")
                        })
                        .collect();
                    sql.push_str(&format!(" ORDER BY {}", parts.join(", ")));
                }

                if let Some(n) = limit {
                    sql.push_str(&format!(" LIMIT {n}"));
                }

                Ok((sql, params))
            }
        }
    }

    fn validate_columns(
        &self,
        schema: &Schema,
        from: &str,
        joins: &[JoinClause],
        projection: &Option<Vec<String>>,
        filter: &Option<Condition>,
    ) -> DbResult<()> {
        let mut known_columns: Vec<String> = Vec::new();
        if let Some(table) = schema.table(from) {
            known_columns.extend(table.columns.iter().map(|c| c.name.clone()));
        } else if schema.views.contains_key(from) {
            // Views resolve to opaque SQL; column membership cannot be
            // checked statically, so we skip validation for their columns.
            return Ok(());
        } else {
            return Err(DbError::Schema(format!("unknown query source `{from}`")));
        }
        for join in joins {
            if let Some(table) = schema.table(&join.table) {
                known_columns.extend(table.columns.iter().map(|c| c.name.clone()));
            } else if !schema.views.contains_key(&join.table) {
                return Err(DbError::Schema(format!("unknown join source `{}`", join.table)));
            }
        }

        if let Some(cols) = projection {
            for col in cols {
                if !known_columns.iter().any(|k| k == col) {
                    return Err(DbError::Schema(format!("unknown column `{col}` in projection of `{from}`")));
                }
            }
        }
        if let Some(cond) = filter {
            let mut referenced = Vec::new();
            cond.referenced_columns(&mut referenced);
            for col in referenced {
                if !known_columns.iter().any(|k| k == &col) {
                    return Err(DbError::Schema(format!("unknown column `{col}` in condition on `{from}`")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{Column, ColumnType, Table};

    fn users_schema() -> Schema {
        Schema::new().declare(
            Table::new("users")
                .column(Column::new("name", ColumnType::Text).required())
                .column(Column::new("age", ColumnType::Integer)),
        )
    }

    #[test]
    fn compiles_simple_where_clause() {
        let schema = users_schema();
        let q = Query::from("users").where_(Condition::gte("age", SqlValue::Integer(18)));
        let (sql, params) = q.compile(&schema).unwrap();
        assert_eq!(sql, "SELECT * FROM users WHERE age >= ?");
        assert_eq!(params, vec![SqlValue::Integer(18)]);
    }

    #[test]
    fn rejects_unknown_column() {
        let schema = users_schema();
        let q = Query::from("users").where_(Condition::eq("nickname", SqlValue::Text("x".into())));
        assert!(q.compile(&schema).is_err());
    }

    #[test]
    fn composes_and_or() {
        let schema = users_schema();
        let q = Query::from("users").where_(
            Condition::gte("age", SqlValue::Integer(18)).and(Condition::like("name", "A%")),
        );
        let (sql, params) = q.compile(&schema).unwrap();
        assert_eq!(sql, "SELECT * FROM users WHERE (age >= ?) AND (name LIKE ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn raw_query_passes_through_untouched() {
        let schema = users_schema();
        let q = Query::raw("SELECT 1", vec![]);
        let (sql, _params) = q.compile(&schema).unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn join_on_params_are_bound_before_where_params() {
        let mut schema = users_schema();
        schema = schema.declare(
            Table::new("posts")
                .column(Column::new("author_name", ColumnType::Text).required()),
        );
        let q = Query::from("users")
            .join("posts", Condition::eq("author_name", SqlValue::Text("Alice".into())))
            .where_(Condition::gte("age", SqlValue::Integer(18)));
        let (sql, params) = q.compile(&schema).unwrap();
        assert_eq!(sql, "SELECT * FROM users JOIN posts ON author_name = ? WHERE age >= ?");
        assert_eq!(params, vec![SqlValue::Text("Alice".into()), SqlValue::Integer(18)]);
    }
}
