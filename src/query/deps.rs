//! Query dependency analysis: extract `{tables, views}` touched by a query,
//! resolving views to their underlying tables transitively.

use std::collections::HashSet;

use crate::query::builder::Query;
use crate::schema::model::Schema;

/// Sentinel dependency used for raw/opaque queries: matches any table
/// change.
pub const UNKNOWN_SOURCE: &str = "*";

/// Resolve the set of source names (tables + views, transitively through
/// view bodies) a query depends on.
///
/// View bodies are not parsed: resolving a view's SQL text down to the exact
/// tables it reads would need a SQL parser, so a query that reads a view
/// conservatively depends on [`UNKNOWN_SOURCE`] as well as the view's own
/// name.
pub fn dependencies_of(query: &Query, schema: &Schema) -> HashSet<String> {
    let mut deps = HashSet::new();

    let Some(primary) = query.primary_source() else {
        // A raw query has no structural source at all.
        deps.insert(UNKNOWN_SOURCE.to_string());
        return deps;
    };

    add_source(&mut deps, primary, schema);
    for joined in query.joined_sources() {
        add_source(&mut deps, joined, schema);
    }

    deps
}

fn add_source(deps: &mut HashSet<String>, name: &str, schema: &Schema) {
    deps.insert(name.to_string());
    if schema.views.contains_key(name) {
        // View bodies are opaque SQL; we cannot narrow past the view name
        // itself, so conservatively widen to "depends on everything".
        deps.insert(UNKNOWN_SOURCE.to_string());
    }
}

/// Whether a dependency set should re-run given a write to `changed_table`.
pub fn intersects(deps: &HashSet<String>, changed_table: &str) -> bool {
    deps.contains(UNKNOWN_SOURCE) || deps.contains(changed_table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::Condition;
    use crate::schema::model::{Column, ColumnType, Table, View};

    fn schema() -> Schema {
        Schema::new()
            .declare(Table::new("users").column(Column::new("name", ColumnType::Text)))
            .declare(Table::new("orders").column(Column::new("user_id", ColumnType::Text)))
            .declare_view(View { name: "active_users".into(), sql: "SELECT * FROM users WHERE 1=1".into() })
    }

    #[test]
    fn structured_query_depends_on_from_and_joins() {
        let schema = schema();
        let q = Query::from("users").join("orders", Condition::eq("users.id", crate::query::builder::SqlValue::Integer(1)));
        let deps = dependencies_of(&q, &schema);
        assert!(deps.contains("users"));
        assert!(deps.contains("orders"));
        assert!(!deps.contains(UNKNOWN_SOURCE));
    }

    #[test]
    fn view_dependency_widens_to_unknown() {
        let schema = schema();
        let q = Query::from("active_users");
        let deps = dependencies_of(&q, &schema);
        assert!(deps.contains("active_users"));
        assert!(deps.contains(UNKNOWN_SOURCE));
    }

    #[test]
    fn raw_query_depends_only_on_unknown() {
        let schema = schema();
        let q = Query::raw("SELECT 1", vec![]);
        let deps = dependencies_of(&q, &schema);
        assert_eq!(deps.len(), 1);
        assert!(deps.contains(UNKNOWN_SOURCE));
    }

    #[test]
    fn intersects_matches_unknown_against_anything() {
        let mut deps = HashSet::new();
        deps.insert(UNKNOWN_SOURCE.to_string());
        assert!(intersects(&deps, "whatever_table"));
    }
}
