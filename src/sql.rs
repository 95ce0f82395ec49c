//! SQL statement classification.
//!
//! Before a statement is sent, it is parsed to decide whether it is a read
//! (sent as `filter`) or a mutation (sent as `update` together with the table
//! it touches, so the server can notify watchers of that table).

pub mod matcher;

use std::ops::ControlFlow;

use sqlparser::ast::{visit_relations, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::SqlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Update,
    Delete,
    Insert,
    Other,
}

/// Result of classifying a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: StatementKind,
    /// The target table of a mutation; empty for selects and other statements.
    pub affected_tables: Vec<String>,
}

impl Classification {
    fn new(kind: StatementKind, affected_tables: Vec<String>) -> Self {
        Self {
            kind,
            affected_tables,
        }
    }

    /// Whether the statement should become the live query of a table view.
    pub fn is_live_query(&self) -> bool {
        self.kind == StatementKind::Select
    }
}

/// Classify the first statement in `sql`.
///
/// Data-modifying statements behind a `WITH` clause
/// (`WITH t AS (...) DELETE FROM ...`) are valid SQLite but are not accepted
/// by the parser and come back as `SqlError::Parse`.
///
/// # Errors
///
/// `SqlError::Parse` if the text is not valid SQL.
pub fn classify(sql: &str) -> Result<Classification, SqlError> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;

    let Some(statement) = statements.first() else {
        return Ok(Classification::new(StatementKind::Other, Vec::new()));
    };
    if statements.len() > 1 {
        debug!(
            "Classifying first of {} statements only",
            statements.len()
        );
    }

    let kind = match statement {
        Statement::Query(_) => return Ok(Classification::new(StatementKind::Select, Vec::new())),
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::Insert { .. } => StatementKind::Insert,
        _ => return Ok(Classification::new(StatementKind::Other, Vec::new())),
    };

    Ok(Classification::new(kind, target_table(statement).into_iter().collect()))
}

/// Unquoted name of the first table a statement references, which for DML is
/// its target.
fn target_table(statement: &Statement) -> Option<String> {
    let found = visit_relations(statement, |name| match name.0.last() {
        Some(ident) => ControlFlow::Break(ident.value.clone()),
        None => ControlFlow::Continue(()),
    });
    match found {
        ControlFlow::Break(table) => Some(table),
        ControlFlow::Continue(()) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_select_is_live_query() {
        let classification = classify("SELECT * FROM foo").unwrap();
        assert_eq!(classification, Classification::new(StatementKind::Select, vec![]));
        assert!(classification.is_live_query());

        let classification =
            classify("SELECT a.id FROM foo a JOIN bar b ON a.id = b.id WHERE b.x > 1").unwrap();
        assert_eq!(classification.kind, StatementKind::Select);
        assert!(classification.affected_tables.is_empty());
    }

    #[test]
    fn test_mutations_report_target_table() {
        assert_eq!(
            classify("UPDATE foo SET x = 1").unwrap(),
            Classification::new(StatementKind::Update, tables(&["foo"]))
        );
        assert_eq!(
            classify("DELETE FROM foo WHERE id = 1").unwrap(),
            Classification::new(StatementKind::Delete, tables(&["foo"]))
        );
        assert_eq!(
            classify("INSERT INTO foo (x) VALUES (1)").unwrap(),
            Classification::new(StatementKind::Insert, tables(&["foo"]))
        );
        assert!(!classify("UPDATE foo SET x = 1").unwrap().is_live_query());
    }

    #[test]
    fn test_target_ignores_subquery_tables() {
        assert_eq!(
            classify("DELETE FROM foo WHERE id IN (SELECT id FROM bar)")
                .unwrap()
                .affected_tables,
            tables(&["foo"])
        );
        assert_eq!(
            classify("INSERT INTO foo (x) SELECT y FROM bar").unwrap().affected_tables,
            tables(&["foo"])
        );
    }

    #[test]
    fn test_quoted_and_qualified_names_are_unquoted() {
        assert_eq!(
            classify("UPDATE \"todo items\" SET done = 1").unwrap().affected_tables,
            tables(&["todo items"])
        );
        assert_eq!(
            classify("DELETE FROM main.users").unwrap().affected_tables,
            tables(&["users"])
        );
    }

    #[test]
    fn test_other_statements() {
        assert_eq!(
            classify("CREATE TABLE foo (id INTEGER PRIMARY KEY)").unwrap(),
            Classification::new(StatementKind::Other, vec![])
        );
        assert_eq!(
            classify("DROP TABLE foo").unwrap().kind,
            StatementKind::Other
        );
        assert_eq!(classify("").unwrap().kind, StatementKind::Other);
    }

    #[test]
    fn test_only_first_statement_is_classified() {
        let classification = classify("SELECT 1; DELETE FROM foo").unwrap();
        assert_eq!(classification.kind, StatementKind::Select);
    }

    #[test]
    fn test_parse_failure() {
        assert!(matches!(classify("not sql"), Err(SqlError::Parse(_))));
        assert!(matches!(classify("UPDATE SET"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn test_cte_prefixed_mutation_is_a_parse_error() {
        let sql = "WITH old AS (SELECT id FROM todos) DELETE FROM todos WHERE id IN (SELECT id FROM old)";
        assert!(matches!(classify(sql), Err(SqlError::Parse(_))));
    }
}
