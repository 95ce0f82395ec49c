//! Row matching for edits and deletes.
//!
//! A row shown in a result grid is identified by a `WHERE` clause built with
//! this priority:
//!
//! 1. the table's declared primary key, when every key column is in the row;
//! 2. SQLite's `rowid`, when the row carries it and the table has one;
//! 3. equality over every column in the row.
//!
//! Non-null values are bound as typed variables; nulls render `IS NULL`.

use crate::error::{SqlError, ValueError};
use crate::model::{BulkAction, Row, SqlValue, Table, Variable, VariableType, ROWID_COLUMN};

/// A `WHERE` clause body and the variables its placeholders bind, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchClause {
    pub sql: String,
    pub variables: Vec<Variable>,
}

impl MatchClause {
    fn new() -> Self {
        Self {
            sql: String::new(),
            variables: Vec::new(),
        }
    }

    fn push(&mut self, column: &str, variable: Variable) {
        if !self.sql.is_empty() {
            self.sql.push_str(" AND ");
        }
        if variable.data.is_null() {
            self.sql.push_str(&format!("{} IS NULL", column));
        } else {
            self.sql.push_str(&format!("{} = ?", column));
            self.variables.push(variable);
        }
    }
}

/// Quote an identifier for SQLite.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build the clause identifying `row` within `table`.
///
/// # Errors
///
/// `ColumnNotFound` when a cell names a column the table does not declare,
/// `EmptyRow` when nothing identifies the row, and value errors when a cell
/// cannot be bound for its column type.
pub fn build_match(table: &Table, row: &Row) -> Result<MatchClause, SqlError> {
    if let Some(keys) = table.declared_primary_key() {
        if keys.iter().all(|key| row.get(key).is_some()) {
            let mut clause = MatchClause::new();
            for key in keys {
                let value = row.get(key).unwrap_or(&SqlValue::Null);
                clause.push(&quote_identifier(key), column_variable(table, key, value)?);
            }
            return Ok(clause);
        }
    }

    if !table.without_row_id {
        if let Some(rowid) = row.get_ignore_case(ROWID_COLUMN) {
            let mut clause = MatchClause::new();
            clause.push(ROWID_COLUMN, rowid_variable(rowid)?);
            return Ok(clause);
        }
    }

    let mut clause = MatchClause::new();
    for (name, value) in row.iter() {
        if table.column(name).is_none() && name.eq_ignore_ascii_case(ROWID_COLUMN) {
            continue;
        }
        clause.push(&quote_identifier(name), column_variable(table, name, value)?);
    }
    if clause.sql.is_empty() {
        return Err(SqlError::EmptyRow {
            table: table.sql_name.clone(),
        });
    }
    Ok(clause)
}

/// `UPDATE` setting one cell of `row` to user-entered text. `None` sets NULL.
pub fn update_cell(
    table: &Table,
    column: &str,
    row: &Row,
    new_value: Option<&str>,
) -> Result<BulkAction, SqlError> {
    let target = table.column(column).ok_or_else(|| SqlError::ColumnNotFound {
        table: table.sql_name.clone(),
        column: column.to_string(),
    })?;
    let value = Variable::from_text(target, new_value)?;
    let clause = build_match(table, row)?;

    let mut variables = Vec::with_capacity(clause.variables.len() + 1);
    variables.push(value);
    variables.extend(clause.variables);

    Ok(BulkAction {
        query: format!(
            "UPDATE {} SET {} = ? WHERE {}",
            quote_identifier(&table.sql_name),
            quote_identifier(column),
            clause.sql
        ),
        affected_tables: vec![table.sql_name.clone()],
        variables,
    })
}

/// `DELETE` removing `row`.
pub fn delete_row(table: &Table, row: &Row) -> Result<BulkAction, SqlError> {
    let clause = build_match(table, row)?;
    Ok(BulkAction {
        query: format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(&table.sql_name),
            clause.sql
        ),
        affected_tables: vec![table.sql_name.clone()],
        variables: clause.variables,
    })
}

fn column_variable(table: &Table, name: &str, value: &SqlValue) -> Result<Variable, SqlError> {
    let column = table.column(name).ok_or_else(|| SqlError::ColumnNotFound {
        table: table.sql_name.clone(),
        column: name.to_string(),
    })?;
    Ok(Variable::from_raw(column, value)?)
}

fn rowid_variable(value: &SqlValue) -> Result<Variable, ValueError> {
    match value {
        SqlValue::Null => Ok(Variable::null()),
        SqlValue::Integer(id) => Ok(Variable::new(VariableType::Int, SqlValue::Integer(*id))),
        other => Err(ValueError::InvalidValue {
            kind: "integer",
            value: other.to_string(),
        }),
    }
}
