//! Data models for the inspector protocol.
//!
//! Schema snapshots (`ServerInfo` down to `Column`) are immutable values that
//! are replaced wholesale on every `serverInfo` frame. Row data is schema-less:
//! every cell is a [`SqlValue`] decoded with explicit per-type branches.

use std::fmt;

use chrono::DateTime;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ValueError;

/// Name of SQLite's implicit row identity column.
pub const ROWID_COLUMN: &str = "rowid";

/// Snapshot describing the remote application and its databases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub bundle_id: String,
    #[serde(default)]
    pub icon: Option<String>,
    pub protocol_version: i64,
    #[serde(default)]
    pub databases: Vec<Database>,
}

impl ServerInfo {
    /// Look up a database by its correlation id.
    pub fn database(&self, id: &str) -> Option<&Database> {
        self.databases.iter().find(|db| db.id == id)
    }
}

/// A database exposed by the server.
///
/// `id` is the correlation key for every request; `name` is display-only and
/// may repeat across ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub id: String,
    pub name: String,
    pub structure: DatabaseStructure,
}

impl Database {
    /// Look up a table by its SQL name.
    pub fn table(&self, sql_name: &str) -> Option<&Table> {
        self.structure.tables.iter().find(|t| t.sql_name == sql_name)
    }

    /// SQL names of all tables, in schema order.
    pub fn table_names(&self) -> Vec<String> {
        self.structure
            .tables
            .iter()
            .map(|t| t.sql_name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStructure {
    pub version: i64,
    #[serde(default)]
    pub tables: Vec<Table>,
}

/// A table in a database schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub sql_name: String,
    #[serde(default)]
    pub without_row_id: bool,
    #[serde(default)]
    pub primary_key: Option<Vec<String>>,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Table {
    /// The declared primary key, treating an empty list the same as none.
    pub fn declared_primary_key(&self) -> Option<&[String]> {
        match &self.primary_key {
            Some(keys) if !keys.is_empty() => Some(keys.as_slice()),
            _ => None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A column in a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub is_required: bool,
    /// Free-form type tag such as `INTEGER` or `TEXT` (case-insensitive).
    #[serde(rename = "type")]
    pub type_name: String,
    pub nullable: bool,
    #[serde(default)]
    pub is_boolean: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub min_text_length: Option<i64>,
    #[serde(default)]
    pub max_text_length: Option<i64>,
}

impl Column {
    /// Classify this column's type tag.
    pub fn kind(&self) -> Result<ColumnKind, ValueError> {
        ColumnKind::from_type_name(&self.type_name)
    }
}

/// Storage family of a column, derived from its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    DateTime,
    Blob,
}

impl ColumnKind {
    /// Classify a free-form type tag.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::UnsupportedColumnType` for tags outside the known
    /// families.
    pub fn from_type_name(type_name: &str) -> Result<Self, ValueError> {
        match type_name.trim().to_lowercase().as_str() {
            "bit" | "tinyint" | "smallint" | "int" | "bigint" | "integer" => Ok(ColumnKind::Integer),
            "float" | "real" | "double" => Ok(ColumnKind::Real),
            "char" | "varchar" | "text" | "nchar" | "nvarchar" | "ntext" => Ok(ColumnKind::Text),
            "date" | "time" | "datetime" | "timestamp" | "year" => Ok(ColumnKind::DateTime),
            "blob" => Ok(ColumnKind::Blob),
            _ => Err(ValueError::UnsupportedColumnType(type_name.to_string())),
        }
    }

    /// The bind variable type used for values of this kind.
    pub fn variable_type(&self) -> VariableType {
        match self {
            ColumnKind::Integer => VariableType::Int,
            ColumnKind::Real => VariableType::Real,
            ColumnKind::Text => VariableType::String,
            ColumnKind::DateTime => VariableType::Datetime,
            ColumnKind::Blob => VariableType::Blob,
        }
    }
}

/// A dynamically-typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Decode a JSON scalar.
    ///
    /// Arrays are only accepted as blobs, i.e. every element must be an
    /// integer in `0..=255`. Objects are never valid cell values.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(SqlValue::Null),
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(SqlValue::Real(f))
                } else {
                    Err(format!("unrepresentable number {}", n))
                }
            }
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| format!("invalid blob byte {}", item))
                })
                .collect::<Result<Vec<u8>, String>>()
                .map(SqlValue::Blob),
            Value::Object(_) => Err("objects are not valid cell values".to_string()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Real(r) => write!(f, "{}", r),
            SqlValue::Text(s) => write!(f, "{}", s),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Blob(bytes) => {
                let parts: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_none(),
            SqlValue::Integer(i) => serializer.serialize_i64(*i),
            SqlValue::Real(r) => serializer.serialize_f64(*r),
            SqlValue::Text(s) => serializer.serialize_str(s),
            SqlValue::Bool(b) => serializer.serialize_bool(*b),
            SqlValue::Blob(bytes) => serializer.collect_seq(bytes.iter()),
        }
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        SqlValue::from_json(&value).map_err(D::Error::custom)
    }
}

/// One result row: column name to value, in the order the server sent them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cell, keeping the original position on replace.
    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        let column = column.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Case-insensitive lookup, used for SQLite's `rowid` aliases.
    pub fn get_ignore_case(&self, column: &str) -> Option<&SqlValue> {
        self.cells
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Decode a row from a JSON object.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("expected row object, got {}", value))?;
        let mut row = Row::new();
        for (column, cell) in object {
            let cell = SqlValue::from_json(cell).map_err(|e| format!("column {}: {}", column, e))?;
            row.cells.push((column.clone(), cell));
        }
        Ok(row)
    }
}

impl<K: Into<String>> FromIterator<(K, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, SqlValue)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.cells.iter().map(|(k, v)| (k, v)))
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Row::from_json(&value).map_err(D::Error::custom)
    }
}

/// How the server should bind a variable in a parameterized statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Int,
    Real,
    String,
    Datetime,
    Blob,
}

/// A typed query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(rename = "type")]
    pub kind: VariableType,
    pub data: SqlValue,
}

impl Variable {
    pub fn new(kind: VariableType, data: SqlValue) -> Self {
        Self { kind, data }
    }

    /// A SQL NULL. The type tag is irrelevant to the server for nulls.
    pub fn null() -> Self {
        Self::new(VariableType::Int, SqlValue::Null)
    }

    /// Build a variable from a value previously read from `column`.
    pub fn from_raw(column: &Column, value: &SqlValue) -> Result<Self, ValueError> {
        if value.is_null() {
            return Ok(Self::null());
        }
        let kind = column.kind()?;
        let invalid = |kind: &'static str| ValueError::InvalidValue {
            kind,
            value: value.to_string(),
        };
        let data = match (kind, value) {
            (ColumnKind::Integer, SqlValue::Integer(i)) => SqlValue::Integer(*i),
            (ColumnKind::Integer, SqlValue::Real(r)) => SqlValue::Integer(*r as i64),
            (ColumnKind::Integer, SqlValue::Bool(b)) => SqlValue::Integer(i64::from(*b)),
            (ColumnKind::Integer, SqlValue::Text(s)) => {
                SqlValue::Integer(s.trim().parse().map_err(|_| invalid("integer"))?)
            }
            (ColumnKind::Integer, _) => return Err(invalid("integer")),
            (ColumnKind::Real, SqlValue::Integer(i)) => SqlValue::Real(*i as f64),
            (ColumnKind::Real, SqlValue::Real(r)) => SqlValue::Real(*r),
            (ColumnKind::Real, SqlValue::Text(s)) => {
                SqlValue::Real(s.trim().parse().map_err(|_| invalid("real"))?)
            }
            (ColumnKind::Real, _) => return Err(invalid("real")),
            (ColumnKind::Text, other) => other.clone(),
            (ColumnKind::DateTime, SqlValue::Integer(i)) => SqlValue::Integer(*i),
            (ColumnKind::DateTime, SqlValue::Real(r)) => SqlValue::Integer(*r as i64),
            (ColumnKind::DateTime, SqlValue::Text(s)) => SqlValue::Integer(parse_datetime(s)?),
            (ColumnKind::DateTime, _) => return Err(invalid("datetime")),
            (ColumnKind::Blob, SqlValue::Blob(bytes)) => SqlValue::Blob(bytes.clone()),
            (ColumnKind::Blob, SqlValue::Text(s)) => SqlValue::Blob(parse_blob(s)?),
            (ColumnKind::Blob, _) => return Err(invalid("blob")),
        };
        Ok(Self::new(kind.variable_type(), data))
    }

    /// Build a variable from user-entered text for `column`.
    ///
    /// `None` binds NULL. Boolean columns accept `true`/`false`.
    pub fn from_text(column: &Column, text: Option<&str>) -> Result<Self, ValueError> {
        let Some(text) = text else {
            return Ok(Self::null());
        };
        let kind = column.kind()?;
        if column.is_boolean && kind == ColumnKind::Integer {
            let flag = match text.trim() {
                "true" | "1" => 1,
                "false" | "0" => 0,
                _ => {
                    return Err(ValueError::InvalidValue {
                        kind: "boolean",
                        value: text.to_string(),
                    })
                }
            };
            return Ok(Self::new(VariableType::Int, SqlValue::Integer(flag)));
        }
        Self::from_raw(column, &SqlValue::Text(text.to_string()))
    }
}

/// Parse epoch milliseconds or an RFC 3339 instant into epoch milliseconds.
fn parse_datetime(text: &str) -> Result<i64, ValueError> {
    let text = text.trim();
    if let Ok(millis) = text.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| ValueError::InvalidValue {
            kind: "datetime",
            value: text.to_string(),
        })
}

/// Parse a comma-separated byte list such as `1, 2, 255`.
fn parse_blob(text: &str) -> Result<Vec<u8>, ValueError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|part| {
            part.trim().parse::<u8>().map_err(|_| ValueError::InvalidValue {
                kind: "blob",
                value: text.to_string(),
            })
        })
        .collect()
}

/// Full data dump returned for an `export` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub database_id: String,
    pub request_id: String,
    /// DDL statements recreating the exported tables.
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub data: Vec<ExportData>,
}

impl ExportResponse {
    pub fn table(&self, name: &str) -> Option<&ExportData> {
        self.data.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportData {
    pub name: String,
    #[serde(default)]
    pub data: Vec<Row>,
}

/// One mutation inside a `batch` request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    pub query: String,
    pub affected_tables: Vec<String>,
    pub variables: Vec<Variable>,
}
