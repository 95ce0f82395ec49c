//! Error types for the inspector client.
//!
//! Each layer owns its own error enum so callers can tell transport failures
//! apart from protocol and SQL problems:
//!
//! - [`TransportError`] - WebSocket connection failures
//! - [`ProtocolError`] - malformed or unexpected frames
//! - [`SqlError`] - statements that cannot be classified or matched
//! - [`SessionError`] - table session operations without the schema they need
//! - [`ValueError`] - values that cannot be bound for a column

use thiserror::Error;

/// Transport-level error types.
///
/// These are reported through the connection's error callback; the core never
/// retries or reconnects on its own.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint address could not be used.
    #[error("Invalid endpoint {url}: {reason}")]
    InvalidEndpoint {
        /// The address as supplied by the caller
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Failed to establish the WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] tokio_tungstenite::tungstenite::Error),

    /// The WebSocket failed after it was established.
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] tokio_tungstenite::tungstenite::Error),

    /// `connect()` was called on a connection that was already started or closed.
    #[error("Connection already started")]
    AlreadyStarted,

    /// Failed to spawn the connection worker.
    #[error("Failed to start connection worker: {0}")]
    Worker(#[source] std::io::Error),
}

/// Protocol-level error types.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The frame is JSON but lacks a string `type` field.
    #[error("Frame has no message type")]
    MissingType,

    /// A known message type carried a body of the wrong shape.
    #[error("Failed to decode {message_type}: {reason}")]
    Decode {
        /// The top-level message type being decoded
        message_type: String,
        /// What was wrong with the body
        reason: String,
    },

    /// The server announced a protocol version no codec is registered for.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(i64),

    /// Failed to serialize an outbound request.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    pub(crate) fn decode(message_type: &str, reason: impl Into<String>) -> Self {
        ProtocolError::Decode {
            message_type: message_type.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised synchronously while preparing SQL, before anything is sent.
#[derive(Debug, Error)]
pub enum SqlError {
    /// The statement could not be parsed.
    #[error("Failed to parse sql statement: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    /// A row referenced a column that the table does not declare.
    #[error("Column {column} not found in table {table}")]
    ColumnNotFound {
        /// Table being matched
        table: String,
        /// Column missing from the table schema
        column: String,
    },

    /// The row carries nothing that could identify it.
    #[error("Row has no columns to match in table {table}")]
    EmptyRow {
        /// Table being matched
        table: String,
    },

    /// A value could not be converted into a bind variable.
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Errors raised by table sessions before a request is sent.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No table selected")]
    NoTableSelected,

    #[error("Database {0} not found in server info")]
    DatabaseNotFound(String),

    #[error("Table {table} not found in database {database}")]
    TableNotFound { database: String, table: String },

    #[error(transparent)]
    Sql(#[from] SqlError),
}

/// Errors raised while coercing a value into a typed bind variable.
#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    /// The column's type tag is not one the inspector knows how to bind.
    #[error("Unsupported column type: {0}")]
    UnsupportedColumnType(String),

    /// The text could not be parsed as the column's type.
    #[error("Invalid {kind} value: {value}")]
    InvalidValue {
        /// Column kind the value was parsed for
        kind: &'static str,
        /// The rejected input
        value: String,
    },
}
