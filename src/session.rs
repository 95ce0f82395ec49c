//! Stateful helpers built on top of the client.
//!
//! [`TableSession`] is the headless half of a table browser: it tracks the
//! selected table and its live query, sends requests through a
//! [`CommandSink`], and applies only the responses to its latest request.
//! [`SchemaStore`] keeps the most recent schema snapshot.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::CommandSink;
use crate::error::SessionError;
use crate::listener::InspectorListener;
use crate::model::{Database, ExportResponse, Row, ServerInfo, Table};
use crate::sql::matcher::{self, quote_identifier};
use crate::sql::{classify, StatementKind};

/// Issues request ids and remembers the latest one.
///
/// Starting a request supersedes the previous one, so late responses to
/// older requests can be recognised and ignored.
#[derive(Debug, Default)]
pub struct RequestTracker {
    current: Mutex<Option<String>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request and return its id.
    pub fn begin(&self) -> String {
        let id = Uuid::new_v4().to_string();
        *self.current.lock() = Some(id.clone());
        id
    }

    pub fn is_current(&self, request_id: &str) -> bool {
        self.current.lock().as_deref() == Some(request_id)
    }

    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }

    /// Forget the current request; every outstanding response becomes stale.
    pub fn reset(&self) {
        self.current.lock().take();
    }
}

/// Latest server schema snapshot, replaced wholesale on every `serverInfo`.
#[derive(Debug, Default)]
pub struct SchemaStore {
    info: RwLock<Option<Arc<ServerInfo>>>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.info.read().clone()
    }

    pub fn database(&self, database_id: &str) -> Option<Database> {
        self.info
            .read()
            .as_ref()
            .and_then(|info| info.database(database_id).cloned())
    }

    pub fn table(&self, database_id: &str, table: &str) -> Option<Table> {
        self.info
            .read()
            .as_ref()
            .and_then(|info| info.database(database_id))
            .and_then(|db| db.table(table).cloned())
    }
}

impl InspectorListener for SchemaStore {
    fn on_server_info(&self, server_info: &ServerInfo) {
        debug!(
            "Schema updated: {} database(s) from {}",
            server_info.databases.len(),
            server_info.bundle_id
        );
        *self.info.write() = Some(Arc::new(server_info.clone()));
    }

    fn on_closed(&self) {
        self.info.write().take();
    }
}

/// Observable state of a [`TableSession`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableState {
    pub table: Option<String>,
    /// The last `SELECT` the user ran; replaces the default full-table query.
    pub live_query: Option<String>,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    pub refreshing: bool,
    pub last_error: Option<String>,
    pub last_update_count: Option<i64>,
    pub last_export: Option<ExportResponse>,
}

/// Browsing and editing session for one database.
///
/// The sink is held weakly: a session registered as a listener on the client
/// it sends through must not keep that client alive. Requests issued after the
/// sink is gone are logged and dropped.
pub struct TableSession {
    database_id: String,
    sink: Weak<dyn CommandSink>,
    schema: Arc<SchemaStore>,
    requests: RequestTracker,
    exports: RequestTracker,
    state: Mutex<TableState>,
}

impl TableSession {
    pub fn new<S: CommandSink + 'static>(
        database_id: impl Into<String>,
        sink: &Arc<S>,
        schema: Arc<SchemaStore>,
    ) -> Self {
        let sink: Weak<dyn CommandSink> = Arc::downgrade(sink) as Weak<S>;
        Self {
            database_id: database_id.into(),
            sink,
            schema,
            requests: RequestTracker::new(),
            exports: RequestTracker::new(),
            state: Mutex::new(TableState::default()),
        }
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn state(&self) -> TableState {
        self.state.lock().clone()
    }

    /// Show `table`, dropping any live query, and load its rows.
    pub fn select_table(&self, table: &str) -> String {
        {
            let mut state = self.state.lock();
            state.table = Some(table.to_string());
            state.live_query = None;
            state.rows.clear();
            state.columns.clear();
            state.last_error = None;
        }
        self.send_filter(&format!("SELECT * FROM {}", quote_identifier(table)))
    }

    /// Re-run the live query, or load the selected table when there is none.
    ///
    /// Returns the request id, or `None` when nothing is selected.
    pub fn refresh(&self) -> Option<String> {
        let query = {
            let state = self.state.lock();
            match (&state.live_query, &state.table) {
                (Some(query), _) => query.clone(),
                (None, Some(table)) => format!("SELECT * FROM {}", quote_identifier(table)),
                (None, None) => {
                    debug!("Nothing to refresh");
                    return None;
                }
            }
        };
        Some(self.send_filter(&query))
    }

    /// Run user-entered SQL.
    ///
    /// Any previous live query is dropped first. Selects become the new live
    /// query. Blank input reloads the selected table. Everything else is sent
    /// as an update naming the affected table; its completion triggers a
    /// refresh.
    ///
    /// Returns the request id, or `None` for blank input with no table
    /// selected.
    ///
    /// # Errors
    ///
    /// Parse failures are returned and nothing is sent.
    pub fn execute_raw(&self, sql: &str) -> Result<Option<String>, SessionError> {
        self.state.lock().live_query = None;
        if sql.trim().is_empty() {
            return Ok(self.refresh());
        }

        let classification = classify(sql)?;

        if classification.is_live_query() {
            self.state.lock().live_query = Some(sql.to_string());
            return Ok(Some(self.send_filter(sql)));
        }

        if classification.kind == StatementKind::Other {
            debug!("Sending unclassified statement as update");
        }
        let request_id = self.begin();
        if let Some(sink) = self.sink() {
            sink.update(
                &request_id,
                &self.database_id,
                sql,
                &classification.affected_tables,
                &[],
            );
        }
        Ok(Some(request_id))
    }

    /// Set one cell of `row` in the selected table to user-entered text.
    pub fn update_cell(
        &self,
        row: &Row,
        column: &str,
        new_value: Option<&str>,
    ) -> Result<String, SessionError> {
        let table = self.selected_table()?;
        let action = matcher::update_cell(&table, column, row, new_value)?;
        let request_id = self.begin();
        if let Some(sink) = self.sink() {
            sink.update(
                &request_id,
                &self.database_id,
                &action.query,
                &action.affected_tables,
                &action.variables,
            );
        }
        Ok(request_id)
    }

    /// Delete `rows` from the selected table in one batch.
    ///
    /// Every row is matched before anything is sent. Returns `None` for an
    /// empty selection.
    pub fn delete_rows(&self, rows: &[Row]) -> Result<Option<String>, SessionError> {
        if rows.is_empty() {
            return Ok(None);
        }
        let table = self.selected_table()?;
        let actions = rows
            .iter()
            .map(|row| matcher::delete_row(&table, row))
            .collect::<Result<Vec<_>, _>>()?;

        let request_id = self.begin();
        if let Some(sink) = self.sink() {
            sink.bulk_update(&request_id, &self.database_id, &actions);
        }
        Ok(Some(request_id))
    }

    /// Export every table of the database.
    pub fn export_all(&self) -> Result<String, SessionError> {
        let database = self
            .schema
            .database(&self.database_id)
            .ok_or_else(|| SessionError::DatabaseNotFound(self.database_id.clone()))?;
        let request_id = self.exports.begin();
        info!(
            "Exporting {} table(s) from {}",
            database.structure.tables.len(),
            database.name
        );
        if let Some(sink) = self.sink() {
            sink.export(&request_id, &self.database_id, &database.table_names());
        }
        Ok(request_id)
    }

    fn selected_table(&self) -> Result<Table, SessionError> {
        let name = self
            .state
            .lock()
            .table
            .clone()
            .ok_or(SessionError::NoTableSelected)?;
        self.schema
            .table(&self.database_id, &name)
            .ok_or_else(|| SessionError::TableNotFound {
                database: self.database_id.clone(),
                table: name,
            })
    }

    fn sink(&self) -> Option<Arc<dyn CommandSink>> {
        let sink = self.sink.upgrade();
        if sink.is_none() {
            warn!("Dropping request for {}, client is gone", self.database_id);
        }
        sink
    }

    fn begin(&self) -> String {
        let request_id = self.requests.begin();
        self.state.lock().refreshing = true;
        request_id
    }

    fn send_filter(&self, query: &str) -> String {
        let request_id = self.begin();
        if let Some(sink) = self.sink() {
            sink.query(&request_id, &self.database_id, query);
        }
        request_id
    }

    fn accepts(&self, database_id: &str, request_id: &str) -> bool {
        if database_id != self.database_id || !self.requests.is_current(request_id) {
            debug!("Ignoring stale response {}", request_id);
            return false;
        }
        true
    }
}

impl InspectorListener for TableSession {
    fn on_filter_data(&self, database_id: &str, request_id: &str, rows: &[Row], columns: &[String]) {
        if !self.accepts(database_id, request_id) {
            return;
        }
        let mut state = self.state.lock();
        state.rows = rows.to_vec();
        state.columns = columns.to_vec();
        state.refreshing = false;
        state.last_error = None;
    }

    fn on_update_result(&self, database_id: &str, request_id: &str, num_updated: i64) {
        if !self.accepts(database_id, request_id) {
            return;
        }
        self.state.lock().last_update_count = Some(num_updated);
        if self.refresh().is_none() {
            self.state.lock().refreshing = false;
        }
    }

    fn on_bulk_update_result(&self, request_id: &str) {
        if !self.requests.is_current(request_id) {
            debug!("Ignoring stale bulk response {}", request_id);
            return;
        }
        if self.refresh().is_none() {
            self.state.lock().refreshing = false;
        }
    }

    fn on_error(&self, request_id: &str, message: &str) {
        if self.exports.is_current(request_id) {
            warn!("Export failed: {}", message);
            self.exports.reset();
            self.state.lock().last_error = Some(message.to_string());
            return;
        }
        if !self.requests.is_current(request_id) {
            debug!("Ignoring stale error for {}", request_id);
            return;
        }
        let mut state = self.state.lock();
        state.refreshing = false;
        state.last_error = Some(message.to_string());
    }

    fn on_export_result(&self, database_id: &str, request_id: &str, export: &ExportResponse) {
        if database_id != self.database_id || !self.exports.is_current(request_id) {
            debug!("Ignoring stale export {}", request_id);
            return;
        }
        self.exports.reset();
        self.state.lock().last_export = Some(export.clone());
    }

    fn on_closed(&self) {
        self.requests.reset();
        self.exports.reset();
        *self.state.lock() = TableState::default();
    }
}
