//! Protocol version 1 codec.
//!
//! Outbound requests are built with serde so that queries containing quotes,
//! backslashes or newlines are escaped correctly. Inbound bodies are decoded
//! field by field; row cells go through [`SqlValue::from_json`] because rows
//! have no fixed schema.
//!
//! [`SqlValue::from_json`]: crate::model::SqlValue::from_json

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{Frame, ProtocolCodec, Request};
use crate::error::ProtocolError;
use crate::listener::InspectorEvent;
use crate::model::{BulkAction, ExportResponse, Row, ServerInfo, Variable};

pub const MESSAGE_TYPE_FILTER_RESULT: &str = "filterResult";
pub const MESSAGE_TYPE_SERVER_INFO: &str = "serverInfo";
pub const MESSAGE_TYPE_UPDATE_RESULT: &str = "updateResult";
pub const MESSAGE_TYPE_ERROR: &str = "error";
pub const MESSAGE_TYPE_BULK_RESPONSE: &str = "bulkResponse";
pub const MESSAGE_TYPE_EXPORT_RESULT: &str = "exportResult";

#[derive(Serialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
enum Outbound<'a> {
    Filter(FilterBody<'a>),
    Update(UpdateBody<'a>),
    Batch(BatchBody<'a>),
    Export(ExportBody<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FilterBody<'a> {
    database_id: &'a str,
    request_id: &'a str,
    query: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody<'a> {
    database_id: &'a str,
    /// Absent for actions nested in a batch; the batch carries the id.
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    query: &'a str,
    affected_tables: &'a [String],
    variables: &'a [Variable],
}

#[derive(Serialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
enum BatchAction<'a> {
    Update(UpdateBody<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchBody<'a> {
    request_id: &'a str,
    actions: Vec<BatchAction<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportBody<'a> {
    database_id: &'a str,
    request_id: &'a str,
    tables: &'a [String],
}

/// Codec for protocol version 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct V1Codec;

impl V1Codec {
    pub fn new() -> Self {
        Self
    }

    fn decode_filter_result(body: &Value) -> Result<InspectorEvent, ProtocolError> {
        let database_id = string_field(body, "databaseId", MESSAGE_TYPE_FILTER_RESULT)?;
        let request_id = string_field(body, "requestId", MESSAGE_TYPE_FILTER_RESULT)?;

        let data = match body.get("data") {
            None | Some(Value::Null) => {
                return Ok(InspectorEvent::FilterData {
                    database_id,
                    request_id,
                    rows: Vec::new(),
                    columns: Vec::new(),
                });
            }
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ProtocolError::decode(
                    MESSAGE_TYPE_FILTER_RESULT,
                    format!("data must be an array, got {}", other),
                ));
            }
        };

        let rows = data
            .iter()
            .map(Row::from_json)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProtocolError::decode(MESSAGE_TYPE_FILTER_RESULT, e))?;

        let columns = match body.get("columns") {
            None | Some(Value::Null) => columns_from_rows(&rows),
            Some(Value::Array(names)) => names
                .iter()
                .map(|name| {
                    name.as_str().map(str::to_string).ok_or_else(|| {
                        ProtocolError::decode(
                            MESSAGE_TYPE_FILTER_RESULT,
                            format!("column name must be a string, got {}", name),
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(ProtocolError::decode(
                    MESSAGE_TYPE_FILTER_RESULT,
                    format!("columns must be an array, got {}", other),
                ));
            }
        };

        Ok(InspectorEvent::FilterData {
            database_id,
            request_id,
            rows,
            columns,
        })
    }

    fn decode_update_result(body: &Value) -> Result<InspectorEvent, ProtocolError> {
        let num_updated = body
            .get("numUpdated")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::decode(MESSAGE_TYPE_UPDATE_RESULT, "missing numUpdated"))?;
        Ok(InspectorEvent::UpdateResult {
            database_id: string_field(body, "databaseId", MESSAGE_TYPE_UPDATE_RESULT)?,
            request_id: string_field(body, "requestId", MESSAGE_TYPE_UPDATE_RESULT)?,
            num_updated,
        })
    }
}

impl ProtocolCodec for V1Codec {
    fn version(&self) -> i64 {
        1
    }

    fn encode(&self, request: &Request) -> Result<String, ProtocolError> {
        let message = match request {
            Request::Filter {
                database_id,
                request_id,
                query,
            } => Outbound::Filter(FilterBody {
                database_id,
                request_id,
                query,
            }),
            Request::Update {
                database_id,
                request_id,
                query,
                affected_tables,
                variables,
            } => Outbound::Update(UpdateBody {
                database_id,
                request_id: Some(request_id.as_str()),
                query,
                affected_tables,
                variables,
            }),
            Request::Batch {
                database_id,
                request_id,
                actions,
            } => Outbound::Batch(BatchBody {
                request_id,
                actions: actions
                    .iter()
                    .map(|action| batch_action(database_id, action))
                    .collect(),
            }),
            Request::Export {
                database_id,
                request_id,
                tables,
            } => Outbound::Export(ExportBody {
                database_id,
                request_id,
                tables,
            }),
        };
        serde_json::to_string(&message).map_err(ProtocolError::Encode)
    }

    fn decode(&self, frame: &Frame) -> Result<Option<InspectorEvent>, ProtocolError> {
        let message_type = frame.message_type.as_str();
        let event = match message_type {
            MESSAGE_TYPE_FILTER_RESULT => Self::decode_filter_result(frame.body()?)?,
            MESSAGE_TYPE_SERVER_INFO => {
                let info: ServerInfo = serde_json::from_value(frame.body()?.clone())
                    .map_err(|e| ProtocolError::decode(message_type, e.to_string()))?;
                InspectorEvent::ServerInfo(info)
            }
            MESSAGE_TYPE_UPDATE_RESULT => Self::decode_update_result(frame.body()?)?,
            MESSAGE_TYPE_ERROR => {
                let body = frame.body()?;
                InspectorEvent::Error {
                    request_id: string_field(body, "requestId", message_type)?,
                    message: string_field(body, "message", message_type)?,
                }
            }
            MESSAGE_TYPE_BULK_RESPONSE => InspectorEvent::BulkUpdateResult {
                request_id: string_field(frame.body()?, "requestId", message_type)?,
            },
            MESSAGE_TYPE_EXPORT_RESULT => {
                let export: ExportResponse = serde_json::from_value(frame.body()?.clone())
                    .map_err(|e| ProtocolError::decode(message_type, e.to_string()))?;
                InspectorEvent::ExportResult(export)
            }
            other => {
                debug!("Ignoring unknown message type: {}", other);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

fn batch_action<'a>(database_id: &'a str, action: &'a BulkAction) -> BatchAction<'a> {
    BatchAction::Update(UpdateBody {
        database_id,
        request_id: None,
        query: &action.query,
        affected_tables: &action.affected_tables,
        variables: &action.variables,
    })
}

fn string_field(body: &Value, field: &str, message_type: &str) -> Result<String, ProtocolError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::decode(message_type, format!("missing {}", field)))
}

/// Column names in first-seen order across all rows.
fn columns_from_rows(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for column in row.columns() {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SqlValue, VariableType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decode(frame: Value) -> Result<Option<InspectorEvent>, ProtocolError> {
        let frame = Frame::parse(&frame.to_string()).unwrap();
        V1Codec::new().decode(&frame)
    }

    fn encode(request: Request) -> Value {
        let text = V1Codec::new().encode(&request).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_encode_filter() {
        let value = encode(Request::Filter {
            database_id: "db".to_string(),
            request_id: "req".to_string(),
            query: "SELECT * FROM t WHERE name = \"x\"\n".to_string(),
        });
        assert_eq!(
            value,
            json!({
                "type": "filter",
                "body": {
                    "databaseId": "db",
                    "requestId": "req",
                    "query": "SELECT * FROM t WHERE name = \"x\"\n"
                }
            })
        );
    }

    #[test]
    fn test_encode_update() {
        let value = encode(Request::Update {
            database_id: "db".to_string(),
            request_id: "req".to_string(),
            query: "UPDATE t SET a = ? WHERE id = ?".to_string(),
            affected_tables: vec!["t".to_string()],
            variables: vec![
                Variable::new(VariableType::String, SqlValue::Text("x".to_string())),
                Variable::new(VariableType::Int, SqlValue::Integer(4)),
            ],
        });
        assert_eq!(
            value,
            json!({
                "type": "update",
                "body": {
                    "databaseId": "db",
                    "requestId": "req",
                    "query": "UPDATE t SET a = ? WHERE id = ?",
                    "affectedTables": ["t"],
                    "variables": [
                        {"type": "string", "data": "x"},
                        {"type": "int", "data": 4}
                    ]
                }
            })
        );
    }

    #[test]
    fn test_encode_batch_nests_update_actions() {
        let value = encode(Request::Batch {
            database_id: "db".to_string(),
            request_id: "bulk".to_string(),
            actions: vec![BulkAction {
                query: "DELETE FROM t WHERE id = ?".to_string(),
                affected_tables: vec!["t".to_string()],
                variables: vec![Variable::new(VariableType::Int, SqlValue::Integer(1))],
            }],
        });
        assert_eq!(
            value,
            json!({
                "type": "batch",
                "body": {
                    "requestId": "bulk",
                    "actions": [{
                        "type": "update",
                        "body": {
                            "databaseId": "db",
                            "query": "DELETE FROM t WHERE id = ?",
                            "affectedTables": ["t"],
                            "variables": [{"type": "int", "data": 1}]
                        }
                    }]
                }
            })
        );
    }

    #[test]
    fn test_encode_export_with_empty_table_list() {
        let value = encode(Request::Export {
            database_id: "db".to_string(),
            request_id: "exp".to_string(),
            tables: vec![],
        });
        assert_eq!(
            value,
            json!({"type": "export", "body": {"databaseId": "db", "requestId": "exp", "tables": []}})
        );
    }

    #[test]
    fn test_decode_filter_result_with_data() {
        let event = decode(json!({
            "type": "filterResult",
            "body": {
                "databaseId": "db",
                "requestId": "req",
                "columns": ["id", "name", "score", "payload", "flag"],
                "data": [
                    {"id": 1, "name": "a", "score": 1.5, "payload": [1, 2], "flag": true},
                    {"id": 2, "name": null, "score": 3, "payload": null, "flag": 0}
                ]
            }
        }))
        .unwrap()
        .unwrap();

        let InspectorEvent::FilterData { rows, columns, .. } = event else {
            panic!("Expected FilterData");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(columns, vec!["id", "name", "score", "payload", "flag"]);
        for row in &rows {
            let keys: Vec<&str> = row.columns().collect();
            assert_eq!(keys, columns.iter().map(String::as_str).collect::<Vec<_>>());
        }
        assert_eq!(rows[0].get("payload"), Some(&SqlValue::Blob(vec![1, 2])));
        assert_eq!(rows[0].get("score"), Some(&SqlValue::Real(1.5)));
        assert_eq!(rows[0].get("flag"), Some(&SqlValue::Bool(true)));
        assert_eq!(rows[1].get("name"), Some(&SqlValue::Null));
        assert_eq!(rows[1].get("score"), Some(&SqlValue::Integer(3)));
    }

    #[test]
    fn test_decode_filter_result_null_or_missing_data() {
        for body in [
            json!({"databaseId": "db", "requestId": "req", "data": null, "columns": null}),
            json!({"databaseId": "db", "requestId": "req"}),
        ] {
            let event = decode(json!({"type": "filterResult", "body": body}))
                .unwrap()
                .unwrap();
            assert_eq!(
                event,
                InspectorEvent::FilterData {
                    database_id: "db".to_string(),
                    request_id: "req".to_string(),
                    rows: vec![],
                    columns: vec![],
                }
            );
        }
    }

    #[test]
    fn test_decode_filter_result_derives_columns_when_absent() {
        let event = decode(json!({
            "type": "filterResult",
            "body": {
                "databaseId": "db",
                "requestId": "req",
                "data": [{"b": 1, "a": 2}, {"c": 3}]
            }
        }))
        .unwrap()
        .unwrap();

        let InspectorEvent::FilterData { rows, columns, .. } = event else {
            panic!("Expected FilterData");
        };
        assert_eq!(columns, vec!["b", "a", "c"]);
        assert_eq!(rows[1].columns().collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_decode_filter_result_rejects_bad_cells() {
        let result = decode(json!({
            "type": "filterResult",
            "body": {"databaseId": "db", "requestId": "req", "data": [{"a": {"nested": 1}}]}
        }));
        assert!(matches!(result, Err(ProtocolError::Decode { .. })));
    }

    #[test]
    fn test_decode_update_bulk_and_error() {
        assert_eq!(
            decode(json!({"type": "updateResult", "body": {"databaseId": "db", "requestId": "u", "numUpdated": 3}}))
                .unwrap(),
            Some(InspectorEvent::UpdateResult {
                database_id: "db".to_string(),
                request_id: "u".to_string(),
                num_updated: 3,
            })
        );
        assert_eq!(
            decode(json!({"type": "bulkResponse", "body": {"requestId": "b"}})).unwrap(),
            Some(InspectorEvent::BulkUpdateResult {
                request_id: "b".to_string()
            })
        );
        assert_eq!(
            decode(json!({"type": "error", "body": {"requestId": "e", "message": "no such table: x"}}))
                .unwrap(),
            Some(InspectorEvent::Error {
                request_id: "e".to_string(),
                message: "no such table: x".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_export_result() {
        let event = decode(json!({
            "type": "exportResult",
            "body": {
                "databaseId": "db",
                "requestId": "exp",
                "schemas": ["CREATE TABLE t (id INTEGER PRIMARY KEY)"],
                "data": [{"name": "t", "data": [{"id": 1}, {"id": 2}]}]
            }
        }))
        .unwrap()
        .unwrap();

        let InspectorEvent::ExportResult(export) = event else {
            panic!("Expected ExportResult");
        };
        assert_eq!(export.schemas.len(), 1);
        assert_eq!(export.table("t").unwrap().data.len(), 2);
    }

    #[test]
    fn test_decode_server_info() {
        let event = decode(json!({
            "type": "serverInfo",
            "body": {"bundleId": "com.example", "protocolVersion": 1, "databases": []}
        }))
        .unwrap()
        .unwrap();
        assert!(matches!(event, InspectorEvent::ServerInfo(info) if info.bundle_id == "com.example"));
    }

    #[test]
    fn test_decode_unknown_type_is_ignored() {
        assert_eq!(decode(json!({"type": "somethingNew", "body": {}})).unwrap(), None);
    }

    #[test]
    fn test_decode_missing_fields() {
        assert!(decode(json!({"type": "updateResult", "body": {"databaseId": "db", "requestId": "u"}})).is_err());
        assert!(decode(json!({"type": "error", "body": {"message": "m"}})).is_err());
        assert!(decode(json!({"type": "bulkResponse"})).is_err());
    }
}
