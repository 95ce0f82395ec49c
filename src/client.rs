//! Inspector client façade.
//!
//! [`InspectorClient`] ties the transport, the protocol handshake and the
//! listener registry together. Requests are fire-and-forget: responses arrive
//! through listeners, correlated by the caller-supplied request id.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::listener::{InspectorEvent, InspectorListener, ListenerRegistry};
use crate::model::{BulkAction, Variable};
use crate::protocol::{CodecRegistry, Frame, ProtocolCodec, Request};
use crate::transport::{ConnectionHandler, WebSocketConnection};

/// The four outbound operations, abstracted so higher-level logic can be
/// driven against a mock in tests.
pub trait CommandSink: Send + Sync {
    /// Run a read-only query; answered by `on_filter_data`.
    fn query(&self, request_id: &str, database_id: &str, sql: &str);

    /// Run a mutating statement; answered by `on_update_result`.
    fn update(
        &self,
        request_id: &str,
        database_id: &str,
        sql: &str,
        affected_tables: &[String],
        variables: &[Variable],
    );

    /// Run several mutations; answered once by `on_bulk_update_result`.
    fn bulk_update(&self, request_id: &str, database_id: &str, actions: &[BulkAction]);

    /// Dump the named tables; answered by `on_export_result`.
    fn export(&self, request_id: &str, database_id: &str, tables: &[String]);
}

/// Codec selected by the handshake, together with the announced version.
struct BoundCodec {
    version: i64,
    codec: Box<dyn ProtocolCodec>,
}

/// Connection-owned state. Receives transport callbacks.
struct ClientCore {
    config: ClientConfig,
    codecs: CodecRegistry,
    bound: Mutex<Option<BoundCodec>>,
    listeners: ListenerRegistry,
    connection: WebSocketConnection,
}

impl ClientCore {
    fn handle_handshake(&self, frame: &Frame) {
        let version = match frame.protocol_version() {
            Ok(version) => version,
            Err(e) => {
                warn!("Ignoring handshake: {}", e);
                return;
            }
        };

        match self.codecs.resolve(version, self.config.version_policy) {
            Ok(codec) => {
                let rebound = self
                    .bound
                    .lock()
                    .replace(BoundCodec { version, codec })
                    .is_some();
                if rebound {
                    info!("Protocol renegotiated, now version {}", version);
                } else {
                    info!("Protocol handshake complete, version {}", version);
                }
                self.listeners.broadcast(&InspectorEvent::Ready);
            }
            Err(e) => {
                error!("Rejecting server: {}", e);
                self.bound.lock().take();
                self.connection.close_with_reason(e.to_string());
            }
        }
    }

    fn send(&self, request: Request) {
        let encoded = {
            let bound = self.bound.lock();
            let Some(bound) = bound.as_ref() else {
                warn!(
                    "Dropping request {}: protocol handshake not complete",
                    request.request_id()
                );
                return;
            };
            bound.codec.encode(&request)
        };

        match encoded {
            Ok(text) => self.connection.send_text(text),
            Err(e) => error!("Dropping request {}: {}", request.request_id(), e),
        }
    }
}

impl ConnectionHandler for ClientCore {
    fn on_open(&self) {
        debug!("Socket open, waiting for protocol handshake");
    }

    fn on_text_frame(&self, payload: &str) {
        let frame = match Frame::parse(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        if frame.is_handshake() {
            self.handle_handshake(&frame);
            return;
        }

        // Decode under the lock, broadcast without it: listeners may send.
        let decoded = {
            let bound = self.bound.lock();
            let Some(bound) = bound.as_ref() else {
                debug!("Dropping {} frame received before handshake", frame.message_type);
                return;
            };
            bound.codec.decode(&frame)
        };

        match decoded {
            Ok(Some(event)) => self.listeners.broadcast(&event),
            Ok(None) => {}
            Err(e) => error!("{}", e),
        }
    }

    fn on_closed(&self, _reason: &str) {
        self.bound.lock().take();
        self.listeners.broadcast(&InspectorEvent::Closed);
    }

    fn on_error(&self, error: &TransportError) {
        debug!("Transport error reported to client: {}", error);
    }
}

/// Client for a remote database inspector server.
///
/// Dropping the client closes its connection.
pub struct InspectorClient {
    core: Arc<ClientCore>,
}

impl InspectorClient {
    /// Create an unconnected client for a `ws://` endpoint.
    ///
    /// # Errors
    ///
    /// `InvalidEndpoint` if `url` does not parse or is not a WebSocket URL.
    pub fn new(url: &str, config: ClientConfig) -> Result<Self, TransportError> {
        Self::with_codecs(url, config, CodecRegistry::default())
    }

    /// Like [`InspectorClient::new`], with a custom set of protocol codecs.
    pub fn with_codecs(
        url: &str,
        config: ClientConfig,
        codecs: CodecRegistry,
    ) -> Result<Self, TransportError> {
        let endpoint = parse_endpoint(url)?;
        let thread_name = config.thread_name.clone();
        let core = Arc::new_cyclic(|weak: &Weak<ClientCore>| {
            let handler: Weak<dyn ConnectionHandler> = weak.clone();
            ClientCore {
                config,
                codecs,
                bound: Mutex::new(None),
                listeners: ListenerRegistry::new(),
                connection: WebSocketConnection::new(endpoint, thread_name, handler),
            }
        });
        Ok(Self { core })
    }

    /// Start connecting. Readiness is reported through `on_ready`.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.core.connection.connect()
    }

    /// Close the connection. Listeners receive `on_closed` exactly once.
    pub fn close(&self) {
        self.core.connection.close();
    }

    pub fn register_listener(&self, listener: Arc<dyn InspectorListener>) -> bool {
        self.core.listeners.register(listener)
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn InspectorListener>) -> bool {
        self.core.listeners.unregister(listener)
    }

    /// True once the handshake has bound a codec, until the connection closes.
    pub fn is_ready(&self) -> bool {
        self.core.bound.lock().is_some()
    }

    /// Version announced by the server's handshake.
    pub fn protocol_version(&self) -> Option<i64> {
        self.core.bound.lock().as_ref().map(|b| b.version)
    }

    pub fn url(&self) -> &Url {
        self.core.connection.url()
    }

    pub fn query(&self, request_id: &str, database_id: &str, sql: &str) {
        self.core.send(Request::Filter {
            database_id: database_id.to_string(),
            request_id: request_id.to_string(),
            query: sql.to_string(),
        });
    }

    pub fn update(
        &self,
        request_id: &str,
        database_id: &str,
        sql: &str,
        affected_tables: &[String],
        variables: &[Variable],
    ) {
        self.core.send(Request::Update {
            database_id: database_id.to_string(),
            request_id: request_id.to_string(),
            query: sql.to_string(),
            affected_tables: affected_tables.to_vec(),
            variables: variables.to_vec(),
        });
    }

    pub fn bulk_update(&self, request_id: &str, database_id: &str, actions: &[BulkAction]) {
        self.core.send(Request::Batch {
            database_id: database_id.to_string(),
            request_id: request_id.to_string(),
            actions: actions.to_vec(),
        });
    }

    /// Export `tables`. An empty list exports nothing.
    pub fn export(&self, request_id: &str, database_id: &str, tables: &[String]) {
        self.core.send(Request::Export {
            database_id: database_id.to_string(),
            request_id: request_id.to_string(),
            tables: tables.to_vec(),
        });
    }
}

impl CommandSink for InspectorClient {
    fn query(&self, request_id: &str, database_id: &str, sql: &str) {
        InspectorClient::query(self, request_id, database_id, sql);
    }

    fn update(
        &self,
        request_id: &str,
        database_id: &str,
        sql: &str,
        affected_tables: &[String],
        variables: &[Variable],
    ) {
        InspectorClient::update(self, request_id, database_id, sql, affected_tables, variables);
    }

    fn bulk_update(&self, request_id: &str, database_id: &str, actions: &[BulkAction]) {
        InspectorClient::bulk_update(self, request_id, database_id, actions);
    }

    fn export(&self, request_id: &str, database_id: &str, tables: &[String]) {
        InspectorClient::export(self, request_id, database_id, tables);
    }
}

impl Drop for InspectorClient {
    fn drop(&mut self) {
        self.core.connection.close();
    }
}

fn parse_endpoint(url: &str) -> Result<Url, TransportError> {
    let endpoint = Url::parse(url).map_err(|e| TransportError::InvalidEndpoint {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match endpoint.scheme() {
        "ws" => Ok(endpoint),
        "wss" => Err(TransportError::InvalidEndpoint {
            url: url.to_string(),
            reason: "TLS endpoints are not supported, use ws".to_string(),
        }),
        other => Err(TransportError::InvalidEndpoint {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}', expected ws", other),
        }),
    }
}
