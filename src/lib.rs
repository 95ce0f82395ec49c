//! Drift Inspector client library.
//!
//! Connects to a database inspector server embedded in a running application
//! over WebSocket, negotiates the protocol version and exposes the server's
//! databases for browsing and editing:
//!
//! - `transport` - WebSocket connection on a dedicated worker thread
//! - `protocol` - handshake, codec selection and the version 1 wire format
//! - `client` - the `InspectorClient` façade and the `CommandSink` trait
//! - `listener` - listener trait, fan-out registry and channel adapter
//! - `sql` - statement classification and row matching for edits
//! - `session` - request tracking, table sessions and the schema store
//! - `model` - schema snapshots, rows, values and bind variables
//!
//! # Example
//!
//! ```ignore
//! use drift_inspector::{ChannelListener, ClientConfig, InspectorClient, InspectorEvent};
//!
//! let client = InspectorClient::new("ws://127.0.0.1:8080", ClientConfig::from_env())?;
//! let (listener, mut events) = ChannelListener::channel();
//! client.register_listener(listener);
//! client.connect()?;
//!
//! while let Some(event) = events.recv().await {
//!     if event == InspectorEvent::Ready {
//!         client.query("req-1", "db-1", "SELECT * FROM users");
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod model;
pub mod protocol;
pub mod session;
pub mod sql;
pub mod transport;

pub use client::{CommandSink, InspectorClient};
pub use config::{ClientConfig, VersionPolicy};
pub use error::{ProtocolError, SessionError, SqlError, TransportError, ValueError};
pub use listener::{ChannelListener, InspectorEvent, InspectorListener, ListenerRegistry};
pub use session::{RequestTracker, SchemaStore, TableSession};
