//! Wire protocol: frame envelopes, handshake and codec selection.
//!
//! Every frame is a JSON object with a top-level `type`:
//!
//! ```text
//! {"type": "<messageType>", "body": { ... }}
//! ```
//!
//! The first frame sent by the server is the handshake, which carries the
//! protocol version instead of a body:
//!
//! ```text
//! {"type": "protocol", "protocolVersion": 1}
//! ```
//!
//! The version selects a [`ProtocolCodec`] from a [`CodecRegistry`]; the codec
//! then translates all further frames for that connection.

pub mod v1;

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::config::VersionPolicy;
use crate::error::ProtocolError;
use crate::listener::InspectorEvent;
use crate::model::{BulkAction, Variable};

pub use v1::V1Codec;

/// Message type of the handshake frame.
pub const MESSAGE_TYPE_PROTOCOL: &str = "protocol";

/// A version-independent outbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Read-only query.
    Filter {
        database_id: String,
        request_id: String,
        query: String,
    },
    /// Single mutating statement with bound parameters.
    Update {
        database_id: String,
        request_id: String,
        query: String,
        affected_tables: Vec<String>,
        variables: Vec<Variable>,
    },
    /// Several mutations answered by one bulk response.
    Batch {
        database_id: String,
        request_id: String,
        actions: Vec<BulkAction>,
    },
    /// Full data dump of the named tables. An empty list requests nothing.
    Export {
        database_id: String,
        request_id: String,
        tables: Vec<String>,
    },
}

impl Request {
    pub fn request_id(&self) -> &str {
        match self {
            Request::Filter { request_id, .. }
            | Request::Update { request_id, .. }
            | Request::Batch { request_id, .. }
            | Request::Export { request_id, .. } => request_id,
        }
    }
}

/// One parsed inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: String,
    pub value: Value,
}

impl Frame {
    /// Parse a raw text frame into its envelope.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        Ok(Self {
            message_type,
            value,
        })
    }

    pub fn is_handshake(&self) -> bool {
        self.message_type == MESSAGE_TYPE_PROTOCOL
    }

    /// The protocol version announced by a handshake frame.
    pub fn protocol_version(&self) -> Result<i64, ProtocolError> {
        self.value
            .get("protocolVersion")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::decode(MESSAGE_TYPE_PROTOCOL, "missing protocolVersion"))
    }

    /// The frame body, or a decode error naming the message type.
    pub fn body(&self) -> Result<&Value, ProtocolError> {
        match self.value.get("body") {
            Some(body) if !body.is_null() => Ok(body),
            _ => Err(ProtocolError::decode(&self.message_type, "missing body")),
        }
    }
}

/// Translates between frames and typed requests/events for one protocol version.
pub trait ProtocolCodec: Send + Sync {
    fn version(&self) -> i64;

    /// Serialize an outbound request into a text frame.
    fn encode(&self, request: &Request) -> Result<String, ProtocolError>;

    /// Decode an inbound frame.
    ///
    /// Returns `Ok(None)` for message types this codec does not know, so
    /// newer servers can add messages without breaking older clients.
    fn decode(&self, frame: &Frame) -> Result<Option<InspectorEvent>, ProtocolError>;
}

/// Constructor for a codec.
pub type CodecFactory = fn() -> Box<dyn ProtocolCodec>;

fn v1_codec() -> Box<dyn ProtocolCodec> {
    Box::new(V1Codec::new())
}

/// Maps protocol versions to codec constructors.
pub struct CodecRegistry {
    factories: BTreeMap<i64, CodecFactory>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(1, v1_codec);
        registry
    }
}

impl CodecRegistry {
    /// A registry with no codecs.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, version: i64, factory: CodecFactory) {
        self.factories.insert(version, factory);
    }

    /// Highest registered version.
    pub fn latest_version(&self) -> Option<i64> {
        self.factories.keys().next_back().copied()
    }

    /// Build the codec serving `version`.
    ///
    /// Under [`VersionPolicy::Strict`] only an exact match is accepted. Under
    /// [`VersionPolicy::Lenient`] the newest codec not newer than `version`
    /// is used, falling back to the latest registered codec.
    pub fn resolve(
        &self,
        version: i64,
        policy: VersionPolicy,
    ) -> Result<Box<dyn ProtocolCodec>, ProtocolError> {
        if let Some(factory) = self.factories.get(&version) {
            return Ok(factory());
        }

        if policy == VersionPolicy::Strict {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let fallback = self
            .factories
            .range(..=version)
            .next_back()
            .or_else(|| self.factories.iter().next_back());

        match fallback {
            Some((selected, factory)) => {
                warn!(
                    "Server speaks protocol version {}, using codec for version {}",
                    version, selected
                );
                Ok(factory())
            }
            None => Err(ProtocolError::UnsupportedVersion(version)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parse() {
        let frame = Frame::parse(r#"{"type":"protocol","protocolVersion":1}"#).unwrap();
        assert!(frame.is_handshake());
        assert_eq!(frame.protocol_version().unwrap(), 1);

        let frame = Frame::parse(r#"{"type":"bulkResponse","body":{"requestId":"r"}}"#).unwrap();
        assert!(!frame.is_handshake());
        assert_eq!(frame.body().unwrap()["requestId"], "r");
    }

    #[test]
    fn test_frame_parse_errors() {
        assert!(matches!(
            Frame::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            Frame::parse(r#"{"body":{}}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            Frame::parse(r#"{"type":5}"#),
            Err(ProtocolError::MissingType)
        ));

        let frame = Frame::parse(r#"{"type":"protocol"}"#).unwrap();
        assert!(frame.protocol_version().is_err());

        let frame = Frame::parse(r#"{"type":"error","body":null}"#).unwrap();
        assert!(frame.body().is_err());
    }

    #[test]
    fn test_registry_exact_match() {
        let registry = CodecRegistry::default();
        let codec = registry.resolve(1, VersionPolicy::Strict).unwrap();
        assert_eq!(codec.version(), 1);
        assert_eq!(registry.latest_version(), Some(1));
    }

    #[test]
    fn test_registry_lenient_falls_back() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.resolve(5, VersionPolicy::Lenient).unwrap().version(), 1);
        assert_eq!(registry.resolve(0, VersionPolicy::Lenient).unwrap().version(), 1);
    }

    #[test]
    fn test_registry_strict_rejects_unknown() {
        let registry = CodecRegistry::default();
        assert!(matches!(
            registry.resolve(2, VersionPolicy::Strict),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_empty_registry_rejects_everything() {
        let registry = CodecRegistry::empty();
        assert!(registry.resolve(1, VersionPolicy::Lenient).is_err());
        assert_eq!(registry.latest_version(), None);
    }

    #[test]
    fn test_request_id_accessor() {
        let request = Request::Export {
            database_id: "db".to_string(),
            request_id: "req-9".to_string(),
            tables: vec![],
        };
        assert_eq!(request.request_id(), "req-9");
    }
}
