//! Error taxonomy for the RPC engine.
//!
//! A peer's method body failing is a *normal* outcome: it crosses the wire
//! as a serialized error and re-surfaces on the caller's side as
//! `RpcError::Remote`, preserving message, stack, and own-enumerable
//! properties so caller-side matching works naturally.

use pl_protocol::WireError;
use pl_transport::TransportError;
use serde_json::Value;
use std::backtrace::Backtrace;
use std::fmt;

/// An error thrown by a method body, local or remote.
///
/// Construction captures the stack at the throw site; `properties` carries
/// whatever extra fields the thrower attached.  Nested causes are not
/// preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrownError {
    pub message: String,
    pub stack: String,
    pub properties: serde_json::Map<String, Value>,
}

impl ThrownError {
    pub fn new(message: impl Into<String>) -> Self {
        ThrownError {
            message: message.into(),
            stack: Backtrace::force_capture().to_string(),
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            message: self.message.clone(),
            stack: self.stack.clone(),
            properties: self.properties.clone(),
        }
    }

    pub fn from_wire(wire: WireError) -> Self {
        ThrownError {
            message: wire.message,
            stack: wire.stack,
            properties: wire.properties,
        }
    }
}

impl fmt::Display for ThrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ThrownError {}

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("required endpoint argument was absent")]
    InvalidTarget,
    #[error("host already has a connection with id {0}")]
    DuplicateConnection(String),
    #[error("method not advertised by peer: {0}")]
    UnknownMethod(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("peer rejected: {}", .0.message)]
    Remote(ThrownError),
    #[error("handshake failed: {0}")]
    Handshake(String),
}
