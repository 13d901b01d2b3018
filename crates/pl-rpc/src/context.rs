//! Explicit call context.
//!
//! A method body that needs to reach back to its peer during its own
//! execution gets the peer handle through the context instead of a
//! trailing magic argument.  For relay-delivered invocations the context
//! also names the originating tab and the channel.

use crate::error::ThrownError;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// What a handler can do with "the other side" while running.
pub trait PeerHandle: Send + Sync {
    /// Invoke a method on the peer (enables bidirectional RPC from inside
    /// a handler).
    fn call(&self, method: &str, args: Vec<Value>)
    -> BoxFuture<'static, Result<Value, ThrownError>>;

    /// Read an advertised/shared data leaf by dotted path.
    fn read(&self, key: &str) -> Option<Value>;

    /// Write a shared data leaf.  Supported by bridge remotes; plain RPC
    /// remotes report the peer's data as read-only.
    fn write(&self, key: &str, value: Value) -> BoxFuture<'static, Result<(), ThrownError>>;
}

/// Context passed to every method body.
#[derive(Clone)]
pub struct CallContext {
    pub peer: Arc<dyn PeerHandle>,
    /// Tab that originated a relay-delivered invocation.
    pub sender: Option<String>,
    /// Channel of a relay-delivered invocation.
    pub channel: Option<String>,
}

impl CallContext {
    /// Context for a direct (non-relayed) invocation.
    pub fn direct(peer: Arc<dyn PeerHandle>) -> Self {
        CallContext {
            peer,
            sender: None,
            channel: None,
        }
    }

    /// Context for an invocation delivered through the relay.
    pub fn relayed(peer: Arc<dyn PeerHandle>, sender: Option<String>, channel: &str) -> Self {
        CallContext {
            peer,
            sender,
            channel: Some(channel.to_owned()),
        }
    }
}
