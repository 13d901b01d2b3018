//! The two-phase handshake.
//!
//! ```text
//! HOST                                GUEST
//!   listen  <──────── request ─────────  sent request
//!   validate, register id
//!           ─────────  reply 1 ───────>  build remote, run setup hook
//!   ready   <──────── reply 2 ─────────  ready
//! ```
//!
//! The host generates the connection identifier and echoes it in both
//! replies.  Reply 2 is the readiness barrier: the host does not issue
//! requests until it arrives.  On frame endpoints every handshake message
//! is origin/source-checked and failures are dropped silently.

use crate::connection::{Connection, Remote, establish};
use crate::error::{RpcError, ThrownError};
use crate::schema::Schema;
use futures::future::BoxFuture;
use pl_protocol::{HandshakeReply, HandshakeRequest, RpcMessage, WireMessage, random_id};
use pl_transport::{Endpoint, GuestContext, Packet, PortEvent, Subscription, auto_host};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Connection registry
// ---------------------------------------------------------------------------

/// The host-side answer to "have I already accepted this id?".  Passed
/// into each host connect; share one across connects that must not
/// collide.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an id.  Returns false when it is already held.
    pub fn register(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .insert(id.to_owned())
    }

    pub fn release(&self, id: &str) {
        self.inner.lock().expect("registry lock").remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().expect("registry lock").contains(id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("registry lock").len()
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Post-handshake hook run on the guest after proxy synthesis, before the
/// readiness confirmation.  A failure discards the half-built connection.
pub type SetupHook = Box<dyn FnOnce(Remote) -> BoxFuture<'static, Result<(), ThrownError>> + Send>;

#[derive(Default)]
pub struct HostOptions {
    /// Registry shared across host connects; a fresh one when absent.
    pub registry: Option<ConnectionRegistry>,
}

#[derive(Default)]
pub struct ConnectOptions {
    /// Explicit host endpoint override.
    pub host: Option<Endpoint>,
    /// Guest context for auto-detection when no override is given.
    pub guest: Option<GuestContext>,
    pub on_connected: Option<SetupHook>,
}

// ---------------------------------------------------------------------------
// Temporary subscription plumbing
// ---------------------------------------------------------------------------

/// Forwards raw events into a channel and unsubscribes on drop, so every
/// handshake exit path cleans up its listener.
struct TempSub {
    endpoint: Endpoint,
    sub: Option<Subscription>,
}

impl TempSub {
    fn attach(endpoint: &Endpoint) -> (Self, mpsc::UnboundedReceiver<Arc<PortEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = endpoint.subscribe(move |event| {
            let _ = tx.send(event);
        });
        (
            TempSub {
                endpoint: endpoint.clone(),
                sub: Some(sub),
            },
            rx,
        )
    }
}

impl Drop for TempSub {
    fn drop(&mut self) {
        if let Some(sub) = self.sub.take() {
            self.endpoint.unsubscribe(sub);
        }
    }
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// Accept one guest handshake on `endpoint` and drive it to READY.
///
/// Resolves only after the guest's confirmation (the readiness barrier),
/// so the returned connection may issue requests immediately.  Handshake
/// messages failing frame validation are dropped without any reply.
pub async fn host_connect(
    endpoint: &Endpoint,
    schema: Schema,
    opts: HostOptions,
) -> Result<Connection, RpcError> {
    let local = schema.extract();
    let registry = opts.registry.unwrap_or_default();
    let (guard, mut rx) = TempSub::attach(endpoint);
    let target_origin = endpoint.origin_of();

    // Phase 1: a valid HANDSHAKE_REQUEST.
    let request: HandshakeRequest = loop {
        let Some(event) = rx.recv().await else {
            return Err(RpcError::Handshake("endpoint went away".to_owned()));
        };
        let WireMessage::Rpc(RpcMessage::HandshakeRequest(req)) = event.message() else {
            continue;
        };
        if !endpoint.is_valid_frame_message(&event) {
            debug!("handshake request dropped: frame origin/source check failed");
            continue;
        }
        break req.clone();
    };

    let connection_id = random_id();
    if !registry.register(&connection_id) {
        return Err(RpcError::DuplicateConnection(connection_id));
    }

    // Reply 1: the id plus the host's advertised surface.
    let reply = RpcMessage::HandshakeReply(HandshakeReply {
        connection_id: connection_id.clone(),
        methods: Some(local.method_names()),
        schema: Some(local.values.clone()),
    });
    if let Err(e) = endpoint.send(Packet::new(reply), target_origin.as_deref()) {
        registry.release(&connection_id);
        return Err(e.into());
    }

    // Phase 2: the guest's bare confirmation.
    loop {
        let Some(event) = rx.recv().await else {
            registry.release(&connection_id);
            return Err(RpcError::Handshake(
                "guest went away before confirming".to_owned(),
            ));
        };
        let WireMessage::Rpc(RpcMessage::HandshakeReply(rep)) = event.message() else {
            continue;
        };
        if rep.connection_id != connection_id || rep.methods.is_some() {
            continue;
        }
        if !endpoint.is_valid_frame_message(&event) {
            debug!("handshake confirmation dropped: frame origin/source check failed");
            continue;
        }
        break;
    }
    drop(guard);

    Ok(establish(
        endpoint.clone(),
        connection_id,
        local,
        request.methods,
        request.schema,
        true,
        Some(registry),
    ))
}

// ---------------------------------------------------------------------------
// Guest side
// ---------------------------------------------------------------------------

/// Open a connection to the host: explicit override, or the ambient guest
/// context (*NoHost* when neither is available).
pub async fn connect(schema: Schema, opts: ConnectOptions) -> Result<Connection, RpcError> {
    let endpoint = match opts.host {
        Some(endpoint) => endpoint,
        None => auto_host(opts.guest.as_ref())?,
    };
    let local = schema.extract();
    let (guard, mut rx) = TempSub::attach(&endpoint);

    let request = RpcMessage::HandshakeRequest(HandshakeRequest {
        methods: local.method_names(),
        schema: local.values.clone(),
    });
    endpoint.send(Packet::new(request), None)?;

    // Reply 1 carries the host's surface.
    let reply: HandshakeReply = loop {
        let Some(event) = rx.recv().await else {
            return Err(RpcError::Handshake("host went away".to_owned()));
        };
        let WireMessage::Rpc(RpcMessage::HandshakeReply(rep)) = event.message() else {
            continue;
        };
        if rep.methods.is_none() {
            continue;
        }
        break rep.clone();
    };
    drop(guard);

    let connection = establish(
        endpoint,
        reply.connection_id.clone(),
        local,
        reply.methods.unwrap_or_default(),
        reply.schema.unwrap_or(Value::Null),
        false,
        None,
    );

    // Setup hook: runs after proxy synthesis, before the confirmation.
    // Failure leaves the connection half-built and discarded.
    if let Some(hook) = opts.on_connected {
        if let Err(err) = hook(connection.remote()).await {
            connection.close();
            return Err(RpcError::Handshake(format!(
                "connection setup hook failed: {}",
                err.message
            )));
        }
    }

    // Reply 2: the readiness barrier.
    let confirmation = RpcMessage::HandshakeReply(HandshakeReply {
        connection_id: reply.connection_id,
        methods: None,
        schema: None,
    });
    if let Err(e) = connection.send_raw(confirmation) {
        connection.close();
        return Err(e);
    }
    Ok(connection)
}
