//! Live connections: request/reply correlation, local dispatch, teardown.
//!
//! One `ConnState` is shared by the `Connection` handle, every `Remote`
//! clone, and the dispatch subscription (through a weak reference, so a
//! dropped connection does not linger in the endpoint's registry).

use crate::context::{CallContext, PeerHandle};
use crate::error::{RpcError, ThrownError};
use crate::handshake::ConnectionRegistry;
use crate::payload::Payload;
use crate::schema::{CallArgs, FlatSchema, Method, value_at};
use futures::future::BoxFuture;
use pl_protocol::{RpcMessage, RpcReject, RpcRequest, RpcResolve, WireMessage, random_id};
use pl_transport::{Endpoint, EndpointKind, Packet, Subscription};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) struct ConnState {
    id: String,
    endpoint: Endpoint,
    /// Method names the peer advertised.
    peer_methods: BTreeSet<String>,
    /// The peer's schema with functions stripped.
    peer_values: Value,
    local_methods: Arc<BTreeMap<String, Method>>,
    /// Origin constraint for frame sends; `None` elsewhere.
    target_origin: Option<String>,
    host_side: bool,
    registry: Option<ConnectionRegistry>,
    dispatch_sub: Mutex<Option<Subscription>>,
    /// Outstanding call id -> its one-shot reply subscription.  Entries
    /// never outlive the connection.
    active_calls: Mutex<HashMap<String, Subscription>>,
    closed: AtomicBool,
}

impl ConnState {
    fn send_packet(&self, packet: Packet) -> Result<(), RpcError> {
        self.endpoint
            .send(packet, self.target_origin.as_deref())
            .map_err(RpcError::from)
    }

    fn remove_call(&self, call_id: &str) {
        let sub = self
            .active_calls
            .lock()
            .expect("active call lock")
            .remove(call_id);
        if let Some(sub) = sub {
            self.endpoint.unsubscribe(sub);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.dispatch_sub.lock() {
            if let Some(sub) = slot.take() {
                self.endpoint.unsubscribe(sub);
            }
        }
        let pending: Vec<Subscription> = self
            .active_calls
            .lock()
            .expect("active call lock")
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        // Dropping a call subscription drops its reply slot, settling the
        // caller with ConnectionClosed.
        for sub in pending {
            self.endpoint.unsubscribe(sub);
        }
        if let Some(registry) = &self.registry {
            registry.release(&self.id);
        }
        if self.host_side && matches!(self.endpoint.kind(), EndpointKind::Worker) {
            self.endpoint.terminate();
        }
    }
}

/// Wire a freshly handshaken link into a live connection: install the
/// local dispatch listener and synthesize the remote proxy.
pub(crate) fn establish(
    endpoint: Endpoint,
    id: String,
    local: FlatSchema,
    peer_methods: Vec<String>,
    peer_values: Value,
    host_side: bool,
    registry: Option<ConnectionRegistry>,
) -> Connection {
    let target_origin = endpoint.origin_of();
    let state = Arc::new(ConnState {
        id,
        endpoint: endpoint.clone(),
        peer_methods: peer_methods.into_iter().collect(),
        peer_values,
        local_methods: Arc::new(local.methods),
        target_origin,
        host_side,
        registry,
        dispatch_sub: Mutex::new(None),
        active_calls: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
    });

    let weak: Weak<ConnState> = Arc::downgrade(&state);
    let sub = endpoint.subscribe(move |event| {
        let Some(state) = weak.upgrade() else { return };
        if state.closed.load(Ordering::SeqCst) {
            return;
        }
        let WireMessage::Rpc(RpcMessage::Request(req)) = event.message() else {
            return;
        };
        if req.connection_id != state.id {
            return;
        }
        let req = req.clone();
        let buffers = event.payload().take_transfers();
        tokio::spawn(async move {
            dispatch_request(state, req, buffers).await;
        });
    });
    if let Ok(mut slot) = state.dispatch_sub.lock() {
        *slot = Some(sub);
    }

    Connection { state }
}

/// Serve one inbound request: run the local body, reply with the result
/// or the serialized error.
async fn dispatch_request(state: Arc<ConnState>, req: RpcRequest, buffers: Vec<pl_transport::Buffer>) {
    let outcome = match state.local_methods.get(&req.method).cloned() {
        None => Err(ThrownError::new(format!("method not found: {}", req.method))),
        Some(method) => {
            let args = CallArgs::from_wire(req.args.clone(), buffers);
            let ctx = CallContext::direct(Arc::new(Remote {
                state: Arc::clone(&state),
            }));
            method.invoke(args, ctx).await
        }
    };
    let send_result = match outcome {
        Ok(payload) => {
            let (result, transfers) = payload.into_parts();
            state.send_packet(Packet::with_transfers(
                RpcMessage::Resolve(RpcResolve {
                    connection_id: req.connection_id,
                    call_id: req.call_id,
                    method: req.method,
                    result,
                }),
                transfers,
            ))
        }
        Err(err) => state.send_packet(Packet::new(RpcMessage::Reject(RpcReject {
            connection_id: req.connection_id,
            call_id: req.call_id,
            method: req.method,
            error: err.to_wire(),
        }))),
    };
    if let Err(e) = send_result {
        debug!(error = %e, "reply could not be delivered");
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// The outcome of a successful handshake: an identifier, the remote proxy
/// tree, and a close operation.
pub struct Connection {
    state: Arc<ConnState>,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// The proxy for the peer's advertised surface.
    pub fn remote(&self) -> Remote {
        Remote {
            state: Arc::clone(&self.state),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Tear the connection down: drop all listeners, release the host
    /// registry entry, terminate a host-created worker.  Idempotent.
    /// Pending invocations settle with `ConnectionClosed`; replies
    /// arriving afterwards are dropped without effect.
    pub fn close(&self) {
        self.state.close();
    }

    pub(crate) fn send_raw(&self, message: RpcMessage) -> Result<(), RpcError> {
        self.state.send_packet(Packet::new(message))
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// The local proxy tree whose calls reach the peer.
#[derive(Clone)]
pub struct Remote {
    state: Arc<ConnState>,
}

impl Remote {
    pub fn connection_id(&self) -> &str {
        &self.state.id
    }

    /// Dotted method names the peer advertised.
    pub fn methods(&self) -> Vec<String> {
        self.state.peer_methods.iter().cloned().collect()
    }

    /// A non-function leaf the peer advertised, by dotted path.
    pub fn value(&self, path: &str) -> Option<Value> {
        value_at(&self.state.peer_values, path).cloned()
    }

    /// Call a peer method and await its result.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke_args(method, CallArgs::from_values(args))
            .await
            .map(Payload::into_value)
    }

    /// Call a peer method with transferable arguments; the reply payload
    /// carries any buffers the peer transferred back.
    pub async fn invoke_args(&self, method: &str, args: CallArgs) -> Result<Payload, RpcError> {
        let state = &self.state;
        if state.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }
        if !state.peer_methods.contains(method) {
            return Err(RpcError::UnknownMethod(method.to_owned()));
        }

        let call_id = random_id();
        let (tx, rx) = oneshot::channel::<Result<Payload, ThrownError>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let expected_conn = state.id.clone();
        let expected_call = call_id.clone();
        let expected_method = method.to_owned();

        // One-shot reply listener scoped to (call id, method, connection
        // id); the slot empties on first match so concurrent calls to the
        // same method cannot cross-wire.
        let sub = state.endpoint.subscribe(move |event| {
            let settle = |value: Result<Payload, ThrownError>| {
                if let Ok(mut guard) = slot.lock() {
                    if let Some(tx) = guard.take() {
                        let _ = tx.send(value);
                    }
                }
            };
            match event.message() {
                WireMessage::Rpc(RpcMessage::Resolve(r))
                    if r.connection_id == expected_conn
                        && r.call_id == expected_call
                        && r.method == expected_method =>
                {
                    let buffers = event.payload().take_transfers();
                    settle(Ok(Payload::from_parts(r.result.clone(), buffers)));
                }
                WireMessage::Rpc(RpcMessage::Reject(r))
                    if r.connection_id == expected_conn
                        && r.call_id == expected_call
                        && r.method == expected_method =>
                {
                    settle(Err(ThrownError::from_wire(r.error.clone())));
                }
                _ => {}
            }
        });
        state
            .active_calls
            .lock()
            .expect("active call lock")
            .insert(call_id.clone(), sub);

        let (values, transfers) = args.into_parts();
        let request = RpcMessage::Request(RpcRequest {
            connection_id: state.id.clone(),
            call_id: call_id.clone(),
            method: method.to_owned(),
            args: values,
        });
        if let Err(e) = state.send_packet(Packet::with_transfers(request, transfers)) {
            state.remove_call(&call_id);
            return Err(e);
        }

        let outcome = rx.await;
        state.remove_call(&call_id);
        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(thrown)) => Err(RpcError::Remote(thrown)),
            // The reply slot was dropped: the connection closed under us.
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }
}

impl PeerHandle for Remote {
    fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, ThrownError>> {
        let remote = self.clone();
        let method = method.to_owned();
        Box::pin(async move {
            match remote.invoke(&method, args).await {
                Ok(value) => Ok(value),
                Err(RpcError::Remote(thrown)) => Err(thrown),
                Err(other) => Err(ThrownError::new(other.to_string())),
            }
        })
    }

    fn read(&self, key: &str) -> Option<Value> {
        self.value(key)
    }

    fn write(&self, key: &str, _value: Value) -> BoxFuture<'static, Result<(), ThrownError>> {
        let key = key.to_owned();
        Box::pin(async move {
            Err(ThrownError::new(format!(
                "peer data leaf {key} is read-only over rpc"
            )))
        })
    }
}
