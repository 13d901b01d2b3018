//! Bridge client: handshake, the dual-natured remote, and the mirrored
//! shared-state view.
//!
//! A broadcast call runs the tab's own handler first (its result is what
//! the caller gets) and dispatches the envelope to the relay as
//! fire-and-forget.  A local failure is rethrown to the caller *and*
//! attached to the envelope so peers can observe it.

use pl_protocol::{
    BridgeBroadcast, BridgeDirectMessage, BridgeDisconnect, BridgeGetTabs, BridgeHandshake,
    BridgeMessage, BridgeSetState, DEFAULT_CHANNEL, WireMessage, error_codes, random_id,
};
use futures::future::BoxFuture;
use pl_rpc::{CallArgs, CallContext, PeerHandle, Schema, ThrownError};
use pl_transport::{Endpoint, Packet, Subscription, TransportError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("relay refused registration ({code}): {message}")]
    Handshake { code: String, message: String },
    #[error("method not in local schema: {0}")]
    UnknownMethod(String),
    #[error("local execution failed: {0}")]
    Local(ThrownError),
    #[error("bridge client closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Connect-time configuration.  Everything is optional: the channel
/// defaults to the shared sentinel and the tab id is generated.
#[derive(Debug, Default)]
pub struct BridgeOptions {
    pub channel: Option<String>,
    pub tab_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Join a channel through `relay` (a tab-side relay port) and return the
/// remote handle.
///
/// One standing dispatcher handles everything the relay sends, the ack
/// included.  It is registered before the handshake goes out, so nothing
/// the relay emits after registering us can slip past unobserved (the ack
/// is always the first message on this port).
pub async fn connect(
    relay: Endpoint,
    schema: Schema,
    opts: BridgeOptions,
) -> Result<BridgeRemote, BridgeError> {
    if relay.is_closed() {
        return Err(TransportError::TransportUnavailable.into());
    }
    let tab_id = opts.tab_id.unwrap_or_else(random_id);
    let channel = opts.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_owned());
    let flat = schema.extract();
    let method_names = flat.method_names();

    let inner = Arc::new(BridgeInner {
        tab_id,
        channel,
        port: relay.clone(),
        methods: Arc::new(flat.methods),
        state: RwLock::new(serde_json::Map::new()),
        dispatch_sub: Mutex::new(None),
        closed: AtomicBool::new(false),
    });

    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), (String, String)>>();
    let ready_slot = Arc::new(Mutex::new(Some(ready_tx)));
    let weak: Weak<BridgeInner> = Arc::downgrade(&inner);
    let sub = relay.subscribe(move |event| {
        let Some(inner) = weak.upgrade() else { return };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let WireMessage::Bridge(message) = event.message() else {
            return;
        };
        match message {
            BridgeMessage::HandshakeAck(ack)
                if ack.tab_id == inner.tab_id && ack.channel == inner.channel =>
            {
                if let Ok(mut state) = inner.state.write() {
                    *state = ack.state.clone();
                }
                settle_ready(&ready_slot, Ok(()));
            }
            BridgeMessage::HandshakeError(err)
                if err.tab_id == inner.tab_id && err.channel == inner.channel =>
            {
                let refusal = Err((err.code.clone(), err.message.clone()));
                if !settle_ready(&ready_slot, refusal)
                    && err.code == error_codes::DUPLICATE_TAB_ID
                {
                    // Past the handshake: this is an eviction.
                    warn!(tab_id = %inner.tab_id, "evicted: tab id re-registered elsewhere");
                    inner.closed.store(true, Ordering::SeqCst);
                }
            }
            BridgeMessage::Relay(relayed) => {
                let remote = BridgeRemote {
                    inner: Arc::clone(&inner),
                };
                let relayed = relayed.clone();
                tokio::spawn(async move {
                    remote.run_relayed(relayed).await;
                });
            }
            BridgeMessage::StateUpdate(update) if update.channel == inner.channel => {
                if let Ok(mut state) = inner.state.write() {
                    state.insert(update.key.clone(), update.value.clone());
                }
            }
            _ => {}
        }
    });
    if let Ok(mut slot) = inner.dispatch_sub.lock() {
        *slot = Some(sub);
    }

    let handshake = BridgeMessage::Handshake(BridgeHandshake {
        tab_id: inner.tab_id.clone(),
        methods: method_names,
        schema: flat.values.clone(),
        channel: inner.channel.clone(),
    });
    let remote = BridgeRemote { inner };
    if let Err(e) = remote.inner.port.send(Packet::new(handshake), None) {
        remote.close();
        return Err(e.into());
    }

    match ready_rx.await {
        Ok(Ok(())) => Ok(remote),
        Ok(Err((code, message))) => {
            remote.close();
            Err(BridgeError::Handshake { code, message })
        }
        Err(_) => {
            remote.close();
            Err(TransportError::TransportUnavailable.into())
        }
    }
}

/// Deliver the handshake outcome if it is still pending.  Returns false
/// when the handshake already settled.
fn settle_ready(
    slot: &Arc<Mutex<Option<oneshot::Sender<Result<(), (String, String)>>>>>,
    outcome: Result<(), (String, String)>,
) -> bool {
    if let Ok(mut guard) = slot.lock() {
        if let Some(tx) = guard.take() {
            let _ = tx.send(outcome);
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// BridgeRemote
// ---------------------------------------------------------------------------

struct BridgeInner {
    tab_id: String,
    channel: String,
    port: Endpoint,
    methods: Arc<BTreeMap<String, pl_rpc::Method>>,
    /// Local mirror of the relay's dictionary, seeded from the ack and
    /// kept fresh by state-update fan-out.
    state: RwLock<serde_json::Map<String, Value>>,
    dispatch_sub: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

/// The remote a connected tab holds: broadcast via `invoke`, direct-send
/// via `to(tab).invoke`, shared state via `get`/`set`.
#[derive(Clone)]
pub struct BridgeRemote {
    inner: Arc<BridgeInner>,
}

impl BridgeRemote {
    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Broadcast form: run the local handler, fan the call out to every
    /// other tab, return the local result.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.invoke_inner(None, method, args).await
    }

    /// Direct form: same local execution, but the dispatch targets one
    /// tab.
    pub fn to(&self, tab_id: &str) -> DirectRemote {
        DirectRemote {
            remote: self.clone(),
            target: tab_id.to_owned(),
        }
    }

    async fn invoke_inner(
        &self,
        target: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let Some(handler) = inner.methods.get(method).cloned() else {
            return Err(BridgeError::UnknownMethod(method.to_owned()));
        };

        let ctx = CallContext::relayed(Arc::new(self.clone()), None, &inner.channel);
        let outcome = handler
            .invoke(CallArgs::from_values(args.clone()), ctx)
            .await;

        // Dispatch is fire-and-forget; a dead relay port is logged, not
        // surfaced, matching the broadcast failure policy.
        let dispatch = match target {
            None => BridgeMessage::Broadcast(BridgeBroadcast {
                sender: inner.tab_id.clone(),
                channel: inner.channel.clone(),
                method: method.to_owned(),
                args,
                result: outcome.as_ref().ok().map(|p| p.value().clone()),
                error: outcome.as_ref().err().map(ThrownError::to_wire),
            }),
            Some(target) => BridgeMessage::DirectMessage(BridgeDirectMessage {
                sender: inner.tab_id.clone(),
                target: target.to_owned(),
                channel: inner.channel.clone(),
                method: method.to_owned(),
                args,
            }),
        };
        if let Err(e) = inner.port.send(Packet::new(dispatch), None) {
            warn!(error = %e, method, "bridge dispatch failed");
        }

        match outcome {
            Ok(payload) => Ok(payload.into_value()),
            Err(thrown) => Err(BridgeError::Local(thrown)),
        }
    }

    /// Run a relay-delivered invocation; thrown errors are swallowed with
    /// a diagnostic, no acknowledgment goes back.
    async fn run_relayed(&self, relayed: pl_protocol::BridgeRelay) {
        let Some(handler) = self.inner.methods.get(&relayed.method).cloned() else {
            debug!(method = %relayed.method, "relayed invocation for unknown local method");
            return;
        };
        let ctx = CallContext::relayed(
            Arc::new(self.clone()),
            Some(relayed.sender.clone()),
            &self.inner.channel,
        );
        if let Err(err) = handler
            .invoke(CallArgs::from_values(relayed.args), ctx)
            .await
        {
            warn!(method = %relayed.method, sender = %relayed.sender, error = %err,
                "relayed invocation failed");
        }
    }

    /// Read a shared-state key from the local mirror.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .state
            .read()
            .ok()
            .and_then(|state| state.get(key).cloned())
    }

    /// Snapshot of the whole mirror.
    pub fn state(&self) -> serde_json::Map<String, Value> {
        self.inner
            .state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Write a shared-state key: the local mirror updates immediately and
    /// the relay fans the update out to every tab, this one included.
    pub fn set(&self, key: &str, value: Value) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        if let Ok(mut state) = self.inner.state.write() {
            state.insert(key.to_owned(), value.clone());
        }
        self.inner.port.send(
            Packet::new(BridgeMessage::SetState(BridgeSetState {
                channel: self.inner.channel.clone(),
                key: key.to_owned(),
                value,
            })),
            None,
        )?;
        Ok(())
    }

    /// Ask the relay for the current roster.  The reply listener removes
    /// itself on first fire.
    pub async fn connected_tabs(&self) -> Result<Vec<String>, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let expect_channel = self.inner.channel.clone();
        let sub = self.inner.port.subscribe(move |event| {
            if let WireMessage::Bridge(BridgeMessage::TabsResponse(resp)) = event.message() {
                if resp.channel == expect_channel {
                    if let Ok(mut guard) = slot.lock() {
                        if let Some(tx) = guard.take() {
                            let _ = tx.send(resp.tabs.clone());
                        }
                    }
                }
            }
        });
        let request = BridgeMessage::GetTabs(BridgeGetTabs {
            channel: self.inner.channel.clone(),
        });
        if let Err(e) = self.inner.port.send(Packet::new(request), None) {
            self.inner.port.unsubscribe(sub);
            return Err(e.into());
        }
        let tabs = rx.await;
        self.inner.port.unsubscribe(sub);
        tabs.map_err(|_| BridgeError::Closed)
    }

    /// Leave the channel and close the underlying port.  Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let goodbye = BridgeMessage::Disconnect(BridgeDisconnect {
            tab_id: self.inner.tab_id.clone(),
            channel: self.inner.channel.clone(),
        });
        let _ = self.inner.port.send(Packet::new(goodbye), None);
        if let Ok(mut slot) = self.inner.dispatch_sub.lock() {
            if let Some(sub) = slot.take() {
                self.inner.port.unsubscribe(sub);
            }
        }
        self.inner.port.close_port();
    }
}

impl PeerHandle for BridgeRemote {
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
                Err(BridgeError::Local(thrown)) => Err(thrown),
                Err(other) => Err(ThrownError::new(other.to_string())),
            }
        })
    }

    fn read(&self, key: &str) -> Option<Value> {
        self.get(key)
    }

    fn write(
        &self,
        key: &str,
        value: Value,
    ) -> BoxFuture<'static, Result<(), ThrownError>> {
        let remote = self.clone();
        let key = key.to_owned();
        Box::pin(async move {
            remote
                .set(&key, value)
                .map_err(|e| ThrownError::new(e.to_string()))
        })
    }
}

// ---------------------------------------------------------------------------
// DirectRemote
// ---------------------------------------------------------------------------

/// The call form `remote.to("tab-x")`: invocations go to exactly one tab.
pub struct DirectRemote {
    remote: BridgeRemote,
    target: String,
}

impl DirectRemote {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.remote
            .invoke_inner(Some(&self.target), method, args)
            .await
    }
}
