//! The endpoint handle and the duplex link primitive.
//!
//! An `Endpoint` is one side's handle to "the other side": it sends into
//! the peer context's inbox and it dispatches events arriving from the
//! peer to its subscribers.  The flavor is a tagged union fixed at link
//! construction, never sniffed at dispatch time.

use crate::TransportError;
use crate::event::{Packet, PortEvent};
use crate::origin::normalize_origin;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Process-internal identity of one context ("window") on a link.  Never
/// travels on the wire; used for frame source checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(Uuid);

impl EndpointId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        EndpointId(Uuid::new_v4())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Flavor tags
// ---------------------------------------------------------------------------

/// Classification of the peer this handle points at, set at construction.
#[derive(Debug, Clone)]
pub enum EndpointKind {
    /// A spawned worker.  Trusted by isolation; supports termination.
    Worker,
    /// A frame with an optionally declared source URL.  Messages from it
    /// are origin/source-checked against the declaration.
    Frame { source_url: Option<String> },
    /// A thread-style port (callback subscription, payload-direct events).
    Thread,
    /// A browser-style message port (listener subscription, enveloped
    /// events, no meaningful origin).
    Port,
}

/// How events are delivered *to* a context, and what identity its sends
/// carry.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    /// The context's actual origin, stamped on enveloped events it emits.
    pub origin: Option<String>,
    /// Shape of events delivered to this context.
    pub delivery: DeliveryStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStyle {
    /// Payload-direct (thread flavor).
    Bare,
    /// Wrapped with `.origin`/`.source` (browser flavor).
    Enveloped,
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

type SubscriberFn = dyn Fn(Arc<PortEvent>) + Send + Sync;
type SubscriberMap = Arc<Mutex<BTreeMap<u64, Arc<SubscriberFn>>>>;

/// Handle to a subscriber registration; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

struct EndpointInner {
    kind: EndpointKind,
    /// Real window identity of the peer context (what `event.source` must
    /// equal for a valid frame message).
    peer_window: EndpointId,
    /// The peer context's actual origin, checked against an explicit
    /// target-origin on send.
    peer_origin: Option<String>,
    /// Identity stamped on events this side emits.
    local_window: EndpointId,
    local_origin: Option<String>,
    /// Delivery shape of the peer context.
    peer_delivery: DeliveryStyle,
    outbound: mpsc::UnboundedSender<PortEvent>,
    subscribers: SubscriberMap,
    /// Wakes the pump when a subscriber arrives, so events buffered
    /// before the first listener are flushed in order.
    drain: Arc<Notify>,
    next_sub: AtomicU64,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Body task of a spawned guest; present only on host-created
    /// worker/thread endpoints.
    guest_body: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

/// One side's handle to a duplex structured-clone link.  Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.inner.kind)
            .field("peer_window", &self.inner.peer_window)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub fn kind(&self) -> &EndpointKind {
        &self.inner.kind
    }

    /// The peer context's window identity (a frame handle's content
    /// window).
    pub fn content_window(&self) -> EndpointId {
        self.inner.peer_window
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dispatch a packet to the peer, shaped for its delivery flavor.
    ///
    /// `target_origin` applies to frame sends only: anything other than
    /// `"*"` must equal the peer's actual origin or the message is dropped
    /// with a warning, never delivered and never surfaced to the peer.
    pub fn send(&self, packet: Packet, target_origin: Option<&str>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::TransportUnavailable);
        }
        if let EndpointKind::Frame { .. } = self.inner.kind {
            if let Some(target) = target_origin {
                if target != "*" && self.inner.peer_origin.as_deref() != Some(target) {
                    warn!(
                        target_origin = target,
                        "frame send dropped: target origin does not match"
                    );
                    return Ok(());
                }
            }
        }
        let event = match self.inner.peer_delivery {
            DeliveryStyle::Bare => PortEvent::Bare(packet),
            DeliveryStyle::Enveloped => PortEvent::Enveloped {
                data: packet,
                origin: self.inner.local_origin.clone(),
                source: self.inner.local_window,
            },
        };
        self.inner
            .outbound
            .send(event)
            .map_err(|_| TransportError::TransportUnavailable)
    }

    /// Register a handler for events arriving from the peer.  Handlers run
    /// on the link's pump task in registration order.  Events that arrived
    /// while no handler was registered are buffered and flushed to the
    /// first one, in send order.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Arc<PortEvent>) + Send + Sync + 'static,
    {
        let id = self.inner.next_sub.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry lock")
            .insert(id, Arc::new(handler));
        self.inner.drain.notify_one();
        Subscription(id)
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry lock")
            .remove(&sub.0);
    }

    /// For frame endpoints, the normalized origin of the declared source
    /// URL; `None` for every other flavor and for undeclared sources.
    pub fn origin_of(&self) -> Option<String> {
        match &self.inner.kind {
            EndpointKind::Frame {
                source_url: Some(url),
            } => normalize_origin(url),
            _ => None,
        }
    }

    /// Frame security check.  Worker/thread/port flavors are trusted by
    /// isolation.  A frame with a declared source requires the event's
    /// origin to equal the declared origin and its source to equal the
    /// frame's content window; a frame with no declared source passes
    /// trivially.
    pub fn is_valid_frame_message(&self, event: &PortEvent) -> bool {
        match &self.inner.kind {
            EndpointKind::Frame {
                source_url: Some(_),
            } => {
                event.origin() == self.origin_of().as_deref()
                    && event.source() == Some(self.inner.peer_window)
            }
            _ => true,
        }
    }

    /// Stop this port: further sends fail with *TransportUnavailable*, no
    /// further events are dispatched, and all subscribers are released.
    /// Idempotent.
    pub fn close_port(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pump) = self.inner.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        self.inner
            .subscribers
            .lock()
            .expect("subscriber registry lock")
            .clear();
    }

    /// Terminate a spawned guest body (host-created worker/thread
    /// endpoints only); a no-op for other flavors.  Closes the port too.
    pub fn terminate(&self) {
        if let Ok(mut body) = self.inner.guest_body.lock() {
            if let Some(handle) = body.take() {
                handle.abort();
            }
        }
        self.close_port();
    }

    pub(crate) fn set_guest_body(&self, handle: JoinHandle<()>) {
        if let Ok(mut body) = self.inner.guest_body.lock() {
            *body = Some(handle);
        }
    }
}

// ---------------------------------------------------------------------------
// Link construction
// ---------------------------------------------------------------------------

/// Build one duplex link between two contexts.
///
/// Returns `(held_by_a, held_by_b)`: the first endpoint lives in context
/// `a` and targets `b` (classified by `a_view_of_b`), the second is the
/// mirror image.  Each side gets its own pump task delivering inbound
/// events to its subscribers in send order.
pub fn linked_pair(
    a: ContextSpec,
    a_view_of_b: EndpointKind,
    b: ContextSpec,
    b_view_of_a: EndpointKind,
) -> (Endpoint, Endpoint) {
    let a_window = EndpointId::new();
    let b_window = EndpointId::new();
    let (tx_ab, rx_ab) = mpsc::unbounded_channel::<PortEvent>();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel::<PortEvent>();

    let held_by_a = build_side(
        a_view_of_b,
        b_window,
        b.origin.clone(),
        a_window,
        a.origin.clone(),
        b.delivery,
        tx_ab,
        rx_ba,
    );
    let held_by_b = build_side(
        b_view_of_a,
        a_window,
        a.origin,
        b_window,
        b.origin,
        a.delivery,
        tx_ba,
        rx_ab,
    );
    (held_by_a, held_by_b)
}

#[allow(clippy::too_many_arguments)]
fn build_side(
    kind: EndpointKind,
    peer_window: EndpointId,
    peer_origin: Option<String>,
    local_window: EndpointId,
    local_origin: Option<String>,
    peer_delivery: DeliveryStyle,
    outbound: mpsc::UnboundedSender<PortEvent>,
    mut inbound: mpsc::UnboundedReceiver<PortEvent>,
) -> Endpoint {
    let subscribers: SubscriberMap = Arc::new(Mutex::new(BTreeMap::new()));
    let drain = Arc::new(Notify::new());
    let registry = Arc::clone(&subscribers);
    let drain_signal = Arc::clone(&drain);
    let pump = tokio::spawn(async move {
        // Events buffered until a listener exists, port-start style.
        let mut backlog: VecDeque<Arc<PortEvent>> = VecDeque::new();
        loop {
            loop {
                let handlers: Vec<Arc<SubscriberFn>> = match registry.lock() {
                    Ok(map) => map.values().cloned().collect(),
                    Err(_) => return,
                };
                if handlers.is_empty() {
                    break;
                }
                let Some(event) = backlog.pop_front() else {
                    break;
                };
                for handler in &handlers {
                    handler(Arc::clone(&event));
                }
            }
            tokio::select! {
                received = inbound.recv() => match received {
                    Some(event) => backlog.push_back(Arc::new(event)),
                    None => return,
                },
                () = drain_signal.notified() => {}
            }
        }
    });
    Endpoint {
        inner: Arc::new(EndpointInner {
            kind,
            peer_window,
            peer_origin,
            local_window,
            local_origin,
            peer_delivery,
            outbound,
            subscribers,
            drain,
            next_sub: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
            guest_body: Mutex::new(None),
        }),
    }
}
