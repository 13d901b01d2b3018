//! Guest contexts and spawn helpers.
//!
//! Transport creation is the caller's business in general; these helpers
//! cover the common case of launching an isolated guest body and handing
//! each side its endpoint.  A guest body receives a [`GuestContext`] from
//! which [`auto_host`] resolves the parent endpoint.

use crate::TransportError;
use crate::endpoint::{ContextSpec, DeliveryStyle, Endpoint, EndpointKind, linked_pair};
use crate::origin::normalize_origin;
use std::future::Future;

/// What a spawned guest knows about where it is running.
#[derive(Debug, Clone)]
pub struct GuestContext {
    host: Endpoint,
}

impl GuestContext {
    /// The guest's handle to its parent.
    pub fn host(&self) -> Endpoint {
        self.host.clone()
    }
}

/// Resolve the parent endpoint for a guest that did not pass an explicit
/// host override.  Fails with *NoHost* outside any guest context.
pub fn auto_host(ctx: Option<&GuestContext>) -> Result<Endpoint, TransportError> {
    ctx.map(GuestContext::host).ok_or(TransportError::NoHost)
}

/// A plain message-port pair (shared-relay flavor): enveloped delivery,
/// no origin on either side.
pub fn port_pair() -> (Endpoint, Endpoint) {
    let spec = ContextSpec {
        origin: None,
        delivery: DeliveryStyle::Enveloped,
    };
    linked_pair(
        spec.clone(),
        EndpointKind::Port,
        spec,
        EndpointKind::Port,
    )
}

/// Spawn a worker guest.  Returns the host's endpoint, which supports
/// `terminate()`.
pub fn spawn_worker<F, Fut>(body: F) -> Endpoint
where
    F: FnOnce(GuestContext) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let spec = ContextSpec {
        origin: None,
        delivery: DeliveryStyle::Enveloped,
    };
    let (host_view, guest_view) = linked_pair(
        spec.clone(),
        EndpointKind::Worker,
        spec,
        EndpointKind::Worker,
    );
    let ctx = GuestContext { host: guest_view };
    let handle = tokio::spawn(body(ctx));
    host_view.set_guest_body(handle);
    host_view
}

/// Spawn a thread-style guest (callback subscription, payload-direct
/// events on both sides).
pub fn spawn_thread<F, Fut>(body: F) -> Endpoint
where
    F: FnOnce(GuestContext) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let spec = ContextSpec {
        origin: None,
        delivery: DeliveryStyle::Bare,
    };
    let (host_view, guest_view) = linked_pair(
        spec.clone(),
        EndpointKind::Thread,
        spec,
        EndpointKind::Thread,
    );
    let ctx = GuestContext { host: guest_view };
    let handle = tokio::spawn(body(ctx));
    host_view.set_guest_body(handle);
    host_view
}

/// Spawn a frame guest whose actual origin is derived from its source URL
/// (the well-behaved case).
pub fn spawn_frame<F, Fut>(source_url: &str, body: F) -> Endpoint
where
    F: FnOnce(GuestContext) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let actual = normalize_origin(source_url);
    spawn_frame_from(Some(source_url), actual, body)
}

/// Spawn a frame guest with the declared source URL and the actual
/// serving origin specified independently.  The two differ only when the
/// content was substituted out from under the host, exactly the case the
/// frame origin check exists to reject.
pub fn spawn_frame_from<F, Fut>(
    source_url: Option<&str>,
    actual_origin: Option<String>,
    body: F,
) -> Endpoint
where
    F: FnOnce(GuestContext) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (host_view, guest_view) = linked_pair(
        ContextSpec {
            origin: None,
            delivery: DeliveryStyle::Enveloped,
        },
        EndpointKind::Frame {
            source_url: source_url.map(ToOwned::to_owned),
        },
        ContextSpec {
            origin: actual_origin,
            delivery: DeliveryStyle::Enveloped,
        },
        // The guest's handle to its parent window: no declared source, so
        // guest-side validation passes trivially.
        EndpointKind::Frame { source_url: None },
    );
    let ctx = GuestContext { host: guest_view };
    let handle = tokio::spawn(body(ctx));
    host_view.set_guest_body(handle);
    host_view
}
