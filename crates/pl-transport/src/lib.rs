// pl-transport: One uniform send/listen surface over the message-channel
// flavors the engine runs on.
//
// The flavors differ in two observable ways: how events are delivered
// (payload-direct vs wrapped in an envelope carrying `.origin`/`.source`)
// and which security checks apply (frames are origin-checked, workers are
// trusted by isolation).  Everything above this crate sees only `Endpoint`,
// `Packet`, and `PortEvent`.

pub mod endpoint;
pub mod event;
pub mod guest;
pub mod origin;

pub use endpoint::{
    ContextSpec, DeliveryStyle, Endpoint, EndpointId, EndpointKind, Subscription, linked_pair,
};
pub use event::{Buffer, Packet, PortEvent};
pub use guest::{
    GuestContext, auto_host, port_pair, spawn_frame, spawn_frame_from, spawn_thread, spawn_worker,
};
pub use origin::normalize_origin;

/// Errors raised at the transport seam.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint has no viable send primitive (its channel is gone or
    /// the port was closed).
    #[error("no viable send primitive for endpoint")]
    TransportUnavailable,
    /// A guest asked for its parent endpoint outside any guest context.
    #[error("no host endpoint detected")]
    NoHost,
}
