//! Packets and the two delivery-event shapes.
//!
//! Thread-flavor channels deliver the payload directly; browser-flavor
//! channels wrap it in an event envelope carrying `.origin` and `.source`.
//! `PortEvent::payload` is the normalization point: callers get the inner
//! packet whether the event wraps it or *is* it.

use crate::endpoint::EndpointId;
use pl_protocol::WireMessage;
use std::sync::Mutex;

/// An owned binary transferable.
///
/// Buffers are moved across the boundary, never copied: once a buffer has
/// been attached to an outgoing packet the sender no longer holds it, which
/// is the Rust rendering of a detached `ArrayBuffer`.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer(Vec<u8>);

impl Buffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Buffer(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer(bytes)
    }
}

/// One wire message plus the transfer list riding with it.
///
/// The transfer list is claimable exactly once: event dispatch hands every
/// subscriber a shared reference, and whichever handler matches the message
/// takes ownership of the buffers.
#[derive(Debug)]
pub struct Packet {
    message: WireMessage,
    transfers: Mutex<Option<Vec<Buffer>>>,
}

impl Packet {
    pub fn new(message: impl Into<WireMessage>) -> Self {
        Packet {
            message: message.into(),
            transfers: Mutex::new(None),
        }
    }

    pub fn with_transfers(message: impl Into<WireMessage>, transfers: Vec<Buffer>) -> Self {
        Packet {
            message: message.into(),
            transfers: Mutex::new(if transfers.is_empty() {
                None
            } else {
                Some(transfers)
            }),
        }
    }

    pub fn message(&self) -> &WireMessage {
        &self.message
    }

    /// Claim the transfer list.  Returns an empty vec on the second and
    /// later calls.
    pub fn take_transfers(&self) -> Vec<Buffer> {
        self.transfers
            .lock()
            .expect("transfer lock poisoned")
            .take()
            .unwrap_or_default()
    }
}

/// A delivered message event, in one of the two channel-flavor shapes.
#[derive(Debug)]
pub enum PortEvent {
    /// Thread-flavor delivery: the payload arrives directly.
    Bare(Packet),
    /// Browser-flavor delivery: the payload arrives wrapped with the
    /// sending context's origin and window identity.
    Enveloped {
        data: Packet,
        origin: Option<String>,
        source: EndpointId,
    },
}

impl PortEvent {
    /// The inner payload, whether the event wraps it or is it.
    pub fn payload(&self) -> &Packet {
        match self {
            PortEvent::Bare(p) => p,
            PortEvent::Enveloped { data, .. } => data,
        }
    }

    pub fn message(&self) -> &WireMessage {
        self.payload().message()
    }

    /// The sending context's origin; `None` for bare events and for
    /// contexts with no origin (workers, plain ports).
    pub fn origin(&self) -> Option<&str> {
        match self {
            PortEvent::Bare(_) => None,
            PortEvent::Enveloped { origin, .. } => origin.as_deref(),
        }
    }

    /// The sending context's window identity, when the event carries one.
    pub fn source(&self) -> Option<EndpointId> {
        match self {
            PortEvent::Bare(_) => None,
            PortEvent::Enveloped { source, .. } => Some(*source),
        }
    }
}
