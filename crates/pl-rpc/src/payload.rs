//! Transfer envelopes.
//!
//! A return value (or argument list) nominates sub-objects to be moved
//! rather than copied by building an explicit envelope: `with_transfers`
//! hands the builder a `TransferList` whose `transfer(buf)` both records
//! the buffer and returns the in-band slot marker to splice into any
//! position of the value shape.  The engine forwards value and buffers
//! together; the receiving side resolves markers back to buffers.

use pl_transport::Buffer;
use serde_json::{Value, json};

/// Key of the in-band slot marker object: `{ "$transfer": <index> }`.
pub const TRANSFER_SLOT_KEY: &str = "$transfer";

/// Read a slot marker, if `value` is one.
pub fn slot_index(value: &Value) -> Option<usize> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(TRANSFER_SLOT_KEY)?.as_u64().map(|n| n as usize)
}

/// Accumulates buffers during envelope construction.
#[derive(Debug, Default)]
pub struct TransferList {
    buffers: Vec<Buffer>,
}

impl TransferList {
    /// Record `buf` for ownership transfer and return its slot marker.
    pub fn transfer(&mut self, buf: impl Into<Buffer>) -> Value {
        let index = self.buffers.len();
        self.buffers.push(buf.into());
        json!({ TRANSFER_SLOT_KEY: index })
    }
}

/// Build a payload whose value may reference transferred buffers.
pub fn with_transfers<F>(build: F) -> Payload
where
    F: FnOnce(&mut TransferList) -> Value,
{
    let mut list = TransferList::default();
    let value = build(&mut list);
    Payload::from_parts(value, list.buffers)
}

/// A value plus the buffers riding with it.
#[derive(Debug)]
pub struct Payload {
    value: Value,
    buffers: Vec<Option<Buffer>>,
}

impl Payload {
    pub fn new(value: Value) -> Self {
        Payload {
            value,
            buffers: Vec::new(),
        }
    }

    pub(crate) fn from_parts(value: Value, buffers: Vec<Buffer>) -> Self {
        Payload {
            value,
            buffers: buffers.into_iter().map(Some).collect(),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn transfer_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    /// Resolve a slot marker to its buffer, removing it from the payload.
    pub fn claim(&mut self, marker: &Value) -> Option<Buffer> {
        let index = slot_index(marker)?;
        self.claim_at(index)
    }

    pub fn claim_at(&mut self, index: usize) -> Option<Buffer> {
        self.buffers.get_mut(index)?.take()
    }

    /// Split into value and wire transfer list.  Claimed slots become
    /// empty buffers so surviving markers keep their indices.
    pub(crate) fn into_parts(self) -> (Value, Vec<Buffer>) {
        let buffers = self
            .buffers
            .into_iter()
            .map(|b| b.unwrap_or_else(|| Buffer::new(Vec::new())))
            .collect();
        (self.value, buffers)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::new(value)
    }
}
