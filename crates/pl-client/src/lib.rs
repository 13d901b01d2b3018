// pl-client: The tab-side bridge layer.
//
// A connected tab holds a `BridgeRemote`: calls on it broadcast to the
// channel (after running the tab's own handler locally), `to(tab)` scopes
// a call to one peer, and the relay's shared-state dictionary is mirrored
// into a local cache kept fresh by state-update fan-out.

pub mod client;

pub use client::{BridgeError, BridgeOptions, BridgeRemote, DirectRemote, connect};
