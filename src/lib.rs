// portlink: Promise-style RPC and tab federation over structured-clone
// message ports.
//
// The workspace splits leaves-first: the transport knows nothing of RPC,
// the engine knows nothing of which transport flavor it holds, the bridge
// client reuses the transport, and the relay is a standalone agent
// addressed through one port flavor.  This crate re-exports the public
// surface of the member crates.

pub use pl_protocol as protocol;
pub use pl_transport as transport;

pub use pl_rpc::{
    CallArgs, CallContext, ConnectOptions, Connection, ConnectionRegistry, HostOptions, Payload,
    PeerHandle, Remote, RpcError, Schema, ThrownError, connect, host_connect, with_transfers,
};

pub use pl_client::{BridgeError, BridgeOptions, BridgeRemote, connect as bridge_connect};
pub use pl_relay::{Relay, RelayHandle};
pub use pl_transport::{
    Buffer, Endpoint, EndpointKind, GuestContext, Packet, PortEvent, TransportError, auto_host,
    port_pair, spawn_frame, spawn_thread, spawn_worker,
};
