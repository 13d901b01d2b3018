// pl-rpc: The RPC engine -- handshake, proxy synthesis, request/reply
// correlation, error marshaling, and transfer handling.
//
// The engine holds an `Endpoint` and knows nothing about which transport
// flavor is behind it; security decisions (frame origin checks) are asked
// of the endpoint, never re-derived here.

pub mod connection;
pub mod context;
pub mod error;
pub mod handshake;
pub mod payload;
pub mod schema;

pub use connection::{Connection, Remote};
pub use context::{CallContext, PeerHandle};
pub use error::{RpcError, ThrownError};
pub use handshake::{
    ConnectOptions, ConnectionRegistry, HostOptions, SetupHook, connect, host_connect,
};
pub use payload::{Payload, TransferList, slot_index, with_transfers};
pub use schema::{CallArgs, FlatSchema, Method, Schema, value_at};
