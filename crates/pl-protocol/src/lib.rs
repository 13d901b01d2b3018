// pl-protocol: Wire message types and serialization for the port-link protocol.
//
// All messages use a top-level `action` field for discriminated
// deserialization.  The enum variants map 1:1 to the frozen wire tags of the
// RPC and bridge namespaces.  Correlation identifiers (connection id, call
// id, tab id, channel name) always travel inside the envelope, never in
// transport metadata, so the scheme stays transport-agnostic.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Length of every wire-visible identifier (connection, call, tab).
pub const ID_LEN: usize = 10;

/// Channel name used when a bridge client does not supply one.
pub const DEFAULT_CHANNEL: &str = "__default__";

/// Generate a random identifier: `ID_LEN` chars drawn from `[A-Za-z0-9]`.
///
/// Uniqueness is statistical, not guaranteed; hosts reject collisions at
/// connection-registration time.
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Serialized errors
// ---------------------------------------------------------------------------

/// An error marshaled across the wire.
///
/// Carries the message, the capture-time stack, and the thrower's
/// own-enumerable properties.  Nested causes are not preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    pub stack: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, Value>,
}

/// Frozen bridge handshake error codes.
pub mod error_codes {
    pub const DUPLICATE_TAB_ID: &str = "DUPLICATE_TAB_ID";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

// ---------------------------------------------------------------------------
// RPC namespace: handshake and calls
// ---------------------------------------------------------------------------

/// Guest -> host: opening message of the two-phase handshake.
///
/// Advertises the guest's flattened method names and its schema with the
/// functions already stripped (data leaves only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub methods: Vec<String>,
    pub schema: Value,
}

/// Both replies of the handshake share this shape.
///
/// Reply 1 (host -> guest) carries the host-generated `connection_id`
/// together with the host's methods and stripped schema.  Reply 2
/// (guest -> host) is the bare confirmation: `connection_id` only.  The
/// host must not issue requests until reply 2 arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// One outbound call.  `args` may contain transfer-slot markers whose
/// buffers ride the packet's transfer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub connection_id: String,
    pub call_id: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Successful reply, correlated by (connection id, call id, method).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResolve {
    pub connection_id: String,
    pub call_id: String,
    pub method: String,
    pub result: Value,
}

/// Failed reply carrying the serialized error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReject {
    pub connection_id: String,
    pub call_id: String,
    pub method: String,
    pub error: WireError,
}

/// All RPC-namespace message kinds.
///
/// ```json
/// { "action": "RPC_REQUEST", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum RpcMessage {
    #[serde(rename = "HANDSHAKE_REQUEST")]
    HandshakeRequest(HandshakeRequest),
    #[serde(rename = "HANDSHAKE_REPLY")]
    HandshakeReply(HandshakeReply),
    #[serde(rename = "RPC_REQUEST")]
    Request(RpcRequest),
    #[serde(rename = "RPC_RESOLVE")]
    Resolve(RpcResolve),
    #[serde(rename = "RPC_REJECT")]
    Reject(RpcReject),
}

// ---------------------------------------------------------------------------
// Bridge namespace: tab federation through the relay
// ---------------------------------------------------------------------------

/// Tab -> relay: join a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeHandshake {
    pub tab_id: String,
    pub methods: Vec<String>,
    pub schema: Value,
    pub channel: String,
}

/// Relay -> tab: registration accepted.  `state` is a snapshot of the
/// channel's shared-state dictionary at join time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeHandshakeAck {
    pub tab_id: String,
    pub channel: String,
    pub state: serde_json::Map<String, Value>,
}

/// Relay -> tab: registration problem.  Sent to the *evicted* holder on a
/// duplicate tab id; the new registrant proceeds normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeHandshakeError {
    /// One of the frozen codes in [`error_codes`].
    pub code: String,
    pub message: String,
    pub tab_id: String,
    pub channel: String,
}

/// Tab -> relay: fan this call out to every other tab on the channel.
///
/// `result`/`error` mirror the sender's own local execution so peers may
/// observe its outcome; they do not affect routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeBroadcast {
    pub sender: String,
    pub channel: String,
    pub method: String,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Tab -> relay: deliver this call to exactly one tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeDirectMessage {
    pub sender: String,
    pub target: String,
    pub channel: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Relay -> tab: a broadcast or direct call delivered to this tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRelay {
    pub sender: String,
    pub method: String,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Tab -> relay: leave the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeDisconnect {
    pub tab_id: String,
    pub channel: String,
}

/// Tab -> relay: request a shared-state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeGetState {
    pub channel: String,
}

/// Relay -> tab: fresh shared-state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeStateResponse {
    pub channel: String,
    pub state: serde_json::Map<String, Value>,
}

/// Tab -> relay: write one shared-state key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSetState {
    pub channel: String,
    pub key: String,
    pub value: Value,
}

/// Relay -> every tab on the channel (sender included): one key changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeStateUpdate {
    pub channel: String,
    pub key: String,
    pub value: Value,
}

/// Tab -> relay: request the channel roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeGetTabs {
    pub channel: String,
}

/// Relay -> tab: current roster, senders included, in registration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTabsResponse {
    pub channel: String,
    pub tabs: Vec<String>,
}

/// All bridge-namespace message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum BridgeMessage {
    #[serde(rename = "BRIDGE_HANDSHAKE")]
    Handshake(BridgeHandshake),
    #[serde(rename = "BRIDGE_HANDSHAKE_ACK")]
    HandshakeAck(BridgeHandshakeAck),
    #[serde(rename = "BRIDGE_HANDSHAKE_ERROR")]
    HandshakeError(BridgeHandshakeError),
    #[serde(rename = "BRIDGE_BROADCAST")]
    Broadcast(BridgeBroadcast),
    #[serde(rename = "BRIDGE_DIRECT_MESSAGE")]
    DirectMessage(BridgeDirectMessage),
    #[serde(rename = "BRIDGE_RELAY")]
    Relay(BridgeRelay),
    #[serde(rename = "BRIDGE_DISCONNECT")]
    Disconnect(BridgeDisconnect),
    #[serde(rename = "BRIDGE_GET_STATE")]
    GetState(BridgeGetState),
    #[serde(rename = "BRIDGE_STATE_RESPONSE")]
    StateResponse(BridgeStateResponse),
    #[serde(rename = "BRIDGE_SET_STATE")]
    SetState(BridgeSetState),
    #[serde(rename = "BRIDGE_STATE_UPDATE")]
    StateUpdate(BridgeStateUpdate),
    #[serde(rename = "BRIDGE_GET_TABS")]
    GetTabs(BridgeGetTabs),
    #[serde(rename = "BRIDGE_TABS_RESPONSE")]
    TabsResponse(BridgeTabsResponse),
}

// ---------------------------------------------------------------------------
// Top-level union
// ---------------------------------------------------------------------------

/// Any wire message.  The inner enums are internally tagged on `action`, so
/// the serialized shape is flat; deserialization tries the RPC namespace
/// first, then the bridge namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Rpc(RpcMessage),
    Bridge(BridgeMessage),
}

impl From<RpcMessage> for WireMessage {
    fn from(m: RpcMessage) -> Self {
        WireMessage::Rpc(m)
    }
}

impl From<BridgeMessage> for WireMessage {
    fn from(m: BridgeMessage) -> Self {
        WireMessage::Bridge(m)
    }
}

impl WireMessage {
    /// The message's wire tag, for diagnostics.
    pub fn action(&self) -> &'static str {
        match self {
            WireMessage::Rpc(m) => match m {
                RpcMessage::HandshakeRequest(_) => "HANDSHAKE_REQUEST",
                RpcMessage::HandshakeReply(_) => "HANDSHAKE_REPLY",
                RpcMessage::Request(_) => "RPC_REQUEST",
                RpcMessage::Resolve(_) => "RPC_RESOLVE",
                RpcMessage::Reject(_) => "RPC_REJECT",
            },
            WireMessage::Bridge(m) => match m {
                BridgeMessage::Handshake(_) => "BRIDGE_HANDSHAKE",
                BridgeMessage::HandshakeAck(_) => "BRIDGE_HANDSHAKE_ACK",
                BridgeMessage::HandshakeError(_) => "BRIDGE_HANDSHAKE_ERROR",
                BridgeMessage::Broadcast(_) => "BRIDGE_BROADCAST",
                BridgeMessage::DirectMessage(_) => "BRIDGE_DIRECT_MESSAGE",
                BridgeMessage::Relay(_) => "BRIDGE_RELAY",
                BridgeMessage::Disconnect(_) => "BRIDGE_DISCONNECT",
                BridgeMessage::GetState(_) => "BRIDGE_GET_STATE",
                BridgeMessage::StateResponse(_) => "BRIDGE_STATE_RESPONSE",
                BridgeMessage::SetState(_) => "BRIDGE_SET_STATE",
                BridgeMessage::StateUpdate(_) => "BRIDGE_STATE_UPDATE",
                BridgeMessage::GetTabs(_) => "BRIDGE_GET_TABS",
                BridgeMessage::TabsResponse(_) => "BRIDGE_TABS_RESPONSE",
            },
        }
    }
}
