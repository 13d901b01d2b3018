//! The relay task and its per-channel state.
//!
//! Channel lifecycle: the first handshake creates the channel and seeds
//! its shared state from the joining tab's declared schema; later joins
//! never re-seed.  When the last tab leaves (explicit disconnect, forced
//! eviction, or a dead port discovered during fan-out) the channel and
//! its dictionary are dropped.

use pl_protocol::{
    error_codes, BridgeBroadcast, BridgeDirectMessage, BridgeDisconnect, BridgeGetState,
    BridgeGetTabs, BridgeHandshake, BridgeHandshakeAck, BridgeHandshakeError, BridgeMessage,
    BridgeRelay, BridgeSetState, BridgeStateResponse, BridgeStateUpdate, BridgeTabsResponse,
    WireMessage,
};
use pl_transport::{port_pair, Endpoint, Packet, PortEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct Inbound {
    port: Endpoint,
    event: Arc<PortEvent>,
}

/// Client-facing handle to a spawned relay.
#[derive(Clone)]
pub struct RelayHandle {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RelayHandle {
    /// Open a fresh port pair to the relay and return the tab side.
    pub fn connect(&self) -> Endpoint {
        let (relay_side, tab_side) = port_pair();
        let tx = self.inbound_tx.clone();
        let port = relay_side.clone();
        relay_side.subscribe(move |event| {
            let _ = tx.send(Inbound {
                port: port.clone(),
                event,
            });
        });
        tab_side
    }

    /// Stop the relay task.  Connected ports go dead; tabs observe
    /// *TransportUnavailable* on their next send.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// The relay service itself.
pub struct Relay;

impl Relay {
    /// Spawn the long-lived routing task and return its handle.
    pub fn spawn() -> RelayHandle {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(inbound_rx));
        info!("relay started");
        RelayHandle {
            inbound_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

async fn run(mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    let mut state = RelayState::default();
    while let Some(Inbound { port, event }) = inbound.recv().await {
        // Unknown actions (including the whole RPC namespace) are ignored.
        let WireMessage::Bridge(message) = event.message() else {
            continue;
        };
        state.handle(message.clone(), &port);
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct TabEntry {
    tab_id: String,
    port: Endpoint,
    #[allow(dead_code)]
    methods: Vec<String>,
}

struct ChannelState {
    /// Registration order is preserved; tab ids are unique per channel.
    tabs: Vec<TabEntry>,
    state: serde_json::Map<String, Value>,
}

#[derive(Default)]
struct RelayState {
    channels: HashMap<String, ChannelState>,
}

fn send_to(port: &Endpoint, message: BridgeMessage) -> bool {
    port.send(Packet::new(message), None).is_ok()
}

impl RelayState {
    fn handle(&mut self, message: BridgeMessage, port: &Endpoint) {
        match message {
            BridgeMessage::Handshake(hs) => self.on_handshake(hs, port),
            BridgeMessage::Broadcast(b) => self.on_broadcast(&b),
            BridgeMessage::DirectMessage(d) => self.on_direct(&d),
            BridgeMessage::GetState(g) => self.on_get_state(&g, port),
            BridgeMessage::SetState(s) => self.on_set_state(s),
            BridgeMessage::GetTabs(g) => self.on_get_tabs(&g, port),
            BridgeMessage::Disconnect(d) => self.on_disconnect(&d),
            // Relay-originated tags arriving here are noise.
            BridgeMessage::HandshakeAck(_)
            | BridgeMessage::HandshakeError(_)
            | BridgeMessage::Relay(_)
            | BridgeMessage::StateResponse(_)
            | BridgeMessage::StateUpdate(_)
            | BridgeMessage::TabsResponse(_) => {}
        }
    }

    fn on_handshake(&mut self, hs: BridgeHandshake, port: &Endpoint) {
        if hs.tab_id.is_empty() || hs.channel.is_empty() {
            send_to(
                port,
                BridgeMessage::HandshakeError(BridgeHandshakeError {
                    code: error_codes::INVALID_PAYLOAD.to_owned(),
                    message: "tab id and channel must be non-empty".to_owned(),
                    tab_id: hs.tab_id,
                    channel: hs.channel,
                }),
            );
            return;
        }

        let channel = self
            .channels
            .entry(hs.channel.clone())
            .or_insert_with(|| ChannelState {
                tabs: Vec::new(),
                // First tab to join seeds the dictionary; later schemas
                // are not merged.
                state: seed_state(&hs.schema),
            });

        // A duplicate registration evicts the previous holder.
        if let Some(pos) = channel.tabs.iter().position(|t| t.tab_id == hs.tab_id) {
            let old = channel.tabs.remove(pos);
            warn!(tab_id = %hs.tab_id, channel = %hs.channel, "duplicate tab id: evicting previous holder");
            send_to(
                &old.port,
                BridgeMessage::HandshakeError(BridgeHandshakeError {
                    code: error_codes::DUPLICATE_TAB_ID.to_owned(),
                    message: format!("tab id {} re-registered on channel {}", hs.tab_id, hs.channel),
                    tab_id: hs.tab_id.clone(),
                    channel: hs.channel.clone(),
                }),
            );
            old.port.close_port();
        }

        channel.tabs.push(TabEntry {
            tab_id: hs.tab_id.clone(),
            port: port.clone(),
            methods: hs.methods,
        });
        let snapshot = channel.state.clone();
        send_to(
            port,
            BridgeMessage::HandshakeAck(BridgeHandshakeAck {
                tab_id: hs.tab_id,
                channel: hs.channel,
                state: snapshot,
            }),
        );
    }

    fn on_broadcast(&mut self, b: &BridgeBroadcast) {
        let Some(channel) = self.channels.get_mut(&b.channel) else {
            return;
        };
        let mut dead: Vec<String> = Vec::new();
        for tab in channel.tabs.iter().filter(|t| t.tab_id != b.sender) {
            let delivered = send_to(
                &tab.port,
                BridgeMessage::Relay(BridgeRelay {
                    sender: b.sender.clone(),
                    method: b.method.clone(),
                    args: b.args.clone(),
                    result: b.result.clone(),
                    error: b.error.clone(),
                }),
            );
            if !delivered {
                // One dead consumer must not abort delivery to the rest.
                warn!(tab_id = %tab.tab_id, channel = %b.channel, "broadcast delivery failed; pruning tab");
                dead.push(tab.tab_id.clone());
            }
        }
        self.prune(&b.channel, &dead);
    }

    fn on_direct(&mut self, d: &BridgeDirectMessage) {
        let Some(channel) = self.channels.get(&d.channel) else {
            return;
        };
        let Some(target) = channel.tabs.iter().find(|t| t.tab_id == d.target) else {
            // Absent target: dropped, no negative acknowledgment.
            debug!(target = %d.target, channel = %d.channel, "direct message to unknown tab dropped");
            return;
        };
        let delivered = send_to(
            &target.port,
            BridgeMessage::Relay(BridgeRelay {
                sender: d.sender.clone(),
                method: d.method.clone(),
                args: d.args.clone(),
                result: None,
                error: None,
            }),
        );
        if !delivered {
            let dead = vec![d.target.clone()];
            self.prune(&d.channel, &dead);
        }
    }

    fn on_get_state(&self, g: &BridgeGetState, port: &Endpoint) {
        let snapshot = self
            .channels
            .get(&g.channel)
            .map(|c| c.state.clone())
            .unwrap_or_default();
        send_to(
            port,
            BridgeMessage::StateResponse(BridgeStateResponse {
                channel: g.channel.clone(),
                state: snapshot,
            }),
        );
    }

    fn on_set_state(&mut self, s: BridgeSetState) {
        let Some(channel) = self.channels.get_mut(&s.channel) else {
            return;
        };
        channel.state.insert(s.key.clone(), s.value.clone());
        let mut dead: Vec<String> = Vec::new();
        // The update fans out to every tab, the writer included, so all
        // mirrors converge through the same serialized stream.
        for tab in &channel.tabs {
            let delivered = send_to(
                &tab.port,
                BridgeMessage::StateUpdate(BridgeStateUpdate {
                    channel: s.channel.clone(),
                    key: s.key.clone(),
                    value: s.value.clone(),
                }),
            );
            if !delivered {
                warn!(tab_id = %tab.tab_id, channel = %s.channel, "state update delivery failed; pruning tab");
                dead.push(tab.tab_id.clone());
            }
        }
        self.prune(&s.channel, &dead);
    }

    fn on_get_tabs(&self, g: &BridgeGetTabs, port: &Endpoint) {
        let tabs = self
            .channels
            .get(&g.channel)
            .map(|c| c.tabs.iter().map(|t| t.tab_id.clone()).collect())
            .unwrap_or_default();
        send_to(
            port,
            BridgeMessage::TabsResponse(BridgeTabsResponse {
                channel: g.channel.clone(),
                tabs,
            }),
        );
    }

    fn on_disconnect(&mut self, d: &BridgeDisconnect) {
        let dead = vec![d.tab_id.clone()];
        self.prune(&d.channel, &dead);
    }

    /// Remove the named tabs; drop the channel when the roster empties.
    fn prune(&mut self, channel_name: &str, tab_ids: &[String]) {
        if tab_ids.is_empty() {
            return;
        }
        let Some(channel) = self.channels.get_mut(channel_name) else {
            return;
        };
        channel.tabs.retain(|t| !tab_ids.contains(&t.tab_id));
        if channel.tabs.is_empty() {
            self.channels.remove(channel_name);
            debug!(channel = %channel_name, "last tab left; channel dropped");
        }
    }
}

/// Seed a channel dictionary from a joining tab's stripped schema: the
/// top-level object entries become the shared keys.
fn seed_state(schema: &Value) -> serde_json::Map<String, Value> {
    schema.as_object().cloned().unwrap_or_default()
}
