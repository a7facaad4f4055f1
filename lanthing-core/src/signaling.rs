//! Signaling rendezvous client (and the reference relay it talks to).
//!
//! The core only relies on the message semantics: a client joins a room
//! and gets a `JoinRoomAck`; afterwards `{from, to, key, value}` tuples
//! are relayed transparently and in order per (sender, receiver) pair,
//! with a periodic keep-alive toward the server. The wire codec here is
//! one concrete rendezvous implementation; any server honoring the
//! semantics can replace it. The in-tree relay server exists for tests
//! and LAN deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LtError;
use crate::pipe::{LtCodec, WireMessage};

/// Keep-alive cadence toward the signaling server.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Peers per room: one host, one client.
const ROOM_CAPACITY: usize = 2;

// ── Wire messages ────────────────────────────────────────────────

const TYPE_JOIN_ROOM: u32 = 0x1001;
const TYPE_JOIN_ROOM_ACK: u32 = 0x1002;
const TYPE_RELAY: u32 = 0x1003;
const TYPE_KEEP_ALIVE: u32 = 0x1004;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
    pub room_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoomAck {
    pub ok: bool,
    pub err: Option<String>,
}

/// An opaque tuple relayed between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub from: String,
    pub to: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
enum SigWire {
    Join(JoinRoom),
    JoinAck(JoinRoomAck),
    Relay(RelayMessage),
    KeepAlive,
}

impl SigWire {
    fn encode(&self) -> Result<WireMessage, LtError> {
        let (type_id, payload) = match self {
            SigWire::Join(p) => (TYPE_JOIN_ROOM, bincode::serialize(p)?),
            SigWire::JoinAck(p) => (TYPE_JOIN_ROOM_ACK, bincode::serialize(p)?),
            SigWire::Relay(p) => (TYPE_RELAY, bincode::serialize(p)?),
            SigWire::KeepAlive => (TYPE_KEEP_ALIVE, Vec::new()),
        };
        Ok(WireMessage { type_id, payload })
    }

    fn decode(msg: &WireMessage) -> Result<Self, LtError> {
        Ok(match msg.type_id {
            TYPE_JOIN_ROOM => SigWire::Join(bincode::deserialize(&msg.payload)?),
            TYPE_JOIN_ROOM_ACK => SigWire::JoinAck(bincode::deserialize(&msg.payload)?),
            TYPE_RELAY => SigWire::Relay(bincode::deserialize(&msg.payload)?),
            TYPE_KEEP_ALIVE => SigWire::KeepAlive,
            other => {
                return Err(LtError::UnknownVariant {
                    type_name: "SigWire",
                    value: other as u64,
                })
            }
        })
    }
}

// ── SignalingClient ──────────────────────────────────────────────

/// What the session hears from the signaling side.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    JoinAck(JoinRoomAck),
    Message { from: String, key: String, value: String },
    Disconnected,
}

pub struct SignalingClient {
    client_id: String,
    outbound: mpsc::Sender<SigWire>,
    cancel: CancellationToken,
}

impl SignalingClient {
    /// Connect, join `room_id`, and deliver events on `events`.
    pub async fn connect(
        addr: &str,
        port: u16,
        room_id: &str,
        client_id: &str,
        events: mpsc::Sender<SignalingEvent>,
    ) -> Result<Self, LtError> {
        let stream = TcpStream::connect((addr, port))
            .await
            .map_err(|e| LtError::Init(format!("signaling connect {addr}:{port}: {e}")))?;
        let (mut writer, mut reader) = Framed::new(stream, LtCodec).split();

        let (outbound, mut outbound_rx) = mpsc::channel::<SigWire>(64);
        let cancel = CancellationToken::new();

        // Join before anything else.
        let join = SigWire::Join(JoinRoom {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
        });
        writer.send(join.encode()?).await?;

        // Writer: queued messages plus the periodic keep-alive.
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
                keep_alive.tick().await; // skip the immediate tick
                loop {
                    let wire = tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = keep_alive.tick() => SigWire::KeepAlive,
                        queued = outbound_rx.recv() => match queued {
                            Some(wire) => wire,
                            None => break,
                        },
                    };
                    let encoded = match wire.encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            warn!("unencodable signaling message: {e}");
                            continue;
                        }
                    };
                    if writer.send(encoded).await.is_err() {
                        break;
                    }
                }
            }
        });

        // Reader: decode and forward.
        tokio::spawn({
            let events = events.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = reader.next() => frame,
                    };
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("signaling read error: {e}");
                            break;
                        }
                        None => break,
                    };
                    let event = match SigWire::decode(&msg) {
                        Ok(SigWire::JoinAck(ack)) => SignalingEvent::JoinAck(ack),
                        Ok(SigWire::Relay(relay)) => SignalingEvent::Message {
                            from: relay.from,
                            key: relay.key,
                            value: relay.value,
                        },
                        Ok(SigWire::KeepAlive) | Ok(SigWire::Join(_)) => continue,
                        Err(e) => {
                            warn!("discarding bad signaling frame: {e}");
                            continue;
                        }
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                let _ = events.send(SignalingEvent::Disconnected).await;
            }
        });

        Ok(Self {
            client_id: client_id.to_string(),
            outbound,
            cancel,
        })
    }

    /// Relay an opaque `(key, value)` to `to`.
    pub async fn send_message(&self, to: &str, key: &str, value: &str) -> Result<(), LtError> {
        self.outbound
            .send(SigWire::Relay(RelayMessage {
                from: self.client_id.clone(),
                to: to.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            }))
            .await
            .map_err(|_| LtError::ChannelClosed)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Tear down the connection tasks. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Reference relay server ───────────────────────────────────────

type RoomTable = Arc<Mutex<HashMap<String, HashMap<String, mpsc::Sender<SigWire>>>>>;

/// Minimal rendezvous relay: rooms of two, transparent in-order relay.
pub struct SignalingServer {
    port: u16,
    cancel: CancellationToken,
}

impl SignalingServer {
    /// Bind on `port` (0 for ephemeral) and start serving.
    pub async fn bind(port: u16) -> Result<Self, LtError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| LtError::Init(format!("signaling bind: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| LtError::Init(e.to_string()))?
            .port();
        info!("signaling relay on port {port}");

        let rooms: RoomTable = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                loop {
                    let accepted = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    let Ok((stream, peer)) = accepted else { continue };
                    debug!("signaling peer {peer}");
                    tokio::spawn(serve_peer(stream, Arc::clone(&rooms), cancel.clone()));
                }
            }
        });

        Ok(Self { port, cancel })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignalingServer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_peer(stream: TcpStream, rooms: RoomTable, cancel: CancellationToken) {
    let (mut writer, mut reader) = Framed::new(stream, LtCodec).split();

    // First frame must be a join.
    let join = match reader.next().await {
        Some(Ok(msg)) => match SigWire::decode(&msg) {
            Ok(SigWire::Join(join)) => join,
            _ => return,
        },
        _ => return,
    };

    let (tx, mut rx) = mpsc::channel::<SigWire>(64);
    let accepted = {
        let mut rooms = rooms.lock().expect("room table poisoned");
        let members = rooms.entry(join.room_id.clone()).or_default();
        if members.len() >= ROOM_CAPACITY && !members.contains_key(&join.client_id) {
            false
        } else {
            members.insert(join.client_id.clone(), tx);
            true
        }
    };

    let ack = JoinRoomAck {
        ok: accepted,
        err: (!accepted).then(|| "room full".to_string()),
    };
    if writer.send(SigWire::JoinAck(ack).encode().expect("ack encodes")).await.is_err() || !accepted
    {
        return;
    }

    // Writer side: messages relayed toward this peer.
    let write_task = tokio::spawn(async move {
        while let Some(wire) = rx.recv().await {
            let Ok(encoded) = wire.encode() else { continue };
            if writer.send(encoded).await.is_err() {
                break;
            }
        }
    });

    // Reader side: relay to the addressee.
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            _ => break,
        };
        match SigWire::decode(&msg) {
            Ok(SigWire::Relay(relay)) => {
                let target = {
                    let rooms = rooms.lock().expect("room table poisoned");
                    rooms
                        .get(&join.room_id)
                        .and_then(|members| members.get(&relay.to))
                        .cloned()
                };
                match target {
                    Some(peer_tx) => {
                        let _ = peer_tx.send(SigWire::Relay(relay)).await;
                    }
                    None => debug!("no such peer '{}' in room '{}'", relay.to, join.room_id),
                }
            }
            Ok(SigWire::KeepAlive) => {} // refreshes the TCP path, nothing to do
            Ok(_) => {}
            Err(e) => {
                warn!("bad frame from {}: {e}", join.client_id);
                break;
            }
        }
    }

    write_task.abort();
    let mut rooms = rooms.lock().expect("room table poisoned");
    if let Some(members) = rooms.get_mut(&join.room_id) {
        members.remove(&join.client_id);
        if members.is_empty() {
            rooms.remove(&join.room_id);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::Receiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn join_and_relay_between_peers() {
        let server = SignalingServer::bind(0).await.unwrap();
        let (host_events_tx, mut host_events) = mpsc::channel(32);
        let (cli_events_tx, mut cli_events) = mpsc::channel(32);

        let host =
            SignalingClient::connect("127.0.0.1", server.port(), "room-1", "host", host_events_tx)
                .await
                .unwrap();
        assert_eq!(
            next_event(&mut host_events).await,
            SignalingEvent::JoinAck(JoinRoomAck { ok: true, err: None })
        );

        let client =
            SignalingClient::connect("127.0.0.1", server.port(), "room-1", "cli", cli_events_tx)
                .await
                .unwrap();
        assert!(matches!(
            next_event(&mut cli_events).await,
            SignalingEvent::JoinAck(JoinRoomAck { ok: true, .. })
        ));

        host.send_message("cli", "sigaddr", "10.0.0.1:7000").await.unwrap();
        assert_eq!(
            next_event(&mut cli_events).await,
            SignalingEvent::Message {
                from: "host".into(),
                key: "sigaddr".into(),
                value: "10.0.0.1:7000".into(),
            }
        );

        client.send_message("host", "sigconnect", "1").await.unwrap();
        assert_eq!(
            next_event(&mut host_events).await,
            SignalingEvent::Message {
                from: "cli".into(),
                key: "sigconnect".into(),
                value: "1".into(),
            }
        );
    }

    #[tokio::test]
    async fn relay_preserves_order_per_sender() {
        let server = SignalingServer::bind(0).await.unwrap();
        let (host_tx, mut host_events) = mpsc::channel(64);
        let (cli_tx, mut cli_events) = mpsc::channel(64);

        let _host =
            SignalingClient::connect("127.0.0.1", server.port(), "r", "host", host_tx)
                .await
                .unwrap();
        let _ = next_event(&mut host_events).await;
        let client = SignalingClient::connect("127.0.0.1", server.port(), "r", "cli", cli_tx)
            .await
            .unwrap();
        let _ = next_event(&mut cli_events).await;

        for i in 0..20 {
            client
                .send_message("host", "seq", &i.to_string())
                .await
                .unwrap();
        }
        for i in 0..20 {
            match next_event(&mut host_events).await {
                SignalingEvent::Message { value, .. } => {
                    assert_eq!(value, i.to_string());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn third_peer_is_rejected() {
        let server = SignalingServer::bind(0).await.unwrap();
        let mut events = Vec::new();
        for id in ["a", "b", "c"] {
            let (tx, rx) = mpsc::channel(8);
            let _client = SignalingClient::connect("127.0.0.1", server.port(), "full", id, tx)
                .await
                .unwrap();
            events.push((rx, _client));
        }
        assert!(matches!(
            next_event(&mut events[0].0).await,
            SignalingEvent::JoinAck(JoinRoomAck { ok: true, .. })
        ));
        assert!(matches!(
            next_event(&mut events[1].0).await,
            SignalingEvent::JoinAck(JoinRoomAck { ok: true, .. })
        ));
        match next_event(&mut events[2].0).await {
            SignalingEvent::JoinAck(ack) => {
                assert!(!ack.ok);
                assert_eq!(ack.err.as_deref(), Some("room full"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_shutdown_disconnects_clients() {
        let server = SignalingServer::bind(0).await.unwrap();
        let (tx, mut events) = mpsc::channel(8);
        let _client = SignalingClient::connect("127.0.0.1", server.port(), "r", "x", tx)
            .await
            .unwrap();
        let _ = next_event(&mut events).await; // ack
        server.close();
        drop(server);
        loop {
            if next_event(&mut events).await == SignalingEvent::Disconnected {
                break;
            }
        }
    }
}
