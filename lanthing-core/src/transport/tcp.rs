//! TCP fallback transport.
//!
//! Both channels share one ordered stream; the `reliable` flag is
//! advisory and stale media is discarded at the receiver by picture id.
//! Intended for LAN sessions and as the reference for plugging in other
//! backends.
//!
//! Rendezvous: the server advertises `sigaddr = "ip:port"`; the client
//! dials it and announces the attempt with `sigconnect`. A `sigconnect`
//! also makes the server re-advertise, covering a client that joined the
//! room late.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LtError;
use crate::pipe::{LtCodec, WireMessage};
use crate::transport::{
    TransportEvent, TransportEventSender, VideoFrameMsg, MEDIA_AUDIO_TYPE, MEDIA_VIDEO_TYPE,
    SIG_ADDR, SIG_CONNECT,
};
use crate::types::{AudioData, EncodedUnit};

/// Outbound queue depth per connection.
const SEND_QUEUE: usize = 256;

pub(super) type WriterSlot = Arc<Mutex<Option<mpsc::Sender<WireMessage>>>>;

/// Best-effort local address for the `sigaddr` advertisement.
pub(super) fn local_ip() -> IpAddr {
    // Routing-table probe; no packet is sent.
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|_| s))
        .and_then(|s| s.local_addr());
    match probe {
        Ok(addr) => addr.ip(),
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

pub(super) fn parse_control(data: &[u8]) -> Result<WireMessage, LtError> {
    if data.len() < 4 {
        return Err(LtError::Protocol("control payload shorter than type id"));
    }
    Ok(WireMessage {
        type_id: u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice")),
        payload: data[4..].to_vec(),
    })
}

pub(super) fn enqueue(slot: &WriterSlot, msg: WireMessage) -> Result<(), LtError> {
    let guard = slot.lock().expect("writer slot poisoned");
    match guard.as_ref() {
        Some(tx) => tx
            .try_send(msg)
            .map_err(|_| LtError::TransientNetwork("send queue full or closed".into())),
        None => Err(LtError::TransientNetwork("not connected".into())),
    }
}

/// Pump one connected stream: writer drains the queue, reader dispatches
/// events. Returns when either side ends or `cancel` fires. The RTC
/// backend reuses this for its reliable channel.
pub(super) async fn pump_stream(
    stream: TcpStream,
    writer_slot: WriterSlot,
    events: TransportEventSender,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, LtCodec);
    let mut writer = FramedWrite::new(write_half, LtCodec);

    let (tx, mut rx) = mpsc::channel::<WireMessage>(SEND_QUEUE);
    *writer_slot.lock().expect("writer slot poisoned") = Some(tx);
    let _ = events.send(TransportEvent::Connected).await;

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(msg).await {
                debug!("tcp write ended: {e}");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!("tcp read error: {e}");
                break;
            }
            None => break,
        };
        let event = match msg.type_id {
            MEDIA_VIDEO_TYPE => match bincode::deserialize::<VideoFrameMsg>(&msg.payload) {
                Ok(frame) => TransportEvent::Video(frame.into()),
                Err(e) => {
                    warn!("malformed video frame: {e}");
                    continue;
                }
            },
            MEDIA_AUDIO_TYPE => match bincode::deserialize::<AudioData>(&msg.payload) {
                Ok(audio) => TransportEvent::Audio(audio),
                Err(e) => {
                    warn!("malformed audio packet: {e}");
                    continue;
                }
            },
            type_id => {
                let mut data = Vec::with_capacity(4 + msg.payload.len());
                data.extend_from_slice(&type_id.to_le_bytes());
                data.extend_from_slice(&msg.payload);
                TransportEvent::Data {
                    data,
                    reliable: true,
                }
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }

    *writer_slot.lock().expect("writer slot poisoned") = None;
    write_task.abort();
    let _ = events.send(TransportEvent::Disconnected).await;
}

// ── TcpServer ────────────────────────────────────────────────────

pub struct TcpServer {
    events: TransportEventSender,
    writer: WriterSlot,
    advertised: String,
    cancel: CancellationToken,
}

impl TcpServer {
    /// Bind an ephemeral port and start accepting. The address
    /// advertisement is emitted immediately.
    pub async fn bind(events: TransportEventSender) -> Result<Self, LtError> {
        let listener = TcpListener::bind("0.0.0.0:0")
            .await
            .map_err(|e| LtError::Init(format!("tcp transport bind: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| LtError::Init(format!("tcp transport local_addr: {e}")))?
            .port();
        let advertised = format!("{}:{port}", local_ip());
        debug!("tcp transport advertising {advertised}");

        let writer: WriterSlot = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let _ = events
            .send(TransportEvent::Signaling {
                key: SIG_ADDR.into(),
                value: advertised.clone(),
            })
            .await;

        // One peer at a time; a dropped peer can come back.
        tokio::spawn({
            let events = events.clone();
            let writer = Arc::clone(&writer);
            let cancel = cancel.clone();
            async move {
                loop {
                    let accepted = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("tcp transport peer {peer} attached");
                            pump_stream(
                                stream,
                                Arc::clone(&writer),
                                events.clone(),
                                cancel.clone(),
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!("tcp accept error: {e}");
                        }
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            events,
            writer,
            advertised,
            cancel,
        })
    }

    pub fn close(&mut self) {
        self.cancel.cancel();
    }

    pub fn send_data(&mut self, data: Vec<u8>, _reliable: bool) -> Result<(), LtError> {
        enqueue(&self.writer, parse_control(&data)?)
    }

    pub fn send_video(&mut self, unit: &EncodedUnit) -> Result<(), LtError> {
        let payload = bincode::serialize(&VideoFrameMsg::from(unit))?;
        enqueue(
            &self.writer,
            WireMessage {
                type_id: MEDIA_VIDEO_TYPE,
                payload,
            },
        )
    }

    pub fn send_audio(&mut self, data: &AudioData) -> Result<(), LtError> {
        let payload = bincode::serialize(data)?;
        enqueue(
            &self.writer,
            WireMessage {
                type_id: MEDIA_AUDIO_TYPE,
                payload,
            },
        )
    }

    pub fn on_signaling_message(&mut self, key: &str, _value: &str) {
        if key == SIG_CONNECT {
            // Late joiner: advertise again.
            let _ = self.events.try_send(TransportEvent::Signaling {
                key: SIG_ADDR.into(),
                value: self.advertised.clone(),
            });
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

// ── TcpClient ────────────────────────────────────────────────────

pub struct TcpClient {
    events: TransportEventSender,
    writer: WriterSlot,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    want_connect: bool,
    dialing: bool,
    cancel: CancellationToken,
}

impl TcpClient {
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            events,
            writer: Arc::new(Mutex::new(None)),
            remote: Arc::new(Mutex::new(None)),
            want_connect: false,
            dialing: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Announce the attempt and dial as soon as the address is known.
    pub fn connect(&mut self) -> Result<(), LtError> {
        self.want_connect = true;
        let _ = self.events.try_send(TransportEvent::Signaling {
            key: SIG_CONNECT.into(),
            value: "1".into(),
        });
        self.maybe_dial();
        Ok(())
    }

    pub fn close(&mut self) {
        self.want_connect = false;
        self.cancel.cancel();
    }

    pub fn send_data(&mut self, data: Vec<u8>, _reliable: bool) -> Result<(), LtError> {
        enqueue(&self.writer, parse_control(&data)?)
    }

    pub fn on_signaling_message(&mut self, key: &str, value: &str) {
        if key != SIG_ADDR {
            return;
        }
        match value.parse::<SocketAddr>() {
            Ok(addr) => {
                *self.remote.lock().expect("remote slot poisoned") = Some(addr);
                self.maybe_dial();
            }
            Err(e) => warn!("unparseable {SIG_ADDR} '{value}': {e}"),
        }
    }

    fn maybe_dial(&mut self) {
        if !self.want_connect || self.dialing {
            return;
        }
        let Some(addr) = *self.remote.lock().expect("remote slot poisoned") else {
            return;
        };
        self.dialing = true;

        let events = self.events.clone();
        let writer = Arc::clone(&self.writer);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    pump_stream(stream, writer, events, cancel).await;
                }
                Err(e) => {
                    let _ = events
                        .send(TransportEvent::Failed(LtError::TransientNetwork(format!(
                            "tcp connect {addr}: {e}"
                        ))))
                        .await;
                }
            }
        });
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ControlMessage;
    use crate::types::{AudioCodec, VideoCodec};
    use std::time::Duration;

    async fn next_event(
        rx: &mut mpsc::Receiver<TransportEvent>,
    ) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    /// Wire a server/client pair through hand-relayed signaling; both
    /// `Connected` events are consumed.
    async fn connected_pair() -> (
        TcpServer,
        TcpClient,
        mpsc::Receiver<TransportEvent>,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (srv_tx, mut srv_rx) = mpsc::channel(64);
        let (cli_tx, mut cli_rx) = mpsc::channel(64);

        let server = TcpServer::bind(srv_tx).await.unwrap();
        let sigaddr = match next_event(&mut srv_rx).await {
            TransportEvent::Signaling { key, value } => {
                assert_eq!(key, SIG_ADDR);
                value
            }
            other => panic!("expected sigaddr, got {other:?}"),
        };
        // Dial loopback regardless of the advertised interface.
        let port = sigaddr.rsplit(':').next().unwrap();
        let local = format!("127.0.0.1:{port}");

        let mut client = TcpClient::new(cli_tx);
        client.connect().unwrap();
        match next_event(&mut cli_rx).await {
            TransportEvent::Signaling { key, .. } => assert_eq!(key, SIG_CONNECT),
            other => panic!("expected sigconnect, got {other:?}"),
        }
        client.on_signaling_message(SIG_ADDR, &local);

        assert!(matches!(
            next_event(&mut cli_rx).await,
            TransportEvent::Connected
        ));
        assert!(matches!(
            next_event(&mut srv_rx).await,
            TransportEvent::Connected
        ));
        (server, client, srv_rx, cli_rx)
    }

    #[tokio::test]
    async fn control_roundtrip_both_directions() {
        let (mut server, mut client, mut srv_rx, mut cli_rx) = connected_pair().await;

        let msg = ControlMessage::StartWorking;
        client
            .send_data(msg.to_wire_bytes().unwrap(), true)
            .unwrap();
        match next_event(&mut srv_rx).await {
            TransportEvent::Data { data, reliable } => {
                assert!(reliable);
                assert_eq!(ControlMessage::from_wire_bytes(&data).unwrap(), msg);
            }
            other => panic!("expected data, got {other:?}"),
        }

        let reply = ControlMessage::KeepAliveAck;
        server
            .send_data(reply.to_wire_bytes().unwrap(), true)
            .unwrap();
        match next_event(&mut cli_rx).await {
            TransportEvent::Data { data, .. } => {
                assert_eq!(ControlMessage::from_wire_bytes(&data).unwrap(), reply);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn media_reaches_the_client() {
        let (mut server, _client, _srv_rx, mut cli_rx) = connected_pair().await;

        let unit = EncodedUnit {
            picture_id: 9,
            codec: VideoCodec::H264,
            is_keyframe: true,
            temporal_id: 0,
            bytes: vec![1, 2, 3, 4, 5],
            capture_ts_us: 777,
            encode_start_ts_us: 0,
            encode_end_ts_us: 0,
            width: 1280,
            height: 720,
        };
        server.send_video(&unit).unwrap();
        match next_event(&mut cli_rx).await {
            TransportEvent::Video(got) => {
                assert_eq!(got.picture_id, 9);
                assert_eq!(got.bytes, vec![1, 2, 3, 4, 5]);
                assert!(got.is_keyframe);
            }
            other => panic!("expected video, got {other:?}"),
        }

        let audio = AudioData {
            codec: AudioCodec::Pcm,
            sample_rate: 48_000,
            channels: 2,
            capture_ts_us: 1,
            data: vec![0; 16],
        };
        server.send_audio(&audio).unwrap();
        match next_event(&mut cli_rx).await {
            TransportEvent::Audio(got) => assert_eq!(got.data.len(), 16),
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_surfaces_disconnect_on_peer() {
        let (server, _client, mut srv_rx, _cli_rx) = connected_pair().await;
        // Dropping the server cancels its pump, which emits Disconnected
        // as it unwinds.
        drop(server);
        match next_event(&mut srv_rx).await {
            TransportEvent::Disconnected => {}
            other => panic!("expected disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let mut client = TcpClient::new(tx);
        let err = client
            .send_data(ControlMessage::KeepAlive.to_wire_bytes().unwrap(), true)
            .unwrap_err();
        assert!(matches!(err, LtError::TransientNetwork(_)));
    }

    #[tokio::test]
    async fn sigconnect_triggers_readvertisement() {
        let (srv_tx, mut srv_rx) = mpsc::channel(64);
        let mut server = TcpServer::bind(srv_tx).await.unwrap();
        let first = match next_event(&mut srv_rx).await {
            TransportEvent::Signaling { value, .. } => value,
            other => panic!("expected sigaddr, got {other:?}"),
        };
        server.on_signaling_message(SIG_CONNECT, "1");
        match next_event(&mut srv_rx).await {
            TransportEvent::Signaling { key, value } => {
                assert_eq!(key, SIG_ADDR);
                assert_eq!(value, first);
            }
            other => panic!("expected sigaddr, got {other:?}"),
        }
    }
}
