//! RTC-like transport: reliable control stream plus an RTP-style UDP
//! media subchannel.
//!
//! Control, clipboard, file and cursor traffic ride a dedicated stream
//! (reusing the TCP pump); video and audio are packetized into
//! [`RtpPacket`]s and sent as datagrams. The client reassembles frames
//! per SSRC and drops stale incompletes; there is no retransmission.
//!
//! Rendezvous: the host advertises `sigaddr = "ip:tcp_port:udp_port"`.
//! The client dials the stream, then hole-punches the media path with a
//! small datagram so the host learns where to send.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LtError;
use crate::rtp::assembler::{packetize, FrameAssembler};
use crate::rtp::packet::RtpPacket;
use crate::time::steady_now_us;
use crate::transport::tcp::{enqueue, local_ip, parse_control, pump_stream, WriterSlot};
use crate::transport::{TransportEvent, TransportEventSender, SIG_ADDR, SIG_CONNECT};
use crate::types::{AudioData, EncodedUnit, VideoCodec};

/// SSRC of the video stream.
pub const VIDEO_SSRC: u32 = 0x10;
/// SSRC of the audio stream.
pub const AUDIO_SSRC: u32 = 0x20;

/// Hole-punch / media keep-alive datagram.
const PUNCH: &[u8] = b"LTPUNCH";
const PUNCH_INTERVAL: Duration = Duration::from_millis(100);

// ── RtcServer ────────────────────────────────────────────────────

pub struct RtcServer {
    events: TransportEventSender,
    writer: WriterSlot,
    udp: Arc<UdpSocket>,
    /// Media destination, learned from the client's punch datagram.
    media_peer: Arc<Mutex<Option<SocketAddr>>>,
    advertised: String,
    video_seq: u16,
    audio_seq: u16,
    audio_packet_id: u32,
    cancel: CancellationToken,
}

impl RtcServer {
    pub async fn bind(events: TransportEventSender) -> Result<Self, LtError> {
        let listener = TcpListener::bind("0.0.0.0:0")
            .await
            .map_err(|e| LtError::Init(format!("rtc stream bind: {e}")))?;
        let udp = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| LtError::Init(format!("rtc media bind: {e}")))?;
        let tcp_port = listener
            .local_addr()
            .map_err(|e| LtError::Init(e.to_string()))?
            .port();
        let udp_port = udp
            .local_addr()
            .map_err(|e| LtError::Init(e.to_string()))?
            .port();
        let advertised = format!("{}:{tcp_port}:{udp_port}", local_ip());
        debug!("rtc transport advertising {advertised}");

        let udp = Arc::new(udp);
        let writer: WriterSlot = Arc::new(Mutex::new(None));
        let media_peer = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let _ = events
            .send(TransportEvent::Signaling {
                key: SIG_ADDR.into(),
                value: advertised.clone(),
            })
            .await;

        // Reliable stream accept loop, one peer at a time.
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
                            debug!("rtc stream peer {peer} attached");
                            pump_stream(stream, Arc::clone(&writer), events.clone(), cancel.clone())
                                .await;
                        }
                        Err(e) => warn!("rtc accept error: {e}"),
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
        });

        // Punch listener: learn (and track) the media return address.
        tokio::spawn({
            let udp = Arc::clone(&udp);
            let media_peer = Arc::clone(&media_peer);
            let cancel = cancel.clone();
            async move {
                let mut buf = [0u8; 1500];
                loop {
                    let received = tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = udp.recv_from(&mut buf) => received,
                    };
                    match received {
                        Ok((len, from)) if &buf[..len] == PUNCH => {
                            let mut peer = media_peer.lock().expect("media peer poisoned");
                            if *peer != Some(from) {
                                debug!("media path to {from} established");
                                *peer = Some(from);
                            }
                        }
                        Ok(_) => {} // host receives no media
                        Err(e) => {
                            warn!("rtc media recv error: {e}");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            events,
            writer,
            udp,
            media_peer,
            advertised,
            video_seq: 0,
            audio_seq: 0,
            audio_packet_id: 0,
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
        let peer = self
            .media_peer
            .lock()
            .expect("media peer poisoned")
            .ok_or_else(|| LtError::TransientNetwork("media path not punched yet".into()))?;
        for packet in packetize(unit, VIDEO_SSRC, &mut self.video_seq) {
            // Datagram loss is the medium's business; a full socket
            // buffer just drops the packet.
            let _ = self.udp.try_send_to(&packet.encode(), peer);
        }
        Ok(())
    }

    pub fn send_audio(&mut self, data: &AudioData) -> Result<(), LtError> {
        let peer = self
            .media_peer
            .lock()
            .expect("media peer poisoned")
            .ok_or_else(|| LtError::TransientNetwork("media path not punched yet".into()))?;
        self.audio_packet_id = self.audio_packet_id.wrapping_add(1);
        // Audio rides the same framing; the unit is just a container for
        // the serialized packet (codec/size fields are unused there).
        let container = EncodedUnit {
            picture_id: self.audio_packet_id,
            codec: VideoCodec::H264,
            is_keyframe: false,
            temporal_id: 0,
            bytes: bincode::serialize(data)?,
            capture_ts_us: data.capture_ts_us,
            encode_start_ts_us: 0,
            encode_end_ts_us: 0,
            width: 0,
            height: 0,
        };
        for packet in packetize(&container, AUDIO_SSRC, &mut self.audio_seq) {
            let _ = self.udp.try_send_to(&packet.encode(), peer);
        }
        Ok(())
    }

    pub fn on_signaling_message(&mut self, key: &str, _value: &str) {
        if key == SIG_CONNECT {
            let _ = self.events.try_send(TransportEvent::Signaling {
                key: SIG_ADDR.into(),
                value: self.advertised.clone(),
            });
        }
    }
}

impl Drop for RtcServer {
    fn drop(&mut self) {
        self.close();
    }
}

// ── RtcClient ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RtcAddr {
    stream: SocketAddr,
    media: SocketAddr,
}

fn parse_sigaddr(value: &str) -> Option<RtcAddr> {
    let mut parts = value.rsplitn(3, ':');
    let udp_port: u16 = parts.next()?.parse().ok()?;
    let tcp_port: u16 = parts.next()?.parse().ok()?;
    let ip: IpAddr = parts.next()?.parse().ok()?;
    Some(RtcAddr {
        stream: SocketAddr::new(ip, tcp_port),
        media: SocketAddr::new(ip, udp_port),
    })
}

pub struct RtcClient {
    events: TransportEventSender,
    writer: WriterSlot,
    remote: Option<RtcAddr>,
    want_connect: bool,
    dialing: bool,
    cancel: CancellationToken,
}

impl RtcClient {
    pub fn new(events: TransportEventSender) -> Self {
        Self {
            events,
            writer: Arc::new(Mutex::new(None)),
            remote: None,
            want_connect: false,
            dialing: false,
            cancel: CancellationToken::new(),
        }
    }

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
        match parse_sigaddr(value) {
            Some(addr) => {
                self.remote = Some(addr);
                self.maybe_dial();
            }
            None => warn!("unparseable {SIG_ADDR} '{value}'"),
        }
    }

    fn maybe_dial(&mut self) {
        if !self.want_connect || self.dialing {
            return;
        }
        let Some(addr) = self.remote else {
            return;
        };
        self.dialing = true;

        // Reliable stream.
        let events = self.events.clone();
        let writer = Arc::clone(&self.writer);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr.stream).await {
                Ok(stream) => {
                    pump_stream(stream, writer, events, cancel).await;
                }
                Err(e) => {
                    let _ = events
                        .send(TransportEvent::Failed(LtError::TransientNetwork(format!(
                            "rtc stream connect {}: {e}",
                            addr.stream
                        ))))
                        .await;
                }
            }
        });

        // Media path: punch, then receive.
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = media_loop(addr.media, events.clone(), cancel).await {
                let _ = events.send(TransportEvent::Failed(e)).await;
            }
        });
    }
}

impl Drop for RtcClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn media_loop(
    media_addr: SocketAddr,
    events: TransportEventSender,
    cancel: CancellationToken,
) -> Result<(), LtError> {
    let udp = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| LtError::Init(format!("rtc media bind: {e}")))?;
    udp.connect(media_addr)
        .await
        .map_err(|e| LtError::Init(format!("rtc media connect: {e}")))?;

    let mut video = FrameAssembler::new(VIDEO_SSRC);
    let mut audio = FrameAssembler::new(AUDIO_SSRC);
    let mut punch_timer = tokio::time::interval(PUNCH_INTERVAL);
    let mut buf = [0u8; 1500];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = punch_timer.tick() => {
                // Doubles as the media-path keep-alive.
                let _ = udp.try_send(PUNCH);
            }
            received = udp.recv(&mut buf) => {
                let len = received.map_err(|e| {
                    LtError::TransientNetwork(format!("rtc media recv: {e}"))
                })?;
                let packet = match RtpPacket::decode(&buf[..len]) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("dropping malformed media packet: {e}");
                        continue;
                    }
                };
                let event = match packet.ssrc {
                    VIDEO_SSRC => video.on_packet(&packet).map(|frame| {
                        TransportEvent::Video(frame.unit)
                    }),
                    AUDIO_SSRC => audio.on_packet(&packet).and_then(|frame| {
                        match bincode::deserialize::<AudioData>(&frame.unit.bytes) {
                            Ok(data) => Some(TransportEvent::Audio(data)),
                            Err(e) => {
                                warn!("malformed audio container: {e}");
                                None
                            }
                        }
                    }),
                    other => {
                        debug!("unknown ssrc {other}, dropping");
                        None
                    }
                };
                if let Some(event) = event {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!(
        "media loop ended at {} us (video lost {}, audio lost {})",
        steady_now_us(),
        video.packets_lost(),
        audio.packets_lost()
    );
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
