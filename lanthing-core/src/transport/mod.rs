//! Pluggable peer transport.
//!
//! Two peer-symmetric backends behind one surface: the TCP fallback
//! multiplexes both channels over a single ordered stream (LAN path), and
//! the RTC-like backend splits control onto its own stream while media
//! rides an RTP-style UDP subchannel (production path).
//!
//! Backends never talk to the signaling server themselves. Outbound
//! rendezvous messages surface as [`TransportEvent::Signaling`] for the
//! session to relay, and inbound ones are injected with
//! `on_signaling_message`. The keys are opaque to everything but the
//! backend that produced them; [`SIG_ADDR`] advertises the host's socket
//! addresses, [`SIG_CONNECT`] announces a connection attempt.

pub mod rtc;
pub mod tcp;

use serde::{Deserialize, Serialize};

use crate::error::LtError;
use crate::types::{AudioData, EncodedUnit, VideoCodec};

/// Address advertisement key (host → client).
pub const SIG_ADDR: &str = "sigaddr";
/// Connection attempt key (client → host).
pub const SIG_CONNECT: &str = "sigconnect";

/// Wire type id for a video frame on the shared TCP stream.
pub(crate) const MEDIA_VIDEO_TYPE: u32 = 0xFF01;
/// Wire type id for an audio packet on the shared TCP stream.
pub(crate) const MEDIA_AUDIO_TYPE: u32 = 0xFF02;

// ── Events ───────────────────────────────────────────────────────

/// Everything a transport reports back to its owning session.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Failed(LtError),
    /// A control-channel payload (`type_id ++ payload` bytes).
    Data { data: Vec<u8>, reliable: bool },
    Video(EncodedUnit),
    Audio(AudioData),
    /// An outbound rendezvous message for the session to relay.
    Signaling { key: String, value: String },
}

/// Sender half the backends emit events on.
pub type TransportEventSender = tokio::sync::mpsc::Sender<TransportEvent>;

// ── Media wire form ──────────────────────────────────────────────

/// Serializable shape of an [`EncodedUnit`] for the ordered-stream path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VideoFrameMsg {
    pub picture_id: u32,
    pub codec: VideoCodec,
    pub is_keyframe: bool,
    pub temporal_id: u8,
    pub capture_ts_us: i64,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl From<&EncodedUnit> for VideoFrameMsg {
    fn from(unit: &EncodedUnit) -> Self {
        Self {
            picture_id: unit.picture_id,
            codec: unit.codec,
            is_keyframe: unit.is_keyframe,
            temporal_id: unit.temporal_id,
            capture_ts_us: unit.capture_ts_us,
            width: unit.width,
            height: unit.height,
            bytes: unit.bytes.clone(),
        }
    }
}

impl From<VideoFrameMsg> for EncodedUnit {
    fn from(msg: VideoFrameMsg) -> Self {
        EncodedUnit {
            picture_id: msg.picture_id,
            codec: msg.codec,
            is_keyframe: msg.is_keyframe,
            temporal_id: msg.temporal_id,
            bytes: msg.bytes,
            capture_ts_us: msg.capture_ts_us,
            encode_start_ts_us: 0,
            encode_end_ts_us: 0,
            width: msg.width,
            height: msg.height,
        }
    }
}

// ── Backend selection ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Single ordered stream; "unreliable" is advisory. LAN.
    Tcp,
    /// Reliable stream + RTP-style UDP media. Production.
    Rtc,
}

/// Client-side transport, dispatching to the selected backend.
pub enum ClientTransport {
    Tcp(tcp::TcpClient),
    Rtc(rtc::RtcClient),
}

impl ClientTransport {
    pub fn create(kind: TransportKind, events: TransportEventSender) -> Self {
        match kind {
            TransportKind::Tcp => ClientTransport::Tcp(tcp::TcpClient::new(events)),
            TransportKind::Rtc => ClientTransport::Rtc(rtc::RtcClient::new(events)),
        }
    }

    /// Begin connecting; completion is reported via `Connected`.
    pub fn connect(&mut self) -> Result<(), LtError> {
        match self {
            ClientTransport::Tcp(t) => t.connect(),
            ClientTransport::Rtc(t) => t.connect(),
        }
    }

    pub fn close(&mut self) {
        match self {
            ClientTransport::Tcp(t) => t.close(),
            ClientTransport::Rtc(t) => t.close(),
        }
    }

    /// Send control bytes (`type_id ++ payload`).
    pub fn send_data(&mut self, data: Vec<u8>, reliable: bool) -> Result<(), LtError> {
        match self {
            ClientTransport::Tcp(t) => t.send_data(data, reliable),
            ClientTransport::Rtc(t) => t.send_data(data, reliable),
        }
    }

    /// Inject a rendezvous message addressed to this transport.
    pub fn on_signaling_message(&mut self, key: &str, value: &str) {
        match self {
            ClientTransport::Tcp(t) => t.on_signaling_message(key, value),
            ClientTransport::Rtc(t) => t.on_signaling_message(key, value),
        }
    }
}

/// Host-side transport, dispatching to the selected backend.
pub enum ServerTransport {
    Tcp(tcp::TcpServer),
    Rtc(rtc::RtcServer),
}

impl ServerTransport {
    pub async fn create(
        kind: TransportKind,
        events: TransportEventSender,
    ) -> Result<Self, LtError> {
        Ok(match kind {
            TransportKind::Tcp => ServerTransport::Tcp(tcp::TcpServer::bind(events).await?),
            TransportKind::Rtc => ServerTransport::Rtc(rtc::RtcServer::bind(events).await?),
        })
    }

    pub fn close(&mut self) {
        match self {
            ServerTransport::Tcp(t) => t.close(),
            ServerTransport::Rtc(t) => t.close(),
        }
    }

    pub fn send_data(&mut self, data: Vec<u8>, reliable: bool) -> Result<(), LtError> {
        match self {
            ServerTransport::Tcp(t) => t.send_data(data, reliable),
            ServerTransport::Rtc(t) => t.send_data(data, reliable),
        }
    }

    pub fn send_video(&mut self, unit: &EncodedUnit) -> Result<(), LtError> {
        match self {
            ServerTransport::Tcp(t) => t.send_video(unit),
            ServerTransport::Rtc(t) => t.send_video(unit),
        }
    }

    pub fn send_audio(&mut self, data: &AudioData) -> Result<(), LtError> {
        match self {
            ServerTransport::Tcp(t) => t.send_audio(data),
            ServerTransport::Rtc(t) => t.send_audio(data),
        }
    }

    pub fn on_signaling_message(&mut self, key: &str, value: &str) {
        match self {
            ServerTransport::Tcp(t) => t.on_signaling_message(key, value),
            ServerTransport::Rtc(t) => t.on_signaling_message(key, value),
        }
    }
}
