//! Control-plane messages and their dynamic dispatch.
//!
//! Every control message carries a 32-bit type id on the wire, organized in
//! ranged blocks:
//!
//! - `0x00xx`: channel upkeep (keep-alive, time sync, stats)
//! - `0x01xx`: session lifecycle (params, start/stop working)
//! - `0x02xx`: media side-band (pool-slot handoff, audio, cursor)
//! - `0x03xx`: data channel (clipboard, file transfer)
//!
//! Payloads are serde structs carried as bincode. Handlers are registered
//! once during init into a [`MessageRouter`]; unknown incoming ids are
//! logged and discarded, and repeated offense is surfaced so the session
//! can close the connection.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::LtError;
use crate::negotiate::{DisplaySetting, SessionParams};
use crate::types::AudioData;

// ── MessageKind ──────────────────────────────────────────────────

/// Wire type id of a control message.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Channel upkeep (0x00xx)
    KeepAlive = 0x0001,
    KeepAliveAck = 0x0002,
    TimeSync = 0x0003,
    SendSideStat = 0x0004,

    // Session lifecycle (0x01xx)
    StreamingParams = 0x0101,
    StartWorking = 0x0102,
    StartWorkingAck = 0x0103,
    StopWorking = 0x0104,
    ChangeStreamingParams = 0x0105,

    // Media side-band (0x02xx)
    CaptureVideoFrame = 0x0201,
    AudioData = 0x0202,
    CursorInfo = 0x0203,

    // Data channel (0x03xx)
    ClipboardChunk = 0x0301,
    FilePullRequest = 0x0302,
    FileChunk = 0x0303,
    FileChunkAck = 0x0304,
}

impl TryFrom<u32> for MessageKind {
    type Error = LtError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(MessageKind::KeepAlive),
            0x0002 => Ok(MessageKind::KeepAliveAck),
            0x0003 => Ok(MessageKind::TimeSync),
            0x0004 => Ok(MessageKind::SendSideStat),

            0x0101 => Ok(MessageKind::StreamingParams),
            0x0102 => Ok(MessageKind::StartWorking),
            0x0103 => Ok(MessageKind::StartWorkingAck),
            0x0104 => Ok(MessageKind::StopWorking),
            0x0105 => Ok(MessageKind::ChangeStreamingParams),

            0x0201 => Ok(MessageKind::CaptureVideoFrame),
            0x0202 => Ok(MessageKind::AudioData),
            0x0203 => Ok(MessageKind::CursorInfo),

            0x0301 => Ok(MessageKind::ClipboardChunk),
            0x0302 => Ok(MessageKind::FilePullRequest),
            0x0303 => Ok(MessageKind::FileChunk),
            0x0304 => Ok(MessageKind::FileChunkAck),

            _ => Err(LtError::UnknownVariant {
                type_name: "MessageKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Payload structs ──────────────────────────────────────────────

/// Time synchronization exchange. A request carries only `t0_us` (the
/// sender's clock); the reply echoes `t0_us` and fills `t1_us`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSyncMsg {
    pub t0_us: i64,
    pub t1_us: Option<i64>,
}

/// Receiver-side statistics fed into the sender's rate controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SendSideStat {
    /// Bandwidth estimate in bits per second.
    pub bwe_bps: u64,
    /// Packet loss over the last window, in percent.
    pub loss_pct: f32,
    pub rtt_ms: u32,
}

/// Why a `StartWorking` request failed, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartWorkingError {
    Success,
    InputFailed,
    CaptureFailed,
    AudioFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWorkingAck {
    pub err_code: StartWorkingError,
    /// Every message type the worker registered a handler for.
    pub supported_msg_types: Vec<u32>,
}

/// Mid-session parameter change request; triggers a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStreamingParams {
    pub display: DisplaySetting,
    pub bitrate_bps: Option<u32>,
}

/// Pool-slot handoff: the capture side announces a filled slot by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureVideoFrame {
    pub name: String,
    pub picture_id: u32,
    pub capture_ts_us: i64,
    pub width: u32,
    pub height: u32,
}

/// Remote cursor shape and position.
///
/// `pixmap` may be absent; a pixel-less update mutates only position and
/// visibility of the last known cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorInfo {
    pub screen_w: u32,
    pub screen_h: u32,
    pub x: i32,
    pub y: i32,
    pub visible: bool,
    pub pixmap: Option<CursorPixmap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPixmap {
    pub width: u32,
    pub height: u32,
    pub hotspot_x: u32,
    pub hotspot_y: u32,
    /// BGRA pixels, `width * height * 4` bytes.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardChunk {
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePullRequest {
    pub request_id: u32,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub request_id: u32,
    pub chunk_index: u32,
    pub is_last: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkAck {
    pub request_id: u32,
    pub chunk_index: u32,
}

// ── ControlMessage ───────────────────────────────────────────────

/// The tagged union of every control-plane message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    KeepAlive,
    KeepAliveAck,
    TimeSync(TimeSyncMsg),
    SendSideStat(SendSideStat),

    StreamingParams(SessionParams),
    StartWorking,
    StartWorkingAck(StartWorkingAck),
    StopWorking,
    ChangeStreamingParams(ChangeStreamingParams),

    CaptureVideoFrame(CaptureVideoFrame),
    AudioData(AudioData),
    CursorInfo(CursorInfo),

    ClipboardChunk(ClipboardChunk),
    FilePullRequest(FilePullRequest),
    FileChunk(FileChunk),
    FileChunkAck(FileChunkAck),
}

impl ControlMessage {
    /// The wire type id of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::KeepAlive => MessageKind::KeepAlive,
            ControlMessage::KeepAliveAck => MessageKind::KeepAliveAck,
            ControlMessage::TimeSync(_) => MessageKind::TimeSync,
            ControlMessage::SendSideStat(_) => MessageKind::SendSideStat,
            ControlMessage::StreamingParams(_) => MessageKind::StreamingParams,
            ControlMessage::StartWorking => MessageKind::StartWorking,
            ControlMessage::StartWorkingAck(_) => MessageKind::StartWorkingAck,
            ControlMessage::StopWorking => MessageKind::StopWorking,
            ControlMessage::ChangeStreamingParams(_) => MessageKind::ChangeStreamingParams,
            ControlMessage::CaptureVideoFrame(_) => MessageKind::CaptureVideoFrame,
            ControlMessage::AudioData(_) => MessageKind::AudioData,
            ControlMessage::CursorInfo(_) => MessageKind::CursorInfo,
            ControlMessage::ClipboardChunk(_) => MessageKind::ClipboardChunk,
            ControlMessage::FilePullRequest(_) => MessageKind::FilePullRequest,
            ControlMessage::FileChunk(_) => MessageKind::FileChunk,
            ControlMessage::FileChunkAck(_) => MessageKind::FileChunkAck,
        }
    }

    /// Serialize to `(type_id, payload)`. Unit messages have an empty
    /// payload.
    pub fn encode(&self) -> Result<(u32, Vec<u8>), LtError> {
        let payload = match self {
            ControlMessage::KeepAlive
            | ControlMessage::KeepAliveAck
            | ControlMessage::StartWorking
            | ControlMessage::StopWorking => Vec::new(),
            ControlMessage::TimeSync(p) => bincode::serialize(p)?,
            ControlMessage::SendSideStat(p) => bincode::serialize(p)?,
            ControlMessage::StreamingParams(p) => bincode::serialize(p)?,
            ControlMessage::StartWorkingAck(p) => bincode::serialize(p)?,
            ControlMessage::ChangeStreamingParams(p) => bincode::serialize(p)?,
            ControlMessage::CaptureVideoFrame(p) => bincode::serialize(p)?,
            ControlMessage::AudioData(p) => bincode::serialize(p)?,
            ControlMessage::CursorInfo(p) => bincode::serialize(p)?,
            ControlMessage::ClipboardChunk(p) => bincode::serialize(p)?,
            ControlMessage::FilePullRequest(p) => bincode::serialize(p)?,
            ControlMessage::FileChunk(p) => bincode::serialize(p)?,
            ControlMessage::FileChunkAck(p) => bincode::serialize(p)?,
        };
        Ok((self.kind() as u32, payload))
    }

    /// Serialize to a flat `type_id ++ payload` buffer, the form the
    /// transport's data channel carries.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, LtError> {
        let (type_id, payload) = self.encode()?;
        let mut bytes = Vec::with_capacity(4 + payload.len());
        bytes.extend_from_slice(&type_id.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Inverse of [`to_wire_bytes`](Self::to_wire_bytes).
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, LtError> {
        if bytes.len() < 4 {
            return Err(LtError::Protocol("control payload shorter than type id"));
        }
        let type_id = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice"));
        Self::decode(type_id, &bytes[4..])
    }

    /// Deserialize from `(type_id, payload)`.
    pub fn decode(type_id: u32, payload: &[u8]) -> Result<Self, LtError> {
        let kind = MessageKind::try_from(type_id)?;
        let msg = match kind {
            MessageKind::KeepAlive => ControlMessage::KeepAlive,
            MessageKind::KeepAliveAck => ControlMessage::KeepAliveAck,
            MessageKind::StartWorking => ControlMessage::StartWorking,
            MessageKind::StopWorking => ControlMessage::StopWorking,
            MessageKind::TimeSync => ControlMessage::TimeSync(bincode::deserialize(payload)?),
            MessageKind::SendSideStat => {
                ControlMessage::SendSideStat(bincode::deserialize(payload)?)
            }
            MessageKind::StreamingParams => {
                ControlMessage::StreamingParams(bincode::deserialize(payload)?)
            }
            MessageKind::StartWorkingAck => {
                ControlMessage::StartWorkingAck(bincode::deserialize(payload)?)
            }
            MessageKind::ChangeStreamingParams => {
                ControlMessage::ChangeStreamingParams(bincode::deserialize(payload)?)
            }
            MessageKind::CaptureVideoFrame => {
                ControlMessage::CaptureVideoFrame(bincode::deserialize(payload)?)
            }
            MessageKind::AudioData => ControlMessage::AudioData(bincode::deserialize(payload)?),
            MessageKind::CursorInfo => ControlMessage::CursorInfo(bincode::deserialize(payload)?),
            MessageKind::ClipboardChunk => {
                ControlMessage::ClipboardChunk(bincode::deserialize(payload)?)
            }
            MessageKind::FilePullRequest => {
                ControlMessage::FilePullRequest(bincode::deserialize(payload)?)
            }
            MessageKind::FileChunk => ControlMessage::FileChunk(bincode::deserialize(payload)?),
            MessageKind::FileChunkAck => {
                ControlMessage::FileChunkAck(bincode::deserialize(payload)?)
            }
        };
        Ok(msg)
    }
}

// ── MessageRouter ────────────────────────────────────────────────

/// Boxed handler invoked for one message type.
pub type MessageHandler = Box<dyn FnMut(ControlMessage) + Send>;

/// Unknown ids tolerated before the session should give up on the peer.
pub const PROTOCOL_STRIKE_LIMIT: u32 = 16;

/// Type-id → handler table.
///
/// Registration happens once during init; afterwards the table is only
/// read. Duplicate registration is an error, matching the worker's
/// fail-fast registration loop.
#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<u32, MessageHandler>,
    unknown_count: u32,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`. Fails if one is already present.
    pub fn register<F>(&mut self, kind: MessageKind, handler: F) -> Result<(), LtError>
    where
        F: FnMut(ControlMessage) + Send + 'static,
    {
        match self.handlers.entry(kind as u32) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(LtError::Protocol("duplicate message handler registration"))
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    /// Dispatch a decoded message to its handler.
    ///
    /// A message with no registered handler is logged, discarded and
    /// counted; the caller is expected to close the session once
    /// [`Self::over_strike_limit`] reports true.
    pub fn dispatch(&mut self, msg: ControlMessage) {
        let id = msg.kind() as u32;
        match self.handlers.get_mut(&id) {
            Some(handler) => handler(msg),
            None => {
                self.unknown_count += 1;
                warn!("no handler for message type {id:#06x}, discarding");
            }
        }
    }

    /// Every type id a handler was registered for (advertised in
    /// `StartWorkingAck`).
    pub fn registered_types(&self) -> Vec<u32> {
        let mut types: Vec<u32> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Number of messages discarded for lack of a handler.
    pub fn unknown_count(&self) -> u32 {
        self.unknown_count
    }

    /// Whether the peer has exceeded the tolerated protocol strikes.
    pub fn over_strike_limit(&self) -> bool {
        self.unknown_count > PROTOCOL_STRIKE_LIMIT
    }
}

// ── Tests ────────────────────────────────────────────────────────
