//! Shared types for the capture → encode → transport → decode pipeline.
//!
//! These are the internal units passed between pipeline stages. The wire
//! representations (control messages, RTP-like packets) live in
//! [`crate::message`] and [`crate::rtp`].

use serde::{Deserialize, Serialize};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of a captured texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

// ── Codecs and backends ──────────────────────────────────────────

/// Video codecs the pipeline can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// The CLI / signaling spelling (`avc`, `hevc`).
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::H264 => "avc",
            VideoCodec::H265 => "hevc",
        }
    }

    /// Parse the CLI spelling. Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "avc" | "h264" => Some(VideoCodec::H264),
            "hevc" | "h265" => Some(VideoCodec::H265),
            _ => None,
        }
    }
}

/// Encoder implementations probed at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderBackend {
    NvEnc,
    IntelMediaSdk,
    Amf,
    /// CPU fallback; always available.
    Software,
}

/// Audio codecs the pipeline can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Pcm,
    Opus,
}

// ── Frame ────────────────────────────────────────────────────────

/// An immutable capture unit.
///
/// Owns no pixel memory; references a pool slot by index and by its stable
/// shareable name. Created by capture, consumed by the encoder, released
/// back to the pool when the encode completes or the frame is skipped.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Strictly increasing within a session; gaps mean dropped captures.
    pub picture_id: u32,
    /// Steady-clock capture timestamp in µs.
    pub capture_ts_us: i64,
    /// Index of the pool slot holding the pixels.
    pub pool_slot: u16,
    /// Stable shareable name of the slot (crosses the process boundary).
    pub slot_name: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Adapter identifier; encoder must open the slot on the same device.
    pub luid: i64,
}

// ── EncodedUnit ──────────────────────────────────────────────────

/// One encoded picture, produced by the encoder and consumed by the
/// transport's media subchannel.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub picture_id: u32,
    pub codec: VideoCodec,
    pub is_keyframe: bool,
    /// Temporal scalability layer; 0 for the base layer.
    pub temporal_id: u8,
    pub bytes: Vec<u8>,
    pub capture_ts_us: i64,
    pub encode_start_ts_us: i64,
    pub encode_end_ts_us: i64,
    pub width: u32,
    pub height: u32,
}

// ── AudioData ────────────────────────────────────────────────────

/// One captured audio packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioData {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub capture_ts_us: i64,
    pub data: Vec<u8>,
}

// ── PipelineStats ────────────────────────────────────────────────

/// Drop counters shared across pipeline stages.
///
/// Dropped frames are counted, never treated as errors.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Pool exhausted at capture time.
    pub pool_exhausted: std::sync::atomic::AtomicU64,
    /// Encoder mailbox was full; the frame was skipped.
    pub encode_skipped: std::sync::atomic::AtomicU64,
    /// Frame arrived too late to present.
    pub present_late: std::sync::atomic::AtomicU64,
    /// Media packets missing at reassembly.
    pub packets_lost: std::sync::atomic::AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }
}
