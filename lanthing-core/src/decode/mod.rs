//! Video decoding.
//!
//! The decoder mirrors the encoder's backend split: hardware paths
//! (D3D11VA / VAAPI / VideoToolbox) are platform work behind the same
//! trait, the software path unpacks the zstd container. What matters to
//! the pipeline is the recovery contract: after any decode failure the
//! decoder refuses non-keyframes until a keyframe arrives, and the caller
//! is expected to request one from the host.

use tracing::debug;

use crate::error::LtError;
use crate::types::{EncodedUnit, VideoCodec};

/// Hardware decode API chosen by platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    D3d11Va,
    Vaapi,
    VideoToolbox,
    Software,
}

impl DecoderKind {
    /// The preferred decoder for the running platform.
    ///
    /// Hardware surfaces need vendor plumbing that is not linked in this
    /// build, so every platform currently resolves to software.
    pub fn for_platform() -> Self {
        DecoderKind::Software
    }
}

/// A decoded picture in CPU memory.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub picture_id: u32,
    pub capture_ts_us: i64,
    pub width: u32,
    pub height: u32,
    /// BGRA pixels, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
}

/// Outcome of feeding one unit to the decoder.
#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(DecodedFrame),
    /// The unit was skipped while waiting for a keyframe.
    NeedKeyframe,
}

// ── VideoDecoder ─────────────────────────────────────────────────

pub struct VideoDecoder {
    kind: DecoderKind,
    codec: VideoCodec,
    /// Set after a failure; cleared by the next keyframe.
    awaiting_keyframe: bool,
    frames_decoded: u64,
}

impl VideoDecoder {
    pub fn new(kind: DecoderKind, codec: VideoCodec) -> Result<Self, LtError> {
        if kind != DecoderKind::Software {
            return Err(LtError::Init(format!(
                "decoder kind {kind:?} not available in this build"
            )));
        }
        Ok(Self {
            kind,
            codec,
            awaiting_keyframe: false,
            frames_decoded: 0,
        })
    }

    pub fn kind(&self) -> DecoderKind {
        self.kind
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Whether the decoder is waiting for recovery.
    pub fn awaiting_keyframe(&self) -> bool {
        self.awaiting_keyframe
    }

    /// Decode one unit.
    ///
    /// After an error the decoder poisons itself until a keyframe
    /// arrives; feed it the error so the session can ask the host for
    /// one.
    pub fn decode(&mut self, unit: &EncodedUnit) -> Result<DecodeOutcome, LtError> {
        if self.awaiting_keyframe && !unit.is_keyframe {
            return Ok(DecodeOutcome::NeedKeyframe);
        }
        let pixels = zstd::decode_all(unit.bytes.as_slice()).map_err(|e| {
            self.awaiting_keyframe = true;
            LtError::Decode(format!("picture {}: {e}", unit.picture_id))
        })?;
        let expected = unit.width as usize * unit.height as usize * 4;
        if pixels.len() != expected {
            self.awaiting_keyframe = true;
            return Err(LtError::Decode(format!(
                "picture {}: got {} bytes, expected {expected}",
                unit.picture_id,
                pixels.len()
            )));
        }
        if unit.is_keyframe && self.awaiting_keyframe {
            debug!("keyframe {} recovered the decoder", unit.picture_id);
        }
        self.awaiting_keyframe = false;
        self.frames_decoded += 1;
        Ok(DecodeOutcome::Frame(DecodedFrame {
            picture_id: unit.picture_id,
            capture_ts_us: unit.capture_ts_us,
            width: unit.width,
            height: unit.height,
            pixels,
        }))
    }

    /// Drop reference state, e.g. after a render-target reset that tore
    /// down hardware surfaces. The next frame must be a keyframe.
    pub fn invalidate_references(&mut self) {
        self.awaiting_keyframe = true;
    }
}

// ── Tests ────────────────────────────────────────────────────────
