//! RTP-like media packet framing.
//!
//! Not interoperable RTP; the same shape with only what the pipeline
//! needs. Wire layout (little-endian):
//!
//! ```text
//! ssrc:     u32  (4)
//! seq:      u16  (2)  wrapping
//! ts:       u32  (4)  media clock (90 kHz video / sample rate audio)
//! flags:    u8   (1)  bit 0 = marker (last packet of a frame),
//!                     bit 1 = keyframe
//! len:      u16  (2)  payload length
//! payload:  [u8] (len)
//! ```

use crate::error::LtError;

/// Media clock rate for video timestamps.
pub const VIDEO_CLOCK_HZ: u64 = 90_000;

/// Payload bytes that fit one UDP datagram after IP/UDP/RTP headers.
pub const MAX_PAYLOAD: usize = 1_200;

pub const HEADER_LEN: usize = 13;

const FLAG_MARKER: u8 = 0b0000_0001;
const FLAG_KEYFRAME: u8 = 0b0000_0010;

/// One media datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub ssrc: u32,
    /// Wrapping 16-bit sequence number.
    pub seq: u16,
    /// Media clock timestamp; identical for every packet of one frame.
    pub ts: u32,
    /// Set on the last packet of a frame.
    pub marker: bool,
    pub keyframe: bool,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Serialize to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.ssrc.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.ts.to_le_bytes());
        let mut flags = 0u8;
        if self.marker {
            flags |= FLAG_MARKER;
        }
        if self.keyframe {
            flags |= FLAG_KEYFRAME;
        }
        buf.push(flags);
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, LtError> {
        if data.len() < HEADER_LEN {
            return Err(LtError::Protocol("rtp packet shorter than header"));
        }
        let ssrc = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        let seq = u16::from_le_bytes(data[4..6].try_into().expect("2-byte slice"));
        let ts = u32::from_le_bytes(data[6..10].try_into().expect("4-byte slice"));
        let flags = data[10];
        let len = u16::from_le_bytes(data[11..13].try_into().expect("2-byte slice")) as usize;
        if data.len() < HEADER_LEN + len {
            return Err(LtError::Protocol("rtp payload truncated"));
        }
        Ok(Self {
            ssrc,
            seq,
            ts,
            marker: flags & FLAG_MARKER != 0,
            keyframe: flags & FLAG_KEYFRAME != 0,
            payload: data[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }
}

/// Convert a capture timestamp (µs) to the 90 kHz media clock.
pub fn video_ts(capture_ts_us: i64) -> u32 {
    (capture_ts_us as u64 * VIDEO_CLOCK_HZ / 1_000_000) as u32
}

// ── SeqUnwrapper ─────────────────────────────────────────────────

/// Unwraps the 16-bit wrapping sequence into a monotonically increasing
/// i64, tolerating reordering around the wrap point.
#[derive(Debug, Default)]
pub struct SeqUnwrapper {
    last_seq: Option<u16>,
    cycles: i64,
}

impl SeqUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            return seq as i64;
        };
        let forward = seq.wrapping_sub(last);
        if forward < 0x8000 {
            // Moving forward, possibly across the wrap.
            if seq < last {
                self.cycles += 1;
            }
            self.last_seq = Some(seq);
            self.cycles * 0x1_0000 + seq as i64
        } else {
            // Reordered packet from before `last`.
            let cycles = if seq > last {
                self.cycles - 1
            } else {
                self.cycles
            };
            cycles * 0x1_0000 + seq as i64
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
