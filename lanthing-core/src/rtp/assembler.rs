//! Frame packetization and reassembly for the media subchannel.
//!
//! A frame travels as a run of [`RtpPacket`]s with consecutive sequence
//! numbers and the marker bit on the last one. Each packet payload starts
//! with a 2-byte fragment index, so any single packet pins down where its
//! frame begins in sequence space; the first fragment additionally carries
//! the frame metadata header. The assembler emits a frame once every
//! fragment of a marker-terminated span has arrived, and drops incomplete
//! frames older than the newest complete one, counting their missing
//! packets. There is no retransmit loop; loss is absorbed by a keyframe
//! request from the decoder side.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::LtError;
use crate::rtp::packet::{RtpPacket, SeqUnwrapper, MAX_PAYLOAD};
use crate::types::{EncodedUnit, VideoCodec};

/// Per-fragment overhead inside the RTP payload.
const FRAG_HEADER_LEN: usize = 2;
/// Incomplete frames kept around before the oldest is abandoned.
const MAX_PARTIAL_FRAMES: usize = 8;

// ── FrameMeta ────────────────────────────────────────────────────

/// Frame metadata carried at the head of fragment 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameMeta {
    picture_id: u32,
    capture_ts_us: i64,
    width: u32,
    height: u32,
    codec: VideoCodec,
}

const META_MAGIC: u16 = 0x4C46; // "FL"
const META_LEN: usize = 23;

impl FrameMeta {
    fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[0..2].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[2..6].copy_from_slice(&self.picture_id.to_le_bytes());
        buf[6..14].copy_from_slice(&self.capture_ts_us.to_le_bytes());
        buf[14..18].copy_from_slice(&self.width.to_le_bytes());
        buf[18..22].copy_from_slice(&self.height.to_le_bytes());
        buf[22] = match self.codec {
            VideoCodec::H264 => 0,
            VideoCodec::H265 => 1,
        };
        buf
    }

    fn decode(data: &[u8]) -> Result<Self, LtError> {
        if data.len() < META_LEN {
            return Err(LtError::Protocol("frame meta truncated"));
        }
        if u16::from_le_bytes(data[0..2].try_into().expect("2-byte slice")) != META_MAGIC {
            return Err(LtError::Protocol("bad frame meta magic"));
        }
        let codec = match data[22] {
            0 => VideoCodec::H264,
            1 => VideoCodec::H265,
            _ => return Err(LtError::Protocol("unknown codec tag")),
        };
        Ok(Self {
            picture_id: u32::from_le_bytes(data[2..6].try_into().expect("4-byte slice")),
            capture_ts_us: i64::from_le_bytes(data[6..14].try_into().expect("8-byte slice")),
            width: u32::from_le_bytes(data[14..18].try_into().expect("4-byte slice")),
            height: u32::from_le_bytes(data[18..22].try_into().expect("4-byte slice")),
            codec,
        })
    }
}

// ── Packetizer ───────────────────────────────────────────────────

/// Split one encoded unit into media packets, advancing `seq`.
pub fn packetize(unit: &EncodedUnit, ssrc: u32, seq: &mut u16) -> Vec<RtpPacket> {
    let meta = FrameMeta {
        picture_id: unit.picture_id,
        capture_ts_us: unit.capture_ts_us,
        width: unit.width,
        height: unit.height,
        codec: unit.codec,
    };
    let mut stream = Vec::with_capacity(META_LEN + unit.bytes.len());
    stream.extend_from_slice(&meta.encode());
    stream.extend_from_slice(&unit.bytes);

    let chunk_len = MAX_PAYLOAD - FRAG_HEADER_LEN;
    let ts = crate::rtp::packet::video_ts(unit.capture_ts_us);
    let chunks: Vec<&[u8]> = stream.chunks(chunk_len).collect();
    let last = chunks.len() - 1;

    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut payload = Vec::with_capacity(FRAG_HEADER_LEN + chunk.len());
            payload.extend_from_slice(&(index as u16).to_le_bytes());
            payload.extend_from_slice(chunk);
            let packet = RtpPacket {
                ssrc,
                seq: *seq,
                ts,
                marker: index == last,
                keyframe: unit.is_keyframe,
                payload,
            };
            *seq = seq.wrapping_add(1);
            packet
        })
        .collect()
}

// ── FrameAssembler ───────────────────────────────────────────────

/// A frame emitted by the assembler, tagged with its unwrapped frame id
/// (the unwrapped sequence number of its marker packet).
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub frame_id: i64,
    pub unit: EncodedUnit,
}

struct Partial {
    /// fragment index → payload chunk.
    chunks: BTreeMap<u16, Vec<u8>>,
    /// Total fragment count, known once the marker arrives.
    total: Option<u16>,
    keyframe: bool,
}

impl Partial {
    /// How many packets of this frame are missing, as far as the receiver
    /// can know. Exact when the marker arrived; a lower bound otherwise
    /// (fragments past the highest received one are unknowable).
    fn missing(&self) -> u64 {
        let span = match self.total {
            Some(total) => total as u64,
            None => self
                .chunks
                .keys()
                .next_back()
                .map(|&hi| hi as u64 + 1)
                .unwrap_or(0),
        };
        span.saturating_sub(self.chunks.len() as u64)
    }
}

/// Receiver-side reassembly for one SSRC.
pub struct FrameAssembler {
    ssrc: u32,
    unwrapper: SeqUnwrapper,
    /// Unwrapped first-sequence of the frame → partial state.
    partials: BTreeMap<i64, Partial>,
    /// Frames older than this are stale.
    newest_complete: Option<i64>,
    packets_lost: u64,
    frames_dropped: u64,
}

impl FrameAssembler {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            unwrapper: SeqUnwrapper::new(),
            partials: BTreeMap::new(),
            newest_complete: None,
            packets_lost: 0,
            frames_dropped: 0,
        }
    }

    /// Missing packets counted across dropped frames.
    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    /// Incomplete frames discarded.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Feed one packet; returns a frame when its last missing fragment
    /// arrives.
    pub fn on_packet(&mut self, packet: &RtpPacket) -> Option<AssembledFrame> {
        if packet.ssrc != self.ssrc {
            return None;
        }
        if packet.payload.len() < FRAG_HEADER_LEN {
            return None;
        }
        let frag_index =
            u16::from_le_bytes(packet.payload[0..2].try_into().expect("2-byte slice"));
        let useq = self.unwrapper.unwrap(packet.seq);
        let base = useq - frag_index as i64;

        // Anything belonging to a frame older than the newest complete
        // one is stale.
        if let Some(newest) = self.newest_complete {
            if base <= newest {
                return None;
            }
        }

        let partial = self.partials.entry(base).or_insert_with(|| Partial {
            chunks: BTreeMap::new(),
            total: None,
            keyframe: packet.keyframe,
        });
        partial
            .chunks
            .entry(frag_index)
            .or_insert_with(|| packet.payload[FRAG_HEADER_LEN..].to_vec());
        if packet.marker {
            partial.total = Some(frag_index + 1);
        }

        let complete = partial
            .total
            .is_some_and(|total| partial.chunks.len() == total as usize);
        if !complete {
            self.evict_overflow();
            return None;
        }

        let partial = self.partials.remove(&base).expect("partial just inserted");
        let total = partial.total.expect("checked complete");
        self.drop_older_than(base);
        self.newest_complete = Some(base);

        match assemble(base, total, partial) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("discarding undecodable frame at seq {base}: {e}");
                self.frames_dropped += 1;
                None
            }
        }
    }

    /// Discard incomplete frames older than `base`, counting their
    /// missing packets.
    fn drop_older_than(&mut self, base: i64) {
        let stale: Vec<i64> = self
            .partials
            .range(..base)
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            let partial = self.partials.remove(&key).expect("key from range");
            self.packets_lost += partial.missing();
            self.frames_dropped += 1;
        }
    }

    /// Bound memory: abandon the oldest partial once too many pile up.
    fn evict_overflow(&mut self) {
        while self.partials.len() > MAX_PARTIAL_FRAMES {
            let (&oldest, _) = self.partials.iter().next().expect("non-empty");
            let partial = self.partials.remove(&oldest).expect("key exists");
            self.packets_lost += partial.missing();
            self.frames_dropped += 1;
        }
    }
}

fn assemble(base: i64, total: u16, partial: Partial) -> Result<AssembledFrame, LtError> {
    let mut stream = Vec::new();
    for (_, chunk) in partial.chunks {
        stream.extend_from_slice(&chunk);
    }
    let meta = FrameMeta::decode(&stream)?;
    Ok(AssembledFrame {
        frame_id: base + total as i64 - 1,
        unit: EncodedUnit {
            picture_id: meta.picture_id,
            codec: meta.codec,
            is_keyframe: partial.keyframe,
            temporal_id: 0,
            bytes: stream[META_LEN..].to_vec(),
            capture_ts_us: meta.capture_ts_us,
            encode_start_ts_us: 0,
            encode_end_ts_us: 0,
            width: meta.width,
            height: meta.height,
        },
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(picture_id: u32, payload_len: usize, is_keyframe: bool) -> EncodedUnit {
        EncodedUnit {
            picture_id,
            codec: VideoCodec::H265,
            is_keyframe,
            temporal_id: 0,
            bytes: (0..payload_len).map(|i| (i % 251) as u8).collect(),
            capture_ts_us: 33_000,
            encode_start_ts_us: 0,
            encode_end_ts_us: 0,
            width: 1920,
            height: 1080,
        }
    }

    #[test]
    fn single_packet_frame() {
        let mut seq = 10u16;
        let packets = packetize(&unit(1, 100, true), 7, &mut seq);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].marker);
        assert_eq!(seq, 11);

        let mut asm = FrameAssembler::new(7);
        let frame = asm.on_packet(&packets[0]).expect("complete frame");
        assert_eq!(frame.unit.picture_id, 1);
        assert_eq!(frame.unit.bytes, unit(1, 100, true).bytes);
        assert!(frame.unit.is_keyframe);
        assert_eq!(frame.frame_id, 10);
    }

    #[test]
    fn multi_packet_frame_in_order() {
        let mut seq = 0u16;
        let packets = packetize(&unit(2, 5_000, false), 7, &mut seq);
        assert!(packets.len() > 1);
        assert!(packets.last().unwrap().marker);
        assert!(packets[..packets.len() - 1].iter().all(|p| !p.marker));

        let mut asm = FrameAssembler::new(7);
        let mut emitted = None;
        for packet in &packets {
            if let Some(frame) = asm.on_packet(packet) {
                emitted = Some(frame);
            }
        }
        let frame = emitted.expect("complete frame");
        assert_eq!(frame.unit.picture_id, 2);
        assert_eq!(frame.unit.bytes, unit(2, 5_000, false).bytes);
        assert_eq!(frame.unit.width, 1920);
    }

    #[test]
    fn reordered_span_emits_once_with_marker_frame_id() {
        // Sequence 10..=14 delivered as [10, 11, 13, 12, 14(marker)].
        let mut seq = 10u16;
        let payload_len = (MAX_PAYLOAD - FRAG_HEADER_LEN) * 4;
        let packets = packetize(&unit(3, payload_len, false), 9, &mut seq);
        assert_eq!(packets.len(), 5);

        let mut asm = FrameAssembler::new(9);
        let order = [0usize, 1, 3, 2, 4];
        let mut frames = Vec::new();
        for &i in &order {
            if let Some(frame) = asm.on_packet(&packets[i]) {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_id, 14);
        assert_eq!(frames[0].unit.bytes, unit(3, payload_len, false).bytes);
        assert_eq!(asm.packets_lost(), 0);
    }

    #[test]
    fn older_incomplete_frame_dropped_when_newer_completes() {
        let mut seq = 0u16;
        let frame_a = packetize(&unit(1, 3_000, false), 9, &mut seq);
        let frame_b = packetize(&unit(2, 3_000, false), 9, &mut seq);
        assert_eq!(frame_a.len(), 3);

        let mut asm = FrameAssembler::new(9);
        // Frame A loses its middle packet; frame B arrives whole.
        asm.on_packet(&frame_a[0]);
        asm.on_packet(&frame_a[2]);
        let mut emitted = Vec::new();
        for packet in &frame_b {
            if let Some(frame) = asm.on_packet(packet) {
                emitted.push(frame);
            }
        }
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].unit.picture_id, 2);
        assert_eq!(asm.frames_dropped(), 1);
        assert_eq!(asm.packets_lost(), 1);

        // A's straggler arriving late must not resurrect the frame.
        assert!(asm.on_packet(&frame_a[1]).is_none());
    }

    #[test]
    fn duplicate_packets_ignored() {
        let mut seq = 0u16;
        let packets = packetize(&unit(4, 3_000, false), 9, &mut seq);
        let mut asm = FrameAssembler::new(9);
        asm.on_packet(&packets[0]);
        asm.on_packet(&packets[0]);
        asm.on_packet(&packets[1]);
        let frame = asm.on_packet(&packets[2]).expect("complete");
        assert_eq!(frame.unit.bytes, unit(4, 3_000, false).bytes);
    }

    #[test]
    fn wrong_ssrc_ignored() {
        let mut seq = 0u16;
        let packets = packetize(&unit(5, 100, false), 9, &mut seq);
        let mut asm = FrameAssembler::new(1234);
        assert!(asm.on_packet(&packets[0]).is_none());
        assert_eq!(asm.packets_lost(), 0);
    }

    #[test]
    fn partial_overflow_is_bounded() {
        let mut seq = 0u16;
        let mut asm = FrameAssembler::new(9);
        // Feed only the first packet of many multi-packet frames.
        for picture_id in 0..20 {
            let packets = packetize(&unit(picture_id, 3_000, false), 9, &mut seq);
            asm.on_packet(&packets[0]);
        }
        assert!(asm.frames_dropped() > 0);
    }

    // ── Property: arbitrary arrival order and loss within one frame ──

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn permuted_delivery_emits_exactly_once(
                payload_len in 1usize..8_000,
                shuffle_seed in any::<u64>(),
            ) {
                let mut seq = 100u16;
                let source = unit(7, payload_len, true);
                let mut packets = packetize(&source, 9, &mut seq);

                // Deterministic shuffle from the seed.
                let mut state = shuffle_seed | 1;
                for i in (1..packets.len()).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    packets.swap(i, (state as usize) % (i + 1));
                }

                let mut asm = FrameAssembler::new(9);
                let mut emitted = Vec::new();
                for packet in &packets {
                    if let Some(frame) = asm.on_packet(packet) {
                        emitted.push(frame);
                    }
                }
                prop_assert_eq!(emitted.len(), 1);
                prop_assert_eq!(&emitted[0].unit.bytes, &source.bytes);
                prop_assert_eq!(asm.packets_lost(), 0);
            }

            #[test]
            fn lossy_delivery_counts_missing(
                payload_len in 2_400usize..8_000,
                loss_mask in any::<u32>(),
            ) {
                let mut seq = 0u16;
                let source = unit(8, payload_len, false);
                let packets = packetize(&source, 9, &mut seq);
                prop_assume!(packets.len() >= 3);

                // Always deliver the marker so the frame span is known,
                // drop an arbitrary subset of the rest.
                let survivors: Vec<&RtpPacket> = packets
                    .iter()
                    .enumerate()
                    .filter(|(i, p)| p.marker || loss_mask & (1 << (i % 32)) == 0)
                    .map(|(_, p)| p)
                    .collect();
                let dropped = packets.len() - survivors.len();

                let mut asm = FrameAssembler::new(9);
                let mut emitted = Vec::new();
                for packet in &survivors {
                    if let Some(frame) = asm.on_packet(packet) {
                        emitted.push(frame);
                    }
                }

                if dropped == 0 {
                    prop_assert_eq!(emitted.len(), 1);
                    prop_assert_eq!(&emitted[0].unit.bytes, &source.bytes);
                } else {
                    // Incomplete: nothing surfaced. A later frame flushes
                    // the partial and the count must match the drops.
                    prop_assert!(emitted.is_empty());
                    let mut next_seq = packets.len() as u16;
                    let flush = packetize(&unit(9, 10, true), 9, &mut next_seq);
                    for packet in &flush {
                        asm.on_packet(packet);
                    }
                    prop_assert_eq!(asm.packets_lost(), dropped as u64);
                }
            }
        }
    }
}
