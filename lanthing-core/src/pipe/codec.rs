//! Wire framing shared by the IPC pipe and the reliable control channel.
//!
//! Each frame is a fixed header followed by the payload:
//!
//! ```text
//! magic:        u32  (4)  "LTM0"
//! type_id:      u32  (4)  32-bit control message type
//! checksum:     u32  (4)  first 4 LE bytes of blake3(payload); 0 if empty
//! payload_len:  u32  (4)
//! payload:      [u8] (payload_len)
//! ```
//!
//! All integers little-endian.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::LtError;
use crate::message::ControlMessage;

const MAGIC: u32 = u32::from_le_bytes(*b"LTM0");
pub const HEADER_LEN: usize = 16;

/// Largest payload a single frame may carry. Cursor pixmaps and file
/// chunks stay well under this.
pub const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    u32::from_le_bytes(hash.as_bytes()[0..4].try_into().expect("4-byte slice"))
}

// ── WireMessage ──────────────────────────────────────────────────

/// A raw frame: type id plus opaque payload. Decoding into a
/// [`ControlMessage`] happens one layer up so transports can forward
/// frames they do not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub type_id: u32,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn from_control(msg: &ControlMessage) -> Result<Self, LtError> {
        let (type_id, payload) = msg.encode()?;
        Ok(Self { type_id, payload })
    }

    pub fn to_control(&self) -> Result<ControlMessage, LtError> {
        ControlMessage::decode(self.type_id, &self.payload)
    }
}

// ── LtCodec ──────────────────────────────────────────────────────

/// Length-prefixed, checksummed frame codec for [`WireMessage`].
#[derive(Debug, Default)]
pub struct LtCodec;

impl Encoder<WireMessage> for LtCodec {
    type Error = LtError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_LEN {
            return Err(LtError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32_le(MAGIC);
        dst.put_u32_le(item.type_id);
        dst.put_u32_le(checksum(&item.payload));
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for LtCodec {
    type Item = WireMessage;
    type Error = LtError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = u32::from_le_bytes(src[0..4].try_into().expect("4-byte slice"));
        if magic != MAGIC {
            return Err(LtError::Protocol("bad frame magic"));
        }
        let type_id = u32::from_le_bytes(src[4..8].try_into().expect("4-byte slice"));
        let expected_checksum = u32::from_le_bytes(src[8..12].try_into().expect("4-byte slice"));
        let payload_len = u32::from_le_bytes(src[12..16].try_into().expect("4-byte slice")) as usize;

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(LtError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).to_vec();
        if checksum(&payload) != expected_checksum {
            return Err(LtError::Protocol("frame checksum mismatch"));
        }

        Ok(Some(WireMessage { type_id, payload }))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn frame_roundtrip() {
        let mut codec = LtCodec;
        let msg = WireMessage {
            type_id: MessageKind::KeepAlive as u32,
            payload: b"hello".to_vec(),
        };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_roundtrip() {
        let mut codec = LtCodec;
        let msg = WireMessage {
            type_id: 0x0001,
            payload: Vec::new(),
        };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = LtCodec;
        let msg = WireMessage {
            type_id: 7,
            payload: vec![0xAB; 64],
        };
        let mut full = BytesMut::new();
        codec.encode(msg.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..HEADER_LEN + 10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[HEADER_LEN + 10..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), msg);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut codec = LtCodec;
        let mut buf = BytesMut::from(&[0xFFu8; HEADER_LEN][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn corrupted_payload_rejected() {
        let mut codec = LtCodec;
        let msg = WireMessage {
            type_id: 7,
            payload: vec![1, 2, 3, 4],
        };
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let mut codec = LtCodec;
        let msg = WireMessage {
            type_id: 7,
            payload: vec![0; MAX_PAYLOAD_LEN + 1],
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(msg, &mut buf),
            Err(LtError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut codec = LtCodec;
        let a = WireMessage {
            type_id: 1,
            payload: b"a".to_vec(),
        };
        let b = WireMessage {
            type_id: 2,
            payload: b"bb".to_vec(),
        };
        let mut buf = BytesMut::new();
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
