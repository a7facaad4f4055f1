//! RTP-like media framing: packetization, sequence unwrapping, and
//! receiver-side frame reassembly.

pub mod assembler;
pub mod packet;

pub use assembler::{packetize, AssembledFrame, FrameAssembler};
pub use packet::{RtpPacket, SeqUnwrapper};
