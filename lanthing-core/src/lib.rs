//! Lanthing core: the real-time remote-desktop streaming pipeline and its
//! control plane.
//!
//! The host side captures the screen into a fixed pool of shareable
//! slots, encodes each frame, and streams it over a pluggable transport;
//! the client side reassembles, decodes and presents against the local
//! vblank while feeding control traffic back. Session negotiation and
//! the rendezvous signaling that bootstrap the path live here too; the
//! GUI launcher and OS service integration are thin shells around this
//! crate.

pub mod audio;
pub mod capture;
pub mod clipboard;
pub mod decode;
pub mod encode;
pub mod error;
pub mod message;
pub mod negotiate;
pub mod pipe;
pub mod render;
pub mod rtp;
pub mod session;
pub mod signaling;
pub mod time;
pub mod transport;
pub mod types;
pub mod watchdog;

pub use clipboard::{ClipboardSink, MemoryClipboard};
pub use error::{ExitReason, LtError};
pub use message::{ControlMessage, MessageKind, MessageRouter};
pub use negotiate::{DisplaySetting, SessionParams};
pub use session::client::{ClientSession, ClientSessionParams};
pub use session::worker::{Worker, WorkerParams};
pub use session::SessionState;
pub use types::{AudioCodec, EncodedUnit, EncoderBackend, Frame, VideoCodec};
