//! Domain error types for the streaming core.
//!
//! All fallible operations return `Result<T, LtError>`.
//! No panics on invalid input; every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the streaming core.
///
/// Variants map onto the error taxonomy the session controller acts on:
/// configuration and initialization errors are fatal for the component,
/// transient network errors trigger reconnection, negotiation errors close
/// the session with a user-visible reason, protocol errors discard the
/// offending message.
#[derive(Debug, Error)]
pub enum LtError {
    // ── Startup ──────────────────────────────────────────────────
    /// Missing or invalid CLI option or settings value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A component failed to initialize (adapter enumeration, pool
    /// allocation, pipe bind, encoder probe).
    #[error("initialization failed: {0}")]
    Init(String),

    // ── Session ──────────────────────────────────────────────────
    /// The transport dropped while the session was working.
    #[error("transport lost: {0}")]
    TransientNetwork(String),

    /// No common codec, or the room could not be joined.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A state machine transition was requested from the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(&'static str),

    // ── Protocol ─────────────────────────────────────────────────
    /// A wire message violated framing or checksum rules.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Pipeline ─────────────────────────────────────────────────
    /// `release` was called with a slot name the pool never issued.
    #[error("unknown pool slot: {0}")]
    UnknownSlot(String),

    /// The encoder backend rejected the frame.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The decoder could not reconstruct the frame.
    #[error("decode failed: {0}")]
    Decode(String),

    // ── Mechanical ───────────────────────────────────────────────
    /// The OS I/O layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Serialization or deserialization of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LtError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LtError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for LtError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        LtError::Encoding(e.to_string())
    }
}

/// Terminal reason delivered through the session's single `on_exited`
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The local user or the remote peer requested a clean stop.
    UserStop,
    /// The remote side closed the session.
    RemoteClose,
    /// No common codec or no joinable room.
    NegotiationFailed,
    /// The transport could not be re-established within the retry budget.
    ReconnectFailed,
    /// Keep-alive silence exceeded the session deadline.
    KeepAliveTimeout,
    /// A component failed to initialize.
    InitFailed,
    /// The peer repeatedly violated the protocol.
    ProtocolAbuse,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::UserStop => "stopped by user",
            ExitReason::RemoteClose => "closed by remote",
            ExitReason::NegotiationFailed => "negotiation failed",
            ExitReason::ReconnectFailed => "reconnect failed",
            ExitReason::KeepAliveTimeout => "keep-alive timeout",
            ExitReason::InitFailed => "initialization failed",
            ExitReason::ProtocolAbuse => "protocol abuse",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = LtError::Negotiation("no common codec".into());
        assert!(e.to_string().contains("no common codec"));

        let e = LtError::PayloadTooLarge {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: LtError = io_err.into();
        assert!(matches!(e, LtError::Io(_)));
    }

    #[test]
    fn exit_reason_display() {
        assert_eq!(ExitReason::KeepAliveTimeout.to_string(), "keep-alive timeout");
        assert_eq!(ExitReason::UserStop.to_string(), "stopped by user");
    }
}
