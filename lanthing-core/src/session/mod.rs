//! Session lifecycle: the state machine shared by client and worker.
//!
//! ```text
//!  Idle ──► SignalingConnecting ──► SignalingConnected ──► Negotiating
//!                                                               │
//!                 ┌──────────── Working ◄── TransportConnecting ┘
//!                 │                ▲ │
//!                 │   Reconnecting ┘ │
//!                 ▼        │         ▼
//!               Closed ◄───┴─────────┘
//! ```
//!
//! Transitions only move forward, except `Working ⇄ Reconnecting` and the
//! `→ Closed` edge reachable from everywhere. `Working` is only entered
//! once `StartWorkingAck{Success}` has been observed; transport
//! connectivity alone is not enough.

pub mod client;
pub mod worker;

use crate::error::LtError;

/// Keep-alive send cadence on the reliable channel.
pub const KEEP_ALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);
/// Silence on the reliable channel after which the session is broken.
pub const KEEP_ALIVE_TIMEOUT_MS: i64 = 3_000;
/// Reconnect backoff cap.
pub const RECONNECT_MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);
/// Reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Time-sync exchange cadence.
pub const TIME_SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

// ── SessionState ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    SignalingConnecting,
    SignalingConnected,
    Negotiating,
    TransportConnecting,
    Working,
    Reconnecting,
    /// The only terminal state.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl SessionState {
    pub fn is_working(&self) -> bool {
        matches!(self, SessionState::Working)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// `start`: open the signaling client.
    pub fn start(&mut self) -> Result<(), LtError> {
        self.advance(
            matches!(self, SessionState::Idle),
            SessionState::SignalingConnecting,
            "start requires Idle",
        )
    }

    /// The signaling TCP link is up.
    pub fn signaling_connected(&mut self) -> Result<(), LtError> {
        self.advance(
            matches!(self, SessionState::SignalingConnecting),
            SessionState::SignalingConnected,
            "signaling_connected requires SignalingConnecting",
        )
    }

    /// `JoinRoomAck{ok}`: start posting streaming params.
    pub fn join_ok(&mut self) -> Result<(), LtError> {
        self.advance(
            matches!(self, SessionState::SignalingConnected),
            SessionState::Negotiating,
            "join_ok requires SignalingConnected",
        )
    }

    /// Parameters agreed: bring the transport up.
    pub fn params_ok(&mut self) -> Result<(), LtError> {
        self.advance(
            matches!(self, SessionState::Negotiating),
            SessionState::TransportConnecting,
            "params_ok requires Negotiating",
        )
    }

    /// `StartWorkingAck{Success}` observed on a live transport.
    pub fn working(&mut self) -> Result<(), LtError> {
        self.advance(
            matches!(
                self,
                SessionState::TransportConnecting | SessionState::Reconnecting
            ),
            SessionState::Working,
            "working requires TransportConnecting or Reconnecting",
        )
    }

    /// Keep-alive silence exceeded the deadline.
    pub fn reconnecting(&mut self) -> Result<(), LtError> {
        self.advance(
            matches!(self, SessionState::Working),
            SessionState::Reconnecting,
            "reconnecting requires Working",
        )
    }

    /// Terminal; valid from every state and idempotent.
    pub fn close(&mut self) {
        *self = SessionState::Closed;
    }

    fn advance(
        &mut self,
        valid: bool,
        next: SessionState,
        why: &'static str,
    ) -> Result<(), LtError> {
        if !valid {
            return Err(LtError::InvalidTransition(why));
        }
        *self = next;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut state = SessionState::default();
        assert_eq!(state, SessionState::Idle);
        state.start().unwrap();
        state.signaling_connected().unwrap();
        state.join_ok().unwrap();
        state.params_ok().unwrap();
        state.working().unwrap();
        assert!(state.is_working());
        state.close();
        assert!(state.is_closed());
    }

    #[test]
    fn reconnect_cycle() {
        let mut state = SessionState::Working;
        state.reconnecting().unwrap();
        assert_eq!(state, SessionState::Reconnecting);
        state.working().unwrap();
        assert!(state.is_working());
    }

    #[test]
    fn no_working_before_ack_path() {
        // Transport connectivity is represented by TransportConnecting;
        // only the ack-driven transition enters Working, and it is
        // rejected from every earlier state.
        for earlier in [
            SessionState::Idle,
            SessionState::SignalingConnecting,
            SessionState::SignalingConnected,
            SessionState::Negotiating,
        ] {
            let mut state = earlier;
            assert!(state.working().is_err(), "entered Working from {earlier}");
        }
    }

    #[test]
    fn no_backward_transitions() {
        let mut state = SessionState::Working;
        assert!(state.start().is_err());
        assert!(state.signaling_connected().is_err());
        assert!(state.join_ok().is_err());
        assert!(state.params_ok().is_err());
    }

    #[test]
    fn close_from_anywhere_is_idempotent() {
        for s in [
            SessionState::Idle,
            SessionState::Negotiating,
            SessionState::Working,
            SessionState::Reconnecting,
            SessionState::Closed,
        ] {
            let mut state = s;
            state.close();
            state.close();
            assert!(state.is_closed());
        }
    }

    #[test]
    fn reconnecting_only_from_working() {
        let mut state = SessionState::TransportConnecting;
        assert!(state.reconnecting().is_err());
    }

    #[test]
    fn closed_rejects_everything_but_close() {
        let mut state = SessionState::Closed;
        assert!(state.start().is_err());
        assert!(state.working().is_err());
        assert!(state.reconnecting().is_err());
        assert!(state.is_closed());
    }
}
