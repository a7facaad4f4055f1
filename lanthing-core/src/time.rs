//! Monotonic clock helpers and the session time synchronizer.
//!
//! Capture timestamps, keep-alive deadlines and presentation scheduling all
//! use the same process-local steady clock so they can be compared without
//! worrying about wall-clock jumps.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed on the process-local steady clock.
///
/// The epoch is the first call in this process; only differences between
/// two readings are meaningful.
pub fn steady_now_us() -> i64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

/// Milliseconds elapsed on the process-local steady clock.
pub fn steady_now_ms() -> i64 {
    steady_now_us() / 1_000
}

// ── TimeSync ─────────────────────────────────────────────────────

/// Round-trip and clock-offset estimator fed by TimeSync exchanges.
///
/// The client stamps `t0` on send; the host echoes it with its own clock
/// `t1`; the client stamps `t2` on receipt. `rtt = t2 - t0` and the clock
/// difference (local minus remote, so `local ≈ remote + diff`) is
/// estimated assuming a symmetric path. Both values are smoothed with an
/// EWMA (alpha = 1/8).
#[derive(Debug, Default)]
pub struct TimeSync {
    smoothed_rtt_us: i64,
    smoothed_diff_us: i64,
    samples: u64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one completed exchange: local send time, remote echo time,
    /// local receive time (all in µs on each side's steady clock).
    pub fn update(&mut self, t0_us: i64, t1_us: i64, t2_us: i64) {
        let rtt = (t2_us - t0_us).max(0);
        let diff = (t0_us + rtt / 2) - t1_us;
        if self.samples == 0 {
            self.smoothed_rtt_us = rtt;
            self.smoothed_diff_us = diff;
        } else {
            // EWMA: s = 7/8 * s + 1/8 * sample
            self.smoothed_rtt_us = self.smoothed_rtt_us * 7 / 8 + rtt / 8;
            self.smoothed_diff_us = self.smoothed_diff_us * 7 / 8 + diff / 8;
        }
        self.samples += 1;
    }

    /// Smoothed round-trip time, or `Duration::ZERO` before any sample.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.smoothed_rtt_us.max(0) as u64)
    }

    /// Smoothed local-minus-remote clock difference in µs.
    pub fn time_diff_us(&self) -> i64 {
        self.smoothed_diff_us
    }

    /// Number of exchanges observed.
    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

// ── Tests ────────────────────────────────────────────────────────
