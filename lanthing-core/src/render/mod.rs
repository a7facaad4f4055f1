//! Presentation: pacing, cursor overlay state, and viewport mapping.
//!
//! The render side answers three questions per decoded frame: *when* to
//! present it (jitter-buffered deadline against the local vblank), *where*
//! the remote cursor lands in render coordinates, and *what* rectangle the
//! video occupies after rotation and stretch are applied.

pub mod pipeline;

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::CursorInfo;

// ── Presentation timing ──────────────────────────────────────────

/// Shared timing inputs, refreshed by the session's time-sync exchanges.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresentTiming {
    /// Smoothed round trip to the host.
    pub rtt_us: i64,
    /// Local-minus-remote clock difference: `local ≈ remote + diff`.
    pub time_diff_us: i64,
}

/// What to do with a frame that is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentDecision {
    Present,
    /// Not due yet; wait this long.
    Wait(Duration),
    /// Late by more than one refresh interval.
    Drop,
}

/// Inter-arrival jitter estimator (EWMA of absolute deviation).
#[derive(Debug, Default)]
pub struct JitterEstimator {
    last_arrival_us: Option<i64>,
    last_delta_us: i64,
    /// Smoothed absolute deviation between consecutive deltas.
    jitter_us: i64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_arrival(&mut self, now_us: i64) {
        if let Some(last) = self.last_arrival_us {
            let delta = now_us - last;
            let deviation = (delta - self.last_delta_us).abs();
            // Same 1/8 smoothing as the RTT estimator.
            self.jitter_us = self.jitter_us * 7 / 8 + deviation / 8;
            self.last_delta_us = delta;
        }
        self.last_arrival_us = Some(now_us);
    }

    pub fn jitter_us(&self) -> i64 {
        self.jitter_us
    }
}

/// Deadline computation for one stream.
#[derive(Debug)]
pub struct PresentClock {
    refresh_interval_us: i64,
    timing: Mutex<PresentTiming>,
}

impl PresentClock {
    pub fn new(refresh_hz: u32) -> Self {
        Self {
            refresh_interval_us: 1_000_000 / refresh_hz.max(1) as i64,
            timing: Mutex::new(PresentTiming::default()),
        }
    }

    /// Refresh the timing inputs (called from the control channel side).
    pub fn set_timing(&self, timing: PresentTiming) {
        *self.timing.lock().expect("present timing poisoned") = timing;
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_micros(self.refresh_interval_us as u64)
    }

    /// The jitter-buffer delay: at least one frame interval, at most what
    /// the path demands (`rtt/2 + jitter`).
    pub fn buffer_delay_us(&self, jitter_us: i64) -> i64 {
        let timing = self.timing.lock().expect("present timing poisoned");
        self.refresh_interval_us.max(timing.rtt_us / 2 + jitter_us)
    }

    /// When `capture_ts_us` (remote clock) should hit the screen, in the
    /// local clock.
    pub fn deadline_us(&self, capture_ts_us: i64, jitter_us: i64) -> i64 {
        let diff = self
            .timing
            .lock()
            .expect("present timing poisoned")
            .time_diff_us;
        capture_ts_us + diff + self.buffer_delay_us(jitter_us)
    }

    /// Decide what to do with a frame at local time `now_us`.
    pub fn decide(&self, now_us: i64, capture_ts_us: i64, jitter_us: i64) -> PresentDecision {
        let deadline = self.deadline_us(capture_ts_us, jitter_us);
        if now_us < deadline {
            return PresentDecision::Wait(Duration::from_micros((deadline - now_us) as u64));
        }
        if now_us - deadline > self.refresh_interval_us {
            return PresentDecision::Drop;
        }
        PresentDecision::Present
    }
}

// ── Cursor ───────────────────────────────────────────────────────

/// Mutex-guarded remote cursor state.
///
/// Writer is the control channel, reader is the render loop. Updates
/// without a pixmap only move or hide the last known cursor; its shape is
/// kept.
#[derive(Debug, Default)]
pub struct CursorState {
    current: Mutex<Option<CursorInfo>>,
}

impl CursorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, incoming: CursorInfo) {
        let mut current = self.current.lock().expect("cursor state poisoned");
        if incoming.pixmap.is_some() {
            *current = Some(incoming);
            return;
        }
        match current.as_mut() {
            Some(existing) => {
                existing.screen_w = incoming.screen_w;
                existing.screen_h = incoming.screen_h;
                existing.x = incoming.x;
                existing.y = incoming.y;
                existing.visible = incoming.visible;
            }
            None => *current = Some(incoming),
        }
    }

    pub fn snapshot(&self) -> Option<CursorInfo> {
        self.current.lock().expect("cursor state poisoned").clone()
    }

    /// The cursor position scaled into render coordinates, or `None` when
    /// there is no visible cursor.
    pub fn position_in(&self, render_w: u32, render_h: u32) -> Option<(i32, i32)> {
        let current = self.current.lock().expect("cursor state poisoned");
        let cursor = current.as_ref()?;
        if !cursor.visible || cursor.screen_w == 0 || cursor.screen_h == 0 {
            return None;
        }
        Some((
            cursor.x * render_w as i32 / cursor.screen_w as i32,
            cursor.y * render_h as i32 / cursor.screen_h as i32,
        ))
    }
}

// ── Viewport ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(deg: u32) -> Option<Self> {
        match deg {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    /// Whether this rotation swaps width and height.
    pub fn transposes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stretch {
    /// Fit entirely inside the target, bars on the short axis.
    Letterbox,
    /// Cover the whole target, cropping the long axis.
    Fill,
}

/// The rectangle the video occupies in the render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Map a video of `video_w × video_h` into a `target_w × target_h`
/// surface under the given rotation and stretch mode.
pub fn target_rect(
    target_w: u32,
    target_h: u32,
    video_w: u32,
    video_h: u32,
    rotation: Rotation,
    stretch: Stretch,
) -> TargetRect {
    let (vw, vh) = if rotation.transposes() {
        (video_h, video_w)
    } else {
        (video_w, video_h)
    };
    if vw == 0 || vh == 0 || target_w == 0 || target_h == 0 {
        return TargetRect {
            x: 0,
            y: 0,
            width: target_w,
            height: target_h,
        };
    }

    let scale_x = target_w as f64 / vw as f64;
    let scale_y = target_h as f64 / vh as f64;
    let scale = match stretch {
        Stretch::Letterbox => scale_x.min(scale_y),
        Stretch::Fill => scale_x.max(scale_y),
    };
    let width = (vw as f64 * scale).round() as u32;
    let height = (vh as f64 * scale).round() as u32;
    TargetRect {
        x: (target_w as i32 - width as i32) / 2,
        y: (target_h as i32 - height as i32) / 2,
        width,
        height,
    }
}

// ── Tests ────────────────────────────────────────────────────────
