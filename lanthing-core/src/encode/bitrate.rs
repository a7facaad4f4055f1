//! Closed-loop bitrate controller.
//!
//! Receiver-reported statistics (`SendSideStat`) arrive over the control
//! channel; the controller nudges the target bitrate between the
//! configured bounds and decides when loss is bad enough to force a
//! keyframe. Targets are advisory: the encoder maps them onto whatever
//! quality knob its backend has.

use crate::message::SendSideStat;
use crate::negotiate::RateControlConfig;

/// What the encoder should do after a stats update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub target_bps: u32,
    pub force_keyframe: bool,
}

/// Additive-increase / multiplicative-decrease controller.
pub struct RateController {
    config: RateControlConfig,
    current_bps: u32,
}

impl RateController {
    pub fn new(config: RateControlConfig) -> Self {
        let current_bps = config
            .start_bitrate_bps
            .clamp(config.min_bitrate_bps, config.max_bitrate_bps);
        Self {
            config,
            current_bps,
        }
    }

    pub fn current_bps(&self) -> u32 {
        self.current_bps
    }

    /// Feed one receiver report.
    pub fn on_stat(&mut self, stat: &SendSideStat) -> RateDecision {
        let lossy = stat.loss_pct >= self.config.loss_threshold_pct as f32;
        if lossy {
            // Back off hard: three quarters of the current rate.
            self.current_bps = (self.current_bps / 4 * 3).max(self.config.min_bitrate_bps);
        } else if stat.loss_pct < 1.0 {
            // Clean window: creep up toward the estimate and the cap.
            let headroom_cap = if stat.bwe_bps > 0 {
                (stat.bwe_bps as u32).min(self.config.max_bitrate_bps)
            } else {
                self.config.max_bitrate_bps
            };
            let bumped = self.current_bps.saturating_add(self.current_bps / 10);
            self.current_bps = bumped.min(headroom_cap).max(self.config.min_bitrate_bps);
        }
        RateDecision {
            target_bps: self.current_bps,
            force_keyframe: lossy,
        }
    }

    /// Map the current target onto a zstd compression level for the
    /// software backend: starved links compress harder.
    pub fn compression_level(&self) -> i32 {
        let range = (self.config.max_bitrate_bps - self.config.min_bitrate_bps).max(1);
        let pos = self.current_bps.saturating_sub(self.config.min_bitrate_bps);
        // min bitrate → level 9, max bitrate → level 1.
        (9 - (pos as u64 * 8 / range as u64) as i32).clamp(1, 9)
    }
}

// ── Tests ────────────────────────────────────────────────────────
