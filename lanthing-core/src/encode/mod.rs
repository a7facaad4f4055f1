//! Video encoding: ability probing, the encoder proper, and its runner.
//!
//! The encoder consumes [`Frame`]s referencing pool slots and produces one
//! [`EncodedUnit`] per input. It opens the slot by its shareable name on
//! the same adapter (LUID) the capturer used, and never retains the slot
//! after returning; the runner releases the slot once the encoder is done.
//!
//! Hardware backends (NvEnc, QuickSync, AMF) are probed on Windows; the
//! software backend is always available and packages frames in a zstd
//! container, which keeps the whole pipeline exercisable on any machine.

pub mod bitrate;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capture::pool::FramePool;
use crate::error::LtError;
use crate::message::SendSideStat;
use crate::negotiate::{EncodeAbility, RateControlConfig};
use crate::time::steady_now_us;
use crate::types::{EncodedUnit, EncoderBackend, Frame, PipelineStats, VideoCodec};
use bitrate::RateController;

/// How long the encoder waits for the writer to hand over a slot.
const SLOT_OPEN_TIMEOUT: Duration = Duration::from_millis(20);

// ── Ability probing ──────────────────────────────────────────────

/// Probe which encoders can run on the adapter identified by `luid` at the
/// given resolution. Order matters: the negotiator walks the client's
/// codec preference against this list.
pub fn check_encode_abilities(luid: i64, width: u32, height: u32) -> Vec<EncodeAbility> {
    let mut abilities = Vec::new();

    #[cfg(windows)]
    abilities.extend(probe_hardware(luid, width, height));
    #[cfg(not(windows))]
    let _ = (luid, width, height);

    // The software fallback is always present.
    abilities.push(EncodeAbility {
        backend: EncoderBackend::Software,
        codec: VideoCodec::H264,
    });
    abilities
}

#[cfg(windows)]
fn probe_hardware(luid: i64, width: u32, height: u32) -> Vec<EncodeAbility> {
    // Vendor SDK probing is an FFI exercise; without the SDKs linked in,
    // no hardware ability is reported and negotiation falls through to
    // the software backend.
    debug!("no hardware encoder SDK linked for luid={luid:#x} ({width}x{height})");
    Vec::new()
}

// ── VideoEncoder ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    pub codec: VideoCodec,
    pub backend: EncoderBackend,
    pub width: u32,
    pub height: u32,
    pub rate: RateControlConfig,
}

/// Stateful per-session encoder.
pub struct VideoEncoder {
    config: VideoEncoderConfig,
    rate: RateController,
    force_keyframe: bool,
    frames_encoded: u64,
    last_keyframe_us: i64,
}

impl VideoEncoder {
    pub fn new(config: VideoEncoderConfig) -> Result<Self, LtError> {
        if config.backend != EncoderBackend::Software {
            return Err(LtError::Init(format!(
                "encoder backend {:?} not available in this build",
                config.backend
            )));
        }
        let rate = RateController::new(config.rate);
        Ok(Self {
            config,
            rate,
            force_keyframe: false,
            frames_encoded: 0,
            last_keyframe_us: 0,
        })
    }

    /// Force the next frame to be a keyframe (params change, decoder
    /// recovery request).
    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    /// Feed a receiver report into the rate loop.
    pub fn on_send_side_stat(&mut self, stat: &SendSideStat) {
        let decision = self.rate.on_stat(stat);
        if decision.force_keyframe {
            self.force_keyframe = true;
        }
    }

    /// Current bitrate target in bits per second.
    pub fn target_bps(&self) -> u32 {
        self.rate.current_bps()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Encode one frame from its pool slot.
    ///
    /// The slot is only read under the keyed-mutex guard and is not
    /// retained; the caller releases the slot after this returns.
    pub fn encode(&mut self, frame: &Frame, pool: &FramePool) -> Result<EncodedUnit, LtError> {
        let start_us = steady_now_us();
        let is_keyframe = self.keyframe_due(start_us);

        let guard = pool.open_for_read(&frame.slot_name, SLOT_OPEN_TIMEOUT)?;
        let bytes = guard.with_bytes(|pixels| {
            zstd::encode_all(pixels, self.rate.compression_level())
                .map_err(|e| LtError::Encode(format!("zstd: {e}")))
        })?;
        drop(guard);

        if is_keyframe {
            self.last_keyframe_us = start_us;
            self.force_keyframe = false;
        }
        self.frames_encoded += 1;

        Ok(EncodedUnit {
            picture_id: frame.picture_id,
            codec: self.config.codec,
            is_keyframe,
            temporal_id: 0,
            bytes,
            capture_ts_us: frame.capture_ts_us,
            encode_start_ts_us: start_us,
            encode_end_ts_us: steady_now_us(),
            width: frame.width,
            height: frame.height,
        })
    }

    fn keyframe_due(&self, now_us: i64) -> bool {
        if self.frames_encoded == 0 || self.force_keyframe {
            return true;
        }
        let cadence_us = self.config.rate.keyframe_interval_ms as i64 * 1_000;
        now_us - self.last_keyframe_us >= cadence_us
    }
}

// ── Mailbox & runner ─────────────────────────────────────────────

/// Create the capture → encoder mailbox. A single slot: if the encoder
/// has not picked up the previous frame, the new one is dropped.
pub fn mailbox() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(1)
}

/// Offer a frame to the encoder without ever blocking the capture path.
///
/// On a full mailbox the frame is skipped: its slot goes straight back to
/// the pool and the skip is counted.
pub fn offer_frame(
    mailbox: &mpsc::Sender<Frame>,
    pool: &FramePool,
    stats: &PipelineStats,
    frame: Frame,
) {
    if let Err(e) = mailbox.try_send(frame) {
        let frame = match e {
            mpsc::error::TrySendError::Full(f) => f,
            mpsc::error::TrySendError::Closed(f) => f,
        };
        let _ = pool.release(&frame.slot_name);
        stats.encode_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Spawn the encoder loop: drain the mailbox, encode, release the slot,
/// forward the unit. Ends when the mailbox closes or the output side
/// hangs up.
///
/// The encoder is shared so the session can feed it keyframe requests
/// and receiver stats while the loop runs; the lock is only held across
/// one encode.
pub fn spawn_runner(
    encoder: Arc<std::sync::Mutex<VideoEncoder>>,
    pool: Arc<FramePool>,
    mut mailbox_rx: mpsc::Receiver<Frame>,
    out_tx: mpsc::Sender<EncodedUnit>,
    stats: Arc<PipelineStats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = mailbox_rx.recv().await {
            let result = encoder
                .lock()
                .expect("encoder poisoned")
                .encode(&frame, &pool);
            // The encoder has returned; the slot goes back regardless.
            if let Err(e) = pool.release(&frame.slot_name) {
                warn!("releasing slot after encode: {e}");
            }
            match result {
                Ok(unit) => {
                    if out_tx.send(unit).await.is_err() {
                        break;
                    }
                }
                Err(LtError::Timeout(_)) => {
                    stats.encode_skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("encode failed for picture {}: {e}", frame.picture_id);
                    stats.encode_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        debug!("encoder runner stopped");
    })
}

// ── Tests ────────────────────────────────────────────────────────
