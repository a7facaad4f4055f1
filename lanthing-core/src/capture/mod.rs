//! Screen capture: backends plus the producer loop.
//!
//! A [`VideoCapturer`] owns a dedicated producer thread which, per display
//! refresh: waits for vblank, polls the backend for a new frame (short
//! timeout, nothing emitted on a miss), copies it into a pool slot, stamps
//! a strictly increasing `picture_id` and the capture timestamp, and hands
//! the [`Frame`] to the sink. `stop()` is synchronous and idempotent.

pub mod dxgi;
pub mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::error::LtError;
use crate::negotiate::DisplaySetting;
use crate::time::steady_now_us;
use crate::types::{Frame, PixelFormat};
use crate::watchdog::AliveHandle;
use pool::FramePool;

// ── Backend abstraction ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBackendKind {
    /// DXGI desktop duplication (Windows).
    Dxgi,
    /// Synthetic test pattern, available everywhere.
    TestPattern,
}

/// One captured frame already copied into a pool slot.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub slot: u16,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A capture implementation driven by the producer loop.
pub trait CaptureBackend: Send {
    fn kind(&self) -> CaptureBackendKind;
    /// Adapter identifier shared with the encoder.
    fn luid(&self) -> i64;
    /// The mode the backend is capturing at.
    fn display(&self) -> DisplaySetting;
    /// Block until the display's next vertical blank (or a pacing
    /// equivalent).
    fn wait_for_vblank(&mut self);
    /// Poll for the next frame and copy it into a pool slot.
    ///
    /// `Ok(None)` means timeout, unchanged screen, or pool exhaustion;
    /// the loop emits nothing and tries again next vblank. An `Err` is
    /// permanent and stops the producer.
    fn capture_one(&mut self, pool: &FramePool) -> Result<Option<CapturedFrame>, LtError>;
}

/// Construct the backend for `kind`.
pub fn create_backend(
    kind: CaptureBackendKind,
    display: DisplaySetting,
) -> Result<Box<dyn CaptureBackend>, LtError> {
    match kind {
        CaptureBackendKind::Dxgi => Ok(Box::new(dxgi::DxgiCapturer::new()?)),
        CaptureBackendKind::TestPattern => Ok(Box::new(TestPatternCapturer::new(display))),
    }
}

// ── TestPatternCapturer ──────────────────────────────────────────

/// Synthetic backend producing a moving gradient at the requested refresh
/// rate. Lets the full pipeline run on machines without a capturable
/// desktop (CI, headless hosts).
pub struct TestPatternCapturer {
    display: DisplaySetting,
    tick: u64,
}

impl TestPatternCapturer {
    pub fn new(display: DisplaySetting) -> Self {
        Self { display, tick: 0 }
    }
}

impl CaptureBackend for TestPatternCapturer {
    fn kind(&self) -> CaptureBackendKind {
        CaptureBackendKind::TestPattern
    }

    fn luid(&self) -> i64 {
        0
    }

    fn display(&self) -> DisplaySetting {
        self.display
    }

    fn wait_for_vblank(&mut self) {
        let interval = Duration::from_micros(1_000_000 / self.display.refresh_hz.max(1) as u64);
        std::thread::sleep(interval);
    }

    fn capture_one(&mut self, pool: &FramePool) -> Result<Option<CapturedFrame>, LtError> {
        let Some(slot) = pool.acquire() else {
            return Ok(None);
        };
        let name = pool.slot_name(slot).map(str::to_owned).unwrap_or_default();

        self.tick = self.tick.wrapping_add(1);
        let w = self.display.width as usize;
        let h = self.display.height as usize;
        let shade = (self.tick % 256) as u8;
        let mut pixels = vec![0u8; w * h * PixelFormat::Bgra8.bytes_per_pixel()];
        for px in pixels.chunks_exact_mut(4) {
            px[0] = shade; // B
            px[1] = shade.wrapping_add(85); // G
            px[2] = shade.wrapping_add(170); // R
            px[3] = 0xFF;
        }

        if pool
            .copy_into(slot, &pixels, Duration::from_millis(5))
            .is_err()
        {
            let _ = pool.release(&name);
            return Ok(None);
        }

        Ok(Some(CapturedFrame {
            slot,
            name,
            width: self.display.width,
            height: self.display.height,
            format: PixelFormat::Bgra8,
        }))
    }
}

// ── VideoCapturer ────────────────────────────────────────────────

/// Sink invoked with each produced frame, from the capture thread.
pub type FrameSink = Box<dyn Fn(Frame) + Send>;
/// Invoked once if the backend fails permanently.
pub type FatalSink = Box<dyn FnOnce(LtError) + Send>;

pub struct VideoCapturerParams {
    pub backend: CaptureBackendKind,
    /// Mode request; the backend may capture at its native mode instead.
    pub display: DisplaySetting,
    pub pool: Arc<FramePool>,
    pub on_frame: FrameSink,
    pub on_fatal: Option<FatalSink>,
    /// Liveness handle pinged once per loop iteration.
    pub alive: Option<AliveHandle>,
}

/// The capture producer. Construction probes the backend (so the LUID and
/// native mode are known for negotiation before any frame is produced);
/// [`start`](Self::start) spawns the thread.
pub struct VideoCapturer {
    backend: Option<Box<dyn CaptureBackend>>,
    luid: i64,
    display: DisplaySetting,
    pool: Arc<FramePool>,
    on_frame: Option<FrameSink>,
    on_fatal: Option<FatalSink>,
    alive: Option<AliveHandle>,
    stopped: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl VideoCapturer {
    pub fn create(params: VideoCapturerParams) -> Result<Self, LtError> {
        let backend = create_backend(params.backend, params.display)?;
        let luid = backend.luid();
        let display = backend.display();
        Ok(Self {
            backend: Some(backend),
            luid,
            display,
            pool: params.pool,
            on_frame: Some(params.on_frame),
            on_fatal: params.on_fatal,
            alive: params.alive,
            stopped: Arc::new(AtomicBool::new(true)),
            thread: None,
        })
    }

    pub fn luid(&self) -> i64 {
        self.luid
    }

    /// The mode the backend actually captures at.
    pub fn display(&self) -> DisplaySetting {
        self.display
    }

    pub fn pool(&self) -> Arc<FramePool> {
        Arc::clone(&self.pool)
    }

    /// Spawn the producer thread. Calling twice is an error.
    pub fn start(&mut self) -> Result<(), LtError> {
        let mut backend = self
            .backend
            .take()
            .ok_or_else(|| LtError::Init("capturer already started".into()))?;
        let on_frame = self
            .on_frame
            .take()
            .ok_or_else(|| LtError::Init("capturer already started".into()))?;
        let on_fatal = self.on_fatal.take();
        let alive = self.alive.clone();
        let pool = Arc::clone(&self.pool);
        let stopped = Arc::clone(&self.stopped);
        stopped.store(false, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("video_capture".into())
            .spawn(move || {
                producer_loop(&mut *backend, &pool, &on_frame, on_fatal, alive, &stopped);
            })
            .map_err(|e| LtError::Init(format!("spawn capture thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stop the producer and join its thread.
    ///
    /// Idempotent and synchronous. Must not be called from the capture
    /// thread itself.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for VideoCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn producer_loop(
    backend: &mut dyn CaptureBackend,
    pool: &FramePool,
    on_frame: &FrameSink,
    mut on_fatal: Option<FatalSink>,
    alive: Option<AliveHandle>,
    stopped: &AtomicBool,
) {
    info!("video capturer started ({:?})", backend.kind());
    let luid = backend.luid();
    let mut picture_id: u32 = 0;

    while !stopped.load(Ordering::SeqCst) {
        if let Some(alive) = &alive {
            alive.alive();
        }
        backend.wait_for_vblank();
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match backend.capture_one(pool) {
            Ok(Some(captured)) => {
                picture_id += 1;
                on_frame(Frame {
                    picture_id,
                    capture_ts_us: steady_now_us(),
                    pool_slot: captured.slot,
                    slot_name: captured.name,
                    width: captured.width,
                    height: captured.height,
                    pixel_format: captured.format,
                    luid,
                });
            }
            Ok(None) => {} // timeout, unchanged, or pool exhausted
            Err(e) => {
                error!("capture backend failed permanently: {e}");
                if let Some(fatal) = on_fatal.take() {
                    fatal(e);
                }
                break;
            }
        }
    }
    info!("video capturer stopped");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_params(
        pool: Arc<FramePool>,
        sink: FrameSink,
    ) -> VideoCapturerParams {
        VideoCapturerParams {
            backend: CaptureBackendKind::TestPattern,
            display: DisplaySetting::new(64, 48, 240),
            pool,
            on_frame: sink,
            on_fatal: None,
            alive: None,
        }
    }

    #[test]
    fn picture_ids_strictly_increase() {
        let pool = Arc::new(FramePool::new(8));
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_sink = Arc::clone(&seen);
        let pool_for_sink = Arc::clone(&pool);

        let mut capturer = VideoCapturer::create(test_params(
            Arc::clone(&pool),
            Box::new(move |frame: Frame| {
                seen_sink.lock().unwrap().push(frame.picture_id);
                // Consume and free the slot immediately.
                let guard = pool_for_sink
                    .open_for_read(&frame.slot_name, Duration::from_millis(100))
                    .unwrap();
                drop(guard);
                pool_for_sink.release(&frame.slot_name).unwrap();
            }),
        ))
        .unwrap();

        capturer.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        capturer.stop();

        let ids = seen.lock().unwrap();
        assert!(ids.len() >= 3, "captured only {} frames", ids.len());
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0], "ids not strictly increasing: {pair:?}");
        }
    }

    #[test]
    fn capture_timestamps_non_decreasing() {
        let pool = Arc::new(FramePool::new(8));
        let stamps: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_stamps = Arc::clone(&stamps);
        let pool_for_sink = Arc::clone(&pool);

        let mut capturer = VideoCapturer::create(test_params(
            Arc::clone(&pool),
            Box::new(move |frame: Frame| {
                sink_stamps.lock().unwrap().push(frame.capture_ts_us);
                let _ = pool_for_sink
                    .open_for_read(&frame.slot_name, Duration::from_millis(100))
                    .map(drop);
                let _ = pool_for_sink.release(&frame.slot_name);
            }),
        ))
        .unwrap();

        capturer.start().unwrap();
        std::thread::sleep(Duration::from_millis(80));
        capturer.stop();

        let stamps = stamps.lock().unwrap();
        for pair in stamps.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn slow_consumer_drops_frames_without_blocking() {
        // Pool of 2, sink never releases: capture must keep running and
        // simply stop emitting once both slots are claimed.
        let pool = Arc::new(FramePool::new(2));
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink_pool = Arc::clone(&pool);

        let mut capturer = VideoCapturer::create(test_params(
            Arc::clone(&pool),
            Box::new(move |frame: Frame| {
                sink_seen.lock().unwrap().push(frame.picture_id);
                // Drain the keyed handoff so the writer is not what blocks,
                // but never return the slot to the free list.
                let _ = sink_pool
                    .open_for_read(&frame.slot_name, Duration::from_millis(50))
                    .map(drop);
            }),
        ))
        .unwrap();

        capturer.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        capturer.stop();

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(pool.in_use_count(), 2);
        assert!(pool.exhausted_count() >= 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let pool = Arc::new(FramePool::new(2));
        let mut capturer =
            VideoCapturer::create(test_params(pool, Box::new(|_| {}))).unwrap();
        capturer.start().unwrap();
        capturer.stop();
        capturer.stop();
        capturer.stop();
        assert!(!capturer.is_running());
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let pool = Arc::new(FramePool::new(2));
        let mut capturer =
            VideoCapturer::create(test_params(pool, Box::new(|_| {}))).unwrap();
        capturer.stop();
        assert!(!capturer.is_running());
    }
}
