//! The decode → present pipeline task.
//!
//! Assembled [`EncodedUnit`]s come in, decoded frames go out to a
//! [`RenderSink`] at their presentation deadline. Decode failures and
//! reference loss turn into keyframe requests on the control channel; a
//! render-target reset rebuilds the sink without discarding the decoder
//! when its references survive.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::decode::{DecodeOutcome, DecoderKind, VideoDecoder};
use crate::error::LtError;
use crate::render::{CursorState, JitterEstimator, PresentClock, PresentDecision, PresentTiming};
use crate::time::steady_now_us;
use crate::types::{EncodedUnit, PipelineStats, VideoCodec};

/// Frames queued between arrival and presentation; this bound is the
/// jitter buffer's capacity.
const QUEUE_DEPTH: usize = 4;

// ── RenderSink ───────────────────────────────────────────────────

/// The cursor overlay handed to the sink alongside each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorOverlay {
    /// Position in render coordinates.
    pub x: i32,
    pub y: i32,
}

/// Where decoded frames are drawn. The real implementations sit on a
/// D3D11 / OpenGL surface; tests record calls.
pub trait RenderSink: Send {
    fn present(&mut self, frame: &crate::decode::DecodedFrame, cursor: Option<CursorOverlay>);
    /// The render target went away; rebuild whatever the sink holds.
    fn rebuild(&mut self);
}

// ── DecodeRenderPipeline ─────────────────────────────────────────

enum Input {
    Unit(EncodedUnit),
    ResetTarget,
}

pub struct DecodeRenderPipelineParams {
    pub codec: VideoCodec,
    pub refresh_hz: u32,
    /// Render target size used to scale the cursor position.
    pub render_size: (u32, u32),
    pub sink: Box<dyn RenderSink>,
    /// Fired whenever the decoder needs a keyframe from the host.
    pub keyframe_request: mpsc::Sender<()>,
    pub stats: Arc<PipelineStats>,
}

/// Handle to the running pipeline.
pub struct DecodeRenderPipeline {
    input_tx: mpsc::Sender<Input>,
    clock: Arc<PresentClock>,
    cursor: Arc<CursorState>,
    task: tokio::task::JoinHandle<()>,
}

impl DecodeRenderPipeline {
    pub fn start(params: DecodeRenderPipelineParams) -> Result<Self, LtError> {
        let decoder = VideoDecoder::new(DecoderKind::for_platform(), params.codec)?;
        let clock = Arc::new(PresentClock::new(params.refresh_hz));
        let cursor = Arc::new(CursorState::new());
        let (input_tx, input_rx) = mpsc::channel(QUEUE_DEPTH);

        let task = tokio::spawn(run_loop(
            decoder,
            Arc::clone(&clock),
            Arc::clone(&cursor),
            params.render_size,
            params.sink,
            params.keyframe_request,
            params.stats,
            input_rx,
        ));

        Ok(Self {
            input_tx,
            clock,
            cursor,
            task,
        })
    }

    /// Queue one assembled unit. Applies backpressure when the jitter
    /// buffer is full.
    pub async fn submit(&self, unit: EncodedUnit) -> Result<(), LtError> {
        self.input_tx
            .send(Input::Unit(unit))
            .await
            .map_err(|_| LtError::ChannelClosed)
    }

    /// Handle a render-target reset.
    pub async fn reset_target(&self) -> Result<(), LtError> {
        self.input_tx
            .send(Input::ResetTarget)
            .await
            .map_err(|_| LtError::ChannelClosed)
    }

    /// Route a cursor update from the control channel.
    pub fn update_cursor(&self, info: crate::message::CursorInfo) {
        self.cursor.update(info);
    }

    /// Refresh rtt / clock-difference from the time-sync estimator.
    pub fn set_timing(&self, timing: PresentTiming) {
        self.clock.set_timing(timing);
    }

    /// Stop the pipeline and wait for the task to finish.
    pub async fn stop(self) {
        drop(self.input_tx);
        let _ = self.task.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut decoder: VideoDecoder,
    clock: Arc<PresentClock>,
    cursor: Arc<CursorState>,
    render_size: (u32, u32),
    mut sink: Box<dyn RenderSink>,
    keyframe_request: mpsc::Sender<()>,
    stats: Arc<PipelineStats>,
    mut input_rx: mpsc::Receiver<Input>,
) {
    let mut jitter = JitterEstimator::new();
    while let Some(input) = input_rx.recv().await {
        let unit = match input {
            Input::Unit(unit) => unit,
            Input::ResetTarget => {
                // Rebuild the surface; software decode keeps its state, so
                // no keyframe is needed here. A hardware decoder losing
                // its surfaces would call invalidate_references instead.
                sink.rebuild();
                continue;
            }
        };

        jitter.record_arrival(steady_now_us());

        let frame = match decoder.decode(&unit) {
            Ok(DecodeOutcome::Frame(frame)) => frame,
            Ok(DecodeOutcome::NeedKeyframe) => {
                let _ = keyframe_request.try_send(());
                continue;
            }
            Err(e) => {
                warn!("decode error: {e}");
                let _ = keyframe_request.try_send(());
                continue;
            }
        };

        match clock.decide(steady_now_us(), frame.capture_ts_us, jitter.jitter_us()) {
            PresentDecision::Drop => {
                stats.present_late.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            PresentDecision::Wait(delay) => {
                tokio::time::sleep(delay).await;
                // Re-check: the wait may have pushed us past the drop
                // window only if timing inputs moved; present anyway.
            }
            PresentDecision::Present => {}
        }

        let overlay = cursor
            .position_in(render_size.0, render_size.1)
            .map(|(x, y)| CursorOverlay { x, y });
        sink.present(&frame, overlay);
    }
    debug!("decode-render pipeline stopped");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CursorInfo, CursorPixmap};
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        presented: Arc<Mutex<Vec<(u32, Option<CursorOverlay>)>>>,
        rebuilds: Arc<Mutex<u32>>,
    }

    impl RenderSink for RecordingSink {
        fn present(&mut self, frame: &crate::decode::DecodedFrame, cursor: Option<CursorOverlay>) {
            self.presented.lock().unwrap().push((frame.picture_id, cursor));
        }
        fn rebuild(&mut self) {
            *self.rebuilds.lock().unwrap() += 1;
        }
    }

    fn unit(picture_id: u32, is_keyframe: bool, capture_ts_us: i64) -> EncodedUnit {
        let pixels = vec![0x42u8; 8 * 4 * 4];
        EncodedUnit {
            picture_id,
            codec: VideoCodec::H264,
            is_keyframe,
            temporal_id: 0,
            bytes: zstd::encode_all(pixels.as_slice(), 1).unwrap(),
            capture_ts_us,
            encode_start_ts_us: capture_ts_us,
            encode_end_ts_us: capture_ts_us,
            width: 8,
            height: 4,
        }
    }

    fn start_pipeline(
        keyframe_tx: mpsc::Sender<()>,
    ) -> (
        DecodeRenderPipeline,
        Arc<Mutex<Vec<(u32, Option<CursorOverlay>)>>>,
        Arc<Mutex<u32>>,
    ) {
        let presented = Arc::new(Mutex::new(Vec::new()));
        let rebuilds = Arc::new(Mutex::new(0));
        let sink = RecordingSink {
            presented: Arc::clone(&presented),
            rebuilds: Arc::clone(&rebuilds),
        };
        let pipeline = DecodeRenderPipeline::start(DecodeRenderPipelineParams {
            codec: VideoCodec::H264,
            refresh_hz: 60,
            render_size: (1280, 720),
            sink: Box::new(sink),
            keyframe_request: keyframe_tx,
            stats: Arc::new(PipelineStats::new()),
        })
        .unwrap();
        (pipeline, presented, rebuilds)
    }

    #[tokio::test]
    async fn frames_flow_to_the_sink() {
        let (kf_tx, _kf_rx) = mpsc::channel(4);
        let (pipeline, presented, _) = start_pipeline(kf_tx);

        pipeline.submit(unit(1, true, steady_now_us())).await.unwrap();
        pipeline.submit(unit(2, false, steady_now_us())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pipeline.stop().await;

        let presented = presented.lock().unwrap();
        let ids: Vec<u32> = presented.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn corrupt_unit_requests_keyframe() {
        let (kf_tx, mut kf_rx) = mpsc::channel(4);
        let (pipeline, _, _) = start_pipeline(kf_tx);

        let mut bad = unit(1, true, steady_now_us());
        bad.bytes = vec![0xFF; 8];
        pipeline.submit(bad).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), kf_rx.recv())
            .await
            .expect("no keyframe request")
            .unwrap();
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn cursor_overlay_reaches_sink() {
        let (kf_tx, _kf_rx) = mpsc::channel(4);
        let (pipeline, presented, _) = start_pipeline(kf_tx);

        pipeline.update_cursor(CursorInfo {
            screen_w: 1920,
            screen_h: 1080,
            x: 960,
            y: 540,
            visible: true,
            pixmap: Some(CursorPixmap {
                width: 1,
                height: 1,
                hotspot_x: 0,
                hotspot_y: 0,
                data: vec![0; 4],
            }),
        });
        pipeline.submit(unit(1, true, steady_now_us())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pipeline.stop().await;

        let presented = presented.lock().unwrap();
        assert_eq!(presented.len(), 1);
        assert_eq!(presented[0].1, Some(CursorOverlay { x: 640, y: 360 }));
    }

    #[tokio::test]
    async fn reset_rebuilds_without_dropping_frames() {
        let (kf_tx, _kf_rx) = mpsc::channel(4);
        let (pipeline, presented, rebuilds) = start_pipeline(kf_tx);

        pipeline.submit(unit(1, true, steady_now_us())).await.unwrap();
        pipeline.reset_target().await.unwrap();
        pipeline.submit(unit(2, false, steady_now_us())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pipeline.stop().await;

        assert_eq!(*rebuilds.lock().unwrap(), 1);
        assert_eq!(presented.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_frame_is_dropped() {
        let (kf_tx, _kf_rx) = mpsc::channel(4);
        let stats = Arc::new(PipelineStats::new());
        let presented = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            presented: Arc::clone(&presented),
            rebuilds: Arc::new(Mutex::new(0)),
        };
        let pipeline = DecodeRenderPipeline::start(DecodeRenderPipelineParams {
            codec: VideoCodec::H264,
            refresh_hz: 60,
            render_size: (1280, 720),
            sink: Box::new(sink),
            keyframe_request: kf_tx,
            stats: Arc::clone(&stats),
        })
        .unwrap();

        // Captured half a second ago: way past the drop window.
        pipeline
            .submit(unit(1, true, steady_now_us() - 500_000))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.stop().await;

        assert!(presented.lock().unwrap().is_empty());
        assert_eq!(stats.present_late.load(Ordering::Relaxed), 1);
    }
}
