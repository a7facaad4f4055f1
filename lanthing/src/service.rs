//! The service role: owns the pipe endpoint workers attach to.
//!
//! Worker spawning and privilege plumbing are platform shells around
//! this; the service core accepts one worker session at a time, mirrors
//! its negotiated parameters, tells it to start working, and keeps it
//! alive with 500 ms keep-alives. A worker that goes silent for 3 s is
//! dropped; the endpoint keeps accepting.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lanthing_core::error::LtError;
use lanthing_core::message::{ControlMessage, StartWorkingError};
use lanthing_core::pipe::{PipeConnection, PipeServer};
use lanthing_core::time::steady_now_ms;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(500);
const WORKER_TIMEOUT_MS: i64 = 3_000;

pub struct Service {
    pipe_name: String,
    stop: CancellationToken,
}

impl Service {
    pub fn new(pipe_name: String) -> Self {
        Self {
            pipe_name,
            stop: CancellationToken::new(),
        }
    }

    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Serve until stopped.
    pub async fn run(&self) -> Result<(), LtError> {
        let mut server = PipeServer::bind(&self.pipe_name)?;
        info!("service pipe '{}' ready", self.pipe_name);

        while !self.stop.is_cancelled() {
            let conn = tokio::select! {
                _ = self.stop.cancelled() => break,
                conn = server.accept() => conn,
            };
            match conn {
                Ok(conn) => {
                    info!("worker attached");
                    self.serve_worker(conn).await;
                    info!("worker session over");
                }
                Err(e) => warn!("pipe accept error: {e}"),
            }
        }
        info!("service stopped");
        Ok(())
    }

    /// Drive one worker connection to completion.
    async fn serve_worker(&self, mut conn: PipeConnection) {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        let mut last_seen = steady_now_ms();
        let mut started = false;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    let _ = conn.send(ControlMessage::StopWorking).await;
                    break;
                }
                msg = conn.recv() => {
                    let Some(msg) = msg else {
                        warn!("worker pipe closed");
                        break;
                    };
                    last_seen = steady_now_ms();
                    match msg {
                        ControlMessage::StreamingParams(params) => {
                            // Mirror for downstream tooling.
                            info!(
                                "worker negotiated {}x{}@{} {:?} via {:?}, audio {} Hz x{}",
                                params.video.width,
                                params.video.height,
                                params.video.refresh_hz,
                                params.video.codec,
                                params.video.encoder_backend,
                                params.audio.sample_rate,
                                params.audio.channels,
                            );
                            if !started {
                                started = true;
                                let _ = conn.send(ControlMessage::StartWorking).await;
                            }
                        }
                        ControlMessage::StartWorkingAck(ack) => {
                            if ack.err_code == StartWorkingError::Success {
                                info!(
                                    "worker working; serves {} message types",
                                    ack.supported_msg_types.len()
                                );
                            } else {
                                warn!("worker failed to start: {:?}", ack.err_code);
                            }
                        }
                        ControlMessage::KeepAlive => {
                            let _ = conn.send(ControlMessage::KeepAliveAck).await;
                        }
                        ControlMessage::KeepAliveAck => {}
                        ControlMessage::CaptureVideoFrame(frame) => {
                            tracing::trace!(
                                "worker filled slot '{}' (picture {})",
                                frame.name,
                                frame.picture_id
                            );
                        }
                        ControlMessage::AudioData(_) => {}
                        other => tracing::debug!("pipe message {:?}", other.kind()),
                    }
                }
                _ = keep_alive.tick() => {
                    let _ = conn.send(ControlMessage::KeepAlive).await;
                    if steady_now_ms() - last_seen > WORKER_TIMEOUT_MS {
                        warn!("worker keep-alive timeout, dropping");
                        break;
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lanthing_core::message::MessageKind;
    use lanthing_core::negotiate::{
        AudioParams, RateControlConfig, SessionParams, VideoParams,
    };
    use lanthing_core::pipe;
    use lanthing_core::types::{AudioCodec, EncoderBackend, VideoCodec};

    fn fake_params() -> SessionParams {
        SessionParams {
            video: VideoParams {
                width: 1280,
                height: 720,
                refresh_hz: 60,
                codec: VideoCodec::H264,
                encoder_backend: EncoderBackend::Software,
            },
            audio: AudioParams {
                sample_rate: 48_000,
                channels: 2,
                codec: AudioCodec::Opus,
            },
            enable_gamepad: false,
            enable_driver_input: false,
            luid: 0,
            rate_control: RateControlConfig::default(),
        }
    }

    #[tokio::test]
    async fn service_starts_worker_after_params() {
        let pipe_name = format!("lt-svc-test-{}", std::process::id());
        let service = Service::new(pipe_name.clone());
        let stop = service.stop_handle();
        let svc_task = tokio::spawn(async move { service.run().await });

        let mut worker_conn = pipe::connect(&pipe_name).await.unwrap();
        worker_conn
            .send(ControlMessage::StreamingParams(fake_params()))
            .await
            .unwrap();

        // The service answers with StartWorking (keep-alives may come
        // first).
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let msg = tokio::time::timeout_at(deadline, worker_conn.recv())
                .await
                .expect("timeout")
                .expect("pipe closed");
            match msg.kind() {
                MessageKind::StartWorking => break,
                MessageKind::KeepAlive => continue,
                other => panic!("unexpected message {other}"),
            }
        }

        stop.cancel();
        let _ = svc_task.await;
    }
}
