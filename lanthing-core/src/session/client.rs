//! The client session: joins the room, negotiates, brings the transport
//! up, and feeds received media into the decode-render pipeline while
//! sending input-side control traffic back.
//!
//! Keep-alives flow every 500 ms; three seconds of silence tips the
//! session into `Reconnecting`, which resets the transport with
//! exponential backoff (capped at 5 s) until the retry budget runs out.
//! Time-sync exchanges feed presentation scheduling, and receiver
//! statistics (frame gaps, rtt) flow back to the host's rate controller.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::AudioPlayer;
use crate::clipboard::{self, ClipboardAssembler, ClipboardSink};
use crate::error::{ExitReason, LtError};
use crate::message::{ControlMessage, FileChunkAck, SendSideStat, StartWorkingError, TimeSyncMsg};
use crate::negotiate::{DisplaySetting, SessionParams};
use crate::render::pipeline::{DecodeRenderPipeline, DecodeRenderPipelineParams, RenderSink};
use crate::render::PresentTiming;
use crate::session::worker::{
    decode_blob, encode_blob, ClientHello, SIG_PARAMS, SIG_PARAMS_ERR, SIG_PARAMS_OK,
};
use crate::session::{
    SessionState, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT_MS, MAX_RECONNECT_ATTEMPTS,
    RECONNECT_MAX_BACKOFF, TIME_SYNC_INTERVAL,
};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::time::{steady_now_ms, steady_now_us, TimeSync};
use crate::transport::{ClientTransport, TransportEvent, TransportKind};
use crate::types::{PipelineStats, VideoCodec};

// ── Parameters ───────────────────────────────────────────────────

pub struct ClientSessionParams {
    pub client_id: String,
    pub room_id: String,
    pub auth_token: String,
    /// Peer id of the host in the signaling room.
    pub host_id: String,
    pub signaling_addr: String,
    pub signaling_port: u16,
    /// Requested display mode.
    pub display: DisplaySetting,
    /// Codec preference, most preferred first.
    pub codecs: Vec<VideoCodec>,
    pub transport: TransportKind,
    /// Render target size for cursor scaling.
    pub render_size: (u32, u32),
    pub sink: Box<dyn RenderSink>,
    /// Where the host's clipboard content lands locally.
    pub clipboard_sink: Box<dyn ClipboardSink>,
    /// Single exit notification toward the embedding UI.
    pub on_exited: Option<Box<dyn FnOnce(ExitReason) + Send>>,
}

/// Requests posted into the running session task.
enum SessionCommand {
    SendClipboard(Vec<u8>),
}

// ── ClientSession ────────────────────────────────────────────────

/// Handle to a running client session.
pub struct ClientSession {
    state_rx: watch::Receiver<SessionState>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    stop: CancellationToken,
    task: tokio::task::JoinHandle<ExitReason>,
}

impl ClientSession {
    /// Spawn the session task.
    pub fn start(params: ClientSessionParams) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_session(params, state_tx, cmd_rx, stop.clone()));
        Self {
            state_rx,
            cmd_tx,
            stop,
            task,
        }
    }

    /// Push the local clipboard to the host over the reliable channel.
    pub fn send_clipboard(&self, text: &str) -> Result<(), LtError> {
        self.cmd_tx
            .try_send(SessionCommand::SendClipboard(text.as_bytes().to_vec()))
            .map_err(|_| LtError::ChannelClosed)
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Request a clean stop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Token form of [`stop`](Self::stop) for use from other tasks.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Wait for the session to end.
    pub async fn wait(self) -> ExitReason {
        self.task.await.unwrap_or(ExitReason::InitFailed)
    }
}

async fn run_session(
    mut params: ClientSessionParams,
    state_tx: watch::Sender<SessionState>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    stop: CancellationToken,
) -> ExitReason {
    let on_exited = params.on_exited.take();
    let reason = match drive(params, &state_tx, cmd_rx, stop).await {
        Ok(reason) => reason,
        Err(e) => {
            warn!("client session failed: {e}");
            match e {
                LtError::Negotiation(_) => ExitReason::NegotiationFailed,
                _ => ExitReason::InitFailed,
            }
        }
    };
    let _ = state_tx.send(SessionState::Closed);
    info!("client session ended: {reason}");
    if let Some(cb) = on_exited {
        cb(reason);
    }
    reason
}

async fn drive(
    params: ClientSessionParams,
    state_tx: &watch::Sender<SessionState>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    stop: CancellationToken,
) -> Result<ExitReason, LtError> {
    let mut state = SessionState::Idle;
    let mut render_sink = Some(params.sink);
    let mut clipboard_sink = params.clipboard_sink;
    let mut clipboard = ClipboardAssembler::new();
    let publish = |state: SessionState| {
        let _ = state_tx.send(state);
    };

    state.start()?;
    publish(state);

    let (sig_events_tx, mut sig_events) = mpsc::channel::<SignalingEvent>(64);
    let signaling = SignalingClient::connect(
        &params.signaling_addr,
        params.signaling_port,
        &params.room_id,
        &params.client_id,
        sig_events_tx,
    )
    .await?;
    state.signaling_connected()?;
    publish(state);

    let (tp_events_tx, mut tp_events) = mpsc::channel::<TransportEvent>(256);
    let (kf_tx, mut kf_rx) = mpsc::channel::<()>(4);
    let stats = Arc::new(PipelineStats::new());
    let audio_player = AudioPlayer::new();

    let mut transport: Option<ClientTransport> = None;
    let mut pipeline: Option<DecodeRenderPipeline> = None;
    let mut time_sync = TimeSync::new();

    let mut last_seen = steady_now_ms();
    let mut last_picture_id: Option<u32> = None;
    let mut frames_seen: u32 = 0;
    let mut frames_lost: u32 = 0;
    let mut reconnect_attempts: u32 = 0;
    let mut next_retry_at: i64 = 0;

    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    let mut sync_timer = tokio::time::interval(TIME_SYNC_INTERVAL);
    // Deadline checks run much finer than the send cadence so a broken
    // session is noticed promptly.
    let mut deadline_check = tokio::time::interval(std::time::Duration::from_millis(100));

    let reason = loop {
        tokio::select! {
            _ = stop.cancelled() => {
                if let Some(tp) = transport.as_mut() {
                    let _ = send_control(tp, &ControlMessage::StopWorking);
                    // Give the writer task a beat to flush the goodbye
                    // before the transport is torn down.
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                break ExitReason::UserStop;
            }

            // ── Signaling ────────────────────────────────────────
            event = sig_events.recv() => {
                let Some(event) = event else { break ExitReason::InitFailed };
                match event {
                    SignalingEvent::JoinAck(ack) if ack.ok => {
                        state.join_ok()?;
                        publish(state);
                        let hello = ClientHello {
                            display: params.display,
                            codecs: params.codecs.clone(),
                        };
                        let blob = encode_blob(&bincode::serialize(&hello)?);
                        signaling
                            .send_message(&params.host_id, SIG_PARAMS, &blob)
                            .await?;
                    }
                    SignalingEvent::JoinAck(ack) => {
                        return Err(LtError::Negotiation(format!(
                            "no joinable room: {}",
                            ack.err.unwrap_or_default()
                        )));
                    }
                    SignalingEvent::Message { key, value, .. } => match key.as_str() {
                        SIG_PARAMS_OK => {
                            let decoded: SessionParams =
                                bincode::deserialize(&decode_blob(&value)?)?;
                            info!(
                                "session params agreed: {}x{}@{} {:?}",
                                decoded.video.width,
                                decoded.video.height,
                                decoded.video.refresh_hz,
                                decoded.video.codec,
                            );
                            state.params_ok()?;
                            publish(state);

                            let sink = render_sink
                                .take()
                                .unwrap_or_else(|| Box::new(NullSink));
                            pipeline = Some(DecodeRenderPipeline::start(
                                DecodeRenderPipelineParams {
                                    codec: decoded.video.codec,
                                    refresh_hz: decoded.video.refresh_hz,
                                    render_size: params.render_size,
                                    sink,
                                    keyframe_request: kf_tx.clone(),
                                    stats: Arc::clone(&stats),
                                },
                            )?);

                            let mut tp =
                                ClientTransport::create(params.transport, tp_events_tx.clone());
                            tp.connect()?;
                            transport = Some(tp);
                        }
                        SIG_PARAMS_ERR => {
                            return Err(LtError::Negotiation(value));
                        }
                        _ => {
                            if let Some(tp) = transport.as_mut() {
                                tp.on_signaling_message(&key, &value);
                            }
                        }
                    },
                    SignalingEvent::Disconnected => {
                        warn!("signaling connection lost");
                        if !state.is_working() {
                            break ExitReason::InitFailed;
                        }
                    }
                }
            }

            // ── Transport ────────────────────────────────────────
            event = tp_events.recv() => {
                let Some(event) = event else { break ExitReason::InitFailed };
                match event {
                    TransportEvent::Signaling { key, value } => {
                        let _ = signaling.send_message(&params.host_id, &key, &value).await;
                    }
                    TransportEvent::Connected => {
                        debug!("transport up, requesting work start");
                        if let Some(tp) = transport.as_mut() {
                            let _ = send_control(tp, &ControlMessage::StartWorking);
                        }
                    }
                    TransportEvent::Data { data, .. } => {
                        last_seen = steady_now_ms();
                        let msg = match ControlMessage::from_wire_bytes(&data) {
                            Ok(msg) => msg,
                            Err(e) => {
                                debug!("bad control payload: {e}");
                                continue;
                            }
                        };
                        match msg {
                            ControlMessage::StartWorkingAck(ack) => {
                                if ack.err_code == StartWorkingError::Success {
                                    if !state.is_working() {
                                        state.working()?;
                                        publish(state);
                                    }
                                    reconnect_attempts = 0;
                                    last_seen = steady_now_ms();
                                    debug!(
                                        "working; host serves {} message types",
                                        ack.supported_msg_types.len()
                                    );
                                } else {
                                    warn!("host refused to start: {:?}", ack.err_code);
                                    break ExitReason::InitFailed;
                                }
                            }
                            ControlMessage::KeepAlive => {
                                if let Some(tp) = transport.as_mut() {
                                    let _ = send_control(tp, &ControlMessage::KeepAliveAck);
                                }
                            }
                            ControlMessage::KeepAliveAck => {}
                            ControlMessage::TimeSync(TimeSyncMsg { t0_us, t1_us: Some(t1) }) => {
                                time_sync.update(t0_us, t1, steady_now_us());
                                if let Some(p) = pipeline.as_ref() {
                                    p.set_timing(PresentTiming {
                                        rtt_us: time_sync.rtt().as_micros() as i64,
                                        time_diff_us: time_sync.time_diff_us(),
                                    });
                                }
                            }
                            ControlMessage::TimeSync(_) => {}
                            ControlMessage::CursorInfo(info) => {
                                if let Some(p) = pipeline.as_ref() {
                                    p.update_cursor(info);
                                }
                            }
                            ControlMessage::FileChunk(chunk) => {
                                if let Some(tp) = transport.as_mut() {
                                    let _ = send_control(
                                        tp,
                                        &ControlMessage::FileChunkAck(FileChunkAck {
                                            request_id: chunk.request_id,
                                            chunk_index: chunk.chunk_index,
                                        }),
                                    );
                                }
                            }
                            ControlMessage::ClipboardChunk(chunk) => {
                                if let Some(bytes) = clipboard.push(chunk) {
                                    clipboard_sink.set_text(&String::from_utf8_lossy(&bytes));
                                }
                            }
                            ControlMessage::StopWorking => {
                                info!("host ended the session");
                                break ExitReason::RemoteClose;
                            }
                            other => debug!("unhandled control message {:?}", other.kind()),
                        }
                    }
                    TransportEvent::Video(unit) => {
                        last_seen = steady_now_ms();
                        frames_seen += 1;
                        if let Some(last) = last_picture_id {
                            if unit.picture_id > last + 1 {
                                frames_lost += unit.picture_id - last - 1;
                            }
                        }
                        last_picture_id = Some(unit.picture_id);
                        if let Some(p) = pipeline.as_ref() {
                            let _ = p.submit(unit).await;
                        }
                    }
                    TransportEvent::Audio(audio) => {
                        last_seen = steady_now_ms();
                        audio_player.submit(audio);
                    }
                    TransportEvent::Disconnected | TransportEvent::Failed(_) => {
                        if state.is_working() {
                            warn!("transport lost while working");
                            state.reconnecting()?;
                            publish(state);
                            reconnect_attempts = 0;
                        }
                        if state == SessionState::Reconnecting
                            || state == SessionState::TransportConnecting
                        {
                            if let Some(tp) = transport.as_mut() {
                                tp.close();
                            }
                            transport = None;
                            reconnect_attempts += 1;
                            if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                                break ExitReason::ReconnectFailed;
                            }
                            let backoff = reconnect_backoff(reconnect_attempts);
                            next_retry_at = steady_now_ms() + backoff.as_millis() as i64;
                            debug!(
                                "reconnect attempt {reconnect_attempts} in {:?}",
                                backoff
                            );
                        }
                    }
                }
            }

            // ── Session commands from the embedder ───────────────
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SessionCommand::SendClipboard(bytes) => {
                        if !state.is_working() {
                            debug!("dropping clipboard push outside Working");
                            continue;
                        }
                        if let Some(tp) = transport.as_mut() {
                            for chunk in clipboard::to_chunks(&bytes) {
                                let _ = send_control(
                                    tp,
                                    &ControlMessage::ClipboardChunk(chunk),
                                );
                            }
                        }
                    }
                }
            }

            // ── Keyframe requests from the decoder ───────────────
            Some(()) = kf_rx.recv() => {
                if let Some(tp) = transport.as_mut() {
                    // A saturated loss report forces a keyframe host-side.
                    let _ = send_control(
                        tp,
                        &ControlMessage::SendSideStat(SendSideStat {
                            bwe_bps: 0,
                            loss_pct: 100.0,
                            rtt_ms: time_sync.rtt().as_millis() as u32,
                        }),
                    );
                }
            }

            // ── Upkeep ───────────────────────────────────────────
            _ = keep_alive.tick() => {
                if state.is_working() {
                    if let Some(tp) = transport.as_mut() {
                        let _ = send_control(tp, &ControlMessage::KeepAlive);
                    }
                }
            }
            _ = deadline_check.tick() => {
                let now = steady_now_ms();
                if state.is_working() {
                    if now - last_seen > KEEP_ALIVE_TIMEOUT_MS {
                        warn!("keep-alive timeout, reconnecting");
                        state.reconnecting()?;
                        publish(state);
                        if let Some(tp) = transport.as_mut() {
                            tp.close();
                        }
                        transport = None;
                        reconnect_attempts = 1;
                        next_retry_at = now;
                        last_seen = now;
                    }
                } else if matches!(
                    state,
                    SessionState::Reconnecting | SessionState::TransportConnecting
                ) && transport.is_none()
                    && now >= next_retry_at
                {
                    if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                        break ExitReason::ReconnectFailed;
                    }
                    debug!("re-dialing transport (attempt {reconnect_attempts})");
                    let mut tp = ClientTransport::create(params.transport, tp_events_tx.clone());
                    if tp.connect().is_ok() {
                        transport = Some(tp);
                    }
                }
            }
            _ = sync_timer.tick() => {
                if state.is_working() {
                    if let Some(tp) = transport.as_mut() {
                        let _ = send_control(
                            tp,
                            &ControlMessage::TimeSync(TimeSyncMsg {
                                t0_us: steady_now_us(),
                                t1_us: None,
                            }),
                        );
                        let loss_pct = if frames_seen + frames_lost > 0 {
                            frames_lost as f32 * 100.0 / (frames_seen + frames_lost) as f32
                        } else {
                            0.0
                        };
                        let _ = send_control(
                            tp,
                            &ControlMessage::SendSideStat(SendSideStat {
                                bwe_bps: 0,
                                loss_pct,
                                rtt_ms: time_sync.rtt().as_millis() as u32,
                            }),
                        );
                        frames_seen = 0;
                        frames_lost = 0;
                    }
                }
            }
        }
    };

    if let Some(mut tp) = transport {
        tp.close();
    }
    if let Some(p) = pipeline {
        p.stop().await;
    }
    signaling.close();
    Ok(reason)
}

fn send_control(tp: &mut ClientTransport, msg: &ControlMessage) -> Result<(), LtError> {
    tp.send_data(msg.to_wire_bytes()?, true)
}

fn reconnect_backoff(attempt: u32) -> std::time::Duration {
    let base = std::time::Duration::from_millis(500);
    std::cmp::min(base * 2u32.saturating_pow(attempt.saturating_sub(1)), RECONNECT_MAX_BACKOFF)
}

/// Placeholder sink used while handing the real one to the pipeline.
struct NullSink;

impl RenderSink for NullSink {
    fn present(
        &mut self,
        _frame: &crate::decode::DecodedFrame,
        _cursor: Option<crate::render::pipeline::CursorOverlay>,
    ) {
    }
    fn rebuild(&mut self) {}
}

// ── Tests ────────────────────────────────────────────────────────
