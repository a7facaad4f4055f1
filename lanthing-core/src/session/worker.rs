//! The per-session worker: the host side of the streaming pipeline.
//!
//! Owns capture, the frame pool, the encoder and the host transport, and
//! keeps a control pipe to the service that launched it. Capture and
//! encode share one address space here, so the pool handoff is
//! in-process; the slot names still travel in `CaptureVideoFrame`
//! messages so the service can mirror what is happening.
//!
//! Lifecycle: negotiate at construction from the launch parameters,
//! announce the result over the pipe, join the signaling room, wait for
//! the client's hello, re-negotiate against it, bring the transport up,
//! and gate all media on `StartWorkingAck{Success}`. The worker never
//! reconnects a lost pipe; the service owns respawn.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioCapturer, AudioCapturerParams, LoopbackSource};
use crate::capture::pool::FramePool;
use crate::clipboard::{ClipboardAssembler, ClipboardSink, MemoryClipboard};
use crate::capture::{CaptureBackendKind, VideoCapturer, VideoCapturerParams};
use crate::encode::{
    check_encode_abilities, mailbox, offer_frame, spawn_runner, VideoEncoder, VideoEncoderConfig,
};
use crate::error::{ExitReason, LtError};
use crate::message::{
    ControlMessage, MessageKind, MessageRouter, StartWorkingAck, StartWorkingError, TimeSyncMsg,
};
use crate::negotiate::{self, DisplaySetting, SessionParams};
use crate::pipe;
use crate::session::{SessionState, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT_MS};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::time::{steady_now_ms, steady_now_us};
use crate::transport::{ServerTransport, TransportEvent, TransportKind};
use crate::types::{AudioData, EncodedUnit, PipelineStats, VideoCodec};
use crate::watchdog::ThreadWatcher;

/// The client's opening negotiation request, relayed through signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub display: DisplaySetting,
    pub codecs: Vec<VideoCodec>,
}

/// Signaling keys for the negotiation round trip.
pub const SIG_PARAMS: &str = "params";
pub const SIG_PARAMS_OK: &str = "params_ok";
pub const SIG_PARAMS_ERR: &str = "params_err";

/// Hex-encode a serialized blob for transport inside a signaling value.
pub fn encode_blob(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub fn decode_blob(s: &str) -> Result<Vec<u8>, LtError> {
    if s.len() % 2 != 0 {
        return Err(LtError::Protocol("odd-length blob"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| LtError::Protocol("non-hex blob"))
        })
        .collect()
}

// ── Parameters ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerParams {
    /// Pipe endpoint name (`\\.\pipe\<name>` on Windows).
    pub pipe_name: String,
    pub room_id: String,
    /// Identity in the signaling room; clients address the host by it.
    pub host_id: String,
    pub signaling_addr: String,
    pub signaling_port: u16,
    /// Display mode requested at launch.
    pub display: DisplaySetting,
    /// Codec preference from the launch request.
    pub codecs: Vec<VideoCodec>,
    pub capture_backend: CaptureBackendKind,
    pub transport: TransportKind,
}

impl WorkerParams {
    fn validate(&self) -> Result<(), LtError> {
        if self.pipe_name.is_empty() {
            return Err(LtError::Config("parameter invalid: name".into()));
        }
        if self.display.width == 0 {
            return Err(LtError::Config("parameter invalid: width".into()));
        }
        if self.display.height == 0 {
            return Err(LtError::Config("parameter invalid: height".into()));
        }
        if self.display.refresh_hz == 0 {
            return Err(LtError::Config("parameter invalid: freq".into()));
        }
        if self.codecs.is_empty() {
            return Err(LtError::Config("parameter invalid: codecs".into()));
        }
        Ok(())
    }
}

// ── Worker ───────────────────────────────────────────────────────

pub struct Worker {
    params: WorkerParams,
    session_params: SessionParams,
    pool: Arc<FramePool>,
    stats: Arc<PipelineStats>,
    watcher: ThreadWatcher,
    capturer: VideoCapturer,
    audio_capturer: AudioCapturer,
    encoder: Arc<Mutex<VideoEncoder>>,
    frame_rx: Option<mpsc::Receiver<crate::types::Frame>>,
    audio_rx: mpsc::Receiver<AudioData>,
    clipboard: ClipboardAssembler,
    clipboard_sink: Box<dyn ClipboardSink>,
    state_tx: watch::Sender<SessionState>,
    stop: CancellationToken,
}

impl Worker {
    /// Validate the launch parameters, probe capture and encode, and run
    /// the initial negotiation. Nothing streams yet.
    pub fn create(params: WorkerParams) -> Result<Self, LtError> {
        params.validate()?;

        let pool = Arc::new(FramePool::default());
        let stats = Arc::new(PipelineStats::new());
        let watcher = ThreadWatcher::new();

        let (frame_tx, frame_rx) = mailbox();
        let capturer = VideoCapturer::create(VideoCapturerParams {
            backend: params.capture_backend,
            display: params.display,
            pool: Arc::clone(&pool),
            on_frame: {
                let pool = Arc::clone(&pool);
                let stats = Arc::clone(&stats);
                Box::new(move |frame| offer_frame(&frame_tx, &pool, &stats, frame))
            },
            on_fatal: None,
            alive: Some(watcher.register("video_capture")),
        })?;

        let (audio_tx, audio_rx) = mpsc::channel::<AudioData>(32);
        let audio_capturer = AudioCapturer::create(AudioCapturerParams {
            codec: crate::types::AudioCodec::Opus,
            source: Box::new(LoopbackSource::new()),
            on_audio: Box::new(move |data| {
                let _ = audio_tx.try_send(data);
            }),
            alive: Some(watcher.register("audio_capture")),
        })?;

        let abilities = check_encode_abilities(
            capturer.luid(),
            params.display.width,
            params.display.height,
        );
        let session_params = negotiate::negotiate(
            params.display,
            &params.codecs,
            &abilities,
            audio_capturer.params(),
            capturer.luid(),
        )?;
        info!(
            "negotiated {}x{}@{} {:?} via {:?}",
            session_params.video.width,
            session_params.video.height,
            session_params.video.refresh_hz,
            session_params.video.codec,
            session_params.video.encoder_backend,
        );

        let encoder = Arc::new(Mutex::new(VideoEncoder::new(VideoEncoderConfig {
            codec: session_params.video.codec,
            backend: session_params.video.encoder_backend,
            width: session_params.video.width,
            height: session_params.video.height,
            rate: session_params.rate_control,
        })?));

        let (state_tx, _) = watch::channel(SessionState::Idle);

        Ok(Self {
            params,
            session_params,
            pool,
            stats,
            watcher,
            capturer,
            audio_capturer,
            encoder,
            frame_rx: Some(frame_rx),
            audio_rx,
            clipboard: ClipboardAssembler::new(),
            clipboard_sink: Box::new(MemoryClipboard::new()),
            state_tx,
            stop: CancellationToken::new(),
        })
    }

    /// Replace the clipboard sink (platform shells install the real OS
    /// clipboard here).
    pub fn set_clipboard_sink(&mut self, sink: Box<dyn ClipboardSink>) {
        self.clipboard_sink = sink;
    }

    /// The parameters agreed at construction time.
    pub fn session_params(&self) -> &SessionParams {
        &self.session_params
    }

    /// Observe state transitions (tests, service mirroring).
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Handle for stopping the worker from another task.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> Result<ExitReason, LtError> {
        let mut state = SessionState::Idle;
        let watchdog_task = self.watcher.start();

        // Pipe first: a worker without its service is an orphan.
        let mut pipe_conn = pipe::connect(&self.params.pipe_name).await?;
        pipe_conn
            .send(ControlMessage::StreamingParams(self.session_params.clone()))
            .await?;

        state.start()?;
        self.publish(state);

        let (sig_events_tx, mut sig_events) = mpsc::channel::<SignalingEvent>(64);
        let signaling = SignalingClient::connect(
            &self.params.signaling_addr,
            self.params.signaling_port,
            &self.params.room_id,
            &self.params.host_id,
            sig_events_tx,
        )
        .await?;
        state.signaling_connected()?;
        self.publish(state);

        // Router: every type the worker serves, advertised in the ack.
        let (ctl_tx, mut ctl_rx) = mpsc::channel::<ControlMessage>(128);
        let mut router = MessageRouter::new();
        for kind in [
            MessageKind::KeepAlive,
            MessageKind::KeepAliveAck,
            MessageKind::TimeSync,
            MessageKind::SendSideStat,
            MessageKind::StartWorking,
            MessageKind::StopWorking,
            MessageKind::ChangeStreamingParams,
            MessageKind::ClipboardChunk,
            MessageKind::FilePullRequest,
            MessageKind::FileChunkAck,
        ] {
            let tx = ctl_tx.clone();
            router.register(kind, move |msg| {
                let _ = tx.try_send(msg);
            })?;
        }
        let supported_msg_types = router.registered_types();

        let (tp_events_tx, mut tp_events) = mpsc::channel::<TransportEvent>(256);
        let mut transport: Option<ServerTransport> = None;
        let mut encoded_rx = {
            let (encoded_tx, encoded_rx) = mpsc::channel::<EncodedUnit>(8);
            let frame_rx = self.frame_rx.take().ok_or_else(|| {
                LtError::Init("worker already ran".into())
            })?;
            spawn_runner(
                Arc::clone(&self.encoder),
                Arc::clone(&self.pool),
                frame_rx,
                encoded_tx,
                Arc::clone(&self.stats),
            );
            encoded_rx
        };

        let mut client_peer: Option<String> = None;
        let mut pending_signaling: Vec<(String, String)> = Vec::new();
        let mut media_gate_open = false;
        let mut working_started = false;

        let mut pipe_last_seen = steady_now_ms();
        let mut client_last_seen = steady_now_ms();
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);

        let reason = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break ExitReason::UserStop,

                // ── Service pipe ─────────────────────────────────
                msg = pipe_conn.recv() => {
                    let Some(msg) = msg else {
                        warn!("disconnected from service, won't reconnect again");
                        break ExitReason::RemoteClose;
                    };
                    pipe_last_seen = steady_now_ms();
                    match msg {
                        ControlMessage::KeepAlive => {
                            let _ = pipe_conn.send(ControlMessage::KeepAliveAck).await;
                        }
                        ControlMessage::StartWorking => {
                            let ack = self.do_start_working(&mut working_started, &supported_msg_types);
                            if ack.err_code == StartWorkingError::Success {
                                media_gate_open = true;
                            }
                            let _ = pipe_conn.send(ControlMessage::StartWorkingAck(ack)).await;
                        }
                        ControlMessage::StopWorking => {
                            info!("received StopWorking from service");
                            break ExitReason::UserStop;
                        }
                        other => debug!("unhandled pipe message {:?}", other.kind()),
                    }
                }

                // ── Signaling ────────────────────────────────────
                event = sig_events.recv() => {
                    let Some(event) = event else {
                        break ExitReason::InitFailed;
                    };
                    match event {
                        SignalingEvent::JoinAck(ack) if ack.ok => {
                            state.join_ok()?;
                            self.publish(state);
                        }
                        SignalingEvent::JoinAck(ack) => {
                            warn!("join room failed: {:?}", ack.err);
                            break ExitReason::NegotiationFailed;
                        }
                        SignalingEvent::Message { from, key, value } => {
                            if client_peer.is_none() {
                                client_peer = Some(from.clone());
                                for (key, value) in pending_signaling.drain(..) {
                                    let _ = signaling.send_message(&from, &key, &value).await;
                                }
                            }
                            if key == SIG_PARAMS {
                                match self.handle_client_hello(&value) {
                                    Ok(blob) => {
                                        let _ = signaling
                                            .send_message(&from, SIG_PARAMS_OK, &blob)
                                            .await;
                                        if state == SessionState::Negotiating {
                                            state.params_ok()?;
                                            self.publish(state);
                                        }
                                        if transport.is_none() {
                                            transport = Some(
                                                ServerTransport::create(
                                                    self.params.transport,
                                                    tp_events_tx.clone(),
                                                )
                                                .await?,
                                            );
                                        }
                                    }
                                    Err(e) => {
                                        warn!("{e}");
                                        let _ = signaling
                                            .send_message(&from, SIG_PARAMS_ERR, &e.to_string())
                                            .await;
                                        break ExitReason::NegotiationFailed;
                                    }
                                }
                            } else if let Some(tp) = transport.as_mut() {
                                tp.on_signaling_message(&key, &value);
                            }
                        }
                        SignalingEvent::Disconnected => {
                            // Tolerable once the transport is direct.
                            warn!("signaling connection lost");
                            if !state.is_working() {
                                break ExitReason::InitFailed;
                            }
                        }
                    }
                }

                // ── Transport ────────────────────────────────────
                event = tp_events.recv() => {
                    let Some(event) = event else {
                        break ExitReason::InitFailed;
                    };
                    match event {
                        TransportEvent::Signaling { key, value } => {
                            if let Some(peer) = &client_peer {
                                let _ = signaling.send_message(peer, &key, &value).await;
                            } else {
                                pending_signaling.push((key, value));
                            }
                        }
                        TransportEvent::Connected => {
                            info!("client transport attached");
                            client_last_seen = steady_now_ms();
                        }
                        TransportEvent::Disconnected => {
                            warn!("client transport detached");
                        }
                        TransportEvent::Failed(e) => {
                            warn!("transport failure: {e}");
                        }
                        TransportEvent::Data { data, .. } => {
                            client_last_seen = steady_now_ms();
                            match ControlMessage::from_wire_bytes(&data) {
                                Ok(msg) => {
                                    router.dispatch(msg);
                                    if router.over_strike_limit() {
                                        break ExitReason::ProtocolAbuse;
                                    }
                                }
                                Err(e) => debug!("bad control payload: {e}"),
                            }
                        }
                        TransportEvent::Video(_) | TransportEvent::Audio(_) => {
                            // The host end does not receive media.
                        }
                    }
                }

                // ── Routed control messages ──────────────────────
                msg = ctl_rx.recv() => {
                    let Some(msg) = msg else { break ExitReason::InitFailed };
                    match msg {
                        ControlMessage::KeepAlive => {
                            if let Some(tp) = transport.as_mut() {
                                let _ = Self::send_control(tp, &ControlMessage::KeepAliveAck);
                            }
                        }
                        ControlMessage::KeepAliveAck => {}
                        ControlMessage::TimeSync(sync) if sync.t1_us.is_none() => {
                            if let Some(tp) = transport.as_mut() {
                                let reply = ControlMessage::TimeSync(TimeSyncMsg {
                                    t0_us: sync.t0_us,
                                    t1_us: Some(steady_now_us()),
                                });
                                let _ = Self::send_control(tp, &reply);
                            }
                        }
                        ControlMessage::TimeSync(_) => {}
                        ControlMessage::SendSideStat(stat) => {
                            self.encoder
                                .lock()
                                .expect("encoder poisoned")
                                .on_send_side_stat(&stat);
                        }
                        ControlMessage::StartWorking => {
                            let ack = self.do_start_working(&mut working_started, &supported_msg_types);
                            let success = ack.err_code == StartWorkingError::Success;
                            if let Some(tp) = transport.as_mut() {
                                let _ = Self::send_control(
                                    tp,
                                    &ControlMessage::StartWorkingAck(ack),
                                );
                            }
                            if success {
                                media_gate_open = true;
                                client_last_seen = steady_now_ms();
                                if !state.is_working() {
                                    state.working()?;
                                    self.publish(state);
                                }
                            }
                        }
                        ControlMessage::StopWorking => {
                            info!("received StopWorking from client");
                            break ExitReason::RemoteClose;
                        }
                        ControlMessage::ChangeStreamingParams(change) => {
                            debug!("stream params change requested: {change:?}");
                            self.encoder
                                .lock()
                                .expect("encoder poisoned")
                                .request_keyframe();
                        }
                        ControlMessage::ClipboardChunk(chunk) => {
                            if let Some(bytes) = self.clipboard.push(chunk) {
                                let text = String::from_utf8_lossy(&bytes);
                                self.clipboard_sink.set_text(&text);
                            }
                        }
                        ControlMessage::FilePullRequest(req) => {
                            if let Some(tp) = transport.as_mut() {
                                Self::serve_file(tp, &req.path, req.request_id).await;
                            }
                        }
                        ControlMessage::FileChunkAck(ack) => {
                            debug!("file chunk {} of request {} acked", ack.chunk_index, ack.request_id);
                        }
                        other => debug!("unrouted control message {:?}", other.kind()),
                    }
                }

                // ── Media out ────────────────────────────────────
                unit = encoded_rx.recv() => {
                    let Some(unit) = unit else { break ExitReason::InitFailed };
                    if media_gate_open {
                        if let Some(tp) = transport.as_mut() {
                            if let Err(e) = tp.send_video(&unit) {
                                debug!("video send: {e}");
                            }
                        }
                    }
                }
                audio = self.audio_rx.recv() => {
                    let Some(audio) = audio else { break ExitReason::InitFailed };
                    if media_gate_open {
                        if let Some(tp) = transport.as_mut() {
                            if let Err(e) = tp.send_audio(&audio) {
                                debug!("audio send: {e}");
                            }
                        }
                    }
                }

                // ── Upkeep ───────────────────────────────────────
                _ = keep_alive.tick() => {
                    let _ = pipe_conn.send(ControlMessage::KeepAlive).await;
                    if let Some(tp) = transport.as_mut() {
                        let _ = Self::send_control(tp, &ControlMessage::KeepAlive);
                    }
                    let now = steady_now_ms();
                    if now - pipe_last_seen > KEEP_ALIVE_TIMEOUT_MS {
                        warn!("service keep-alive timeout");
                        break ExitReason::KeepAliveTimeout;
                    }
                    // The worker has no client-rediscovery logic: a silent
                    // client ends the session rather than entering
                    // Reconnecting.
                    if state.is_working() && now - client_last_seen > KEEP_ALIVE_TIMEOUT_MS {
                        warn!("client keep-alive timeout");
                        break ExitReason::KeepAliveTimeout;
                    }
                }
            }
        };

        // Teardown: synchronous stops, then report.
        self.capturer.stop();
        self.audio_capturer.stop();
        if let Some(mut tp) = transport {
            tp.close();
        }
        signaling.close();
        self.watcher.stop();
        let _ = watchdog_task.await;
        state.close();
        self.publish(state);
        info!("worker session ended: {reason}");
        Ok(reason)
    }

    // ── Internals ────────────────────────────────────────────────

    fn publish(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    fn send_control(tp: &mut ServerTransport, msg: &ControlMessage) -> Result<(), LtError> {
        tp.send_data(msg.to_wire_bytes()?, true)
    }

    /// Re-negotiate against the client's hello and return the agreed
    /// parameters as a signaling blob.
    fn handle_client_hello(&mut self, value: &str) -> Result<String, LtError> {
        let hello: ClientHello = bincode::deserialize(&decode_blob(value)?)?;
        let abilities = check_encode_abilities(
            self.capturer.luid(),
            hello.display.width,
            hello.display.height,
        );
        let negotiated = negotiate::negotiate(
            hello.display,
            &hello.codecs,
            &abilities,
            self.audio_capturer.params(),
            self.capturer.luid(),
        )?;
        if negotiated.video != self.session_params.video {
            *self.encoder.lock().expect("encoder poisoned") =
                VideoEncoder::new(VideoEncoderConfig {
                    codec: negotiated.video.codec,
                    backend: negotiated.video.encoder_backend,
                    width: negotiated.video.width,
                    height: negotiated.video.height,
                    rate: negotiated.rate_control,
                })?;
        }
        self.session_params = negotiated.clone();
        Ok(encode_blob(&bincode::serialize(&negotiated)?))
    }

    fn do_start_working(
        &mut self,
        working_started: &mut bool,
        supported_msg_types: &[u32],
    ) -> StartWorkingAck {
        let err_code = if *working_started {
            StartWorkingError::Success
        } else {
            match self.capturer.start().and_then(|_| self.audio_capturer.start()) {
                Ok(()) => {
                    *working_started = true;
                    StartWorkingError::Success
                }
                Err(e) => {
                    warn!("start working failed: {e}");
                    self.capturer.stop();
                    self.audio_capturer.stop();
                    StartWorkingError::CaptureFailed
                }
            }
        };
        StartWorkingAck {
            err_code,
            supported_msg_types: supported_msg_types.to_vec(),
        }
    }

    async fn serve_file(tp: &mut ServerTransport, path: &str, request_id: u32) {
        const CHUNK: usize = 64 * 1024;
        match tokio::fs::read(path).await {
            Ok(contents) => {
                let chunks: Vec<&[u8]> = if contents.is_empty() {
                    vec![&[]]
                } else {
                    contents.chunks(CHUNK).collect()
                };
                let last = chunks.len() - 1;
                for (index, data) in chunks.iter().enumerate() {
                    let msg = ControlMessage::FileChunk(crate::message::FileChunk {
                        request_id,
                        chunk_index: index as u32,
                        is_last: index == last,
                        data: data.to_vec(),
                    });
                    if Self::send_control(tp, &msg).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("file pull '{path}' failed: {e}");
                // An empty terminal chunk tells the peer the pull ended.
                let _ = Self::send_control(
                    tp,
                    &ControlMessage::FileChunk(crate::message::FileChunk {
                        request_id,
                        chunk_index: 0,
                        is_last: true,
                        data: Vec::new(),
                    }),
                );
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params(pipe_name: &str, room: &str, sig_port: u16) -> WorkerParams {
        WorkerParams {
            pipe_name: pipe_name.into(),
            room_id: room.into(),
            host_id: "host".into(),
            signaling_addr: "127.0.0.1".into(),
            signaling_port: sig_port,
            display: DisplaySetting::new(64, 48, 240),
            codecs: vec![VideoCodec::H264],
            capture_backend: CaptureBackendKind::TestPattern,
            transport: TransportKind::Tcp,
        }
    }

    #[test]
    fn blob_roundtrip() {
        let data = vec![0u8, 1, 0xAB, 0xFF];
        assert_eq!(decode_blob(&encode_blob(&data)).unwrap(), data);
        assert!(decode_blob("abc").is_err());
        assert!(decode_blob("zz").is_err());
    }

    #[test]
    fn create_validates_parameters() {
        let mut params = test_params("p", "r", 1);
        params.pipe_name = String::new();
        assert!(matches!(Worker::create(params), Err(LtError::Config(_))));

        let mut params = test_params("p", "r", 1);
        params.display.width = 0;
        assert!(matches!(Worker::create(params), Err(LtError::Config(_))));

        let mut params = test_params("p", "r", 1);
        params.codecs.clear();
        assert!(matches!(Worker::create(params), Err(LtError::Config(_))));
    }

    #[test]
    fn create_negotiates_from_launch_params() {
        let worker = Worker::create(test_params("p", "r", 1)).unwrap();
        let params = worker.session_params();
        assert_eq!(params.video.codec, VideoCodec::H264);
        assert_eq!(params.audio.sample_rate, 48_000);
    }

    #[test]
    fn create_fails_without_common_codec() {
        let mut params = test_params("p", "r", 1);
        // The software host only offers H264.
        params.codecs = vec![VideoCodec::H265];
        assert!(matches!(
            Worker::create(params),
            Err(LtError::Negotiation(_))
        ));
    }

    #[test]
    fn hello_renegotiation_picks_client_preference() {
        let mut worker = Worker::create(test_params("p", "r", 1)).unwrap();
        let hello = ClientHello {
            display: DisplaySetting::new(1280, 720, 60),
            codecs: vec![VideoCodec::H265, VideoCodec::H264],
        };
        let blob = encode_blob(&bincode::serialize(&hello).unwrap());
        let reply = worker.handle_client_hello(&blob).unwrap();
        let agreed: SessionParams = bincode::deserialize(&decode_blob(&reply).unwrap()).unwrap();
        assert_eq!(agreed.video.codec, VideoCodec::H264);
        assert_eq!(agreed.video.width, 1280);
    }

    #[test]
    fn hello_renegotiation_fails_without_intersection() {
        let mut worker = Worker::create(test_params("p", "r", 1)).unwrap();
        let hello = ClientHello {
            display: DisplaySetting::new(1280, 720, 60),
            codecs: vec![VideoCodec::H265],
        };
        let blob = encode_blob(&bincode::serialize(&hello).unwrap());
        assert!(matches!(
            worker.handle_client_hello(&blob),
            Err(LtError::Negotiation(_))
        ));
    }
}
