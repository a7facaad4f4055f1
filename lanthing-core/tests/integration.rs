//! End-to-end session scenarios on localhost: negotiation outcomes,
//! the full capture → encode → transport → decode → present path,
//! keep-alive liveness, and the reconnect deadline.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use lanthing_core::capture::CaptureBackendKind;
use lanthing_core::clipboard::MemoryClipboard;
use lanthing_core::decode::DecodedFrame;
use lanthing_core::error::ExitReason;
use lanthing_core::message::{ControlMessage, StartWorkingAck, StartWorkingError, TimeSyncMsg};
use lanthing_core::negotiate::{
    AudioParams, DisplaySetting, RateControlConfig, SessionParams, VideoParams,
};
use lanthing_core::pipe;
use lanthing_core::render::pipeline::{CursorOverlay, RenderSink};
use lanthing_core::session::client::{ClientSession, ClientSessionParams};
use lanthing_core::session::worker::{
    encode_blob, Worker, WorkerParams, SIG_PARAMS, SIG_PARAMS_OK,
};
use lanthing_core::session::SessionState;
use lanthing_core::signaling::{SignalingClient, SignalingEvent, SignalingServer};
use lanthing_core::time::steady_now_ms;
use lanthing_core::transport::{ServerTransport, TransportEvent, TransportKind};
use lanthing_core::types::{AudioCodec, EncoderBackend, VideoCodec};

// ── Helpers ──────────────────────────────────────────────────────

fn unique(tag: &str) -> String {
    use std::sync::atomic::AtomicU32;
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "lt-it-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// A fake service: accepts the worker's pipe, answers keep-alives, and
/// leaves session control to the client side.
fn spawn_fake_service(pipe_name: String) {
    tokio::spawn(async move {
        let mut server = pipe::PipeServer::bind(&pipe_name).expect("bind service pipe");
        let Ok(mut conn) = server.accept().await else {
            return;
        };
        let mut keep_alive = tokio::time::interval(Duration::from_millis(400));
        loop {
            tokio::select! {
                msg = conn.recv() => {
                    match msg {
                        Some(ControlMessage::KeepAlive) => {
                            let _ = conn.send(ControlMessage::KeepAliveAck).await;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = keep_alive.tick() => {
                    let _ = conn.send(ControlMessage::KeepAlive).await;
                }
            }
        }
    });
}

struct CountingSink {
    presented: Arc<Mutex<Vec<u32>>>,
}

impl RenderSink for CountingSink {
    fn present(&mut self, frame: &DecodedFrame, _cursor: Option<CursorOverlay>) {
        self.presented.lock().unwrap().push(frame.picture_id);
    }
    fn rebuild(&mut self) {}
}

fn worker_params(pipe: &str, room: &str, sig_port: u16) -> WorkerParams {
    WorkerParams {
        pipe_name: pipe.into(),
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

fn client_params(
    room: &str,
    sig_port: u16,
    codecs: Vec<VideoCodec>,
    sink: Box<dyn RenderSink>,
) -> ClientSessionParams {
    ClientSessionParams {
        client_id: "cli".into(),
        room_id: room.into(),
        auth_token: String::new(),
        host_id: "host".into(),
        signaling_addr: "127.0.0.1".into(),
        signaling_port: sig_port,
        display: DisplaySetting::new(1280, 720, 60),
        codecs,
        transport: TransportKind::Tcp,
        render_size: (1280, 720),
        sink,
        clipboard_sink: Box::new(MemoryClipboard::new()),
        on_exited: None,
    }
}

async fn wait_for_state(
    rx: &mut tokio::sync::watch::Receiver<SessionState>,
    want: SessionState,
    within: Duration,
) {
    tokio::time::timeout(within, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("never reached {want}"))
        .expect("state channel closed");
}

// ── Scenario: negotiation picks the client's preference ──────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_reaches_working_and_presents_frames() {
    let relay = SignalingServer::bind(0).await.unwrap();
    let room = unique("room");
    let pipe = unique("pipe");
    spawn_fake_service(pipe.clone());

    let mut worker = Worker::create(worker_params(&pipe, &room, relay.port())).unwrap();
    let agreed_at_launch = worker.session_params().clone();
    assert_eq!(agreed_at_launch.video.codec, VideoCodec::H264);
    let host_clipboard = MemoryClipboard::new();
    let host_clipboard_handle = host_clipboard.handle();
    worker.set_clipboard_sink(Box::new(host_clipboard));
    let mut worker_state = worker.state();
    let worker_task = tokio::spawn(worker.run());

    let presented = Arc::new(Mutex::new(Vec::new()));
    // Client prefers H265 but also supports H264; the host only encodes
    // H264, so negotiation lands there.
    let session = ClientSession::start(client_params(
        &room,
        relay.port(),
        vec![VideoCodec::H265, VideoCodec::H264],
        Box::new(CountingSink {
            presented: Arc::clone(&presented),
        }),
    ));

    let mut client_state = session.state();
    wait_for_state(&mut client_state, SessionState::Working, Duration::from_secs(10)).await;
    wait_for_state(&mut worker_state, SessionState::Working, Duration::from_secs(10)).await;

    // Let some frames travel the whole pipeline.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    {
        let frames = presented.lock().unwrap();
        assert!(
            frames.len() >= 3,
            "only {} frames made it to the sink",
            frames.len()
        );
        for pair in frames.windows(2) {
            assert!(pair[1] > pair[0], "picture ids reordered: {pair:?}");
        }
    }

    // Clipboard rides the reliable channel to the host's sink.
    session.send_clipboard("copied on the client").unwrap();
    let mut applied = false;
    for _ in 0..50 {
        if host_clipboard_handle.lock().unwrap().as_deref() == Some("copied on the client") {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(applied, "clipboard never reached the host sink");

    session.stop();
    assert_eq!(session.wait().await, ExitReason::UserStop);
    let worker_reason = tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .expect("worker never exited")
        .unwrap()
        .unwrap();
    assert_eq!(worker_reason, ExitReason::RemoteClose);
}

// ── Scenario: no common codec ────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_without_common_codec_closes() {
    let relay = SignalingServer::bind(0).await.unwrap();
    let room = unique("room");
    let pipe = unique("pipe");
    spawn_fake_service(pipe.clone());

    let worker = Worker::create(worker_params(&pipe, &room, relay.port())).unwrap();
    let worker_task = tokio::spawn(worker.run());

    // Client insists on H265 only; the software host cannot provide it.
    let session = ClientSession::start(client_params(
        &room,
        relay.port(),
        vec![VideoCodec::H265],
        Box::new(CountingSink {
            presented: Arc::new(Mutex::new(Vec::new())),
        }),
    ));

    assert_eq!(session.wait().await, ExitReason::NegotiationFailed);
    let worker_reason = tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .expect("worker never exited")
        .unwrap()
        .unwrap();
    assert_eq!(worker_reason, ExitReason::NegotiationFailed);
}

// ── Scenario: steady keep-alives hold the session ────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_stays_working_under_keepalives() {
    let relay = SignalingServer::bind(0).await.unwrap();
    let room = unique("room");
    let pipe = unique("pipe");
    spawn_fake_service(pipe.clone());

    let worker = Worker::create(worker_params(&pipe, &room, relay.port())).unwrap();
    let worker_task = tokio::spawn(worker.run());

    let session = ClientSession::start(client_params(
        &room,
        relay.port(),
        vec![VideoCodec::H264],
        Box::new(CountingSink {
            presented: Arc::new(Mutex::new(Vec::new())),
        }),
    ));

    let mut state = session.state();
    wait_for_state(&mut state, SessionState::Working, Duration::from_secs(10)).await;

    // Watch for any transition away from Working over several timeout
    // windows' worth of traffic.
    let observer = tokio::spawn(async move {
        let watch = async {
            loop {
                if state.changed().await.is_err() {
                    return Some(*state.borrow());
                }
                let now = *state.borrow();
                if now != SessionState::Working {
                    return Some(now);
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), watch)
            .await
            .ok()
            .flatten()
    });
    let deviation = observer.await.unwrap();
    assert_eq!(deviation, None, "session left Working: {deviation:?}");

    session.stop();
    session.wait().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_task).await;
}

// ── Scenario: keep-alive silence trips the reconnect deadline ────

/// A scripted host: negotiates with whatever the client offers, acks
/// `StartWorking`, and sends keep-alives only while `talking` is set.
fn spawn_scripted_host(
    relay_port: u16,
    room: String,
    talking: Arc<AtomicBool>,
    last_sent_ms: Arc<AtomicI64>,
) {
    tokio::spawn(async move {
        let (sig_tx, mut sig_rx) = mpsc::channel::<SignalingEvent>(64);
        let signaling =
            SignalingClient::connect("127.0.0.1", relay_port, &room, "host", sig_tx)
                .await
                .expect("host signaling");

        let (tp_tx, mut tp_rx) = mpsc::channel::<TransportEvent>(256);
        let mut transport: Option<ServerTransport> = None;
        let mut client_peer: Option<String> = None;
        let mut pending: Vec<(String, String)> = Vec::new();
        let mut keep_alive = tokio::time::interval(Duration::from_millis(400));

        let agreed = SessionParams {
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
        };

        let send = |tp: &mut ServerTransport, msg: ControlMessage, stamp: &AtomicI64| {
            if tp.send_data(msg.to_wire_bytes().unwrap(), true).is_ok() {
                stamp.store(steady_now_ms(), Ordering::SeqCst);
            }
        };

        loop {
            tokio::select! {
                event = sig_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SignalingEvent::Message { from, key, value } => {
                            if client_peer.is_none() {
                                client_peer = Some(from.clone());
                                for (key, value) in pending.drain(..) {
                                    let _ = signaling.send_message(&from, &key, &value).await;
                                }
                            }
                            if key == SIG_PARAMS {
                                let blob =
                                    encode_blob(&bincode::serialize(&agreed).unwrap());
                                let _ = signaling
                                    .send_message(&from, SIG_PARAMS_OK, &blob)
                                    .await;
                                if transport.is_none() {
                                    transport = Some(
                                        ServerTransport::create(
                                            TransportKind::Tcp,
                                            tp_tx.clone(),
                                        )
                                        .await
                                        .expect("host transport"),
                                    );
                                }
                            } else if let Some(tp) = transport.as_mut() {
                                tp.on_signaling_message(&key, &value);
                            }
                        }
                        SignalingEvent::JoinAck(_) => {}
                        SignalingEvent::Disconnected => break,
                    }
                }
                event = tp_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        TransportEvent::Signaling { key, value } => {
                            if let Some(peer) = &client_peer {
                                let _ = signaling.send_message(peer, &key, &value).await;
                            } else {
                                pending.push((key, value));
                            }
                        }
                        TransportEvent::Data { data, .. } => {
                            let Ok(msg) = ControlMessage::from_wire_bytes(&data) else {
                                continue;
                            };
                            if !talking.load(Ordering::SeqCst) {
                                continue; // scripted silence
                            }
                            let Some(tp) = transport.as_mut() else { continue };
                            match msg {
                                ControlMessage::StartWorking => {
                                    send(
                                        tp,
                                        ControlMessage::StartWorkingAck(StartWorkingAck {
                                            err_code: StartWorkingError::Success,
                                            supported_msg_types: Vec::new(),
                                        }),
                                        &last_sent_ms,
                                    );
                                }
                                ControlMessage::KeepAlive => {
                                    send(tp, ControlMessage::KeepAliveAck, &last_sent_ms);
                                }
                                ControlMessage::TimeSync(TimeSyncMsg {
                                    t0_us,
                                    t1_us: None,
                                }) => {
                                    send(
                                        tp,
                                        ControlMessage::TimeSync(TimeSyncMsg {
                                            t0_us,
                                            t1_us: Some(0),
                                        }),
                                        &last_sent_ms,
                                    );
                                }
                                _ => {}
                            }
                        }
                        _ => {}
                    }
                }
                _ = keep_alive.tick() => {
                    if talking.load(Ordering::SeqCst) {
                        if let Some(tp) = transport.as_mut() {
                            send(tp, ControlMessage::KeepAlive, &last_sent_ms);
                        }
                    }
                }
            }
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keepalive_silence_hits_reconnecting_near_the_deadline() {
    let relay = SignalingServer::bind(0).await.unwrap();
    let room = unique("room");
    let talking = Arc::new(AtomicBool::new(true));
    let last_sent_ms = Arc::new(AtomicI64::new(steady_now_ms()));
    spawn_scripted_host(
        relay.port(),
        room.clone(),
        Arc::clone(&talking),
        Arc::clone(&last_sent_ms),
    );

    let session = ClientSession::start(client_params(
        &room,
        relay.port(),
        vec![VideoCodec::H264],
        Box::new(CountingSink {
            presented: Arc::new(Mutex::new(Vec::new())),
        }),
    ));
    let mut state = session.state();
    wait_for_state(&mut state, SessionState::Working, Duration::from_secs(10)).await;

    // Hold Working for a moment, then script total silence.
    tokio::time::sleep(Duration::from_millis(700)).await;
    talking.store(false, Ordering::SeqCst);

    wait_for_state(
        &mut state,
        SessionState::Reconnecting,
        Duration::from_secs(6),
    )
    .await;
    let detected_after = steady_now_ms() - last_sent_ms.load(Ordering::SeqCst);

    // The deadline is 3 s of silence; detection runs on a 100 ms check.
    assert!(
        (2_900..=3_600).contains(&detected_after),
        "reconnect detected {detected_after} ms after the last host message"
    );

    session.stop();
    session.wait().await;
}
