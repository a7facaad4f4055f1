//! Lanthing entry point: one binary, four roles.
//!
//! ```text
//! lanthing --type app                           GUI launcher (external; stub here)
//! lanthing --type service [--with-relay]        pipe endpoint for workers
//! lanthing --type worker --name <pipe> --width 1920 --height 1080 \
//!          --freq 60 --codecs avc,hevc          per-session host worker
//! lanthing --type client --client-id c1 --room r1 [--token t] \
//!          --signaling-addr host --signaling-port 8788
//! ```
//!
//! Exit codes: 0 normal, 1 initialization failure, negative (255 on
//! POSIX) when the role is unavailable on this platform.

mod config;
mod logging;
mod service;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use lanthing_core::capture::CaptureBackendKind;
use lanthing_core::clipboard::MemoryClipboard;
use lanthing_core::decode::DecodedFrame;
use lanthing_core::error::ExitReason;
use lanthing_core::negotiate::DisplaySetting;
use lanthing_core::render::pipeline::{CursorOverlay, RenderSink};
use lanthing_core::session::client::{ClientSession, ClientSessionParams};
use lanthing_core::session::worker::{Worker, WorkerParams};
use lanthing_core::signaling::SignalingServer;
use lanthing_core::transport::TransportKind;
use lanthing_core::types::VideoCodec;

use config::Settings;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    App,
    Service,
    Client,
    Worker,
}

#[derive(Parser, Debug)]
#[command(name = "lanthing", about = "Low-latency remote desktop")]
struct Cli {
    /// Process role.
    #[arg(long = "type", value_enum, default_value = "app")]
    kind: Role,

    /// Path to the settings TOML (defaults to the platform config dir).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log flush cadence in lines, clamped to [1, 100].
    #[arg(long)]
    flushlog: Option<i64>,

    // ── Worker options ───────────────────────────────────────────
    /// Pipe endpoint name.
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Display refresh rate.
    #[arg(long)]
    freq: Option<u32>,
    /// Comma-separated codec preference: avc,hevc.
    #[arg(long)]
    codecs: Option<String>,

    // ── Client options ───────────────────────────────────────────
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long)]
    room: Option<String>,
    /// Room auth token.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    signaling_addr: Option<String>,
    #[arg(long)]
    signaling_port: Option<u16>,
    /// Use the TCP fallback transport instead of the RTC-like one.
    #[arg(long)]
    tcp: bool,

    // ── Service options ──────────────────────────────────────────
    /// Also host the reference signaling relay.
    #[arg(long)]
    with_relay: bool,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::App => "app",
        Role::Service => "service",
        Role::Client => "client",
        Role::Worker => "worker",
    }
}

fn parse_codecs(spec: &str) -> Vec<VideoCodec> {
    spec.split(',')
        .filter_map(|name| VideoCodec::parse(name.trim()))
        .collect()
}

// ── Role runners ─────────────────────────────────────────────────

async fn run_worker(cli: &Cli, settings: &Settings) -> i32 {
    let display = DisplaySetting::new(
        cli.width.unwrap_or(0),
        cli.height.unwrap_or(0),
        cli.freq.unwrap_or(0),
    );
    let codecs = cli.codecs.as_deref().map(parse_codecs).unwrap_or_default();
    let params = WorkerParams {
        pipe_name: cli.name.clone().unwrap_or_default(),
        room_id: cli.room.clone().unwrap_or_else(|| "lanthing".into()),
        host_id: "host".into(),
        signaling_addr: cli
            .signaling_addr
            .clone()
            .unwrap_or_else(|| settings.signaling.addr.clone()),
        signaling_port: cli.signaling_port.unwrap_or(settings.signaling.port),
        display,
        codecs,
        capture_backend: default_capture_backend(),
        transport: transport_kind(cli),
    };

    let worker = match Worker::create(params) {
        Ok(worker) => worker,
        Err(e) => {
            warn!("worker init failed: {e}");
            return 1;
        }
    };

    let stop = worker.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, stopping worker");
        stop.cancel();
    });

    match worker.run().await {
        Ok(reason) => {
            info!("normal exit ({reason})");
            0
        }
        Err(e) => {
            warn!("worker failed: {e}");
            1
        }
    }
}

async fn run_client(cli: &Cli, settings: &Settings) -> i32 {
    let codecs = match &cli.codecs {
        Some(spec) => parse_codecs(spec),
        None => settings.codec_preference(),
    };
    let defaults = settings.display();
    let display = DisplaySetting::new(
        cli.width.unwrap_or(defaults.width),
        cli.height.unwrap_or(defaults.height),
        cli.freq.unwrap_or(defaults.refresh_hz),
    );
    let params = ClientSessionParams {
        client_id: cli.client_id.clone().unwrap_or_else(|| "client".into()),
        room_id: cli.room.clone().unwrap_or_else(|| "lanthing".into()),
        auth_token: cli.token.clone().unwrap_or_default(),
        host_id: "host".into(),
        signaling_addr: cli
            .signaling_addr
            .clone()
            .unwrap_or_else(|| settings.signaling.addr.clone()),
        signaling_port: cli.signaling_port.unwrap_or(settings.signaling.port),
        display,
        codecs,
        transport: transport_kind(cli),
        render_size: (display.width, display.height),
        sink: Box::new(ConsoleStatsSink::new()),
        // Headless build: remote clipboard lands in memory. A windowed
        // shell installs the OS clipboard here.
        clipboard_sink: Box::new(MemoryClipboard::new()),
        on_exited: Some(Box::new(|reason: ExitReason| {
            info!("session exited: {reason}");
        })),
    };

    let session = ClientSession::start(params);
    let stop_session = session.stop_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, stopping session");
        stop_session.cancel();
    });

    match session.wait().await {
        ExitReason::InitFailed | ExitReason::NegotiationFailed => 1,
        _ => 0,
    }
}

async fn run_service(cli: &Cli, settings: &Settings) -> i32 {
    let _relay = if cli.with_relay {
        match SignalingServer::bind(settings.signaling.port).await {
            Ok(relay) => {
                info!("signaling relay on port {}", relay.port());
                Some(relay)
            }
            Err(e) => {
                warn!("relay init failed: {e}");
                return 1;
            }
        }
    } else {
        None
    };

    let svc = service::Service::new(settings.service.pipe_name.clone());
    let stop = svc.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, stopping service");
        stop.cancel();
    });

    match svc.run().await {
        Ok(()) => 0,
        Err(e) => {
            warn!("service failed: {e}");
            1
        }
    }
}

fn default_capture_backend() -> CaptureBackendKind {
    if cfg!(windows) {
        CaptureBackendKind::Dxgi
    } else {
        CaptureBackendKind::TestPattern
    }
}

fn transport_kind(cli: &Cli) -> TransportKind {
    if cli.tcp {
        TransportKind::Tcp
    } else {
        TransportKind::Rtc
    }
}

// ── Client render sink ───────────────────────────────────────────

/// Headless sink: counts frames and logs a smoothed fps line once a
/// second. The windowed renderer plugs into the same trait.
struct ConsoleStatsSink {
    frames: u64,
    window_started_us: i64,
    window_frames: u64,
}

impl ConsoleStatsSink {
    fn new() -> Self {
        Self {
            frames: 0,
            window_started_us: lanthing_core::time::steady_now_us(),
            window_frames: 0,
        }
    }
}

impl RenderSink for ConsoleStatsSink {
    fn present(&mut self, frame: &DecodedFrame, _cursor: Option<CursorOverlay>) {
        self.frames += 1;
        self.window_frames += 1;
        let now = lanthing_core::time::steady_now_us();
        let elapsed = now - self.window_started_us;
        if elapsed >= 1_000_000 {
            let fps = self.window_frames as f64 * 1_000_000.0 / elapsed as f64;
            info!(
                "{}x{} @ {fps:.1} fps ({} frames total)",
                frame.width, frame.height, self.frames
            );
            self.window_started_us = now;
            self.window_frames = 0;
        }
    }

    fn rebuild(&mut self) {
        info!("render target rebuilt");
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(config::settings_path);
    let settings = Settings::load(&settings_path);

    let flush_lines = logging::clamp_flush_lines(cli.flushlog);
    let log_dir = logging::init(role_name(cli.kind), &settings.logging.level, flush_lines);
    if let Some(dir) = log_dir {
        logging::spawn_dump_cleanup(dir);
    }
    info!(
        "lanthing v{} starting as {}",
        env!("CARGO_PKG_VERSION"),
        role_name(cli.kind)
    );

    let code = match cli.kind {
        Role::App => {
            eprintln!("the graphical launcher is not available in this build");
            -1
        }
        Role::Service => run_service(&cli, &settings).await,
        Role::Client => run_client(&cli, &settings).await,
        Role::Worker => run_worker(&cli, &settings).await,
    };
    std::process::exit(code);
}
