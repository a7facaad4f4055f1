//! Audio capture and playback scheduling.
//!
//! The capturer advertises its format during negotiation and produces
//! timestamped packets on a dedicated thread at a fixed packet cadence.
//! Device I/O lives behind the source / sink traits; the loopback source
//! ships in-tree so the pipeline runs end to end anywhere, and the OS
//! capture APIs plug into the same seam.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::error::LtError;
use crate::negotiate::AudioParams;
use crate::time::steady_now_us;
use crate::types::{AudioCodec, AudioData};
use crate::watchdog::AliveHandle;

/// Packet cadence: 10 ms of audio per packet.
pub const PACKET_MS: u32 = 10;

// ── Source / sink seams ──────────────────────────────────────────

/// Produces raw PCM for one packet interval.
pub trait AudioSource: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Fill one packet worth of interleaved i16 samples.
    fn read_packet(&mut self, out: &mut Vec<i16>);
}

/// Consumes decoded audio on the playback side.
pub trait AudioSink: Send {
    fn play(&mut self, data: &AudioData);
}

/// Silence generator with the standard format; stands in where no OS
/// capture API is wired up.
pub struct LoopbackSource {
    sample_rate: u32,
    channels: u16,
}

impl LoopbackSource {
    pub fn new() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl Default for LoopbackSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for LoopbackSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read_packet(&mut self, out: &mut Vec<i16>) {
        let samples = (self.sample_rate / 1_000 * PACKET_MS) as usize * self.channels as usize;
        out.clear();
        out.resize(samples, 0);
    }
}

// ── AudioCapturer ────────────────────────────────────────────────

pub type AudioDataSink = Box<dyn Fn(AudioData) + Send>;

pub struct AudioCapturerParams {
    pub codec: AudioCodec,
    pub source: Box<dyn AudioSource>,
    pub on_audio: AudioDataSink,
    pub alive: Option<AliveHandle>,
}

/// Producer thread emitting one packet per cadence interval.
pub struct AudioCapturer {
    params: Option<AudioCapturerParams>,
    audio: AudioParams,
    stopped: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioCapturer {
    /// Probe the source format; nothing runs until [`start`](Self::start).
    pub fn create(params: AudioCapturerParams) -> Result<Self, LtError> {
        let audio = AudioParams {
            sample_rate: params.source.sample_rate(),
            channels: params.source.channels(),
            codec: params.codec,
        };
        if audio.sample_rate == 0 || audio.channels == 0 {
            return Err(LtError::Init("audio source reported a zero format".into()));
        }
        Ok(Self {
            params: Some(params),
            audio,
            stopped: Arc::new(AtomicBool::new(true)),
            thread: None,
        })
    }

    /// The format advertised during negotiation.
    pub fn params(&self) -> AudioParams {
        self.audio.clone()
    }

    pub fn start(&mut self) -> Result<(), LtError> {
        let params = self
            .params
            .take()
            .ok_or_else(|| LtError::Init("audio capturer already started".into()))?;
        let stopped = Arc::clone(&self.stopped);
        stopped.store(false, Ordering::SeqCst);
        let audio = self.audio.clone();

        let handle = std::thread::Builder::new()
            .name("audio_capture".into())
            .spawn(move || capture_loop(params, audio, &stopped))
            .map_err(|e| LtError::Init(format!("spawn audio thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Synchronous, idempotent stop.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(mut params: AudioCapturerParams, audio: AudioParams, stopped: &AtomicBool) {
    info!(
        "audio capturer started ({} Hz, {} ch)",
        audio.sample_rate, audio.channels
    );
    let interval = Duration::from_millis(PACKET_MS as u64);
    let mut samples: Vec<i16> = Vec::new();
    while !stopped.load(Ordering::SeqCst) {
        if let Some(alive) = &params.alive {
            alive.alive();
        }
        params.source.read_packet(&mut samples);
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in &samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        (params.on_audio)(AudioData {
            codec: audio.codec,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            capture_ts_us: steady_now_us(),
            data,
        });
        std::thread::sleep(interval);
    }
    info!("audio capturer stopped");
}

// ── AudioPlayer ──────────────────────────────────────────────────

/// Playback packets buffered between a packet's arrival and when the sink
/// drains it.
const MAX_QUEUE_DEPTH: usize = 16;

/// Client-side playback queue.
///
/// Bounded: when the sink falls behind, the oldest packets are discarded
/// so playback latency cannot grow without limit.
pub struct AudioPlayer {
    queue: Mutex<VecDeque<AudioData>>,
    dropped: std::sync::atomic::AtomicU64,
}

impl AudioPlayer {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(MAX_QUEUE_DEPTH)),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Enqueue a received packet.
    pub fn submit(&self, data: AudioData) {
        let mut queue = self.queue.lock().expect("audio queue poisoned");
        if queue.len() == MAX_QUEUE_DEPTH {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(data);
    }

    /// Drain everything due into the sink.
    pub fn drain_into(&self, sink: &mut dyn AudioSink) -> usize {
        let packets: Vec<AudioData> = {
            let mut queue = self.queue.lock().expect("audio queue poisoned");
            queue.drain(..).collect()
        };
        for packet in &packets {
            sink.play(packet);
        }
        packets.len()
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().expect("audio queue poisoned").len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for AudioPlayer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
