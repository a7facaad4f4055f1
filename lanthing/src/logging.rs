//! Logging init and log-directory housekeeping.
//!
//! Each role logs under `<config>/log/<role>/`. The file writer flushes
//! every N lines (the `--flushlog` value, clamped to `[1, 100]`); crash
//! dumps land beside the logs and anything older than 14 days is reaped
//! by a background task every 12 hours.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config;

/// Default flush cadence in lines.
pub const DEFAULT_FLUSH_LINES: u32 = 30;
/// Dumps older than this are removed.
const DUMP_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);
const DUMP_SWEEP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Clamp a `--flushlog` request into the supported range.
pub fn clamp_flush_lines(requested: Option<i64>) -> u32 {
    match requested {
        None => DEFAULT_FLUSH_LINES,
        Some(n) if n <= 0 => DEFAULT_FLUSH_LINES,
        Some(n) => n.clamp(1, 100) as u32,
    }
}

// ── Line-counting writer ─────────────────────────────────────────

struct FlushState {
    out: BufWriter<File>,
    lines_since_flush: u32,
    flush_every: u32,
}

/// A cloneable writer that flushes the underlying file every
/// `flush_every` newlines.
#[derive(Clone)]
pub struct LineFlushWriter {
    state: Arc<Mutex<FlushState>>,
}

impl LineFlushWriter {
    pub fn create(path: &Path, flush_every: u32) -> std::io::Result<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self {
            state: Arc::new(Mutex::new(FlushState {
                out: BufWriter::new(file),
                lines_since_flush: 0,
                flush_every: flush_every.max(1),
            })),
        })
    }
}

impl Write for LineFlushWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().expect("log writer poisoned");
        let written = state.out.write(buf)?;
        state.lines_since_flush += buf[..written].iter().filter(|&&b| b == b'\n').count() as u32;
        if state.lines_since_flush >= state.flush_every {
            state.out.flush()?;
            state.lines_since_flush = 0;
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.state.lock().expect("log writer poisoned").out.flush()
    }
}

// ── Init ─────────────────────────────────────────────────────────

/// The log directory for `role`, created on demand.
pub fn log_dir(role: &str) -> PathBuf {
    config::config_dir().join("log").join(role)
}

/// Initialize tracing for `role`.
///
/// Logs go to a per-role file when the directory is writable, otherwise
/// to stderr. Returns the log directory when file logging is active.
pub fn init(role: &str, level: &str, flush_lines: u32) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let dir = log_dir(role);

    let file_writer = std::fs::create_dir_all(&dir)
        .ok()
        .and_then(|_| LineFlushWriter::create(&dir.join(format!("{role}.log")), flush_lines).ok());

    match file_writer {
        Some(writer) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .init();
            Some(dir)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

// ── Dump reaping ─────────────────────────────────────────────────

/// Remove `.dmp` files in `dir` older than the retention window.
/// Returns how many were deleted.
pub fn reap_old_dumps(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("dmp") {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > DUMP_MAX_AGE);
        if old_enough && std::fs::remove_file(&path).is_ok() {
            info!("removed dump {}", path.display());
            removed += 1;
        }
    }
    removed
}

/// Spawn the periodic dump sweeper for `dir`.
pub fn spawn_dump_cleanup(dir: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            reap_old_dumps(&dir);
            tokio::time::sleep(DUMP_SWEEP_INTERVAL).await;
        }
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushlog_clamping() {
        assert_eq!(clamp_flush_lines(None), 30);
        assert_eq!(clamp_flush_lines(Some(0)), 30);
        assert_eq!(clamp_flush_lines(Some(-5)), 30);
        assert_eq!(clamp_flush_lines(Some(1)), 1);
        assert_eq!(clamp_flush_lines(Some(42)), 42);
        assert_eq!(clamp_flush_lines(Some(1_000)), 100);
    }

    #[test]
    fn writer_flushes_on_line_budget() {
        let dir = std::env::temp_dir().join(format!("lt-log-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.log");

        let mut writer = LineFlushWriter::create(&path, 2).unwrap();
        writer.write_all(b"one\n").unwrap();
        // Under the budget: may still sit in the buffer.
        writer.write_all(b"two\n").unwrap();
        // Budget reached: contents must be on disk without an explicit
        // flush call.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("one"));
        assert!(contents.contains("two"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reap_removes_only_old_dumps() {
        let dir = std::env::temp_dir().join(format!("lt-dump-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let fresh = dir.join("fresh.dmp");
        std::fs::write(&fresh, b"x").unwrap();
        let log = dir.join("keep.log");
        std::fs::write(&log, b"x").unwrap();

        // Fresh files and non-dumps survive.
        assert_eq!(reap_old_dumps(&dir), 0);
        assert!(fresh.exists());
        assert!(log.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
