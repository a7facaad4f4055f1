//! Thread liveness watchdog.
//!
//! Every long-running producer loop (capture, transport workers, the I/O
//! reactor) registers itself and pings its [`AliveHandle`] once per
//! iteration. A monitor task flags any registered worker whose last ping
//! is older than the hang threshold and fires the hang callback once per
//! hang episode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::time::steady_now_ms;

/// Default time without a ping before a worker is considered hung.
pub const DEFAULT_HANG_THRESHOLD: Duration = Duration::from_secs(10);
const CHECK_INTERVAL: Duration = Duration::from_millis(500);

// ── AliveHandle ──────────────────────────────────────────────────

/// Handed to a worker loop; call [`alive`](Self::alive) each iteration.
#[derive(Debug, Clone)]
pub struct AliveHandle {
    stamp: Arc<AtomicI64>,
}

impl AliveHandle {
    pub fn alive(&self) {
        self.stamp.store(steady_now_ms(), Ordering::Relaxed);
    }
}

// ── ThreadWatcher ────────────────────────────────────────────────

struct Entry {
    stamp: Arc<AtomicI64>,
    flagged: bool,
}

/// Registry of watched worker loops plus the monitor task.
pub struct ThreadWatcher {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    threshold_ms: i64,
    on_hang: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    cancel: CancellationToken,
}

impl ThreadWatcher {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_HANG_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            threshold_ms: threshold.as_millis() as i64,
            on_hang: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set a callback fired once per hang episode with the worker's name.
    pub fn on_hang<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_hang = Some(Arc::new(f));
        self
    }

    /// Register a worker loop. The returned handle starts out fresh.
    pub fn register(&self, name: impl Into<String>) -> AliveHandle {
        let stamp = Arc::new(AtomicI64::new(steady_now_ms()));
        let handle = AliveHandle {
            stamp: Arc::clone(&stamp),
        };
        self.entries.lock().expect("watchdog lock poisoned").insert(
            name.into(),
            Entry {
                stamp,
                flagged: false,
            },
        );
        handle
    }

    /// Remove a worker (after its loop has exited).
    pub fn unregister(&self, name: &str) {
        self.entries
            .lock()
            .expect("watchdog lock poisoned")
            .remove(name);
    }

    /// Names of workers currently past the hang threshold.
    pub fn hung_workers(&self) -> Vec<String> {
        let now = steady_now_ms();
        let entries = self.entries.lock().expect("watchdog lock poisoned");
        entries
            .iter()
            .filter(|(_, e)| now - e.stamp.load(Ordering::Relaxed) > self.threshold_ms)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Spawn the monitor task. Runs until [`stop`](Self::stop).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let threshold_ms = self.threshold_ms;
        let on_hang = self.on_hang.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = steady_now_ms();
                let mut entries = entries.lock().expect("watchdog lock poisoned");
                for (name, entry) in entries.iter_mut() {
                    let silent_ms = now - entry.stamp.load(Ordering::Relaxed);
                    if silent_ms > threshold_ms {
                        if !entry.flagged {
                            entry.flagged = true;
                            error!("worker '{name}' silent for {silent_ms} ms, flagging as hung");
                            if let Some(cb) = &on_hang {
                                cb(name);
                            }
                        }
                    } else if entry.flagged {
                        entry.flagged = false;
                        info!("worker '{name}' recovered");
                    }
                }
            }
        })
    }

    /// Stop the monitor task. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for ThreadWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadWatcher {
    fn drop(&mut self) {
        // The monitor task must not outlive its registry, whichever exit
        // path dropped us.
        self.cancel.cancel();
    }
}

// ── Tests ────────────────────────────────────────────────────────
