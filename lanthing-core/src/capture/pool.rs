//! Fixed-capacity pool of shareable frame slots.
//!
//! Allocating a shareable GPU texture per frame is expensive, and the
//! encoder needs stable handles, so capture writes into a fixed ring of
//! named slots instead. Ownership of a slot moves
//! `free list → capture → encoder → free list`; the `in_use` flag only
//! guards allocation, while the actual writer/reader handoff is a keyed
//! mutex: the writer acquires key 0, copies, releases with key 1; the
//! reader acquires key 1, reads, releases with key 0. The same protocol
//! works across a process boundary when the slots are backed by named
//! shared textures.
//!
//! On exhaustion the frame is dropped; the capture thread never blocks
//! waiting for a slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::error;

use crate::error::LtError;

/// Default number of slots, matching the capture-side texture pool.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Writer-side key: the slot is free to be written.
pub const KEY_WRITE: u64 = 0;
/// Reader-side key: the slot holds a finished frame.
pub const KEY_READ: u64 = 1;

// ── KeyedMutex ───────────────────────────────────────────────────

/// A keyed mutex: acquire succeeds only when the stored key matches the
/// requested one, and release stores a (possibly different) key.
///
/// This mirrors the `IDXGIKeyedMutex` acquire/release contract so the
/// in-process and cross-process slot implementations behave identically.
#[derive(Debug)]
pub struct KeyedMutex {
    state: Mutex<KeyedState>,
    cv: Condvar,
}

#[derive(Debug)]
struct KeyedState {
    key: u64,
    held: bool,
}

impl KeyedMutex {
    pub fn new(initial_key: u64) -> Self {
        Self {
            state: Mutex::new(KeyedState {
                key: initial_key,
                held: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Acquire when the current key equals `key`, waiting up to `timeout`.
    pub fn acquire(&self, key: u64, timeout: Duration) -> Result<(), LtError> {
        let guard = self.state.lock().expect("keyed mutex poisoned");
        let (state, wait) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| s.held || s.key != key)
            .expect("keyed mutex poisoned");
        if wait.timed_out() {
            return Err(LtError::Timeout(timeout));
        }
        let mut state = state;
        state.held = true;
        Ok(())
    }

    /// Release the mutex, storing `key` for the next acquirer.
    pub fn release(&self, key: u64) {
        let mut state = self.state.lock().expect("keyed mutex poisoned");
        state.held = false;
        state.key = key;
        self.cv.notify_all();
    }

    /// Store `key` if nobody currently holds the mutex.
    ///
    /// Used when a slot is returned to the free list on a path where the
    /// read handoff never happened (skipped or failed frame), so the next
    /// writer does not wait on a reader that will never come.
    fn reset_if_idle(&self, key: u64) {
        let mut state = self.state.lock().expect("keyed mutex poisoned");
        if !state.held {
            state.key = key;
            self.cv.notify_all();
        }
    }
}

// ── FramePool ────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot {
    name: String,
    in_use: AtomicBool,
    sync: KeyedMutex,
    /// Pixel storage. Guarded by the keyed handoff; the inner mutex is
    /// only there to satisfy aliasing rules and is never contended.
    pixels: Mutex<Vec<u8>>,
}

/// The fixed ring of shareable slots.
pub struct FramePool {
    slots: Vec<Slot>,
    /// Frames dropped because every slot was busy.
    exhausted: AtomicU64,
}

impl FramePool {
    /// Create a pool of `capacity` slots with stable shareable names.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| Slot {
                name: format!("Global\\lanthing_shared_texture_{i}"),
                in_use: AtomicBool::new(false),
                sync: KeyedMutex::new(KEY_WRITE),
                pixels: Mutex::new(Vec::new()),
            })
            .collect();
        Self {
            slots,
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The stable name of slot `index`.
    pub fn slot_name(&self, index: u16) -> Option<&str> {
        self.slots.get(index as usize).map(|s| s.name.as_str())
    }

    /// Atomically claim the first free slot; `None` when all are busy.
    ///
    /// Lock-free: a compare-exchange scan over the `in_use` flags.
    pub fn acquire(&self) -> Option<u16> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(index as u16);
            }
        }
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Copy `src` into an acquired slot under the write key.
    ///
    /// A timeout here means the previous consumer still holds the slot;
    /// the caller should drop the frame and release the slot.
    pub fn copy_into(&self, index: u16, src: &[u8], timeout: Duration) -> Result<(), LtError> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or_else(|| LtError::UnknownSlot(format!("index {index}")))?;
        slot.sync.acquire(KEY_WRITE, timeout)?;
        {
            let mut pixels = slot.pixels.lock().expect("slot pixels poisoned");
            pixels.clear();
            pixels.extend_from_slice(src);
        }
        slot.sync.release(KEY_READ);
        Ok(())
    }

    /// Open a filled slot for reading by its shareable name.
    ///
    /// Blocks (up to `timeout`) until the writer has released with the
    /// read key. The guard releases back to the write key on drop; it
    /// does not clear `in_use`; the producer side does that via
    /// [`release`](Self::release) once the consumer has returned.
    pub fn open_for_read(&self, name: &str, timeout: Duration) -> Result<SlotReadGuard<'_>, LtError> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| LtError::UnknownSlot(name.to_string()))?;
        slot.sync.acquire(KEY_READ, timeout)?;
        Ok(SlotReadGuard { slot })
    }

    /// Return a slot to the free list by name.
    ///
    /// Releasing a name the pool never issued is a hard error (the
    /// original treats it as fatal; see DESIGN.md).
    pub fn release(&self, name: &str) -> Result<(), LtError> {
        match self.slots.iter().find(|s| s.name == name) {
            Some(slot) => {
                slot.sync.reset_if_idle(KEY_WRITE);
                slot.in_use.store(false, Ordering::Release);
                Ok(())
            }
            None => {
                error!("release of unknown pool slot '{name}'");
                Err(LtError::UnknownSlot(name.to_string()))
            }
        }
    }

    /// Number of slots currently claimed.
    pub fn in_use_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Acquire))
            .count()
    }

    /// Frames dropped because the pool was exhausted.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

// ── SlotReadGuard ────────────────────────────────────────────────

/// Read access to a filled slot; hands the slot back to the writer side
/// on drop.
#[derive(Debug)]
pub struct SlotReadGuard<'a> {
    slot: &'a Slot,
}

impl SlotReadGuard<'_> {
    /// Copy the slot contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.slot.pixels.lock().expect("slot pixels poisoned").clone()
    }

    /// Run `f` over the pixel bytes without copying.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let pixels = self.slot.pixels.lock().expect("slot pixels poisoned");
        f(&pixels)
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }
}

impl Drop for SlotReadGuard<'_> {
    fn drop(&mut self) {
        self.slot.sync.release(KEY_WRITE);
    }
}

// ── Tests ────────────────────────────────────────────────────────
