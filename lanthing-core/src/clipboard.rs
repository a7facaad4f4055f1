//! Clipboard transfer over the reliable channel.
//!
//! Clipboard text travels as a run of [`ClipboardChunk`]s tagged with
//! `chunk_index` / `chunk_count`, reassembled in order at the receiver.
//! The OS integration sits behind [`ClipboardSink`], the same seam the
//! audio module uses for device I/O: platform shells plug the real
//! clipboard in, and the in-tree [`MemoryClipboard`] serves headless
//! sessions and tests.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::message::ClipboardChunk;

/// Bytes per chunk; clipboard payloads stay far below the frame limit.
pub const CHUNK_SIZE: usize = 64 * 1024;

// ── Sink seam ────────────────────────────────────────────────────

/// Applies received clipboard content to the local environment.
pub trait ClipboardSink: Send {
    fn set_text(&mut self, text: &str);
}

/// In-memory sink: stores the last applied text behind a shared handle.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    contents: Arc<Mutex<Option<String>>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the stored text (for embedders and tests).
    pub fn handle(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.contents)
    }
}

impl ClipboardSink for MemoryClipboard {
    fn set_text(&mut self, text: &str) {
        *self.contents.lock().expect("clipboard poisoned") = Some(text.to_string());
    }
}

// ── Chunking ─────────────────────────────────────────────────────

/// Split clipboard bytes into wire chunks. Empty input still yields one
/// (empty) chunk so a cleared clipboard propagates.
pub fn to_chunks(data: &[u8]) -> Vec<ClipboardChunk> {
    let pieces: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(CHUNK_SIZE).collect()
    };
    let chunk_count = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| ClipboardChunk {
            chunk_index: index as u32,
            chunk_count,
            data: piece.to_vec(),
        })
        .collect()
}

// ── Reassembly ───────────────────────────────────────────────────

/// In-order reassembly of one clipboard transfer.
///
/// The reliable channel preserves order, so any gap or count mismatch
/// means interleaved or corrupt traffic; the partial transfer is dropped
/// and reassembly restarts at the next index-0 chunk.
#[derive(Debug, Default)]
pub struct ClipboardAssembler {
    buf: Vec<u8>,
    expected: u32,
    next_index: u32,
}

impl ClipboardAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the full payload when the last chunk of a
    /// transfer arrives.
    pub fn push(&mut self, chunk: ClipboardChunk) -> Option<Vec<u8>> {
        if chunk.chunk_count == 0 {
            warn!("discarding clipboard chunk with zero count");
            return None;
        }
        if chunk.chunk_index == 0 {
            self.buf.clear();
            self.expected = chunk.chunk_count;
            self.next_index = 0;
        } else if chunk.chunk_index != self.next_index || chunk.chunk_count != self.expected {
            warn!(
                "clipboard chunk {}/{} out of sequence (expected {}/{}), resetting",
                chunk.chunk_index, chunk.chunk_count, self.next_index, self.expected
            );
            self.buf.clear();
            self.expected = 0;
            self.next_index = 0;
            return None;
        }
        self.buf.extend_from_slice(&chunk.data);
        self.next_index += 1;
        if self.next_index == self.expected {
            self.expected = 0;
            self.next_index = 0;
            return Some(std::mem::take(&mut self.buf));
        }
        None
    }
}

// ── Tests ────────────────────────────────────────────────────────
