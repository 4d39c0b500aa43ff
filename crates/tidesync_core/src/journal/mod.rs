//! Append-only framed journals.
//!
//! The entity store, the pending-change log and the schema catalog each
//! persist their state as a journal of CRC-protected frames over a
//! [`StorageBackend`]. Owners give frames their meaning through the frame
//! kind byte; the journal only guarantees framing, ordering and durability.
//!
//! ## Recovery
//!
//! On open the whole journal is replayed. A frame cut short at the end of the
//! file is a write interrupted by a crash: it was never acknowledged, so it is
//! truncated away. A bad magic, an unknown version or a CRC mismatch on a
//! complete frame is corruption and fails the open.

mod frame;

pub use frame::{compute_crc32, decode_frames, DecodedFrames, Frame, CRC_SIZE, HEADER_SIZE};

use crate::error::CoreResult;
use tidesync_storage::StorageBackend;
use tracing::{debug, info, warn};

/// A framed journal over a storage backend.
pub struct Journal {
    name: &'static str,
    magic: [u8; 4],
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
    /// Size of the last rewrite; compaction is reconsidered only once the
    /// journal has grown well past it.
    baseline: u64,
}

impl Journal {
    /// Wraps a backend. Nothing is read until [`Journal::replay`].
    pub fn new(
        name: &'static str,
        magic: [u8; 4],
        backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> Self {
        Self {
            name,
            magic,
            backend,
            sync_on_write,
            baseline: 0,
        }
    }

    /// Reads every frame, truncating a torn trailing frame.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a complete frame is invalid, or a
    /// storage error if the backend cannot be read or truncated.
    pub fn replay(&mut self) -> CoreResult<Vec<Frame>> {
        let data = self.backend.read_all()?;
        let decoded = decode_frames(&data, self.magic)?;

        if decoded.torn_bytes > 0 {
            warn!(
                journal = self.name,
                torn_bytes = decoded.torn_bytes,
                valid_len = decoded.valid_len,
                "truncating torn trailing frame"
            );
            self.backend.truncate(decoded.valid_len)?;
            self.backend.sync()?;
        }

        debug!(
            journal = self.name,
            frames = decoded.frames.len(),
            bytes = decoded.valid_len,
            "journal replayed"
        );
        Ok(decoded.frames)
    }

    /// Decodes the journal without repairing it.
    ///
    /// # Errors
    ///
    /// Same as [`Journal::replay`], minus truncation failures.
    pub fn scan(&self) -> CoreResult<DecodedFrames> {
        let data = self.backend.read_all()?;
        decode_frames(&data, self.magic)
    }

    /// Appends one frame and returns its offset.
    ///
    /// With `sync_on_write` the frame is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be written or flushed.
    pub fn append(&mut self, kind: u8, payload: Vec<u8>) -> CoreResult<u64> {
        let bytes = Frame::new(kind, payload).encode(self.magic)?;
        let size = self.backend.size()?;
        match self.write_frame(&bytes) {
            Ok(offset) => Ok(offset),
            Err(e) => {
                // A partial frame would sit in front of every later append.
                if let Err(cut) = self.backend.truncate(size) {
                    warn!(journal = self.name, error = %cut, "could not cut failed append");
                }
                Err(e)
            }
        }
    }

    fn write_frame(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        let offset = self.backend.append(bytes)?;
        if self.sync_on_write {
            self.backend.flush()?;
        }
        Ok(offset)
    }

    /// Atomically replaces the journal with `frames`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new image cannot be written; the old journal
    /// is left intact in that case.
    pub fn rewrite(&mut self, frames: &[Frame]) -> CoreResult<()> {
        let before = self.backend.size()?;
        let mut image = Vec::new();
        for frame in frames {
            image.extend(frame.encode(self.magic)?);
        }
        self.backend.replace(&image)?;
        self.baseline = image.len() as u64;
        info!(
            journal = self.name,
            before,
            after = image.len(),
            frames = frames.len(),
            "journal compacted"
        );
        Ok(())
    }

    /// Returns the current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Returns true if the journal is over `threshold` and at least twice as
    /// large as it was after the last rewrite. A zero threshold disables
    /// automatic compaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn wants_compaction(&self, threshold: u64) -> CoreResult<bool> {
        if threshold == 0 {
            return Ok(false);
        }
        let size = self.size()?;
        Ok(size > threshold && size > self.baseline.saturating_mul(2))
    }

    /// Records the size of a snapshot that was judged not worth writing, so
    /// the next attempt waits for more growth.
    pub fn defer_compaction(&mut self, snapshot_len: u64) {
        self.baseline = snapshot_len;
    }

    /// Journal name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("name", &self.name)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

/// Encoded size of a frame carrying `payload_len` bytes.
pub const fn framed_len(payload_len: usize) -> u64 {
    (HEADER_SIZE + payload_len + CRC_SIZE) as u64
}
