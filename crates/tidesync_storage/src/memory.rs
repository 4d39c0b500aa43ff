//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Shared {
    data: Vec<u8>,
    fail_writes: bool,
}

/// An in-memory storage backend.
///
/// Clones share the same buffer. Tests use this to "restart" an engine over
/// the bytes a previous instance wrote: drop the engine, keep a clone of the
/// backend, and open again.
///
/// # Example
///
/// ```rust
/// use tidesync_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let survivor = backend.clone();
/// backend.append(b"entry").unwrap();
/// assert_eq!(survivor.size().unwrap(), 5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    shared: Arc<RwLock<Shared>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            shared: Arc::new(RwLock::new(Shared {
                data,
                fail_writes: false,
            })),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.shared.read().data.clone()
    }

    /// Makes every subsequent write fail with [`StorageError::Unavailable`].
    ///
    /// Simulates a full or detached device. Reads keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.write().fail_writes = fail;
    }

    /// Overwrites a single byte in place.
    ///
    /// Only meant for corruption tests; journals never modify written bytes.
    pub fn corrupt_byte(&self, offset: usize, value: u8) {
        let mut shared = self.shared.write();
        if let Some(byte) = shared.data.get_mut(offset) {
            *byte = value;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let shared = self.shared.read();
        let size = shared.data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > shared.data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(shared.data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut shared = self.shared.write();
        if shared.fail_writes {
            return Err(StorageError::Unavailable);
        }
        let offset = shared.data.len() as u64;
        shared.data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.shared.read().data.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut shared = self.shared.write();
        if shared.fail_writes {
            return Err(StorageError::Unavailable);
        }
        let current_size = shared.data.len() as u64;
        if new_size > current_size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to size {new_size} which is greater than current size {current_size}"),
            )));
        }
        shared.data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let mut shared = self.shared.write();
        if shared.fail_writes {
            return Err(StorageError::Unavailable);
        }
        shared.data = data.to_vec();
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn appended_chunks_read_back_at_their_offsets(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16)
        ) {
            let mut backend = InMemoryBackend::new();
            let offsets: Vec<u64> = chunks
                .iter()
                .map(|chunk| backend.append(chunk).unwrap())
                .collect();

            for (chunk, offset) in chunks.iter().zip(offsets) {
                prop_assert_eq!(&backend.read_at(offset, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
