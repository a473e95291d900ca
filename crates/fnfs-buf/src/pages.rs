//! Backing page storage for cache buffers.

use crate::page_state::PageState;
use fnfs_error::Result;
use fnfs_types::{BlockNumber, FileId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Virtual-memory side of the cache.
///
/// The cache maps storage lazily the first time a buffer's bytes are
/// touched and unmaps it when the buffer is recycled or reclaimed. Validity
/// and dirtiness are reported back so the page layer can mirror them.
///
/// Implementations are called with the cache lock held and must not call
/// back into the cache.
pub trait PageProvider: Send + Sync {
    /// Storage for `len` bytes of `file` starting at `block`.
    fn map_pages(&self, file: FileId, block: BlockNumber, len: usize) -> Result<Vec<u8>>;

    /// Return storage obtained from [`Self::map_pages`].
    fn unmap_pages(&self, file: FileId, block: BlockNumber, pages: Vec<u8>);

    fn mark_valid(&self, _file: FileId, _block: BlockNumber, _pages: &PageState) {}

    fn mark_dirty(&self, _file: FileId, _block: BlockNumber, _pages: &PageState) {}

    /// Current size of `file` in bytes as known to the client.
    fn file_size(&self, file: FileId) -> u64;

    fn set_file_size(&self, file: FileId, size: u64);
}

/// Heap-backed pages with an in-memory file size table.
#[derive(Debug, Default)]
pub struct AnonymousPages {
    sizes: Mutex<HashMap<FileId, u64>>,
    mapped: AtomicUsize,
}

impl AnonymousPages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers currently holding mapped storage.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }
}

impl PageProvider for AnonymousPages {
    fn map_pages(&self, _file: FileId, _block: BlockNumber, len: usize) -> Result<Vec<u8>> {
        self.mapped.fetch_add(1, Ordering::Relaxed);
        Ok(vec![0_u8; len])
    }

    fn unmap_pages(&self, _file: FileId, _block: BlockNumber, _pages: Vec<u8>) {
        self.mapped.fetch_sub(1, Ordering::Relaxed);
    }

    fn file_size(&self, file: FileId) -> u64 {
        self.sizes.lock().get(&file).copied().unwrap_or(0)
    }

    fn set_file_size(&self, file: FileId, size: u64) {
        self.sizes.lock().insert(file, size);
    }
}
