#![forbid(unsafe_code)]
//! Buffered file I/O over the NFS request engine.
//!
//! [`WriteBackEngine`] moves data between the buffer cache and the server:
//! it fills invalid pages with READs (plus readahead), defers writes as
//! delayed-write buffers, writes them back unstable or stable, commits
//! unstable data and recovers from write-verifier changes by rewriting
//! stable. A [`FlusherHandle`] drives delayed writes out in the background.

pub mod codec;
mod flusher;
mod read;
mod writeback;

pub use codec::{
    CommitArgs, CommitResult, NfsCodec, ReadArgs, ReadResult, WireCodec, WriteArgs, WriteResult,
};
pub use flusher::FlusherHandle;
pub use writeback::{FlushMode, InvalidateMode, WriteBackEngine};

use fnfs_error::{NfsError, Result};
use fnfs_types::{Cx, FileId, MAX_BUFFER_SIZE, PAGE_SIZE, WriteVerifier};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(NfsError::from)
}

/// Sizing and pacing of buffered I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBackConfig {
    /// Largest READ payload.
    pub read_size: usize,
    /// Largest WRITE payload; bigger dirty ranges go out as several RPCs.
    pub write_size: usize,
    /// Blocks prefetched after each read.
    pub readahead: usize,
    /// Delayed-write buffers allowed before writers are made to write
    /// synchronously.
    pub max_delayed_writes: usize,
    pub flush_period: Duration,
    pub flush_batch: usize,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            read_size: 32 * 1024,
            write_size: 32 * 1024,
            readahead: 1,
            max_delayed_writes: 256,
            flush_period: Duration::from_secs(1),
            flush_batch: 16,
        }
    }
}

impl WriteBackConfig {
    #[must_use]
    pub fn with_io_sizes(mut self, read_size: usize, write_size: usize) -> Self {
        self.read_size = read_size;
        self.write_size = write_size;
        self
    }

    #[must_use]
    pub fn with_readahead(mut self, blocks: usize) -> Self {
        self.readahead = blocks;
        self
    }

    #[must_use]
    pub fn with_max_delayed_writes(mut self, max: usize) -> Self {
        self.max_delayed_writes = max;
        self
    }

    #[must_use]
    pub fn with_flusher(mut self, period: Duration, batch: usize) -> Self {
        self.flush_period = period;
        self.flush_batch = batch;
        self
    }

    /// Check the sizes against the cache's buffer size.
    pub fn validate(&self, buffer_size: usize) -> Result<()> {
        for (name, size) in [("read_size", self.read_size), ("write_size", self.write_size)] {
            if size == 0 || size % PAGE_SIZE != 0 || size > buffer_size.min(MAX_BUFFER_SIZE) {
                return Err(NfsError::InvalidConfig(format!(
                    "{name} {size} must be a non-zero multiple of {PAGE_SIZE} \
                     no larger than the buffer size {buffer_size}"
                )));
            }
        }
        if self.max_delayed_writes == 0 {
            return Err(NfsError::InvalidConfig(
                "max_delayed_writes must be at least 1".to_owned(),
            ));
        }
        if self.flush_period.is_zero() || self.flush_batch == 0 {
            return Err(NfsError::InvalidConfig(
                "flusher period and batch must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Counters of the I/O issued by a [`WriteBackEngine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBackStats {
    pub reads: u64,
    pub readaheads: u64,
    pub writes: u64,
    pub unstable_writes: u64,
    pub commits: u64,
    /// Buffers rewritten stable after a verifier change.
    pub stale_rewrites: u64,
    /// Writes forced synchronous by the delayed-write high-water mark.
    pub pressure_writes: u64,
    pub write_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    readaheads: AtomicU64,
    writes: AtomicU64,
    unstable_writes: AtomicU64,
    commits: AtomicU64,
    stale_rewrites: AtomicU64,
    pressure_writes: AtomicU64,
    write_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WriteBackStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WriteBackStats {
            reads: get(&self.reads),
            readaheads: get(&self.readaheads),
            writes: get(&self.writes),
            unstable_writes: get(&self.unstable_writes),
            commits: get(&self.commits),
            stale_rewrites: get(&self.stale_rewrites),
            pressure_writes: get(&self.pressure_writes),
            write_errors: get(&self.write_errors),
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Last write verifier the server returned, and how many times it changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct VerifierState {
    current: Option<WriteVerifier>,
    epoch: u64,
}

impl VerifierState {
    /// Record a verifier seen in a reply; returns the epoch it belongs to.
    fn observe(&mut self, verifier: WriteVerifier) -> u64 {
        match self.current {
            Some(current) if current != verifier => {
                self.current = Some(verifier);
                self.epoch += 1;
            }
            Some(_) => {}
            None => self.current = Some(verifier),
        }
        self.epoch
    }
}

/// Asynchronous writes still outstanding, per file.
#[derive(Debug, Default)]
struct InFlight {
    files: Mutex<HashMap<FileId, usize>>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self, file: FileId) {
        *self.files.lock().entry(file).or_insert(0) += 1;
    }

    fn end(&self, file: FileId) {
        let mut files = self.files.lock();
        if let Some(count) = files.get_mut(&file) {
            *count -= 1;
            if *count == 0 {
                files.remove(&file);
            }
        }
        drop(files);
        self.idle.notify_all();
    }

    fn count(&self, file: FileId) -> usize {
        self.files.lock().get(&file).copied().unwrap_or(0)
    }

    fn wait_idle(&self, cx: &Cx, file: FileId) -> Result<()> {
        let mut files = self.files.lock();
        while files.contains_key(&file) {
            cx_checkpoint(cx)?;
            let _ = self
                .idle
                .wait_for(&mut files, cx.bounded_wait(fnfs_types::wait::WAIT_SLICE));
        }
        Ok(())
    }
}
