//! Read path and readahead.

use crate::codec::ReadArgs;
use crate::writeback::{WriteBackEngine, bytes_in_file, locate};
use crate::{bump, cx_checkpoint};
use fnfs_buf::{BufFlags, BufferHandle, BufferPin, GetFlags, PageState};
use fnfs_error::{NfsError, Result};
use fnfs_rpc::Reply;
use fnfs_types::{BlockNumber, Cx, FileId, PAGE_SIZE, pages_for, procs};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::trace;

/// Longest a readahead waits for a buffer before giving up on it.
const READAHEAD_WAIT: Duration = Duration::from_millis(10);

/// Byte ranges `[pos, pos + n)` of `[start, stop)` in `chunk`-sized pieces.
fn chunk_ranges(start: usize, stop: usize, chunk: usize) -> Vec<(usize, usize)> {
    (start..stop)
        .step_by(chunk)
        .map(|pos| (pos, chunk.min(stop - pos)))
        .collect()
}

fn read_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// A readahead buffer whose READs are in flight. The pin outlives the
/// handle so the block is not recycled before the last callback returns.
struct AsyncRead {
    handle: Option<BufferHandle>,
    remaining: usize,
    _pin: BufferPin,
}

impl Drop for AsyncRead {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.clear_flags(BufFlags::READ | BufFlags::ASYNC);
        }
    }
}

impl WriteBackEngine {
    /// Read up to `len` bytes of `file` at `offset`; shorter at end of
    /// file. Only pages not already valid in the cache go to the server.
    pub fn read(&self, cx: &Cx, file: FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let eof = self.file_size(file);
        if offset >= eof || len == 0 {
            return Ok(Vec::new());
        }
        let total = usize::try_from(eof - offset).map_or(len, |avail| avail.min(len));
        let cache = &self.shared.cache;
        let bs = cache.buffer_size();
        let mut out = Vec::with_capacity(total);
        let mut last_block = None;
        while out.len() < total {
            cx_checkpoint(cx)?;
            let (block, off) = locate(offset + out.len() as u64, bs);
            let n = (bs - off).min(total - out.len());
            let mut handle = cache.get(cx, file, block, bs, GetFlags::empty())?;
            let wanted = PageState::range_mask(off / PAGE_SIZE, (off + n).div_ceil(PAGE_SIZE));
            let missing = wanted & !handle.valid();
            if missing.is_any_set() {
                self.fill_pages(cx, &mut handle, &missing)?;
            }
            out.extend_from_slice(&handle.data()?[off..off + n]);
            handle.release(true);
            last_block = Some(block);
        }
        if let Some(block) = last_block {
            self.readahead(file, block, eof);
        }
        trace!(file = file.0, offset, len = out.len(), "read");
        Ok(out)
    }

    /// Read the pages of `want` into `handle` and mark them valid. Bytes
    /// past end of file read as zeros.
    pub(crate) fn fill_pages(&self, cx: &Cx, handle: &mut BufferHandle, want: &PageState) -> Result<()> {
        let file = handle.file();
        let base = handle.file_offset();
        let in_file = bytes_in_file(base, handle.size(), self.file_size(file));
        let cred = self.shared.creds.credential(Some(file));
        let runs: Vec<(usize, usize)> = want.runs(handle.pages()).collect();
        for (first, last) in runs {
            let start = first * PAGE_SIZE;
            let stop = (last * PAGE_SIZE).min(in_file).max(start);
            let ranges = chunk_ranges(start, stop, self.shared.config.read_size);
            let bodies: Vec<Vec<u8>> = ranges
                .iter()
                .map(|&(pos, n)| {
                    self.shared.codec.encode_read(&ReadArgs {
                        file,
                        offset: base + pos as u64,
                        count: read_count(n),
                    })
                })
                .collect();
            let replies = if bodies.is_empty() {
                Vec::new()
            } else {
                self.shared
                    .counters
                    .reads
                    .fetch_add(bodies.len() as u64, Ordering::Relaxed);
                self.call_all(cx, procs::READ, &cred, &bodies)?
            };
            let buf = handle.data_mut()?;
            buf[start..last * PAGE_SIZE].fill(0);
            for (&(pos, n), reply) in ranges.iter().zip(replies) {
                let result = self.shared.codec.decode_read(&reply?.body)?;
                let got = result.data.len().min(n);
                buf[pos..pos + got].copy_from_slice(&result.data[..got]);
            }
            handle.mark_valid(first, last);
        }
        Ok(())
    }

    /// Start asynchronous READs for up to `readahead` blocks after `after`
    /// that are inside the file and not cached.
    fn readahead(&self, file: FileId, after: BlockNumber, eof: u64) {
        let bs = self.shared.cache.buffer_size() as u64;
        for i in 1..=self.shared.config.readahead as u64 {
            let block = BlockNumber(after.0 + i);
            if block.0 * bs >= eof {
                break;
            }
            if self.shared.cache.incore(file, block).is_some() {
                continue;
            }
            if let Err(err) = self.start_readahead(file, block) {
                trace!(file = file.0, block = block.0, error = %err, "readahead skipped");
                break;
            }
        }
    }

    fn start_readahead(&self, file: FileId, block: BlockNumber) -> Result<()> {
        let cache = &self.shared.cache;
        let stats = cache.stats();
        if stats.buffers >= cache.config().max_buffers && stats.free_lru == 0 {
            return Err(NfsError::ResourceExhausted);
        }
        let cx = Cx::with_timeout(READAHEAD_WAIT);
        let mut handle = cache.get(&cx, file, block, cache.buffer_size(), GetFlags::NONBLOCK)?;
        let base = handle.file_offset();
        let in_file = bytes_in_file(base, handle.size(), self.file_size(file));
        let missing = PageState::range_mask(0, pages_for(in_file)) & !handle.valid();
        let (Some(first), Some(last)) = (missing.first_set(), missing.last_set()) else {
            return Ok(());
        };
        let start = first * PAGE_SIZE;
        let stop = ((last + 1) * PAGE_SIZE).min(in_file);
        let ranges = chunk_ranges(start, stop, self.shared.config.read_size);
        let cred = self.shared.creds.credential(Some(file));
        handle.set_flags(BufFlags::READ | BufFlags::ASYNC);
        // Only pages that are still invalid get overwritten on completion.
        let overwrite = missing;
        let pin = handle.pin();
        let pending = Arc::new(Mutex::new(AsyncRead {
            handle: Some(handle),
            remaining: ranges.len(),
            _pin: pin,
        }));
        bump(&self.shared.counters.readaheads);
        for (pos, n) in ranges {
            let body = self.shared.codec.encode_read(&ReadArgs {
                file,
                offset: base + pos as u64,
                count: read_count(n),
            });
            let engine = self.clone();
            let slot = Arc::clone(&pending);
            bump(&self.shared.counters.reads);
            let issued = self.shared.rpc.call_async(procs::READ, &cred, &body, move |result| {
                engine.readahead_done(&slot, &overwrite, pos, n, result);
            });
            if let Err(err) = issued {
                self.readahead_done(&pending, &overwrite, pos, n, Err(err));
            }
        }
        Ok(())
    }

    fn readahead_done(
        &self,
        pending: &Mutex<AsyncRead>,
        overwrite: &PageState,
        pos: usize,
        n: usize,
        result: Result<Reply>,
    ) {
        let mut state = pending.lock();
        state.remaining = state.remaining.saturating_sub(1);
        if let Some(handle) = state.handle.as_mut() {
            let filled = result.and_then(|reply| self.shared.codec.decode_read(&reply.body));
            match filled {
                Ok(read) => {
                    if let Err(err) = Self::copy_readahead(handle, overwrite, pos, n, &read.data) {
                        trace!(error = %err, "readahead buffer unavailable");
                    }
                }
                Err(err) => {
                    trace!(file = handle.file().0, block = handle.block().0, error = %err, "readahead failed");
                }
            }
        }
        if state.remaining == 0 {
            if let Some(mut handle) = state.handle.take() {
                handle.clear_flags(BufFlags::READ | BufFlags::ASYNC);
                drop(state);
                handle.release(false);
            }
        }
    }

    fn copy_readahead(
        handle: &mut BufferHandle,
        overwrite: &PageState,
        pos: usize,
        n: usize,
        data: &[u8],
    ) -> Result<()> {
        let last = (pos + n).div_ceil(PAGE_SIZE);
        let landed = *overwrite & PageState::range_mask(pos / PAGE_SIZE, last);
        let got = data.len().min(n);
        let buf = handle.data_mut()?;
        for (a, b) in landed.runs(last) {
            let (lo, hi) = (a * PAGE_SIZE, b * PAGE_SIZE);
            buf[lo..hi].fill(0);
            let (from, to) = (lo.max(pos), hi.min(pos + got));
            if from < to {
                buf[from..to].copy_from_slice(&data[from - pos..to - pos]);
            }
        }
        for (a, b) in landed.runs(last) {
            handle.mark_valid(a, b);
        }
        Ok(())
    }
}
