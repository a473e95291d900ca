//! Delayed writes, write-back and commit.
//!
//! A dirty buffer moves `clean -> delayed -> written (unstable) -> committed`.
//! Unstable data keeps its byte dirty range as the commit range and stays on
//! the delayed list until a COMMIT answered with the verifier it was written
//! under clears it. Any verifier change in between makes the data stale and
//! it is written again, stable.

use crate::codec::{CommitArgs, NfsCodec, WriteArgs, WriteResult};
use crate::{
    Counters, InFlight, VerifierState, WriteBackConfig, WriteBackStats, bump, cx_checkpoint,
};
use crossbeam_channel::RecvTimeoutError;
use fnfs_buf::{BufFlags, BufferCache, BufferHandle, GetFlags, PageState};
use fnfs_error::{NfsError, Result};
use fnfs_rpc::{Reply, RequestEngine, RequestHandle};
use fnfs_types::wait::WAIT_SLICE;
use fnfs_types::{
    BlockNumber, Credential, CredentialProvider, Cx, FileId, PAGE_SIZE, ProcNumber, StableHow,
    pages_for, procs,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Consecutive verifier disagreements tolerated while flushing one buffer.
const MAX_REWRITES: u32 = 4;

/// How far [`WriteBackEngine::flush_all`] goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Start asynchronous writes and return.
    NoWait,
    /// Return once every dirty buffer is written and committed.
    Wait,
}

/// What [`WriteBackEngine::invalidate_all`] does with dirty data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
    /// Write everything back first.
    Flush,
    /// Drop dirty data unwritten.
    Discard,
}

pub(crate) struct Shared {
    pub(crate) cache: BufferCache,
    pub(crate) rpc: Arc<RequestEngine>,
    pub(crate) codec: Arc<dyn NfsCodec>,
    pub(crate) creds: Arc<dyn CredentialProvider>,
    pub(crate) config: WriteBackConfig,
    verifier: Mutex<VerifierState>,
    /// First unreported write error per file.
    errors: Mutex<HashMap<FileId, NfsError>>,
    inflight: InFlight,
    pub(crate) counters: Counters,
}

/// Moves file data between the buffer cache and the server.
#[derive(Clone)]
pub struct WriteBackEngine {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for WriteBackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBackEngine")
            .field("config", &self.shared.config)
            .field("verifier", &*self.shared.verifier.lock())
            .finish_non_exhaustive()
    }
}

/// One contiguous run of dirty pages to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WritePlan {
    pub first: usize,
    pub last: usize,
    /// Bytes from the start of `first`, clipped to end of file.
    pub len: usize,
    pub stable: StableHow,
}

impl WritePlan {
    fn offset(&self) -> usize {
        self.first * PAGE_SIZE
    }
}

/// Pick the first dirty run. The write is stable when the caller demands
/// it or when dirty pages remain outside the run.
pub(crate) fn plan_write(dirty: &PageState, in_file: usize, force_stable: bool) -> Option<WritePlan> {
    let mut runs = dirty.runs(pages_for(in_file));
    let (first, last) = runs.next()?;
    let more = runs.next().is_some();
    let len = (last * PAGE_SIZE).min(in_file) - first * PAGE_SIZE;
    let stable = if force_stable || more {
        StableHow::FileSync
    } else {
        StableHow::Unstable
    };
    Some(WritePlan {
        first,
        last,
        len,
        stable,
    })
}

/// Combined result of the chunks of one write.
#[derive(Debug)]
pub(crate) enum WriteOutcome {
    Written {
        committed: StableHow,
        verifier: fnfs_types::WriteVerifier,
    },
    /// Chunks were answered under different verifiers.
    Disagreed,
    Failed(NfsError),
}

/// The weakest commit level wins; any verifier disagreement wins over that.
pub(crate) fn fold_writes<I>(results: I) -> WriteOutcome
where
    I: IntoIterator<Item = Result<WriteResult>>,
{
    let mut committed = StableHow::FileSync;
    let mut verifier = None;
    let mut disagreed = false;
    for result in results {
        let written = match result {
            Ok(written) => written,
            Err(err) => return WriteOutcome::Failed(err),
        };
        committed = committed.min(written.committed);
        match verifier {
            None => verifier = Some(written.verifier),
            Some(v) if v != written.verifier => disagreed = true,
            Some(_) => {}
        }
    }
    match verifier {
        _ if disagreed => WriteOutcome::Disagreed,
        Some(verifier) => WriteOutcome::Written {
            committed,
            verifier,
        },
        None => WriteOutcome::Failed(NfsError::Protocol("write produced no replies".to_owned())),
    }
}

/// Errors after which the data is still worth writing.
fn leaves_dirty(err: &NfsError) -> bool {
    err.is_transient()
        || matches!(
            err,
            NfsError::Interrupted | NfsError::Abandoned | NfsError::Shutdown
        )
}

/// Split a position into its block and offset within the block.
#[expect(clippy::cast_possible_truncation)]
pub(crate) fn locate(pos: u64, buffer_size: usize) -> (BlockNumber, usize) {
    let bs = buffer_size as u64;
    (BlockNumber(pos / bs), (pos % bs) as usize)
}

/// Bytes of the buffer at `file_offset` that lie inside a file of `eof` bytes.
#[expect(clippy::cast_possible_truncation)]
pub(crate) fn bytes_in_file(file_offset: u64, size: usize, eof: u64) -> usize {
    eof.saturating_sub(file_offset).min(size as u64) as usize
}

enum Applied {
    Written,
    Stale,
}

/// Handle of a buffer whose chunks are in flight, shared by the callbacks.
struct AsyncWrite {
    shared: Arc<Shared>,
    file: FileId,
    plan: WritePlan,
    handle: Option<BufferHandle>,
    results: Vec<Result<Reply>>,
    remaining: usize,
}

impl Drop for AsyncWrite {
    fn drop(&mut self) {
        drop(self.handle.take());
        self.shared.inflight.end(self.file);
    }
}

impl WriteBackEngine {
    pub fn new(
        cache: BufferCache,
        rpc: Arc<RequestEngine>,
        codec: Arc<dyn NfsCodec>,
        creds: Arc<dyn CredentialProvider>,
        config: WriteBackConfig,
    ) -> Result<Self> {
        config.validate(cache.buffer_size())?;
        Ok(Self {
            shared: Arc::new(Shared {
                cache,
                rpc,
                codec,
                creds,
                config,
                verifier: Mutex::new(VerifierState::default()),
                errors: Mutex::new(HashMap::new()),
                inflight: InFlight::default(),
                counters: Counters::default(),
            }),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &BufferCache {
        &self.shared.cache
    }

    #[must_use]
    pub fn rpc(&self) -> &Arc<RequestEngine> {
        &self.shared.rpc
    }

    #[must_use]
    pub fn config(&self) -> &WriteBackConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn stats(&self) -> WriteBackStats {
        self.shared.counters.snapshot()
    }

    /// Asynchronous writes of `file` still outstanding.
    #[must_use]
    pub fn writes_in_flight(&self, file: FileId) -> usize {
        self.shared.inflight.count(file)
    }

    /// Take the first write error recorded against `file`.
    pub fn take_error(&self, file: FileId) -> Option<NfsError> {
        self.shared.errors.lock().remove(&file)
    }

    pub(crate) fn file_size(&self, file: FileId) -> u64 {
        self.shared.cache.provider().file_size(file)
    }

    fn credential_for(&self, handle: &BufferHandle) -> Credential {
        handle
            .credential()
            .cloned()
            .unwrap_or_else(|| self.shared.creds.credential(Some(handle.file())))
    }

    /// Copy `data` into the file at `offset` through the cache.
    ///
    /// Buffers are left as delayed writes unless `sync` is set or too many
    /// delayed writes are pending, in which case they are written before
    /// returning (stable and committed when `sync`).
    pub fn write(&self, cx: &Cx, file: FileId, offset: u64, data: &[u8], sync: bool) -> Result<usize> {
        let bs = self.shared.cache.buffer_size();
        let mut done = 0;
        while done < data.len() {
            cx_checkpoint(cx)?;
            let (block, off) = locate(offset + done as u64, bs);
            let n = (bs - off).min(data.len() - done);
            let mut handle = self.shared.cache.get(cx, file, block, bs, GetFlags::empty())?;
            self.write_into(cx, &mut handle, off, &data[done..done + n])?;
            let pressured = self.mark_delayed(&mut handle);
            if pressured {
                bump(&self.shared.counters.pressure_writes);
                debug!(file = file.0, block = block.0, "delayed-write high-water mark reached");
            }
            if sync || pressured {
                self.flush_dirty(cx, &mut handle, sync)?;
                if sync {
                    self.commit(cx, &mut handle)?;
                }
            }
            handle.release(true);
            done += n;
        }
        trace!(file = file.0, offset, len = done, sync, "write");
        Ok(done)
    }

    fn write_into(&self, cx: &Cx, handle: &mut BufferHandle, off: usize, bytes: &[u8]) -> Result<()> {
        let end = off + bytes.len();
        self.check_stale(handle);
        if let Some((dirty_off, dirty_end)) = handle.dirty_range() {
            if end < dirty_off || off > dirty_end {
                // The dirty span must stay contiguous.
                self.flush_dirty(cx, handle, true)?;
                self.commit(cx, handle)?;
            }
        }

        let file = handle.file();
        let eof = self.file_size(file);
        let in_file = bytes_in_file(handle.file_offset(), handle.size(), eof);
        let first = off / PAGE_SIZE;
        let last = end.div_ceil(PAGE_SIZE);
        let valid = handle.valid();
        let mut fill = PageState::empty();
        for (page, partial) in [(first, off % PAGE_SIZE != 0), (last - 1, end % PAGE_SIZE != 0)] {
            if partial && !valid.is_set(page) && page * PAGE_SIZE < in_file {
                fill.set_mask(page);
            }
        }
        if fill.is_any_set() {
            self.fill_pages(cx, handle, &fill)?;
        }

        let valid = handle.valid();
        let buf = handle.data_mut()?;
        for page in first..last {
            if !valid.is_set(page) {
                buf[page * PAGE_SIZE..(page + 1) * PAGE_SIZE].fill(0);
            }
        }
        buf[off..end].copy_from_slice(bytes);
        handle.mark_valid(first, last);
        handle.mark_pages_dirty(first, last);
        handle.extend_dirty_range(off, end);
        if handle.credential().is_none() {
            handle.set_credential(self.shared.creds.credential(Some(file)));
        }

        let new_end = handle.file_offset() + end as u64;
        if new_end > eof {
            self.shared.cache.provider().set_file_size(file, new_end);
        }
        Ok(())
    }

    /// Flag `handle` as a delayed write. Returns true when the caller must
    /// write it now because the high-water mark was crossed.
    fn mark_delayed(&self, handle: &mut BufferHandle) -> bool {
        handle.mark_delayed_write()
            && self.shared.cache.delayed_write_count() > self.shared.config.max_delayed_writes
    }

    /// Record bytes `[off, end)` of `handle`, already filled in by the
    /// caller, as modified. Pages touched must hold valid data.
    pub fn mark_dirty(&self, cx: &Cx, handle: &mut BufferHandle, off: usize, end: usize) -> Result<()> {
        let end = end.min(handle.size());
        if off >= end {
            return Ok(());
        }
        self.check_stale(handle);
        handle.mark_pages_dirty(off / PAGE_SIZE, end.div_ceil(PAGE_SIZE));
        handle.extend_dirty_range(off, end);
        if handle.credential().is_none() {
            handle.set_credential(self.shared.creds.credential(Some(handle.file())));
        }
        if self.mark_delayed(handle) {
            bump(&self.shared.counters.pressure_writes);
            self.flush_dirty(cx, handle, false)?;
        }
        Ok(())
    }

    /// Work out the next run to write, dropping dirty pages past end of file.
    fn plan(&self, handle: &mut BufferHandle, stable: bool) -> Option<WritePlan> {
        let eof = self.file_size(handle.file());
        let in_file = bytes_in_file(handle.file_offset(), handle.size(), eof);
        handle.clear_dirty_pages(pages_for(in_file), handle.pages());
        let force = stable || handle.flags().contains(BufFlags::STABLE);
        let plan = plan_write(&handle.dirty(), in_file, force);
        if plan.is_none() && !handle.flags().contains(BufFlags::NEEDS_COMMIT) {
            handle.mark_clean();
        }
        plan
    }

    fn encode_chunks(&self, handle: &mut BufferHandle, plan: &WritePlan) -> Result<Vec<Vec<u8>>> {
        let file = handle.file();
        let base = handle.file_offset() + plan.offset() as u64;
        let chunk = self.shared.config.write_size;
        let data = handle.data()?;
        Ok(data[plan.offset()..plan.offset() + plan.len]
            .chunks(chunk)
            .enumerate()
            .map(|(i, bytes)| {
                self.shared.codec.encode_write(&WriteArgs {
                    file,
                    offset: base + (i * chunk) as u64,
                    stable: plan.stable,
                    data: bytes,
                })
            })
            .collect())
    }

    fn decode_writes(&self, replies: Vec<Result<Reply>>) -> WriteOutcome {
        fold_writes(
            replies
                .into_iter()
                .map(|r| r.and_then(|reply| self.shared.codec.decode_write(&reply.body))),
        )
    }

    /// Write every dirty page of `handle` synchronously, stable when
    /// `stable` is set. Unstable data is left needing a commit.
    pub fn flush_dirty(&self, cx: &Cx, handle: &mut BufferHandle, stable: bool) -> Result<()> {
        self.check_stale(handle);
        let mut rewrites = 0;
        loop {
            cx_checkpoint(cx)?;
            let Some(plan) = self.plan(handle, stable) else {
                return Ok(());
            };
            let cred = self.credential_for(handle);
            let bodies = self.encode_chunks(handle, &plan)?;
            if bodies.len() > 1 {
                handle.set_flags(BufFlags::MULTI_RPC);
            }
            let outcome = match self.call_all(cx, procs::WRITE, &cred, &bodies) {
                Ok(replies) => self.decode_writes(replies),
                Err(err) => WriteOutcome::Failed(err),
            };
            handle.clear_flags(BufFlags::MULTI_RPC);
            if let Applied::Stale = self.apply_write(handle, &plan, outcome)? {
                rewrites += 1;
                if rewrites > MAX_REWRITES {
                    let err = NfsError::Protocol("server write verifier keeps changing".to_owned());
                    self.fail_buffer(handle, err.duplicate());
                    return Err(err);
                }
            }
        }
    }

    /// Write the first dirty run of `handle` without waiting; the buffer
    /// stays busy until the last chunk is answered.
    pub(crate) fn write_async(&self, mut handle: BufferHandle) -> Result<()> {
        self.check_stale(&mut handle);
        let Some(plan) = self.plan(&mut handle, false) else {
            return Ok(());
        };
        let cred = self.credential_for(&handle);
        let bodies = self.encode_chunks(&mut handle, &plan)?;
        if bodies.len() > 1 {
            handle.set_flags(BufFlags::MULTI_RPC);
        }
        handle.set_flags(BufFlags::ASYNC);
        let file = handle.file();
        trace!(file = file.0, block = handle.block().0, chunks = bodies.len(), "async write");
        self.shared.inflight.begin(file);
        let pending = Arc::new(Mutex::new(AsyncWrite {
            shared: Arc::clone(&self.shared),
            file,
            plan,
            handle: Some(handle),
            results: Vec::with_capacity(bodies.len()),
            remaining: bodies.len(),
        }));
        for body in bodies {
            let engine = self.clone();
            let slot = Arc::clone(&pending);
            let issued = self.shared.rpc.call_async(procs::WRITE, &cred, &body, move |result| {
                engine.chunk_done(&slot, result);
            });
            if let Err(err) = issued {
                self.chunk_done(&pending, Err(err));
            }
        }
        Ok(())
    }

    fn chunk_done(&self, pending: &Mutex<AsyncWrite>, result: Result<Reply>) {
        let mut state = pending.lock();
        state.results.push(result);
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining > 0 {
            return;
        }
        let Some(mut handle) = state.handle.take() else {
            return;
        };
        let replies = std::mem::take(&mut state.results);
        let plan = state.plan;
        drop(state);
        handle.clear_flags(BufFlags::ASYNC | BufFlags::MULTI_RPC);
        let outcome = self.decode_writes(replies);
        if let Err(err) = self.apply_write(&mut handle, &plan, outcome) {
            debug!(file = handle.file().0, block = handle.block().0, error = %err, "async write did not complete");
        }
        handle.release(false);
    }

    fn apply_write(&self, handle: &mut BufferHandle, plan: &WritePlan, outcome: WriteOutcome) -> Result<Applied> {
        let counters = &self.shared.counters;
        match outcome {
            WriteOutcome::Failed(err) if leaves_dirty(&err) => Err(err),
            WriteOutcome::Failed(err) => {
                self.fail_buffer(handle, err.duplicate());
                Err(err)
            }
            WriteOutcome::Disagreed => {
                self.restale(handle);
                Ok(Applied::Stale)
            }
            WriteOutcome::Written {
                committed,
                verifier,
            } => {
                bump(&counters.writes);
                handle.clear_dirty_pages(plan.first, plan.last);
                let epoch = self.shared.verifier.lock().observe(verifier);
                if let Some((earlier, _)) = handle.verifier() {
                    if earlier != verifier {
                        // Uncommitted data from before the change is gone.
                        self.restale(handle);
                        return Ok(Applied::Stale);
                    }
                }
                if !committed.is_stable() {
                    bump(&counters.unstable_writes);
                    handle.set_flags(BufFlags::NEEDS_COMMIT);
                    handle.set_verifier(verifier, epoch);
                }
                if !handle.dirty().is_any_set() {
                    if handle.flags().contains(BufFlags::NEEDS_COMMIT) {
                        handle.clear_flags(BufFlags::STABLE | BufFlags::STALE_WVERF);
                    } else {
                        handle.mark_clean();
                    }
                }
                trace!(
                    file = handle.file().0,
                    block = handle.block().0,
                    pages = plan.last - plan.first,
                    ?committed,
                    "write done"
                );
                Ok(Applied::Written)
            }
        }
    }

    fn fail_buffer(&self, handle: &mut BufferHandle, err: NfsError) {
        warn!(file = handle.file().0, block = handle.block().0, error = %err, "write failed, dropping dirty data");
        bump(&self.shared.counters.write_errors);
        handle.mark_clean();
        handle.set_error(err.duplicate());
        self.shared.errors.lock().entry(handle.file()).or_insert(err);
    }

    /// Put everything in the dirty span back on the dirty page map for a
    /// stable rewrite.
    fn redirty(handle: &mut BufferHandle) {
        if let Some((off, end)) = handle.dirty_range() {
            let span = PageState::range_mask(off / PAGE_SIZE, end.div_ceil(PAGE_SIZE));
            let rewrite = span & handle.valid();
            for (first, last) in rewrite.runs(handle.pages()) {
                handle.mark_pages_dirty(first, last);
            }
        }
        handle.clear_flags(BufFlags::NEEDS_COMMIT);
        handle.clear_verifier();
        handle.set_flags(BufFlags::STABLE);
    }

    fn restale(&self, handle: &mut BufferHandle) {
        Self::redirty(handle);
        handle.set_flags(BufFlags::STALE_WVERF);
        bump(&self.shared.counters.stale_rewrites);
        debug!(
            file = handle.file().0,
            block = handle.block().0,
            "write verifier changed, rewriting stable"
        );
    }

    /// Mark `handle` stale if its unstable data predates the current
    /// verifier epoch.
    fn check_stale(&self, handle: &mut BufferHandle) -> bool {
        if !handle.flags().contains(BufFlags::NEEDS_COMMIT) {
            return false;
        }
        let current = self.shared.verifier.lock().epoch;
        match handle.verifier() {
            Some((_, epoch)) if epoch == current => false,
            _ => {
                self.restale(handle);
                true
            }
        }
    }

    /// Commit the unstable data of `handle`. If the server's verifier no
    /// longer matches, the data is rewritten stable instead.
    pub fn commit(&self, cx: &Cx, handle: &mut BufferHandle) -> Result<()> {
        if !handle.flags().contains(BufFlags::NEEDS_COMMIT) {
            return Ok(());
        }
        if !self.check_stale(handle) {
            let file = handle.file();
            match self.commit_handles(cx, file, &mut [&mut *handle]) {
                Ok(()) => {}
                Err(err) if leaves_dirty(&err) => return Err(err),
                Err(err) => {
                    warn!(file = file.0, error = %err, "commit failed, rewriting stable");
                    Self::redirty(handle);
                }
            }
        }
        if handle.flags().contains(BufFlags::STABLE) {
            self.flush_dirty(cx, handle, true)?;
        }
        Ok(())
    }

    /// One COMMIT covering the dirty spans of `handles`. Buffers whose
    /// verifier matches the reply become clean; the rest go stale.
    fn commit_handles(&self, cx: &Cx, file: FileId, handles: &mut [&mut BufferHandle]) -> Result<()> {
        let mut lo = u64::MAX;
        let mut hi = 0_u64;
        for handle in handles.iter() {
            if let Some((off, end)) = handle.dirty_range() {
                lo = lo.min(handle.file_offset() + off as u64);
                hi = hi.max(handle.file_offset() + end as u64);
            }
        }
        if lo >= hi {
            return Ok(());
        }
        // Zero asks the server to commit to end of file.
        let count = u32::try_from(hi - lo).unwrap_or(0);
        let cred = self.shared.creds.credential(Some(file));
        let body = self.shared.codec.encode_commit(&CommitArgs {
            file,
            offset: lo,
            count,
        });
        bump(&self.shared.counters.commits);
        let reply = self.shared.rpc.call(cx, procs::COMMIT, &cred, &body)?;
        let verifier = self.shared.codec.decode_commit(&reply.body)?.verifier;
        let _epoch = self.shared.verifier.lock().observe(verifier);
        for handle in handles.iter_mut() {
            if !handle.flags().contains(BufFlags::NEEDS_COMMIT) {
                continue;
            }
            match handle.verifier() {
                Some((written, _)) if written == verifier => Self::committed(handle),
                _ => self.restale(handle),
            }
        }
        debug!(file = file.0, offset = lo, count, buffers = handles.len(), "committed");
        Ok(())
    }

    fn committed(handle: &mut BufferHandle) {
        handle.clear_flags(BufFlags::NEEDS_COMMIT | BufFlags::STALE_WVERF | BufFlags::STABLE);
        handle.clear_verifier();
        let dirty = handle.dirty();
        match (dirty.first_set(), dirty.last_set()) {
            (Some(first), Some(last)) => {
                handle.set_dirty_range(first * PAGE_SIZE, (last + 1) * PAGE_SIZE);
            }
            _ => handle.mark_clean(),
        }
    }

    /// Write back every dirty buffer of `file`.
    ///
    /// First pass: asynchronous writes for all dirty buffers. With
    /// [`FlushMode::Wait`], waits for them, commits what went out unstable
    /// in one COMMIT, then rewrites anything still dirty synchronously and
    /// stable. Returns (and clears) the first write error recorded against
    /// the file.
    pub fn flush_all(&self, cx: &Cx, file: FileId, mode: FlushMode) -> Result<()> {
        let cache = &self.shared.cache;
        for block in cache.dirty_blocks(file) {
            cx_checkpoint(cx)?;
            let handle = match cache.get_if_cached(cx, file, block, GetFlags::NONBLOCK) {
                Ok(Some(handle)) => handle,
                Ok(None) | Err(NfsError::WouldBlock) => continue,
                Err(err) => return Err(err),
            };
            if handle.dirty().is_any_set() {
                self.write_async(handle)?;
            }
        }
        if mode == FlushMode::NoWait {
            return Ok(());
        }
        self.shared.inflight.wait_idle(cx, file)?;

        let mut unstable = Vec::new();
        for block in cache.dirty_blocks(file) {
            cx_checkpoint(cx)?;
            let Some(mut handle) = cache.get_if_cached(cx, file, block, GetFlags::empty())? else {
                continue;
            };
            self.check_stale(&mut handle);
            if handle.flags().contains(BufFlags::NEEDS_COMMIT) {
                unstable.push(handle);
            }
        }
        if !unstable.is_empty() {
            let mut refs: Vec<&mut BufferHandle> = unstable.iter_mut().collect();
            if let Err(err) = self.commit_handles(cx, file, &mut refs) {
                if leaves_dirty(&err) {
                    return Err(err);
                }
                warn!(file = file.0, error = %err, "commit failed, rewriting stable");
                for handle in &mut refs {
                    Self::redirty(handle);
                }
            }
            drop(refs);
            drop(unstable);
        }

        for block in cache.dirty_blocks(file) {
            cx_checkpoint(cx)?;
            let Some(mut handle) = cache.get_if_cached(cx, file, block, GetFlags::empty())? else {
                continue;
            };
            if handle.flags().contains(BufFlags::NEEDS_COMMIT) {
                Self::redirty(&mut handle);
            }
            if let Err(err) = self.flush_dirty(cx, &mut handle, true) {
                if leaves_dirty(&err) {
                    return Err(err);
                }
                break;
            }
        }
        match self.take_error(file) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop every cached buffer of `file`, writing dirty data back first
    /// unless told to discard it.
    pub fn invalidate_all(&self, cx: &Cx, file: FileId, mode: InvalidateMode) -> Result<()> {
        match mode {
            InvalidateMode::Flush => {
                self.flush_all(cx, file, FlushMode::Wait)?;
                self.shared.cache.invalidate_file(cx, file, false)
            }
            InvalidateMode::Discard => {
                self.shared.errors.lock().remove(&file);
                self.shared.cache.invalidate_file(cx, file, true)
            }
        }
    }

    /// Issue one call per body concurrently and collect the replies in
    /// order. Cancelling `cx` abandons whatever is still outstanding.
    pub(crate) fn call_all(
        &self,
        cx: &Cx,
        proc: ProcNumber,
        cred: &Credential,
        bodies: &[Vec<u8>],
    ) -> Result<Vec<Result<Reply>>> {
        let rpc = &self.shared.rpc;
        if let [body] = bodies {
            return Ok(vec![rpc.call(cx, proc, cred, body)]);
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut issued: Vec<RequestHandle> = Vec::with_capacity(bodies.len());
        for (i, body) in bodies.iter().enumerate() {
            let tx = tx.clone();
            match rpc.call_async(proc, cred, body, move |result| {
                let _ = tx.send((i, result));
            }) {
                Ok(handle) => issued.push(handle),
                Err(err) => {
                    for handle in issued {
                        rpc.abandon(handle);
                    }
                    return Err(err);
                }
            }
        }
        drop(tx);
        let mut replies: Vec<Option<Result<Reply>>> = bodies.iter().map(|_| None).collect();
        let mut left = bodies.len();
        while left > 0 {
            if let Err(err) = cx_checkpoint(cx) {
                for handle in &issued {
                    rpc.abandon(*handle);
                }
                return Err(err);
            }
            match rx.recv_timeout(cx.bounded_wait(WAIT_SLICE)) {
                Ok((i, result)) => {
                    replies[i] = Some(result);
                    left -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(replies
            .into_iter()
            .map(|r| r.unwrap_or(Err(NfsError::Abandoned)))
            .collect())
    }
}
