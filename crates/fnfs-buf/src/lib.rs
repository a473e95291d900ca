#![forbid(unsafe_code)]
//! Block buffer cache for the FrankenNFS client.
//!
//! Buffers are keyed by `(FileId, BlockNumber)` and carry per-page validity
//! and dirty maps ([`PageState`]). Every idle buffer sits on exactly one of
//! three queues:
//!
//! | Queue | Contents | Order |
//! |-------|----------|-------|
//! | free LRU | clean regular buffers | invalidated at the head, then least recently used |
//! | free meta | clean metadata buffers | same as free LRU |
//! | delayed | buffers holding delayed writes | oldest first |
//!
//! A buffer handed out by [`BufferCache::get`] is *busy*: it is on no queue
//! and its bytes are owned exclusively by the [`BufferHandle`]. Dropping or
//! releasing the handle returns the buffer to the right queue exactly once.
//!
//! Invariant: `buffers == free_lru + free_meta + delayed + busy`.

mod handle;
pub mod page_state;
mod pages;

pub use handle::{BufferHandle, BufferPin};
pub use page_state::PageState;
pub use pages::{AnonymousPages, PageProvider};

use bitflags::bitflags;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use fnfs_error::{NfsError, Result};
use fnfs_types::{
    Attempt, BlockNumber, Credential, Cx, FileId, MAX_BUFFER_SIZE, PAGE_SIZE, Turn, WaitQueue,
    WriteVerifier,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(NfsError::from)
}

bitflags! {
    /// Per-buffer state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufFlags: u32 {
        /// Holds file metadata rather than file data.
        const META = 1 << 0;
        /// Owned by an asynchronous RPC.
        const ASYNC = 1 << 1;
        /// Written unstable; a COMMIT is still owed.
        const NEEDS_COMMIT = 1 << 2;
        /// A READ is in flight into this buffer.
        const READ = 1 << 3;
        /// Uncommitted data predates the server's current write verifier.
        const STALE_WVERF = 1 << 4;
        /// A WRITE was split into several RPCs that are still in flight.
        const MULTI_RPC = 1 << 5;
        /// Contents are meaningless; the buffer is disassociated on release.
        const INVALID = 1 << 6;
        /// Holds a delayed write.
        const DELWRI = 1 << 7;
        /// Last I/O failed.
        const ERROR = 1 << 8;
        /// Next write must be stable.
        const STABLE = 1 << 9;
    }
}

bitflags! {
    /// Options for [`BufferCache::get`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GetFlags: u32 {
        /// Fail with `WouldBlock` instead of waiting for a busy buffer.
        const NONBLOCK = 1 << 0;
        /// Allocate from the metadata pool.
        const META = 1 << 1;
    }
}

/// Pool sizing and staleness thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_buffers: usize,
    /// Buffers are allocated rather than recycled while the pool is smaller.
    pub min_buffers: usize,
    pub max_meta_buffers: usize,
    /// Default buffer size in bytes.
    pub buffer_size: usize,
    /// Idle time after which a regular buffer is preferred for eviction.
    pub lru_stale: Duration,
    /// Idle time after which a metadata buffer is preferred for eviction.
    pub meta_stale: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_buffers: 512,
            min_buffers: 16,
            max_meta_buffers: 128,
            buffer_size: 32 * 1024,
            lru_stale: Duration::from_secs(10),
            meta_stale: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_max_buffers(mut self, max: usize) -> Self {
        self.max_buffers = max;
        self
    }

    #[must_use]
    pub fn with_min_buffers(mut self, min: usize) -> Self {
        self.min_buffers = min;
        self
    }

    #[must_use]
    pub fn with_max_meta_buffers(mut self, max: usize) -> Self {
        self.max_meta_buffers = max;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_staleness(mut self, lru: Duration, meta: Duration) -> Self {
        self.lru_stale = lru;
        self.meta_stale = meta;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffers == 0 {
            return Err(NfsError::InvalidConfig("max_buffers must be > 0".to_owned()));
        }
        if self.min_buffers > self.max_buffers {
            return Err(NfsError::InvalidConfig(
                "min_buffers must not exceed max_buffers".to_owned(),
            ));
        }
        if self.max_meta_buffers > self.max_buffers {
            return Err(NfsError::InvalidConfig(
                "max_meta_buffers must not exceed max_buffers".to_owned(),
            ));
        }
        validate_buffer_size(self.buffer_size)
    }
}

fn validate_buffer_size(size: usize) -> Result<()> {
    if size == 0 || size % PAGE_SIZE != 0 || size > MAX_BUFFER_SIZE {
        return Err(NfsError::InvalidConfig(format!(
            "buffer size {size} must be a non-zero multiple of {PAGE_SIZE} up to {MAX_BUFFER_SIZE}"
        )));
    }
    Ok(())
}

/// Mode of a [`BufferCache::reclaim`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// Periodic pass: up to 1/8 of each free list.
    Timer,
    /// Pool pressure: up to 1/4 of each free list.
    Pressure,
}

/// Read-only view of a cached buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub file: FileId,
    pub block: BlockNumber,
    pub size: usize,
    pub flags: BufFlags,
    pub busy: bool,
    pub refs: u32,
    /// Page maps; `None` while the buffer is busy.
    pub valid: Option<PageState>,
    pub dirty: Option<PageState>,
    pub dirty_range: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub buffers: usize,
    pub busy: usize,
    pub free_lru: usize,
    pub free_meta: usize,
    pub delayed: usize,
    pub meta_buffers: usize,
    /// Buffers carrying `DELWRI`, busy or not.
    pub delayed_writes: usize,
    pub hits: u64,
    pub misses: u64,
    pub recycled: u64,
    pub reclaimed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BufId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Queue {
    None,
    FreeLru,
    FreeMeta,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKey {
    Buffer(BufId),
    Pool,
}

/// Contents of a buffer, owned by the handle while busy.
#[derive(Debug, Default)]
struct BufBody {
    data: Option<Vec<u8>>,
    valid: PageState,
    dirty: PageState,
    dirty_off: usize,
    dirty_end: usize,
    flags: BufFlags,
    error: Option<NfsError>,
    verifier: Option<WriteVerifier>,
    verifier_epoch: u64,
    cred: Option<Credential>,
}

impl BufBody {
    fn with_flags(flags: BufFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    fn dirty_range(&self) -> Option<(usize, usize)> {
        (self.dirty_end > self.dirty_off).then_some((self.dirty_off, self.dirty_end))
    }

    fn resize(&mut self, size: usize) {
        let first_gone = size.div_ceil(PAGE_SIZE);
        self.valid.clear_range(first_gone, PageState::CAPACITY);
        self.dirty.clear_range(first_gone, PageState::CAPACITY);
        self.dirty_end = self.dirty_end.min(size);
        self.dirty_off = self.dirty_off.min(self.dirty_end);
        if let Some(data) = self.data.as_mut() {
            data.resize(size, 0);
        }
    }
}

#[derive(Debug)]
struct BufMeta {
    live: bool,
    file: Option<FileId>,
    block: BlockNumber,
    size: usize,
    busy: bool,
    /// 1 for the cache itself plus one per outstanding pin.
    refs: u32,
    queue: Queue,
    /// `None` once invalidated: immediately reclaimable.
    last_used: Option<Instant>,
    /// Mirror of the body flags, refreshed on checkout and release.
    flags: BufFlags,
    body: Option<BufBody>,
    /// Distinguishes successive occupants of one slot.
    generation: u64,
}

impl BufMeta {
    fn vacant() -> Self {
        Self {
            live: false,
            file: None,
            block: BlockNumber(0),
            size: 0,
            busy: false,
            refs: 0,
            queue: Queue::None,
            last_used: None,
            flags: BufFlags::empty(),
            body: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Default)]
struct FileLists {
    clean: BTreeSet<BlockNumber>,
    dirty: BTreeSet<BlockNumber>,
}

#[derive(Debug, Default)]
struct CacheState {
    slots: Vec<BufMeta>,
    vacant: Vec<BufId>,
    index: HashMap<(FileId, BlockNumber), BufId>,
    files: HashMap<FileId, FileLists>,
    free_lru: VecDeque<BufId>,
    free_meta: VecDeque<BufId>,
    delayed: VecDeque<BufId>,
    count: usize,
    busy: usize,
    meta_count: usize,
    delwri_count: usize,
    pressure: bool,
    shutdown: bool,
    next_generation: u64,
    hits: u64,
    misses: u64,
    recycled: u64,
    reclaimed: u64,
}

enum Slot {
    Fresh,
    Recycle(BufId),
}

fn time_to_stale(last_used: Option<Instant>, threshold: Duration, now: Instant) -> Duration {
    last_used.map_or(Duration::ZERO, |t| {
        threshold.saturating_sub(now.saturating_duration_since(t))
    })
}

impl CacheState {
    fn list_mut(&mut self, queue: Queue) -> Option<&mut VecDeque<BufId>> {
        match queue {
            Queue::None => None,
            Queue::FreeLru => Some(&mut self.free_lru),
            Queue::FreeMeta => Some(&mut self.free_meta),
            Queue::Delayed => Some(&mut self.delayed),
        }
    }

    fn remove_from_list(list: &mut VecDeque<BufId>, id: BufId) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == id) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    /// Take `id` off whichever queue holds it.
    fn unlink(&mut self, id: BufId) {
        let queue = self.slots[id.0].queue;
        if let Some(list) = self.list_mut(queue) {
            let _ = Self::remove_from_list(list, id);
        }
        self.slots[id.0].queue = Queue::None;
    }

    fn enqueue(&mut self, id: BufId, queue: Queue, front: bool) {
        if let Some(list) = self.list_mut(queue) {
            if front {
                list.push_front(id);
            } else {
                list.push_back(id);
            }
        }
        self.slots[id.0].queue = queue;
    }

    fn oldest_unpinned(&self, queue: Queue) -> Option<BufId> {
        let list = match queue {
            Queue::FreeLru => &self.free_lru,
            Queue::FreeMeta => &self.free_meta,
            Queue::Delayed | Queue::None => return None,
        };
        list.iter().copied().find(|id| self.slots[id.0].refs <= 1)
    }

    fn sync_file_lists(&mut self, id: BufId) {
        let meta = &self.slots[id.0];
        let Some(file) = meta.file else {
            return;
        };
        let block = meta.block;
        let dirty = meta.flags.contains(BufFlags::DELWRI);
        let lists = self.files.entry(file).or_default();
        if dirty {
            lists.clean.remove(&block);
            lists.dirty.insert(block);
        } else {
            lists.dirty.remove(&block);
            lists.clean.insert(block);
        }
    }

    /// Remove `id` from the hash index and its file's lists and unmap its
    /// storage.
    fn disassociate(&mut self, id: BufId, provider: &dyn PageProvider) {
        let (file, block) = {
            let meta = &mut self.slots[id.0];
            let Some(file) = meta.file.take() else {
                return;
            };
            (file, meta.block)
        };
        if self.index.get(&(file, block)) == Some(&id) {
            self.index.remove(&(file, block));
        }
        if let Some(lists) = self.files.get_mut(&file) {
            lists.clean.remove(&block);
            lists.dirty.remove(&block);
            if lists.clean.is_empty() && lists.dirty.is_empty() {
                self.files.remove(&file);
            }
        }
        let meta = &mut self.slots[id.0];
        if meta.flags.contains(BufFlags::DELWRI) {
            meta.flags.remove(BufFlags::DELWRI);
            self.delwri_count = self.delwri_count.saturating_sub(1);
        }
        let is_meta = meta.flags.contains(BufFlags::META);
        if let Some(body) = meta.body.as_mut() {
            body.flags.remove(BufFlags::DELWRI);
            if let Some(data) = body.data.take() {
                if !is_meta {
                    provider.unmap_pages(file, block, data);
                }
            }
        }
    }

    fn destroy(&mut self, id: BufId) {
        let meta = &mut self.slots[id.0];
        if meta.flags.contains(BufFlags::META) {
            self.meta_count = self.meta_count.saturating_sub(1);
        }
        *meta = BufMeta::vacant();
        self.vacant.push(id);
        self.count -= 1;
    }

    fn alloc_slot(&mut self) -> BufId {
        self.count += 1;
        if let Some(id) = self.vacant.pop() {
            return id;
        }
        self.slots.push(BufMeta::vacant());
        BufId(self.slots.len() - 1)
    }

    fn counts_balance(&self) -> bool {
        self.count == self.free_lru.len() + self.free_meta.len() + self.delayed.len() + self.busy
    }

    /// Full structural check.
    fn verify(&self) -> std::result::Result<(), String> {
        if !self.counts_balance() {
            return Err(format!(
                "count {} != free_lru {} + free_meta {} + delayed {} + busy {}",
                self.count,
                self.free_lru.len(),
                self.free_meta.len(),
                self.delayed.len(),
                self.busy
            ));
        }
        let mut seen = HashSet::new();
        for (queue, list) in [
            (Queue::FreeLru, &self.free_lru),
            (Queue::FreeMeta, &self.free_meta),
            (Queue::Delayed, &self.delayed),
        ] {
            for id in list {
                if !seen.insert(*id) {
                    return Err(format!("buffer {} on more than one queue", id.0));
                }
                let meta = &self.slots[id.0];
                if !meta.live || meta.busy || meta.queue != queue {
                    return Err(format!("buffer {} queued in {queue:?} but {meta:?}", id.0));
                }
                if meta.flags.contains(BufFlags::DELWRI) != (queue == Queue::Delayed) {
                    return Err(format!("buffer {} on {queue:?} with flags {:?}", id.0, meta.flags));
                }
            }
        }
        let mut live = 0;
        let mut busy = 0;
        let mut meta_count = 0;
        let mut delwri = 0;
        for (i, meta) in self.slots.iter().enumerate() {
            if !meta.live {
                continue;
            }
            live += 1;
            if meta.busy {
                busy += 1;
                if meta.queue != Queue::None {
                    return Err(format!("busy buffer {i} is queued"));
                }
            }
            if meta.flags.contains(BufFlags::META) {
                meta_count += 1;
            }
            if meta.flags.contains(BufFlags::DELWRI) {
                delwri += 1;
            }
            if meta.file.is_none() && meta.last_used.is_some() && !meta.busy {
                return Err(format!("disassociated buffer {i} has a valid timestamp"));
            }
        }
        if live != self.count || busy != self.busy {
            return Err(format!(
                "live {live}/busy {busy} disagree with counters {}/{}",
                self.count, self.busy
            ));
        }
        if meta_count != self.meta_count || delwri != self.delwri_count {
            return Err(format!(
                "meta {meta_count}/delwri {delwri} disagree with counters {}/{}",
                self.meta_count, self.delwri_count
            ));
        }
        for (&(file, block), id) in &self.index {
            let meta = &self.slots[id.0];
            if !meta.live || meta.file != Some(file) || meta.block != block {
                return Err(format!("index entry {file}/{block} points at {meta:?}"));
            }
        }
        for lists in self.files.values() {
            if lists.clean.intersection(&lists.dirty).next().is_some() {
                return Err("buffer on both clean and dirty file lists".to_owned());
            }
        }
        Ok(())
    }

    fn check_after_mutation(&self) {
        if !self.counts_balance() {
            error!(
                count = self.count,
                busy = self.busy,
                free_lru = self.free_lru.len(),
                free_meta = self.free_meta.len(),
                delayed = self.delayed.len(),
                "buffer accounting out of balance"
            );
        }
        debug_assert_eq!(self.verify(), Ok(()));
    }
}

struct CacheInner {
    config: CacheConfig,
    provider: Arc<dyn PageProvider>,
    state: Mutex<CacheState>,
    waiters: WaitQueue<WaitKey>,
    pressure_cv: Condvar,
}

/// Shared handle to one buffer cache instance.
#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A buffer leaving the cache lock in busy state.
struct Checkout {
    id: BufId,
    file: FileId,
    block: BlockNumber,
    size: usize,
    body: BufBody,
}

impl BufferCache {
    /// Create an empty cache.
    pub fn init(config: CacheConfig, provider: Arc<dyn PageProvider>) -> Result<Self> {
        config.validate()?;
        debug!(
            max_buffers = config.max_buffers,
            min_buffers = config.min_buffers,
            buffer_size = config.buffer_size,
            "buffer cache initialized"
        );
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                provider,
                state: Mutex::new(CacheState::default()),
                waiters: WaitQueue::new(),
                pressure_cv: Condvar::new(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.config.buffer_size
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn PageProvider> {
        &self.inner.provider
    }

    /// Acquire the buffer for `(file, block)`, allocating or recycling one
    /// on a miss. The buffer is busy until the returned handle is released.
    ///
    /// Waits while the buffer is busy (unless `NONBLOCK`) or while the pool
    /// is at capacity with nothing evictable.
    pub fn get(
        &self,
        cx: &Cx,
        file: FileId,
        block: BlockNumber,
        size: usize,
        flags: GetFlags,
    ) -> Result<BufferHandle> {
        validate_buffer_size(size)?;
        cx_checkpoint(cx)?;
        let mut state = self.inner.state.lock();
        let checkout = self.inner.waiters.acquire(cx, &mut state, |state, turn| {
            self.try_get(state, turn, file, block, size, flags, true)
        })?;
        drop(state);
        Ok(self.handle_for(checkout))
    }

    /// Like [`Self::get`] but never allocates: `None` when the block is not
    /// cached. Waits for the buffer if it is busy.
    pub fn get_if_cached(
        &self,
        cx: &Cx,
        file: FileId,
        block: BlockNumber,
        flags: GetFlags,
    ) -> Result<Option<BufferHandle>> {
        cx_checkpoint(cx)?;
        let mut state = self.inner.state.lock();
        let checkout = self.inner.waiters.acquire(cx, &mut state, |state, turn| {
            let Some(&id) = state.index.get(&(file, block)) else {
                return Ok::<_, NfsError>(Attempt::Ready(None));
            };
            let size = state.slots[id.0].size;
            match self.try_get(state, turn, file, block, size, flags, false)? {
                Attempt::Ready(c) => Ok(Attempt::Ready(Some(c))),
                Attempt::Wait(key) => Ok(Attempt::Wait(key)),
            }
        })?;
        drop(state);
        Ok(checkout.map(|c| self.handle_for(c)))
    }

    fn handle_for(&self, checkout: Checkout) -> BufferHandle {
        BufferHandle::new(
            Arc::clone(&self.inner),
            checkout.id,
            checkout.file,
            checkout.block,
            checkout.size,
            checkout.body,
        )
    }

    #[expect(clippy::too_many_arguments)]
    fn try_get(
        &self,
        state: &mut CacheState,
        turn: &Turn<'_, WaitKey>,
        file: FileId,
        block: BlockNumber,
        size: usize,
        flags: GetFlags,
        create: bool,
    ) -> Result<Attempt<Checkout, WaitKey>> {
        if state.shutdown {
            return Err(NfsError::Shutdown);
        }
        let key = (file, block);
        if let Some(&id) = state.index.get(&key) {
            let wait = WaitKey::Buffer(id);
            if state.slots[id.0].busy {
                if flags.contains(GetFlags::NONBLOCK) {
                    return Err(NfsError::WouldBlock);
                }
                trace!(file = file.0, block = block.0, "waiting for busy buffer");
                return Ok(Attempt::Wait(wait));
            }
            if turn.blocked_by_earlier(&wait) {
                return Ok(Attempt::Wait(wait));
            }
            state.unlink(id);
            state.busy += 1;
            state.hits += 1;
            let meta = &mut state.slots[id.0];
            meta.busy = true;
            let mut body = meta
                .body
                .take()
                .unwrap_or_else(|| BufBody::with_flags(meta.flags));
            if meta.size != size {
                body.resize(size);
                meta.size = size;
            }
            state.check_after_mutation();
            trace!(file = file.0, block = block.0, "buffer cache hit");
            return Ok(Attempt::Ready(Checkout {
                id,
                file,
                block,
                size,
                body,
            }));
        }
        if !create {
            return Err(NfsError::Busy);
        }

        if turn.blocked_by_earlier(&WaitKey::Pool) {
            return Ok(Attempt::Wait(WaitKey::Pool));
        }
        let want_meta = flags.contains(GetFlags::META);
        let Some(slot) = self.select_slot(state, want_meta, Instant::now()) else {
            if !state.delayed.is_empty() {
                state.pressure = true;
                self.inner.pressure_cv.notify_all();
            }
            debug!(
                file = file.0,
                block = block.0,
                buffers = state.count,
                "buffer pool exhausted, waiting"
            );
            return Ok(Attempt::Wait(WaitKey::Pool));
        };
        state.misses += 1;
        let id = match slot {
            Slot::Fresh => state.alloc_slot(),
            Slot::Recycle(id) => {
                state.unlink(id);
                state.disassociate(id, self.inner.provider.as_ref());
                if state.slots[id.0].flags.contains(BufFlags::META) {
                    state.meta_count -= 1;
                }
                state.recycled += 1;
                trace!(file = file.0, block = block.0, "recycling buffer");
                id
            }
        };
        let base_flags = if want_meta {
            state.meta_count += 1;
            BufFlags::META
        } else {
            BufFlags::empty()
        };
        state.next_generation += 1;
        let generation = state.next_generation;
        state.slots[id.0] = BufMeta {
            generation,
            live: true,
            file: Some(file),
            block,
            size,
            busy: true,
            refs: 1,
            queue: Queue::None,
            last_used: None,
            flags: base_flags,
            body: None,
        };
        state.busy += 1;
        state.index.insert(key, id);
        state.sync_file_lists(id);
        state.check_after_mutation();
        Ok(Attempt::Ready(Checkout {
            id,
            file,
            block,
            size,
            body: BufBody::with_flags(base_flags),
        }))
    }

    /// Pick a fresh allocation or a victim for a cache miss.
    fn select_slot(&self, state: &CacheState, want_meta: bool, now: Instant) -> Option<Slot> {
        let config = &self.inner.config;
        if want_meta && state.meta_count >= config.max_meta_buffers {
            return state.oldest_unpinned(Queue::FreeMeta).map(Slot::Recycle);
        }
        if state.count < config.min_buffers {
            return Some(Slot::Fresh);
        }
        let lru = state.oldest_unpinned(Queue::FreeLru).map(|id| {
            (
                id,
                time_to_stale(state.slots[id.0].last_used, config.lru_stale, now),
            )
        });
        let meta = state.oldest_unpinned(Queue::FreeMeta).map(|id| {
            (
                id,
                time_to_stale(state.slots[id.0].last_used, config.meta_stale, now),
            )
        });
        if let Some((id, left)) = lru {
            if left.is_zero() {
                return Some(Slot::Recycle(id));
            }
        }
        if let Some((id, left)) = meta {
            if left.is_zero() {
                return Some(Slot::Recycle(id));
            }
        }
        if state.count < config.max_buffers {
            return Some(Slot::Fresh);
        }
        // At the cap: take whichever candidate goes stale first.
        match (lru, meta) {
            (Some((l, l_left)), Some((m, m_left))) => {
                Some(Slot::Recycle(if l_left <= m_left { l } else { m }))
            }
            (Some((id, _)), None) | (None, Some((id, _))) => Some(Slot::Recycle(id)),
            (None, None) => None,
        }
    }

    /// Return a busy buffer to the cache.
    ///
    /// Invalid buffers go to the head of their free list, delayed writes to
    /// the tail of the delayed list, everything else to the tail of its free
    /// list with a fresh timestamp. With `can_reclaim`, a pressure reclaim
    /// runs when more than 1/8 of the pool is idle on free lists.
    pub fn release(&self, handle: BufferHandle, can_reclaim: bool) {
        handle.release(can_reclaim);
    }

    /// Look up a cached buffer without acquiring it. Invalid buffers are
    /// not reported.
    #[must_use]
    pub fn incore(&self, file: FileId, block: BlockNumber) -> Option<BufferInfo> {
        let state = self.inner.state.lock();
        let id = *state.index.get(&(file, block))?;
        let meta = &state.slots[id.0];
        if meta.flags.contains(BufFlags::INVALID) {
            return None;
        }
        let body = meta.body.as_ref();
        Some(BufferInfo {
            file,
            block,
            size: meta.size,
            flags: meta.flags,
            busy: meta.busy,
            refs: meta.refs,
            valid: body.map(|b| b.valid),
            dirty: body.map(|b| b.dirty),
            dirty_range: body.and_then(BufBody::dirty_range),
        })
    }

    /// Free idle buffers that have been stale for twice their threshold.
    ///
    /// Stops at the first pinned or recently used buffer on each list and
    /// never shrinks the pool below `min_buffers`. Returns the number freed.
    pub fn reclaim(&self, mode: ReclaimMode) -> usize {
        reclaim(&self.inner, mode)
    }

    /// Invalidate every cached buffer of `file`.
    ///
    /// Fails with `Busy` on the first buffer holding a delayed write unless
    /// `discard_dirty` is set.
    pub fn invalidate_file(&self, cx: &Cx, file: FileId, discard_dirty: bool) -> Result<()> {
        let blocks: Vec<BlockNumber> = {
            let state = self.inner.state.lock();
            state
                .files
                .get(&file)
                .map(|l| l.clean.union(&l.dirty).copied().collect())
                .unwrap_or_default()
        };
        for block in blocks {
            cx_checkpoint(cx)?;
            let Some(mut handle) = self.get_if_cached(cx, file, block, GetFlags::empty())? else {
                continue;
            };
            if handle.flags().contains(BufFlags::DELWRI) && !discard_dirty {
                drop(handle);
                return Err(NfsError::Busy);
            }
            handle.invalidate();
        }
        debug!(file = file.0, discard_dirty, "file buffers invalidated");
        Ok(())
    }

    /// Blocks of `file` holding delayed writes, ascending.
    #[must_use]
    pub fn dirty_blocks(&self, file: FileId) -> Vec<BlockNumber> {
        let state = self.inner.state.lock();
        state
            .files
            .get(&file)
            .map(|l| l.dirty.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Blocks of `file` currently cached, ascending.
    #[must_use]
    pub fn cached_blocks(&self, file: FileId) -> Vec<BlockNumber> {
        let state = self.inner.state.lock();
        state
            .files
            .get(&file)
            .map(|l| l.clean.union(&l.dirty).copied().collect())
            .unwrap_or_default()
    }

    /// Files with at least one delayed write.
    #[must_use]
    pub fn files_with_dirty(&self) -> Vec<FileId> {
        let state = self.inner.state.lock();
        let mut files: Vec<FileId> = state
            .files
            .iter()
            .filter(|(_, l)| !l.dirty.is_empty())
            .map(|(f, _)| *f)
            .collect();
        files.sort_unstable();
        files
    }

    /// Up to `max` idle delayed-write buffers, oldest first.
    #[must_use]
    pub fn delayed_candidates(&self, max: usize) -> Vec<(FileId, BlockNumber)> {
        let state = self.inner.state.lock();
        state
            .delayed
            .iter()
            .take(max)
            .filter_map(|id| {
                let meta = &state.slots[id.0];
                meta.file.map(|f| (f, meta.block))
            })
            .collect()
    }

    /// Number of buffers holding delayed writes.
    #[must_use]
    pub fn delayed_write_count(&self) -> usize {
        self.inner.state.lock().delwri_count
    }

    /// Block until a `get` found the pool exhausted with delayed writes
    /// pending, or `timeout` passes. Clears the signal.
    pub fn wait_for_pressure(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if !state.pressure {
            let _ = self.inner.pressure_cv.wait_for(&mut state, timeout);
        }
        std::mem::take(&mut state.pressure)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            buffers: state.count,
            busy: state.busy,
            free_lru: state.free_lru.len(),
            free_meta: state.free_meta.len(),
            delayed: state.delayed.len(),
            meta_buffers: state.meta_count,
            delayed_writes: state.delwri_count,
            hits: state.hits,
            misses: state.misses,
            recycled: state.recycled,
            reclaimed: state.reclaimed,
        }
    }

    /// Verify queue membership, counters, and the hash index.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.inner.state.lock().verify()
    }

    /// Drop every idle buffer and fail current and future waiters with
    /// `Shutdown`. Busy buffers are destroyed when released.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        let idle: Vec<BufId> = state
            .free_lru
            .iter()
            .chain(state.free_meta.iter())
            .chain(state.delayed.iter())
            .copied()
            .collect();
        let discarded_dirty = state.delayed.len();
        for id in idle {
            state.unlink(id);
            state.disassociate(id, self.inner.provider.as_ref());
            state.destroy(id);
        }
        state.check_after_mutation();
        let busy = state.busy;
        drop(state);
        if discarded_dirty > 0 {
            warn!(discarded_dirty, "buffer cache shut down with delayed writes");
        }
        debug!(busy, "buffer cache shut down");
        self.inner.waiters.notify();
        self.inner.pressure_cv.notify_all();
    }

    /// Start a thread that runs a timer reclaim every `period`.
    pub fn start_reclaimer(&self, period: Duration) -> Result<ReclaimerHandle> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let cache = self.clone();
        let join = std::thread::Builder::new()
            .name("fnfs-reclaim".to_owned())
            .spawn(move || reclaimer_loop(&cache, &stop_rx, period))?;
        Ok(ReclaimerHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

fn release_body(inner: &CacheInner, id: BufId, mut body: BufBody, can_reclaim: bool) {
    let mut state = inner.state.lock();
    let now = Instant::now();
    debug_assert!(state.slots[id.0].busy, "releasing a buffer that is not busy");
    state.slots[id.0].busy = false;
    state.busy -= 1;

    if state.shutdown {
        state.slots[id.0].flags = body.flags;
        state.slots[id.0].body = Some(body);
        state.disassociate(id, inner.provider.as_ref());
        state.destroy(id);
        state.check_after_mutation();
        drop(state);
        inner.waiters.notify();
        return;
    }

    if body.flags.contains(BufFlags::ERROR) && !body.flags.contains(BufFlags::DELWRI) {
        body.flags.insert(BufFlags::INVALID);
    }
    let is_meta = body.flags.contains(BufFlags::META);
    let free_queue = if is_meta {
        Queue::FreeMeta
    } else {
        Queue::FreeLru
    };

    if body.flags.contains(BufFlags::INVALID) {
        state.slots[id.0].body = Some(body);
        state.disassociate(id, inner.provider.as_ref());
        let meta = &mut state.slots[id.0];
        let flags = BufFlags::INVALID | (meta.flags & BufFlags::META);
        meta.flags = flags;
        meta.last_used = None;
        if let Some(b) = meta.body.as_mut() {
            *b = BufBody::with_flags(flags);
        }
        state.enqueue(id, free_queue, true);
    } else {
        let queue = if body.flags.contains(BufFlags::DELWRI) {
            Queue::Delayed
        } else {
            free_queue
        };
        state.slots[id.0].flags = body.flags;
        state.slots[id.0].body = Some(body);
        state.slots[id.0].last_used = Some(now);
        state.enqueue(id, queue, false);
        state.sync_file_lists(id);
    }
    state.check_after_mutation();

    let free = state.free_lru.len() + state.free_meta.len();
    let reclaim_now = can_reclaim
        && state.count > inner.config.min_buffers
        && free > state.count / 8;
    drop(state);
    inner.waiters.notify();
    if reclaim_now {
        let freed = reclaim(inner, ReclaimMode::Pressure);
        trace!(freed, "reclaim on release");
    }
}

fn reclaim(inner: &CacheInner, mode: ReclaimMode) -> usize {
    let mut state = inner.state.lock();
    let now = Instant::now();
    let mut freed = 0;
    for (queue, threshold) in [
        (Queue::FreeLru, inner.config.lru_stale),
        (Queue::FreeMeta, inner.config.meta_stale),
    ] {
        let len = state.list_mut(queue).map_or(0, |l| l.len());
        let budget = match mode {
            ReclaimMode::Timer => len.div_ceil(8),
            ReclaimMode::Pressure => len.div_ceil(4),
        };
        let min_age = threshold.saturating_mul(2);
        for _ in 0..budget {
            if state.count <= inner.config.min_buffers {
                break;
            }
            let Some(id) = state.list_mut(queue).and_then(|l| l.front().copied()) else {
                break;
            };
            let meta = &state.slots[id.0];
            if meta.refs > 1 {
                break;
            }
            if let Some(used) = meta.last_used {
                if now.saturating_duration_since(used) < min_age {
                    break;
                }
            }
            state.unlink(id);
            state.disassociate(id, inner.provider.as_ref());
            state.destroy(id);
            freed += 1;
        }
    }
    state.reclaimed += freed as u64;
    state.check_after_mutation();
    drop(state);
    if freed > 0 {
        debug!(freed, ?mode, "reclaimed idle buffers");
    }
    freed
}

fn reclaimer_loop(cache: &BufferCache, stop: &Receiver<()>, period: Duration) {
    loop {
        match stop.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {
                let freed = cache.reclaim(ReclaimMode::Timer);
                trace!(freed, "periodic reclaim");
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("reclaimer stopped");
}

/// Handle to the periodic reclaim thread.
#[derive(Debug)]
pub struct ReclaimerHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ReclaimerHandle {
    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReclaimerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests;
