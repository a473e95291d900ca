//! Exclusive access to a busy buffer.

use crate::page_state::PageState;
use crate::{BufBody, BufFlags, BufId, CacheInner, release_body};
use fnfs_error::{NfsError, Result};
use fnfs_types::{BlockNumber, Credential, FileId, PAGE_SIZE, WriteVerifier, page_round, page_trunc};
use std::fmt;
use std::sync::Arc;

/// Flags the cache manages itself; callers go through the dedicated methods.
const MANAGED: BufFlags = BufFlags::DELWRI.union(BufFlags::INVALID).union(BufFlags::META);

/// A busy buffer.
///
/// While the handle lives, the buffer is on no queue and nobody else can
/// acquire it. Dropping the handle (or calling [`Self::release`]) returns it
/// to the cache exactly once.
pub struct BufferHandle {
    inner: Arc<CacheInner>,
    id: BufId,
    file: FileId,
    block: BlockNumber,
    size: usize,
    body: BufBody,
    reclaim_on_release: bool,
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("file", &self.file)
            .field("block", &self.block)
            .field("size", &self.size)
            .field("flags", &self.body.flags)
            .field("valid", &self.body.valid)
            .field("dirty", &self.body.dirty)
            .field("dirty_range", &self.body.dirty_range())
            .finish_non_exhaustive()
    }
}

impl BufferHandle {
    pub(crate) fn new(
        inner: Arc<CacheInner>,
        id: BufId,
        file: FileId,
        block: BlockNumber,
        size: usize,
        body: BufBody,
    ) -> Self {
        Self {
            inner,
            id,
            file,
            block,
            size,
            body,
            reclaim_on_release: false,
        }
    }

    #[must_use]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Buffer length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of pages spanned by the buffer.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.size.div_ceil(PAGE_SIZE)
    }

    /// Byte offset of the buffer within its file.
    #[must_use]
    pub fn file_offset(&self) -> u64 {
        self.block.0 * self.size as u64
    }

    #[must_use]
    pub fn flags(&self) -> BufFlags {
        self.body.flags
    }

    /// Set caller-managed flags (`DELWRI`, `INVALID`, and `META` are ignored).
    pub fn set_flags(&mut self, flags: BufFlags) {
        self.body.flags.insert(flags - MANAGED);
    }

    pub fn clear_flags(&mut self, flags: BufFlags) {
        self.body.flags.remove(flags - MANAGED);
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.body.data.is_some()
    }

    fn map(&mut self) -> Result<&mut Vec<u8>> {
        if self.body.data.is_none() {
            let bytes = if self.body.flags.contains(BufFlags::META) {
                vec![0_u8; self.size]
            } else {
                self.inner
                    .provider
                    .map_pages(self.file, self.block, self.size)?
            };
            if bytes.len() < self.size {
                return Err(NfsError::ResourceExhausted);
            }
            self.body.data = Some(bytes);
        }
        match self.body.data.as_mut() {
            Some(data) => Ok(data),
            None => Err(NfsError::ResourceExhausted),
        }
    }

    /// Buffer bytes, mapping backing storage on first use.
    pub fn data(&mut self) -> Result<&[u8]> {
        let size = self.size;
        Ok(&self.map()?[..size])
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let size = self.size;
        Ok(&mut self.map()?[..size])
    }

    #[must_use]
    pub fn valid(&self) -> PageState {
        self.body.valid
    }

    #[must_use]
    pub fn dirty(&self) -> PageState {
        self.body.dirty
    }

    /// Mark pages `[first, last)` as holding current data.
    pub fn mark_valid(&mut self, first: usize, last: usize) {
        let last = last.min(self.pages());
        self.body.valid.set_range(first, last);
        self.inner
            .provider
            .mark_valid(self.file, self.block, &self.body.valid);
    }

    pub fn clear_valid(&mut self, first: usize, last: usize) {
        self.body.valid.clear_range(first, last);
    }

    /// Mark pages `[first, last)` as modified locally.
    pub fn mark_pages_dirty(&mut self, first: usize, last: usize) {
        let last = last.min(self.pages());
        self.body.dirty.set_range(first, last);
        self.inner
            .provider
            .mark_dirty(self.file, self.block, &self.body.dirty);
    }

    pub fn clear_dirty_pages(&mut self, first: usize, last: usize) {
        self.body.dirty.clear_range(first, last);
    }

    /// Dirty byte span `[off, end)`, if any.
    #[must_use]
    pub fn dirty_range(&self) -> Option<(usize, usize)> {
        self.body.dirty_range()
    }

    pub fn set_dirty_range(&mut self, off: usize, end: usize) {
        let end = end.min(self.size);
        self.body.dirty_off = off.min(end);
        self.body.dirty_end = end;
    }

    /// Grow the dirty span to cover `[off, end)` as well.
    pub fn extend_dirty_range(&mut self, off: usize, end: usize) {
        match self.body.dirty_range() {
            Some((cur_off, cur_end)) => {
                self.set_dirty_range(cur_off.min(off), cur_end.max(end));
            }
            None => self.set_dirty_range(off, end),
        }
    }

    pub fn clear_dirty_range(&mut self) {
        self.body.dirty_off = 0;
        self.body.dirty_end = 0;
    }

    /// Round the dirty span out to page boundaries, clipped to the buffer.
    pub fn normalize_dirty_range(&mut self) {
        if let Some((off, end)) = self.body.dirty_range() {
            self.body.dirty_off = page_trunc(off);
            self.body.dirty_end = page_round(end).min(self.size);
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&NfsError> {
        self.body.error.as_ref()
    }

    pub fn set_error(&mut self, err: NfsError) {
        self.body.flags.insert(BufFlags::ERROR);
        self.body.error = Some(err);
    }

    pub fn clear_error(&mut self) -> Option<NfsError> {
        self.body.flags.remove(BufFlags::ERROR);
        self.body.error.take()
    }

    /// Verifier (and its local epoch) of the unstable write that left this
    /// buffer needing a commit.
    #[must_use]
    pub fn verifier(&self) -> Option<(WriteVerifier, u64)> {
        self.body
            .verifier
            .map(|v| (v, self.body.verifier_epoch))
    }

    pub fn set_verifier(&mut self, verifier: WriteVerifier, epoch: u64) {
        self.body.verifier = Some(verifier);
        self.body.verifier_epoch = epoch;
    }

    pub fn clear_verifier(&mut self) {
        self.body.verifier = None;
        self.body.verifier_epoch = 0;
    }

    #[must_use]
    pub fn credential(&self) -> Option<&Credential> {
        self.body.cred.as_ref()
    }

    pub fn set_credential(&mut self, cred: Credential) {
        self.body.cred = Some(cred);
    }

    /// Flag the buffer as holding a delayed write and move it to its file's
    /// dirty list. Returns `true` on the clean-to-dirty transition.
    pub fn mark_delayed_write(&mut self) -> bool {
        if self.body.flags.contains(BufFlags::DELWRI) {
            return false;
        }
        self.body.flags.insert(BufFlags::DELWRI);
        self.sync_delwri(true);
        true
    }

    /// Drop the delayed-write state. Returns `true` if it was set.
    pub fn clear_delayed_write(&mut self) -> bool {
        if !self.body.flags.contains(BufFlags::DELWRI) {
            return false;
        }
        self.body.flags.remove(BufFlags::DELWRI);
        self.sync_delwri(false);
        true
    }

    fn sync_delwri(&self, on: bool) {
        let mut state = self.inner.state.lock();
        let meta = &mut state.slots[self.id.0];
        if meta.flags.contains(BufFlags::DELWRI) == on {
            return;
        }
        meta.flags.set(BufFlags::DELWRI, on);
        if on {
            state.delwri_count += 1;
        } else {
            state.delwri_count -= 1;
        }
        state.sync_file_lists(self.id);
    }

    /// Mark the buffer clean: no dirty pages, no dirty span, no pending
    /// commit, no delayed write.
    pub fn mark_clean(&mut self) {
        self.body.dirty.clear_all();
        self.clear_dirty_range();
        self.body
            .flags
            .remove(BufFlags::NEEDS_COMMIT | BufFlags::STALE_WVERF | BufFlags::STABLE);
        self.clear_verifier();
        self.clear_delayed_write();
    }

    /// Discard the contents; the buffer is disassociated from its file when
    /// released and becomes the first candidate for reuse.
    pub fn invalidate(&mut self) {
        self.mark_clean();
        self.body.valid.clear_all();
        self.body.flags.insert(BufFlags::INVALID);
    }

    /// Hold an extra reference that keeps the buffer from being evicted or
    /// reclaimed after it is released.
    #[must_use]
    pub fn pin(&self) -> BufferPin {
        let mut state = self.inner.state.lock();
        let meta = &mut state.slots[self.id.0];
        meta.refs += 1;
        BufferPin {
            inner: Arc::clone(&self.inner),
            id: self.id,
            generation: meta.generation,
        }
    }

    /// Return the buffer to the cache, optionally letting the release run a
    /// pressure reclaim.
    pub fn release(mut self, can_reclaim: bool) {
        self.reclaim_on_release = can_reclaim;
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        let body = std::mem::take(&mut self.body);
        release_body(&self.inner, self.id, body, self.reclaim_on_release);
    }
}

/// Extra reference on a cached buffer; see [`BufferHandle::pin`].
pub struct BufferPin {
    inner: Arc<CacheInner>,
    id: BufId,
    generation: u64,
}

impl fmt::Debug for BufferPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPin")
            .field("slot", &self.id.0)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for BufferPin {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let meta = &mut state.slots[self.id.0];
        if meta.live && meta.generation == self.generation && meta.refs > 1 {
            meta.refs -= 1;
        }
    }
}
