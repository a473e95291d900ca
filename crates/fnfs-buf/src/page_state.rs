//! Fixed-width page bitsets.
//!
//! One bit per page of a cache buffer, wide enough for the largest buffer
//! (`MAX_BUFFER_PAGES`). Used for the validity and dirty maps so questions
//! like "is any page in this range dirty" never scan bytes.

use fnfs_types::MAX_BUFFER_PAGES;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

const WORD_BITS: usize = 64;
const WORDS: usize = MAX_BUFFER_PAGES.div_ceil(WORD_BITS);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageState {
    words: [u64; WORDS],
}

impl PageState {
    /// Number of pages representable.
    pub const CAPACITY: usize = MAX_BUFFER_PAGES;

    #[must_use]
    pub const fn empty() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Mask with pages `[first, last)` set. Bounds are clamped to the width.
    #[must_use]
    pub fn range_mask(first: usize, last: usize) -> Self {
        let mut mask = Self::empty();
        mask.set_range(first, last);
        mask
    }

    /// `a & b`.
    #[must_use]
    pub fn bitwise_and(a: &Self, b: &Self) -> Self {
        let mut dst = *a;
        for (d, s) in dst.words.iter_mut().zip(b.words.iter()) {
            *d &= *s;
        }
        dst
    }

    /// `a | b`.
    #[must_use]
    pub fn union(a: &Self, b: &Self) -> Self {
        let mut dst = *a;
        for (d, s) in dst.words.iter_mut().zip(b.words.iter()) {
            *d |= *s;
        }
        dst
    }

    /// Set page `page`. Out-of-range pages are ignored.
    pub fn set_mask(&mut self, page: usize) {
        if page < Self::CAPACITY {
            self.words[page / WORD_BITS] |= 1 << (page % WORD_BITS);
        }
    }

    pub fn clear(&mut self, page: usize) {
        if page < Self::CAPACITY {
            self.words[page / WORD_BITS] &= !(1 << (page % WORD_BITS));
        }
    }

    #[must_use]
    pub fn is_set(&self, page: usize) -> bool {
        page < Self::CAPACITY && (self.words[page / WORD_BITS] >> (page % WORD_BITS)) & 1 == 1
    }

    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    /// Invert every bit in place.
    pub fn bitwise_not(&mut self) {
        for word in &mut self.words {
            *word = !*word;
        }
    }

    pub fn set_range(&mut self, first: usize, last: usize) {
        for page in first..last.min(Self::CAPACITY) {
            self.set_mask(page);
        }
    }

    pub fn clear_range(&mut self, first: usize, last: usize) {
        for page in first..last.min(Self::CAPACITY) {
            self.clear(page);
        }
    }

    #[must_use]
    pub fn is_any_set(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    /// Whether any page in `[first, last)` is set.
    #[must_use]
    pub fn any_in(&self, first: usize, last: usize) -> bool {
        Self::bitwise_and(self, &Self::range_mask(first, last)).is_any_set()
    }

    /// Whether every page in `[first, last)` is set.
    #[must_use]
    pub fn all_in(&self, first: usize, last: usize) -> bool {
        (first..last.min(Self::CAPACITY)).all(|p| self.is_set(p))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn first_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * WORD_BITS + w.trailing_zeros() as usize)
    }

    #[must_use]
    pub fn last_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros() as usize))
    }

    /// Contiguous runs `[start, end)` of set pages below `limit`.
    #[must_use]
    pub fn runs(&self, limit: usize) -> Runs<'_> {
        Runs {
            state: self,
            next: 0,
            limit: limit.min(Self::CAPACITY),
        }
    }
}

/// Iterator over contiguous runs of set pages.
pub struct Runs<'a> {
    state: &'a PageState,
    next: usize,
    limit: usize,
}

impl Iterator for Runs<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let mut page = self.next;
        while page < self.limit && !self.state.is_set(page) {
            page += 1;
        }
        if page >= self.limit {
            self.next = self.limit;
            return None;
        }
        let start = page;
        while page < self.limit && self.state.is_set(page) {
            page += 1;
        }
        self.next = page;
        Some((start, page))
    }
}

impl BitAnd for PageState {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self::bitwise_and(&self, &rhs)
    }
}

impl BitOr for PageState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::union(&self, &rhs)
    }
}

impl Not for PageState {
    type Output = Self;

    fn not(mut self) -> Self {
        self.bitwise_not();
        self
    }
}

impl fmt::Debug for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageState(")?;
        for word in self.words.iter().rev() {
            write!(f, "{word:016x}")?;
        }
        write!(f, ")")
    }
}
