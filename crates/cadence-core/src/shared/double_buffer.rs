//! Write-inactive-then-flip double buffer
//!
//! A writer fills the buffer that is *not* active, then flips the index.
//! A reader always sees a complete buffer, at the cost of at most one
//! update of staleness. Used for control-op buffers, for a program's two
//! slots, and for history packs.
//!
//! Where the flip index lives is pluggable through [`FlipIndex`]: a private
//! atomic by default, or a slot inside a shared-memory record.

use std::sync::atomic::{AtomicU32, Ordering};

/// Storage for the active-buffer index
pub trait FlipIndex {
    /// Currently active buffer (0 or 1)
    fn load(&self) -> usize;

    /// Make `index` the active buffer
    fn store(&self, index: usize);
}

impl FlipIndex for AtomicU32 {
    #[inline]
    fn load(&self) -> usize {
        (AtomicU32::load(self, Ordering::Acquire) & 1) as usize
    }

    #[inline]
    fn store(&self, index: usize) {
        AtomicU32::store(self, (index & 1) as u32, Ordering::Release);
    }
}

/// Two buffers plus an active index
pub struct DoubleBuffer<T, I: FlipIndex = AtomicU32> {
    buffers: [T; 2],
    index: I,
}

impl<T> DoubleBuffer<T, AtomicU32> {
    /// Buffer 0 starts active
    pub fn new(first: T, second: T) -> Self {
        Self::with_index(first, second, AtomicU32::new(0))
    }
}

impl<T: Default> Default for DoubleBuffer<T, AtomicU32> {
    fn default() -> Self {
        Self::new(T::default(), T::default())
    }
}

impl<T, I: FlipIndex> DoubleBuffer<T, I> {
    pub fn with_index(first: T, second: T, index: I) -> Self {
        Self {
            buffers: [first, second],
            index,
        }
    }

    #[inline]
    pub fn active_index(&self) -> usize {
        self.index.load()
    }

    #[inline]
    pub fn inactive_index(&self) -> usize {
        self.active_index() ^ 1
    }

    #[inline]
    pub fn active(&self) -> &T {
        &self.buffers[self.active_index()]
    }

    #[inline]
    pub fn inactive(&self) -> &T {
        &self.buffers[self.inactive_index()]
    }

    #[inline]
    pub fn get(&self, index: usize) -> &T {
        &self.buffers[index & 1]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        &mut self.buffers[index & 1]
    }

    /// Both buffers, in index order
    pub fn both(&self) -> &[T; 2] {
        &self.buffers
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// Make `index` active without touching either buffer
    #[inline]
    pub fn set_active(&self, index: usize) {
        self.index.store(index & 1);
    }

    /// Activate the inactive buffer; returns the new active index
    #[inline]
    pub fn flip(&self) -> usize {
        let next = self.inactive_index();
        self.index.store(next);
        next
    }

    /// Write into the inactive buffer, then flip to it
    pub fn write_inactive<R>(&mut self, write: impl FnOnce(&mut T) -> R) -> R {
        let i = self.inactive_index();
        let result = write(&mut self.buffers[i]);
        self.index.store(i);
        result
    }
}
