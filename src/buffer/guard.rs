//! RAII page guards and the mini-transaction context.
//!
//! Every successful acquisition returns a [`PageGuard`] that pairs the
//! pin with the latch: both are released on every exit path, including
//! early returns and panics, so a pin can never leak. The caller's
//! [`Mtr`] records each registered latch and observes the open count
//! drain back to zero as guards drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buffer::block::{ControlBlock, ImageReadGuard, ImageWriteGuard, PageImage};
use crate::buffer::pool::BufferPool;
use crate::common::{Lsn, PageId};

/// How the caller wants the frame content latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
    /// Pin only; the guard gives no access to the frame bytes.
    None,
}

/// How far `get` is allowed to go to produce the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Read from disk on a miss and block on the latch.
    Normal,
    /// Fail with `NotFound` instead of issuing a read.
    OnlyIfCached,
    /// Like `Normal` but acquire no latch; waits out an in-flight read.
    NoLatch,
    /// Fail with `WouldBlock` instead of blocking on the latch.
    NoWait,
}

/// LRU treatment for `get_known_nowait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownMode {
    /// Leave the block's LRU position alone.
    KeepOld,
    /// Apply the make-young promotion rule.
    MakeYoung,
}

/// Mini-transaction context.
///
/// Acquisitions register their latch here so release is guaranteed and
/// observable: `open_latches` returns to zero once every guard created
/// under this context has dropped.
#[derive(Debug)]
pub struct Mtr {
    open: Arc<AtomicUsize>,
    registered: usize,
}

impl Mtr {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicUsize::new(0)),
            registered: 0,
        }
    }

    pub(crate) fn register(&mut self) -> Arc<AtomicUsize> {
        self.registered += 1;
        self.open.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.open)
    }

    /// Latches registered through this context that are still held.
    pub fn open_latches(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    /// Total acquisitions registered over the context's lifetime.
    pub fn total_registered(&self) -> usize {
        self.registered
    }
}

impl Default for Mtr {
    fn default() -> Self {
        Self::new()
    }
}

/// The latch half of a guard.
pub(crate) enum LatchGuard {
    None,
    Shared(ImageReadGuard),
    Exclusive(ImageWriteGuard),
}

/// A pinned page.
///
/// Holds the pin and (unless acquired latch-free) the content latch.
/// Dropping the guard releases the latch, bumps the modify clock after
/// exclusive access, and unpins the block.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    block: Arc<ControlBlock>,
    page_id: PageId,
    latch: LatchGuard,
    mtr_open: Arc<AtomicUsize>,
}

impl<'a> PageGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPool,
        block: Arc<ControlBlock>,
        page_id: PageId,
        latch: LatchGuard,
        mtr_open: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            pool,
            block,
            page_id,
            latch,
            mtr_open,
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The underlying control block, e.g. for a later optimistic retry.
    #[inline]
    pub fn block(&self) -> &Arc<ControlBlock> {
        &self.block
    }

    /// Current modify clock, for optimistic revalidation after release.
    #[inline]
    pub fn modify_clock(&self) -> u64 {
        self.block.meta().modify_clock
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        matches!(self.latch, LatchGuard::Exclusive(_))
    }

    /// The latched page image.
    ///
    /// # Panics
    /// Panics if the guard was acquired latch-free; such a guard only
    /// keeps the page pinned.
    pub fn image(&self) -> &PageImage {
        match &self.latch {
            LatchGuard::Shared(g) => g,
            LatchGuard::Exclusive(g) => g,
            LatchGuard::None => panic!("page {} held without a latch", self.page_id),
        }
    }

    /// Mutable access to the latched page image.
    ///
    /// # Panics
    /// Panics unless the guard holds the exclusive latch.
    pub fn image_mut(&mut self) -> &mut PageImage {
        match &mut self.latch {
            LatchGuard::Exclusive(g) => g,
            _ => panic!("page {} not latched exclusively", self.page_id),
        }
    }

    /// The uncompressed page bytes.
    pub fn data(&self) -> &[u8] {
        match self.image().frame() {
            Some(frame) => frame.as_slice(),
            None => panic!("page {} has no resident frame", self.page_id),
        }
    }

    /// Mutable page bytes; requires the exclusive latch.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let id = self.page_id;
        match self.image_mut().frame_mut() {
            Some(frame) => frame.as_mut_slice(),
            None => panic!("page {} has no resident frame", id),
        }
    }

    /// Record a modification at `lsn`: updates the block's modification
    /// LSNs and enters it into the flush list if it was clean.
    ///
    /// Call while holding the exclusive latch, after editing the frame.
    pub fn set_modified(&self, lsn: Lsn) {
        debug_assert!(self.is_exclusive(), "modification without exclusive latch");
        self.pool.mark_modified(&self.block, lsn);
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        if matches!(self.latch, LatchGuard::Exclusive(_)) {
            // Content may have been structurally altered; invalidate
            // optimistic callers before the latch is released.
            self.block.meta().modify_clock += 1;
        }
        self.latch = LatchGuard::None;
        self.pool.unpin(&self.block);
        self.mtr_open.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtr_counts_registrations() {
        let mut mtr = Mtr::new();
        assert_eq!(mtr.open_latches(), 0);

        let a = mtr.register();
        let b = mtr.register();
        assert_eq!(mtr.open_latches(), 2);
        assert_eq!(mtr.total_registered(), 2);

        a.fetch_sub(1, Ordering::Relaxed);
        b.fetch_sub(1, Ordering::Relaxed);
        assert_eq!(mtr.open_latches(), 0);
        assert_eq!(mtr.total_registered(), 2);
    }
}
