//! Control block: per-page metadata, the block state machine, and the
//! page image it owns.
//!
//! A [`ControlBlock`] is one slot of the pool's chunk arena. It carries
//! two synchronization layers of its own, below the pool-wide mutex:
//! - a mutex over [`BlockMeta`] (state, io fix, pin count, clocks), and
//! - a reader-writer latch over the [`PageImage`] (frame content).
//!
//! # Lock discipline
//! The pool mutex is acquired before a block mutex, and a block mutex
//! before the latch, but only for *try* acquisitions. Nothing blocks on
//! the latch while holding a mutex: blocking latch acquisition always
//! happens after both mutexes are released, and the completion/eviction
//! paths that take a mutex while holding the latch treat the mutex as a
//! leaf lock with bounded hold time.
//!
//! # The IoFix gate
//! While a read is in flight (`IoFix::Read`) no caller may latch the
//! block; blocking callers park on the block's condvar and are woken by
//! the completion path, non-blocking callers fail immediately. The
//! completion path then takes the write latch itself, uncontended by
//! construction.

use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, MutexGuard, RawRwLock, RwLock};

use crate::codec::ZipImage;
use crate::common::{BlockId, Lsn, PageId};
use crate::page::Frame;

/// Owned shared latch guard over a block's page image.
pub type ImageReadGuard = ArcRwLockReadGuard<RawRwLock, PageImage>;
/// Owned exclusive latch guard over a block's page image.
pub type ImageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageImage>;

/// The block state machine.
///
/// `NotUsed -> FilePage -> RemoveHash -> NotUsed`; a block leaves
/// `FilePage` only through eviction (or read abort), and `RemoveHash` is
/// the window where the block is unhashed but not yet reusable because
/// late pins are still draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    /// On the free list (or transitioning there); owns no page.
    #[default]
    NotUsed,
    /// Holds a page and is reachable through the page hash.
    FilePage,
    /// Mid-eviction: unhashed, waiting for the last pin to drain.
    RemoveHash,
}

/// In-flight I/O marker, orthogonal to [`BlockState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoFix {
    #[default]
    None,
    Read,
    Write,
}

/// Which flush queue an in-flight write was issued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushType {
    /// Flush-list order (checkpoint-driven).
    #[default]
    List,
    /// LRU-tail flush making room for replacement.
    Lru,
}

/// The page bytes a control block owns, in one of three shapes.
///
/// The compressed image is *relocated* between blocks, never copied;
/// [`PageImage::demote`] and [`PageImage::take_zip`] are the only
/// transitions that move it, and each frame freed by one is either kept
/// in place or handed to the pool's spare cache.
pub enum PageImage {
    /// No page: parks the block's frame between uses.
    Free(Frame),
    /// Uncompressed page resident in the frame, optionally paired with
    /// its compressed image.
    Resident {
        frame: Frame,
        zip: Option<ZipImage>,
    },
    /// Only the compressed image is in memory.
    CompressedOnly { zip: ZipImage },
    /// Transient placeholder while a transition is in progress; never
    /// observable outside this type's own methods.
    Vacant,
}

impl PageImage {
    #[inline]
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            PageImage::Free(frame) | PageImage::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }

    #[inline]
    pub fn frame_mut(&mut self) -> Option<&mut Frame> {
        match self {
            PageImage::Free(frame) | PageImage::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }

    #[inline]
    pub fn zip(&self) -> Option<&ZipImage> {
        match self {
            PageImage::Resident { zip, .. } => zip.as_ref(),
            PageImage::CompressedOnly { zip } => Some(zip),
            _ => None,
        }
    }

    #[inline]
    pub fn zip_mut(&mut self) -> Option<&mut ZipImage> {
        match self {
            PageImage::Resident { zip, .. } => zip.as_mut(),
            PageImage::CompressedOnly { zip } => Some(zip),
            _ => None,
        }
    }

    #[inline]
    pub fn is_compressed_only(&self) -> bool {
        matches!(self, PageImage::CompressedOnly { .. })
    }

    /// Begin residency on a free block, optionally with a compressed
    /// image buffer the read will fill. Returns false if the block was
    /// not free.
    pub fn start_resident(&mut self, zip: Option<ZipImage>) -> bool {
        match std::mem::replace(self, PageImage::Vacant) {
            PageImage::Free(frame) => {
                *self = PageImage::Resident { frame, zip };
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// Demote a resident page that still holds its compressed image,
    /// returning the freed frame for the pool's spare cache.
    pub fn demote(&mut self) -> Option<Frame> {
        match std::mem::replace(self, PageImage::Vacant) {
            PageImage::Resident {
                frame,
                zip: Some(zip),
            } => {
                *self = PageImage::CompressedOnly { zip };
                Some(frame)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    /// Take the compressed image out of a compressed-only block, parking
    /// `spare` as the block's frame. This is the donor half of the
    /// promote transition; [`PageImage::start_resident`] on the target
    /// block is the other half. A block in any other shape refuses and
    /// hands the spare frame back.
    pub fn take_zip(&mut self, spare: Frame) -> Result<ZipImage, Frame> {
        match std::mem::replace(self, PageImage::Vacant) {
            PageImage::CompressedOnly { zip } => {
                *self = PageImage::Free(spare);
                Ok(zip)
            }
            other => {
                *self = other;
                Err(spare)
            }
        }
    }

    /// Reset to the free shape after eviction, returning any compressed
    /// image for the zip allocator. `spare` supplies a frame when the
    /// image did not contain one.
    pub fn reset(&mut self, spare: impl FnOnce() -> Frame) -> Option<ZipImage> {
        match std::mem::replace(self, PageImage::Vacant) {
            PageImage::Free(frame) => {
                *self = PageImage::Free(frame);
                None
            }
            PageImage::Resident { frame, zip } => {
                *self = PageImage::Free(frame);
                zip
            }
            PageImage::CompressedOnly { zip } => {
                *self = PageImage::Free(spare());
                Some(zip)
            }
            PageImage::Vacant => {
                *self = PageImage::Free(spare());
                None
            }
        }
    }
}

/// A control block's own fields, guarded by its mutex.
#[derive(Debug)]
pub struct BlockMeta {
    /// The page this block holds; INVALID while `NotUsed`.
    pub page_id: PageId,
    pub state: BlockState,
    pub io_fix: IoFix,
    /// Reference count preventing eviction while in use.
    pub pin_count: u32,
    /// Set at first access after residency; drives read-ahead and the
    /// hit statistics.
    pub accessed: bool,
    /// Compressed size class of the on-disk page; 0 = uncompressed.
    pub size_class: u8,
    /// Mirrors whether the image is in compressed-only form, so state
    /// checks need not touch the latch. Maintained by the pool together
    /// with the image transitions.
    pub compressed_only: bool,
    /// LSN of the most recent modification.
    pub newest_modification: Lsn,
    /// LSN of the first unflushed modification; 0 = clean.
    pub oldest_modification: Lsn,
    /// Watermark recorded when a write was issued: modifications beyond
    /// it happened during the write and keep the page dirty.
    pub flush_lsn: Lsn,
    pub flush_type: FlushType,
    /// Pool `freed_page_clock` value when this block was last moved to
    /// the LRU head. Read without synchronization is fine: it only feeds
    /// the make-young heuristic.
    pub freed_page_clock: u64,
    /// Pool access clock stamp from the block's first touch.
    pub access_stamp: u64,
    /// Bumped whenever frame content may have been structurally altered;
    /// optimistic callers revalidate against it.
    pub modify_clock: u64,
}

impl BlockMeta {
    fn new() -> Self {
        Self {
            page_id: PageId::INVALID,
            state: BlockState::NotUsed,
            io_fix: IoFix::None,
            pin_count: 0,
            accessed: false,
            size_class: 0,
            compressed_only: false,
            newest_modification: 0,
            oldest_modification: 0,
            flush_lsn: 0,
            flush_type: FlushType::List,
            freed_page_clock: 0,
            access_stamp: 0,
            modify_clock: 0,
        }
    }

    /// Whether the page has unflushed modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.oldest_modification != 0
    }

    /// Clear everything page-specific after eviction.
    ///
    /// The modify clock is bumped, not reset: an optimistic caller still
    /// holding a pointer to this block must see a different clock after
    /// the block is reused.
    pub fn reset_evicted(&mut self) {
        self.page_id = PageId::INVALID;
        self.state = BlockState::NotUsed;
        self.io_fix = IoFix::None;
        self.accessed = false;
        self.size_class = 0;
        self.compressed_only = false;
        self.newest_modification = 0;
        self.oldest_modification = 0;
        self.flush_lsn = 0;
        self.access_stamp = 0;
        self.modify_clock += 1;
    }
}

/// One slot of the pool's block arena.
pub struct ControlBlock {
    id: BlockId,
    meta: Mutex<BlockMeta>,
    /// Parked waiters for the IoFix read gate, woken by io_complete.
    io_wait: Condvar,
    latch: Arc<RwLock<PageImage>>,
}

impl ControlBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            meta: Mutex::new(BlockMeta::new()),
            io_wait: Condvar::new(),
            latch: Arc::new(RwLock::new(PageImage::Free(Frame::new()))),
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Lock the block's own fields.
    #[inline]
    pub fn meta(&self) -> MutexGuard<'_, BlockMeta> {
        self.meta.lock()
    }

    // ========================================================================
    // Latch (frame content)
    // ========================================================================

    /// Blocking shared latch. Guards are owned so they can outlive any
    /// borrow of the pool.
    #[inline]
    pub fn latch_shared(&self) -> ImageReadGuard {
        self.latch.read_arc()
    }

    /// Blocking exclusive latch.
    #[inline]
    pub fn latch_exclusive(&self) -> ImageWriteGuard {
        self.latch.write_arc()
    }

    #[inline]
    pub fn try_latch_shared(&self) -> Option<ImageReadGuard> {
        self.latch.try_read_arc()
    }

    #[inline]
    pub fn try_latch_exclusive(&self) -> Option<ImageWriteGuard> {
        self.latch.try_write_arc()
    }

    // ========================================================================
    // IoFix gate
    // ========================================================================

    /// Park until any in-flight read on this block has completed or
    /// aborted.
    pub fn wait_read_clear(&self) {
        let mut meta = self.meta.lock();
        while meta.io_fix == IoFix::Read {
            self.io_wait.wait(&mut meta);
        }
    }

    /// Wake every caller parked on the read gate.
    #[inline]
    pub fn notify_io_waiters(&self) {
        self.io_wait.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::zip_size;

    fn test_zip() -> ZipImage {
        let len = zip_size(2).unwrap();
        ZipImage::from_disk(&vec![0u8; len], 2).unwrap()
    }

    #[test]
    fn test_new_block_is_not_used() {
        let block = ControlBlock::new(BlockId::new(3));
        let meta = block.meta();
        assert_eq!(meta.state, BlockState::NotUsed);
        assert_eq!(meta.io_fix, IoFix::None);
        assert_eq!(meta.pin_count, 0);
        assert_eq!(meta.page_id, PageId::INVALID);
        drop(meta);

        let img = block.latch_shared();
        assert!(img.frame().is_some());
        assert!(img.zip().is_none());
    }

    #[test]
    fn test_image_start_resident() {
        let mut img = PageImage::Free(Frame::new());
        assert!(img.start_resident(None));
        assert!(img.frame().is_some());
        // Already resident: refused, image unchanged.
        assert!(!img.start_resident(None));
    }

    #[test]
    fn test_image_demote_and_take_zip() {
        let mut img = PageImage::Free(Frame::new());
        img.start_resident(Some(test_zip()));

        let freed = img.demote().expect("resident with zip demotes");
        assert_eq!(freed.as_slice().len(), Frame::size());
        assert!(img.is_compressed_only());

        // Demoting twice is a no-op.
        assert!(img.demote().is_none());

        let zip = img.take_zip(freed).ok().expect("compressed-only donates zip");
        assert_eq!(zip.size_class(), 2);
        assert!(img.frame().is_some());
        assert!(!img.is_compressed_only());

        // A free image refuses and returns the spare.
        assert!(img.take_zip(Frame::new()).is_err());
    }

    #[test]
    fn test_image_demote_without_zip_refused() {
        let mut img = PageImage::Free(Frame::new());
        img.start_resident(None);
        assert!(img.demote().is_none());
        assert!(img.frame().is_some());
    }

    #[test]
    fn test_image_reset_returns_zip() {
        let mut img = PageImage::Free(Frame::new());
        img.start_resident(Some(test_zip()));
        let zip = img.reset(Frame::new);
        assert!(zip.is_some());
        assert!(matches!(img, PageImage::Free(_)));

        // Resetting a compressed-only image draws the spare frame.
        let mut img = PageImage::CompressedOnly { zip: test_zip() };
        let zip = img.reset(Frame::new);
        assert!(zip.is_some());
        assert!(img.frame().is_some());
    }

    #[test]
    fn test_meta_reset_bumps_modify_clock() {
        let block = ControlBlock::new(BlockId::new(0));
        let mut meta = block.meta();
        meta.page_id = PageId::new(1, 2);
        meta.state = BlockState::FilePage;
        meta.modify_clock = 7;
        meta.reset_evicted();

        assert_eq!(meta.state, BlockState::NotUsed);
        assert_eq!(meta.page_id, PageId::INVALID);
        assert_eq!(meta.modify_clock, 8);
    }

    #[test]
    fn test_read_gate_wakes_waiters() {
        use std::sync::Arc;
        use std::thread;

        let block = Arc::new(ControlBlock::new(BlockId::new(1)));
        block.meta().io_fix = IoFix::Read;

        let waiter = {
            let block = Arc::clone(&block);
            thread::spawn(move || {
                block.wait_read_clear();
                assert_eq!(block.meta().io_fix, IoFix::None);
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        block.meta().io_fix = IoFix::None;
        block.notify_io_waiters();
        waiter.join().unwrap();
    }

    #[test]
    fn test_try_latch_contention() {
        let block = ControlBlock::new(BlockId::new(2));
        let shared = block.latch_shared();
        // Shared latches coexist; exclusive is refused while one is held.
        assert!(block.try_latch_shared().is_some());
        assert!(block.try_latch_exclusive().is_none());
        drop(shared);
        assert!(block.try_latch_exclusive().is_some());
    }
}
