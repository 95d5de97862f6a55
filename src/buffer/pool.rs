//! The buffer pool: page hash, replacement lists, and the acquisition
//! API.
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         BufferPool                           │
//! │  ┌─────────────────────── inner (pool mutex) ────────────┐   │
//! │  │ page_hash: PageId → BlockId    chunks: Vec<Chunk>     │   │
//! │  │ lru (midpoint)   free: Vec     flush_list             │   │
//! │  │ spare_frames     freed_page_clock / access_clock      │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! │  ┌────────────┐ ┌──────────┐ ┌───────────┐ ┌────────────┐   │
//! │  │ IoDriver   │ │ RedoLog  │ │ChangeBuf. │ │ ZipAlloc   │   │
//! │  └────────────┘ └──────────┘ └───────────┘ └────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lock hierarchy
//! Pool mutex → block mutex → block latch, with two hard rules:
//! - the pool mutex is never held across I/O, and
//! - nothing *blocks* on a latch while holding either mutex; every
//!   latch acquisition under a mutex is a try that skips or retries on
//!   failure. Blocking latch acquisition happens with no locks held.
//!
//! Reads in flight are gated by `IoFix::Read`: callers park on the
//! block's condvar instead of touching the latch, and the completion
//! path takes the write latch itself (uncontended by construction),
//! fills the frame, then wakes the waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::block::{BlockState, ControlBlock, FlushType, IoFix, PageImage};
use crate::buffer::chunk::Chunk;
use crate::buffer::guard::{FetchMode, KnownMode, LatchGuard, LatchMode, Mtr, PageGuard};
use crate::buffer::lists::{BlockList, LruList};
use crate::buffer::read_ahead;
use crate::buffer::stats::PoolStats;
use crate::codec::{self, ZipImage};
use crate::common::config::zip_size;
use crate::common::{BlockId, Error, Lsn, PageId, PoolConfig, Result};
use crate::io::{Collaborators, FlushRequest, IoDriver};
use crate::page::{checksum, layout, Frame};

/// Attempts to find or make a free block before giving up.
const FREE_BLOCK_ATTEMPTS: usize = 8;

/// Drain attempts per retiring chunk before a shrink gives up.
const SHRINK_ATTEMPTS: usize = 100;

/// Everything the pool mutex protects.
struct PoolInner {
    chunks: Vec<Chunk>,
    /// Next chunk base; monotonic, never reused.
    next_base: u32,
    page_hash: HashMap<PageId, BlockId>,
    lru: LruList,
    free: Vec<BlockId>,
    /// Dirty blocks ordered by oldest modification, most urgent at the
    /// tail.
    flush_list: BlockList,
    /// Frames freed by compressed-only demotion, drawn by promotion.
    spare_frames: Vec<Frame>,
    /// Bumped per eviction; drives the make-young staleness rule.
    freed_page_clock: u64,
    /// Bumped per first touch; stamped into the touched block.
    access_clock: u64,
    /// Base of a chunk being shrunk. It supplies no free blocks and its
    /// evicted blocks are not handed out.
    retiring: Option<u32>,
}

impl PoolInner {
    fn block(&self, id: BlockId) -> Option<Arc<ControlBlock>> {
        self.chunks
            .iter()
            .find(|c| c.contains(id))
            .and_then(|c| c.block(id))
            .cloned()
    }

    fn capacity(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    fn is_retiring(&self, id: BlockId) -> bool {
        match self.retiring {
            Some(base) => self
                .chunks
                .iter()
                .find(|c| c.base() == base)
                .map(|c| c.contains(id))
                .unwrap_or(false),
            None => false,
        }
    }
}

/// A fixed-capacity cache of tablespace pages.
///
/// Explicitly instantiated and passed around; there is no global pool.
/// All acquisition goes through [`BufferPool::get`] and friends, which
/// return a [`PageGuard`] pairing the pin with the latch.
pub struct BufferPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    driver: Arc<dyn IoDriver>,
    collab: Collaborators,
    stats: PoolStats,
    /// Reads issued but not yet completed.
    n_pend_reads: AtomicU64,
    /// In-flight writes per flush type.
    n_flush_list: AtomicU64,
    n_flush_lru: AtomicU64,
}

impl BufferPool {
    /// Create a pool with default (no-op) collaborators.
    ///
    /// # Panics
    /// Panics if the configured capacity or chunk capacity is 0.
    pub fn new(config: PoolConfig, driver: Arc<dyn IoDriver>) -> Self {
        Self::with_collaborators(config, driver, Collaborators::default())
    }

    /// Create a pool wired to explicit collaborators.
    pub fn with_collaborators(
        config: PoolConfig,
        driver: Arc<dyn IoDriver>,
        collab: Collaborators,
    ) -> Self {
        assert!(config.capacity > 0, "pool capacity must be > 0");
        assert!(config.chunk_capacity > 0, "chunk capacity must be > 0");

        let mut chunks = Vec::new();
        let mut free = Vec::new();
        let mut next_base = 0u32;
        let mut remaining = config.capacity;
        while remaining > 0 {
            let n = remaining.min(config.chunk_capacity);
            let chunk = Chunk::new(next_base, n);
            free.extend((0..n as u32).map(|i| BlockId::new(next_base + i)));
            next_base += n as u32;
            remaining -= n;
            chunks.push(chunk);
        }
        // Pop order: lowest handles first.
        free.reverse();

        info!(
            capacity = config.capacity,
            chunks = chunks.len(),
            "buffer pool created"
        );

        Self {
            inner: Mutex::new(PoolInner {
                chunks,
                next_base,
                page_hash: HashMap::new(),
                lru: LruList::new(config.old_ratio_pct),
                free,
                flush_list: BlockList::new(),
                spare_frames: Vec::new(),
                freed_page_clock: 0,
                access_clock: 0,
                retiring: None,
            }),
            config,
            driver,
            collab,
            stats: PoolStats::new(),
            n_pend_reads: AtomicU64::new(0),
            n_flush_list: AtomicU64::new(0),
            n_flush_lru: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Total block capacity across all chunks.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Blocks currently on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Pages currently reachable through the page hash.
    pub fn resident_count(&self) -> usize {
        self.inner.lock().page_hash.len()
    }

    /// Blocks on the LRU list.
    pub fn lru_len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Dirty blocks on the flush list.
    pub fn flush_list_len(&self) -> usize {
        self.inner.lock().flush_list.len()
    }

    /// Reads issued but not yet completed.
    pub fn pending_reads(&self) -> u64 {
        self.n_pend_reads.load(Ordering::Relaxed)
    }

    /// The page id at the LRU head, for tests and diagnostics.
    pub fn lru_head_page(&self) -> Option<PageId> {
        let inner = self.inner.lock();
        let bid = inner.lru.head()?;
        let block = inner.block(bid)?;
        let meta = block.meta();
        Some(meta.page_id)
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    /// Acquire a page, reading it from the tablespace on a miss.
    ///
    /// `hint` short-circuits the hash lookup when the caller cached the
    /// block from an earlier acquisition; it is revalidated and ignored
    /// if stale. See [`FetchMode`] for the miss/latch policies.
    ///
    /// # Errors
    /// - `NotFound` for `OnlyIfCached` misses and unreadable pages
    /// - `WouldBlock` when `NoWait` cannot latch immediately
    /// - `PageCorrupted` when the read fails validation (below the
    ///   force-recovery level)
    pub fn get(
        &self,
        id: PageId,
        latch: LatchMode,
        hint: Option<&Arc<ControlBlock>>,
        mode: FetchMode,
        mtr: &mut Mtr,
    ) -> Result<PageGuard<'_>> {
        let mut hint = hint.cloned();
        let mut missed = false;

        loop {
            let block = match self.lookup(id, hint.take()) {
                Some(b) => b,
                None => {
                    if mode == FetchMode::OnlyIfCached {
                        return Err(Error::NotFound(id));
                    }
                    if !missed {
                        missed = true;
                        self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    }
                    self.read_page(id)?;
                    continue;
                }
            };

            // Pin and LRU bookkeeping under pool mutex + block mutex.
            let first_touch;
            {
                let mut inner = self.inner.lock();
                let mut meta = block.meta();
                if meta.state != BlockState::FilePage || meta.page_id != id {
                    continue; // raced with eviction; retry
                }
                if meta.compressed_only {
                    drop(meta);
                    drop(inner);
                    self.ensure_resident(id, &block)?;
                    continue;
                }
                if meta.io_fix == IoFix::Read && mode == FetchMode::NoWait {
                    return Err(Error::WouldBlock(id));
                }

                meta.pin_count += 1;
                first_touch = !meta.accessed;
                if first_touch {
                    meta.accessed = true;
                    inner.access_clock += 1;
                    meta.access_stamp = inner.access_clock;
                }
                if Self::stale_enough(&inner, meta.freed_page_clock) {
                    inner.lru.make_young(block.id());
                    meta.freed_page_clock = inner.freed_page_clock;
                }
            }

            // Latch stage: no locks held, so blocking here is safe.
            let latch_guard = match self.latch_for(&block, latch, mode) {
                Some(g) => g,
                None => {
                    self.unpin(&block);
                    return Err(Error::WouldBlock(id));
                }
            };

            // An aborted read unhashes the block while we were parked.
            {
                let meta = block.meta();
                if meta.state != BlockState::FilePage || meta.page_id != id {
                    drop(meta);
                    drop(latch_guard);
                    self.unpin(&block);
                    continue;
                }
            }

            if !missed {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
            }

            let guard = PageGuard::new(self, Arc::clone(&block), id, latch_guard, mtr.register());

            if first_touch && mode == FetchMode::Normal {
                self.linear_read_ahead(id);
            }
            return Ok(guard);
        }
    }

    /// Revalidate a block pointer cached outside the pool.
    ///
    /// Fails (`WouldBlock`) if the block no longer holds a page, the
    /// non-blocking latch attempt fails, or the modify clock moved;
    /// the caller falls back to [`BufferPool::get`].
    pub fn optimistic_get(
        &self,
        block: &Arc<ControlBlock>,
        latch: LatchMode,
        modify_clock: u64,
        mtr: &mut Mtr,
    ) -> Result<PageGuard<'_>> {
        let latch_guard = match latch {
            LatchMode::Shared => block.try_latch_shared().map(LatchGuard::Shared),
            LatchMode::Exclusive => block.try_latch_exclusive().map(LatchGuard::Exclusive),
            LatchMode::None => Some(LatchGuard::None),
        };
        let Some(latch_guard) = latch_guard else {
            return Err(Error::WouldBlock(block.meta().page_id));
        };

        let id = {
            let mut meta = block.meta();
            if meta.state != BlockState::FilePage
                || meta.io_fix != IoFix::None
                || meta.compressed_only
                || meta.modify_clock != modify_clock
            {
                return Err(Error::WouldBlock(meta.page_id));
            }
            meta.pin_count += 1;
            meta.accessed = true;
            meta.page_id
        };

        self.make_young(block);
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Ok(PageGuard::new(
            self,
            Arc::clone(block),
            id,
            latch_guard,
            mtr.register(),
        ))
    }

    /// Acquire a block already known to be resident, skipping the hash.
    ///
    /// Fails (`WouldBlock`) when the block is mid-eviction, has a read
    /// in flight, or the try-latch fails.
    pub fn get_known_nowait(
        &self,
        block: &Arc<ControlBlock>,
        latch: LatchMode,
        mode: KnownMode,
        mtr: &mut Mtr,
    ) -> Result<PageGuard<'_>> {
        let id = {
            let mut meta = block.meta();
            if meta.state != BlockState::FilePage
                || meta.compressed_only
                || meta.io_fix == IoFix::Read
            {
                return Err(Error::WouldBlock(meta.page_id));
            }
            meta.pin_count += 1;
            meta.accessed = true;
            meta.page_id
        };

        let latch_guard = match latch {
            LatchMode::Shared => block.try_latch_shared().map(LatchGuard::Shared),
            LatchMode::Exclusive => block.try_latch_exclusive().map(LatchGuard::Exclusive),
            LatchMode::None => Some(LatchGuard::None),
        };
        let Some(latch_guard) = latch_guard else {
            self.unpin(block);
            return Err(Error::WouldBlock(id));
        };

        if mode == KnownMode::MakeYoung {
            let mut inner = self.inner.lock();
            let mut meta = block.meta();
            inner.lru.make_young(block.id());
            meta.freed_page_clock = inner.freed_page_clock;
        }

        Ok(PageGuard::new(
            self,
            Arc::clone(block),
            id,
            latch_guard,
            mtr.register(),
        ))
    }

    /// Prepare a block to receive an asynchronous page read.
    ///
    /// Returns the block to hand to the I/O driver, or `None` when no
    /// read is needed: the page is already hashed (someone else got
    /// there first) or was resident compressed-only and has been
    /// promoted in place.
    ///
    /// While the read is in flight the block is hashed with
    /// `IoFix::Read` set, which keeps every caller off the latch on the
    /// I/O thread's behalf.
    ///
    /// # Errors
    /// - `TablespaceDeleted` when `tablespace_version` is stale
    /// - `NoFreeBlocks` when no block can be freed for the page
    pub fn init_for_read(
        &self,
        id: PageId,
        size_class: u8,
        tablespace_version: u64,
    ) -> Result<Option<Arc<ControlBlock>>> {
        if self.driver.tablespace_version(id.space_id) != tablespace_version {
            return Err(Error::TablespaceDeleted(id.space_id));
        }

        // A compressed read lands in its own buffer; allocate before any
        // lock (a real buddy allocator may itself evict pool pages).
        let zip = match zip_size(size_class) {
            Some(len) => {
                let buf = self
                    .collab
                    .zip_alloc
                    .alloc(len, true)
                    .ok_or(Error::NoFreeBlocks)?;
                Some(ZipImage::from_parts(buf, size_class, 0, 0, 0))
            }
            None => None,
        };

        // Already hashed? Promote a compressed-only image, otherwise the
        // page is resident or being read by someone else.
        let compressed_only = {
            let inner = self.inner.lock();
            match inner.page_hash.get(&id).and_then(|&bid| inner.block(bid)) {
                Some(block) => Some(block.meta().compressed_only),
                None => None,
            }
        };
        if let Some(compressed_only) = compressed_only {
            if let Some(zip) = zip {
                self.collab.zip_alloc.free(zip.into_data());
            }
            if compressed_only {
                self.promote(id)?;
            }
            return Ok(None);
        }

        let free_id = self.get_free_block()?;
        let block = {
            let mut inner = self.inner.lock();
            if inner.page_hash.contains_key(&id) {
                // Lost the race; give everything back.
                inner.free.push(free_id);
                drop(inner);
                if let Some(zip) = zip {
                    self.collab.zip_alloc.free(zip.into_data());
                }
                return Ok(None);
            }
            let block = match inner.block(free_id) {
                Some(b) => b,
                None => return Err(Error::Busy("free block vanished")),
            };
            {
                let mut meta = block.meta();
                meta.page_id = id;
                meta.state = BlockState::FilePage;
                meta.io_fix = IoFix::Read;
                meta.size_class = size_class;
                meta.accessed = false;
                meta.freed_page_clock = inner.freed_page_clock;
            }
            self.hash_page(&mut inner, id, free_id)?;
            inner.lru.insert_old(free_id);
            block
        };

        // The block is published but gated by IoFix::Read, so setting up
        // the image outside the pool mutex is safe.
        {
            let mut img = block.latch_exclusive();
            img.start_resident(zip);
        }
        self.n_pend_reads.fetch_add(1, Ordering::Relaxed);
        debug!(page = %id, size_class, "read initialized");
        Ok(Some(block))
    }

    /// Manufacture a brand-new page without any I/O.
    ///
    /// If `id` is already resident the existing block is re-initialized
    /// instead. The returned guard holds the exclusive latch; the frame
    /// carries the freshly-allocated stamp and the page's identity, and
    /// stale change-buffer entries for the id are invalidated.
    pub fn create(&self, id: PageId, size_class: u8, mtr: &mut Mtr) -> Result<PageGuard<'_>> {
        let guard = loop {
            let existing = {
                let inner = self.inner.lock();
                inner.page_hash.get(&id).and_then(|&bid| inner.block(bid))
            };

            match existing {
                Some(block) => {
                    if block.meta().compressed_only {
                        self.ensure_resident(id, &block)?;
                        continue;
                    }
                    block.wait_read_clear();
                    {
                        let mut meta = block.meta();
                        if meta.state != BlockState::FilePage || meta.page_id != id {
                            continue;
                        }
                        meta.pin_count += 1;
                        meta.accessed = true;
                    }
                    let mut img = block.latch_exclusive();
                    {
                        // Re-check under the latch; the pin keeps the
                        // block from being evicted meanwhile.
                        let meta = block.meta();
                        if meta.state != BlockState::FilePage || meta.page_id != id {
                            drop(meta);
                            drop(img);
                            self.unpin(&block);
                            continue;
                        }
                    }
                    Self::stamp_fresh(&mut img, id);
                    break PageGuard::new(self, block, id, LatchGuard::Exclusive(img), mtr.register());
                }
                None => {
                    let free_id = self.get_free_block()?;
                    let zip = match zip_size(size_class) {
                        Some(len) => match self.collab.zip_alloc.alloc(len, true) {
                            Some(buf) => Some(ZipImage::from_parts(buf, size_class, 0, 0, 0)),
                            None => {
                                self.inner.lock().free.push(free_id);
                                return Err(Error::NoFreeBlocks);
                            }
                        },
                        None => None,
                    };
                    let block = {
                        let mut inner = self.inner.lock();
                        if inner.page_hash.contains_key(&id) {
                            inner.free.push(free_id);
                            drop(inner);
                            if let Some(zip) = zip {
                                self.collab.zip_alloc.free(zip.into_data());
                            }
                            continue;
                        }
                        let block = match inner.block(free_id) {
                            Some(b) => b,
                            None => return Err(Error::Busy("free block vanished")),
                        };
                        {
                            let mut meta = block.meta();
                            meta.page_id = id;
                            meta.state = BlockState::FilePage;
                            meta.size_class = size_class;
                            meta.pin_count = 1;
                            meta.accessed = true;
                            inner.access_clock += 1;
                            meta.access_stamp = inner.access_clock;
                            meta.freed_page_clock = inner.freed_page_clock;
                        }
                        self.hash_page(&mut inner, id, free_id)?;
                        inner.lru.push_young(free_id);
                        block
                    };
                    let mut img = block.latch_exclusive();
                    img.start_resident(zip);
                    Self::stamp_fresh(&mut img, id);
                    let latch = LatchGuard::Exclusive(img);
                    break PageGuard::new(self, block, id, latch, mtr.register());
                }
            }
        };

        debug!(page = %id, "page created");
        self.collab
            .change_buffer
            .merge_buffered_changes(self, None, id, size_class, true);
        self.free_margin_flush();
        Ok(guard)
    }

    // ========================================================================
    // I/O completion
    // ========================================================================

    /// Finish an asynchronous read or write on `block`.
    ///
    /// Called by the I/O driver. The direction is taken from the
    /// block's `IoFix`.
    pub fn io_complete(&self, block: &Arc<ControlBlock>) -> Result<()> {
        let fix = block.meta().io_fix;
        match fix {
            IoFix::Read => self.complete_read(block),
            IoFix::Write => {
                self.complete_write(block);
                Ok(())
            }
            IoFix::None => Ok(()),
        }
    }

    fn complete_read(&self, block: &Arc<ControlBlock>) -> Result<()> {
        let (id, size_class) = {
            let meta = block.meta();
            (meta.page_id, meta.size_class)
        };

        let mut corrupt = false;
        {
            // Uncontended: every caller is parked behind the IoFix gate.
            let mut img = block.latch_exclusive();

            if size_class > 0 {
                match &mut *img {
                    PageImage::Resident {
                        frame,
                        zip: Some(zip),
                    } => {
                        if blank_page(zip.data()) {
                            // Never-written page of a preallocated file.
                            frame.reset();
                        } else if checksum::zip_is_corrupted(zip.data(), self.config.checksums)
                            || codec::decompress(zip, frame).is_none()
                        {
                            corrupt = true;
                        }
                    }
                    _ => corrupt = true,
                }
            }

            if !corrupt {
                match img.frame() {
                    Some(frame) => {
                        let data = frame.as_slice();
                        if !blank_page(data) {
                            if layout::page_id_of(data) != id {
                                warn!(
                                    page = %id,
                                    stamped = %layout::page_id_of(data),
                                    "page header id does not match the read request"
                                );
                                corrupt = true;
                            } else if size_class == 0
                                && checksum::is_corrupted(data, self.config.checksums)
                            {
                                // Compressed pages are covered by the
                                // payload checksum verified above; the
                                // frame built from one carries no
                                // trailer stamps.
                                corrupt = true;
                            } else {
                                let lsn = layout::read_u64(data, layout::OFF_LSN);
                                let recoverable = self.collab.redo.peek_recoverable_lsn();
                                if lsn > recoverable {
                                    warn!(
                                        page = %id,
                                        lsn,
                                        recoverable,
                                        "page LSN is ahead of the recoverable LSN"
                                    );
                                }
                            }
                        }
                    }
                    None => corrupt = true,
                }
            }

            if corrupt {
                if self.config.force_recovery == 0 {
                    drop(img);
                    error!(page = %id, "corrupted page read");
                    self.io_abort(block);
                    return Err(Error::PageCorrupted(id));
                }
                error!(
                    page = %id,
                    force_recovery = self.config.force_recovery,
                    "corrupted page read; continuing at the caller's risk"
                );
            }

            if self.collab.redo.recovery_active() {
                self.collab.redo.apply_redo(self, block);
            }
        }

        self.collab
            .change_buffer
            .merge_buffered_changes(self, Some(block), id, size_class, false);

        block.meta().io_fix = IoFix::None;
        self.n_pend_reads.fetch_sub(1, Ordering::Relaxed);
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
        block.notify_io_waiters();
        debug!(page = %id, "read completed");
        Ok(())
    }

    fn complete_write(&self, block: &Arc<ControlBlock>) {
        let mut inner = self.inner.lock();
        let mut meta = block.meta();
        if meta.io_fix != IoFix::Write {
            return;
        }
        meta.io_fix = IoFix::None;
        match meta.flush_type {
            FlushType::List => self.n_flush_list.fetch_sub(1, Ordering::Relaxed),
            FlushType::Lru => self.n_flush_lru.fetch_sub(1, Ordering::Relaxed),
        };
        if meta.newest_modification <= meta.flush_lsn {
            meta.oldest_modification = 0;
            inner.flush_list.remove(block.id());
        }
        // Otherwise the page was modified while the write was in
        // flight: it stays dirty, in flush-list position.
        self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        debug!(page = %meta.page_id, "write completed");
    }

    /// Abort an in-flight read: unhash the block and release the gate.
    ///
    /// Called by the driver on a failed read, and internally for
    /// corrupted reads. Parked waiters wake, notice the block no longer
    /// maps to their page, and retry (surfacing the driver's error).
    pub fn io_abort(&self, block: &Arc<ControlBlock>) {
        let pinned = {
            let mut inner = self.inner.lock();
            let mut meta = block.meta();
            if meta.io_fix != IoFix::Read {
                return;
            }
            meta.io_fix = IoFix::None;
            warn!(page = %meta.page_id, "read aborted");
            if meta.state == BlockState::FilePage {
                inner.page_hash.remove(&meta.page_id);
                inner.lru.remove(block.id());
                meta.state = BlockState::RemoveHash;
            }
            meta.pin_count > 0
        };
        self.n_pend_reads.fetch_sub(1, Ordering::Relaxed);
        block.notify_io_waiters();
        if !pinned {
            self.finish_remove(block);
        }
    }

    /// Release a failed write: the page stays dirty and will be picked
    /// up by a later flush.
    pub fn write_failed(&self, block: &Arc<ControlBlock>) {
        warn!(page = %block.meta().page_id, "page write failed; page stays dirty");
        self.unfix_write(block);
    }

    // ========================================================================
    // LRU
    // ========================================================================

    /// Promote a block to the LRU head if it has been stale long enough.
    ///
    /// The staleness rule (`freed_page_clock` distance of at least
    /// `1 + capacity/4`) amortizes pool-mutex contention: recently
    /// younged blocks are left where they are.
    pub fn make_young(&self, block: &Arc<ControlBlock>) {
        let mut inner = self.inner.lock();
        let mut meta = block.meta();
        if meta.state != BlockState::FilePage {
            return;
        }
        if Self::stale_enough(&inner, meta.freed_page_clock) {
            inner.lru.make_young(block.id());
            meta.freed_page_clock = inner.freed_page_clock;
        }
    }

    fn stale_enough(inner: &PoolInner, block_clock: u64) -> bool {
        inner.freed_page_clock.saturating_sub(block_clock) >= 1 + inner.capacity() as u64 / 4
    }

    // ========================================================================
    // Modification tracking
    // ========================================================================

    /// Record a modification of `block` at `lsn` (callers hand out
    /// monotonically increasing LSNs, which keeps the flush list
    /// ordered). Invoked through [`PageGuard::set_modified`].
    pub(crate) fn mark_modified(&self, block: &Arc<ControlBlock>, lsn: Lsn) {
        let mut inner = self.inner.lock();
        let mut meta = block.meta();
        if lsn > meta.newest_modification {
            meta.newest_modification = lsn;
        }
        if meta.oldest_modification == 0 {
            meta.oldest_modification = lsn;
            inner.flush_list.push_head(block.id());
        }
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Write out up to `max` dirty pages.
    ///
    /// `FlushType::List` takes the most urgent flush-list entries (the
    /// tail); `FlushType::Lru` walks the LRU tail to make replacement
    /// room. Snapshots are taken under a shared latch and checksummed;
    /// the page is only marked clean at completion, and only if it was
    /// not re-modified while the write was in flight.
    ///
    /// Returns the number of writes handed to the driver.
    pub fn flush_pages(&self, flush_type: FlushType, max: usize) -> Result<usize> {
        let picked = {
            let inner = self.inner.lock();
            let order = match flush_type {
                FlushType::List => inner.flush_list.tail_to_head(),
                FlushType::Lru => inner.lru.tail_to_head(),
            };
            let mut picked = Vec::new();
            for bid in order {
                if picked.len() >= max {
                    break;
                }
                let block = match inner.block(bid) {
                    Some(b) => b,
                    None => continue,
                };
                let mut meta = block.meta();
                if meta.io_fix != IoFix::None || !meta.is_dirty() {
                    continue;
                }
                meta.io_fix = IoFix::Write;
                meta.flush_type = flush_type;
                match flush_type {
                    FlushType::List => self.n_flush_list.fetch_add(1, Ordering::Relaxed),
                    FlushType::Lru => self.n_flush_lru.fetch_add(1, Ordering::Relaxed),
                };
                drop(meta);
                picked.push(block);
            }
            picked
        };

        if picked.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(picked.len());
        for block in picked {
            // Non-blocking: a page someone holds exclusively (possibly
            // this very thread) is skipped and stays dirty for a later
            // flush.
            let img = match block.try_latch_shared() {
                Some(img) => img,
                None => {
                    self.unfix_write(&block);
                    continue;
                }
            };
            let (page_id, size_class, lsn) = {
                let mut meta = block.meta();
                meta.flush_lsn = meta.newest_modification;
                (meta.page_id, meta.size_class, meta.newest_modification)
            };

            // The compressed image, when the space is compressed, is the
            // authoritative on-disk form; callers keep it in sync via
            // the modification log or recompression.
            let bytes = match (size_class, img.zip()) {
                (c, Some(zip)) if c > 0 => {
                    let mut copy = zip.data().to_vec();
                    checksum::stamp_zip(&mut copy, lsn, self.config.checksums);
                    copy
                }
                _ => match img.frame() {
                    Some(frame) => {
                        let mut copy = frame.as_slice().to_vec();
                        checksum::stamp(&mut copy, lsn, self.config.checksums);
                        copy
                    }
                    None => {
                        drop(img);
                        self.unfix_write(&block);
                        continue;
                    }
                },
            };
            drop(img);

            batch.push(FlushRequest {
                block,
                page_id,
                size_class,
                flush_type,
                bytes,
            });
        }

        let n = batch.len();
        if n > 0 {
            debug!(n, ?flush_type, "flush batch issued");
            self.driver.issue_flush_batch(self, batch)?;
        }
        Ok(n)
    }

    /// Withdraw a write reservation without writing.
    fn unfix_write(&self, block: &Arc<ControlBlock>) {
        let mut meta = block.meta();
        if meta.io_fix != IoFix::Write {
            return;
        }
        meta.io_fix = IoFix::None;
        match meta.flush_type {
            FlushType::List => self.n_flush_list.fetch_sub(1, Ordering::Relaxed),
            FlushType::Lru => self.n_flush_lru.fetch_sub(1, Ordering::Relaxed),
        };
    }

    /// Flush every dirty page and wait for the writes to complete.
    pub fn flush_all(&self) -> Result<()> {
        loop {
            let n = self.flush_pages(FlushType::List, usize::MAX)?;
            if n == 0 {
                break;
            }
        }
        while self.n_flush_list.load(Ordering::Relaxed) + self.n_flush_lru.load(Ordering::Relaxed)
            > 0
        {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Ok(())
    }

    /// Keep free-list slack available: called by `create`, best-effort.
    fn free_margin_flush(&self) {
        let need = {
            let inner = self.inner.lock();
            inner.free.len() < self.config.free_margin
        };
        if need {
            if let Err(err) = self.flush_pages(FlushType::Lru, self.config.flush_batch) {
                warn!(%err, "free-margin flush failed");
            }
        }
    }

    // ========================================================================
    // Resize
    // ========================================================================

    /// Grow or shrink the pool to `new_capacity` blocks.
    ///
    /// Growing appends a chunk. Shrinking retires one chunk at a time
    /// (no larger than the remaining deficit, fully free preferred),
    /// aging its residents to the LRU tail and flushing until the chunk
    /// drains, then unlinks it and rebuilds the page hash. A retiring
    /// chunk supplies no blocks to new acquisitions; pages resident
    /// elsewhere are unaffected. Secondary structures are disabled
    /// around the shrink and rebuilt after.
    pub fn resize(&self, new_capacity: usize) -> Result<()> {
        if new_capacity == 0 {
            return Err(Error::Busy("cannot resize to zero capacity"));
        }
        let current = self.capacity();
        if new_capacity == current {
            return Ok(());
        }

        if new_capacity > current {
            let add = new_capacity - current;
            let mut inner = self.inner.lock();
            let base = inner.next_base;
            inner.next_base += add as u32;
            let chunk = Chunk::new(base, add);
            inner
                .free
                .extend((0..add as u32).map(|i| BlockId::new(base + i)));
            inner.chunks.push(chunk);
            info!(from = current, to = new_capacity, "pool grown");
            return Ok(());
        }

        info!(from = current, to = new_capacity, "pool shrink started");
        self.collab.index_hook.disable();
        let result = self.shrink_to(new_capacity);
        self.collab.index_hook.rebuild();
        if result.is_ok() {
            info!(to = new_capacity, "pool shrink finished");
        }
        result
    }

    fn shrink_to(&self, new_capacity: usize) -> Result<()> {
        while self.capacity() > new_capacity {
            let deficit = self.capacity() - new_capacity;

            // Pick a victim chunk no larger than the deficit, preferring
            // one that is already fully free.
            let victim_base = {
                let mut inner = self.inner.lock();
                let victim = inner
                    .chunks
                    .iter()
                    .filter(|c| c.len() <= deficit)
                    .max_by_key(|c| (c.is_idle(), c.len()))
                    .map(|c| c.base());
                let Some(base) = victim else {
                    return Err(Error::Busy("no chunk fits the shrink deficit"));
                };
                inner.retiring = Some(base);
                let retiring: Vec<BlockId> = inner
                    .free
                    .iter()
                    .copied()
                    .filter(|&bid| inner.is_retiring(bid))
                    .collect();
                inner.free.retain(|&bid| !retiring.contains(&bid));
                base
            };

            let mut drained = false;
            for _ in 0..SHRINK_ATTEMPTS {
                {
                    let mut inner = self.inner.lock();
                    let residents: Vec<Arc<ControlBlock>> = inner
                        .chunks
                        .iter()
                        .find(|c| c.base() == victim_base)
                        .map(|c| c.blocks().cloned().collect())
                        .unwrap_or_default();

                    for block in &residents {
                        let in_lru = inner.lru.contains(block.id());
                        if in_lru && !self.try_evict(&mut inner, block) {
                            // Not evictable yet: age it toward the tail
                            // so LRU flushing reaches it first.
                            inner.lru.move_to_tail(block.id());
                        }
                    }
                    drained = inner
                        .chunks
                        .iter()
                        .find(|c| c.base() == victim_base)
                        .map(Chunk::is_idle)
                        .unwrap_or(true);
                }
                if drained {
                    break;
                }
                self.flush_pages(FlushType::Lru, self.config.flush_batch)?;
                std::thread::yield_now();
            }

            let mut inner = self.inner.lock();
            if !drained {
                // Give up: restore the chunk's free blocks and report.
                let restore: Vec<BlockId> = inner
                    .chunks
                    .iter()
                    .find(|c| c.base() == victim_base)
                    .map(|c| {
                        c.blocks()
                            .filter(|b| {
                                let meta = b.meta();
                                meta.state == BlockState::NotUsed && meta.pin_count == 0
                            })
                            .map(|b| b.id())
                            .collect()
                    })
                    .unwrap_or_default();
                inner.free.extend(restore);
                inner.retiring = None;
                return Err(Error::Busy("pinned pages kept the chunk from draining"));
            }

            inner.chunks.retain(|c| c.base() != victim_base);
            inner.retiring = None;

            // Rebuild the page hash from scratch; a derived map must not
            // outlive the blocks it pointed into.
            let mut hash = HashMap::new();
            for chunk in &inner.chunks {
                for block in chunk.blocks() {
                    let meta = block.meta();
                    if meta.state == BlockState::FilePage {
                        hash.insert(meta.page_id, block.id());
                    }
                }
            }
            inner.page_hash = hash;
        }
        Ok(())
    }

    // ========================================================================
    // Internal: location, pinning, eviction
    // ========================================================================

    fn lookup(&self, id: PageId, hint: Option<Arc<ControlBlock>>) -> Option<Arc<ControlBlock>> {
        if let Some(h) = hint {
            let meta = h.meta();
            if meta.state == BlockState::FilePage && meta.page_id == id {
                drop(meta);
                return Some(h);
            }
        }
        let inner = self.inner.lock();
        inner.page_hash.get(&id).and_then(|&bid| inner.block(bid))
    }

    /// Issue (or join) a read of `id` through the driver.
    fn read_page(&self, id: PageId) -> Result<()> {
        let version = self.driver.tablespace_version(id.space_id);
        let size_class = self.driver.size_class_of(id.space_id);
        if let Some(block) = self.init_for_read(id, size_class, version)? {
            self.driver.issue_read(self, block)?;
        }
        Ok(())
    }

    fn latch_for(
        &self,
        block: &Arc<ControlBlock>,
        latch: LatchMode,
        mode: FetchMode,
    ) -> Option<LatchGuard> {
        match mode {
            FetchMode::NoWait => match latch {
                LatchMode::Shared => block.try_latch_shared().map(LatchGuard::Shared),
                LatchMode::Exclusive => block.try_latch_exclusive().map(LatchGuard::Exclusive),
                LatchMode::None => Some(LatchGuard::None),
            },
            FetchMode::NoLatch => {
                block.wait_read_clear();
                Some(LatchGuard::None)
            }
            FetchMode::Normal | FetchMode::OnlyIfCached => {
                block.wait_read_clear();
                match latch {
                    LatchMode::Shared => Some(LatchGuard::Shared(block.latch_shared())),
                    LatchMode::Exclusive => Some(LatchGuard::Exclusive(block.latch_exclusive())),
                    LatchMode::None => Some(LatchGuard::None),
                }
            }
        }
    }

    /// Drop a pin. The last pin of a `RemoveHash` block completes its
    /// eviction.
    pub(crate) fn unpin(&self, block: &Arc<ControlBlock>) {
        let finish = {
            let mut meta = block.meta();
            assert!(meta.pin_count > 0, "pin count underflow");
            meta.pin_count -= 1;
            meta.pin_count == 0 && meta.state == BlockState::RemoveHash
        };
        if finish {
            self.finish_remove(block);
        }
    }

    /// Return an unhashed block to the free shape and the free list.
    fn finish_remove(&self, block: &Arc<ControlBlock>) {
        // Latch before the pool mutex: the block is unhashed, so only
        // transient optimistic probes can contend, and pool-mutex
        // holders never block on a latch.
        let mut img = block.latch_exclusive();
        let mut inner = self.inner.lock();
        let mut meta = block.meta();
        if meta.pin_count != 0 || meta.state != BlockState::RemoveHash {
            return;
        }
        let zip = if meta.compressed_only {
            let spare = inner.spare_frames.pop().unwrap_or_default();
            img.reset(move || spare)
        } else {
            img.reset(Frame::new)
        };
        meta.reset_evicted();
        if !inner.is_retiring(block.id()) {
            inner.free.push(block.id());
        }
        drop(meta);
        drop(img);
        drop(inner);
        if let Some(zip) = zip {
            self.collab.zip_alloc.free(zip.into_data());
        }
    }

    /// Pop or make a free block, flushing the LRU tail when everything
    /// is dirty.
    fn get_free_block(&self) -> Result<BlockId> {
        for _ in 0..FREE_BLOCK_ATTEMPTS {
            {
                let mut inner = self.inner.lock();
                if let Some(bid) = inner.free.pop() {
                    return Ok(bid);
                }
                if let Some(bid) = self.evict_one(&mut inner) {
                    return Ok(bid);
                }
            }
            let flushed = self.flush_pages(FlushType::Lru, self.config.flush_batch)?;
            if flushed == 0 {
                let inner = self.inner.lock();
                if inner.free.is_empty() {
                    drop(inner);
                    warn!("no free blocks: every page is pinned or mid-I/O");
                    return Err(Error::NoFreeBlocks);
                }
            }
        }
        Err(Error::NoFreeBlocks)
    }

    /// Scan the LRU tail for a replaceable page and evict it, returning
    /// the freed block for immediate reuse.
    fn evict_one(&self, inner: &mut PoolInner) -> Option<BlockId> {
        for bid in inner.lru.tail_to_head() {
            let block = match inner.block(bid) {
                Some(b) => b,
                None => continue,
            };
            if !self.try_evict(inner, &block) {
                continue;
            }
            if inner.is_retiring(bid) {
                // Freed, but the retiring chunk keeps its blocks.
                continue;
            }
            return Some(bid);
        }
        None
    }

    /// Evict `block` if it is replaceable right now. A clean resident
    /// block still carrying its compressed image is demoted to
    /// compressed-only instead (the compressed cache stays warm) and
    /// reported as not evicted.
    fn try_evict(&self, inner: &mut PoolInner, block: &Arc<ControlBlock>) -> bool {
        let mut meta = block.meta();
        if meta.state != BlockState::FilePage
            || meta.pin_count != 0
            || meta.io_fix != IoFix::None
            || meta.is_dirty()
        {
            return false;
        }
        // Content must be ours alone; skip on any transient holder.
        let mut img = match block.try_latch_exclusive() {
            Some(g) => g,
            None => return false,
        };

        if !meta.compressed_only && img.zip().is_some() {
            if let Some(frame) = img.demote() {
                meta.compressed_only = true;
                inner.spare_frames.push(frame);
                self.stats.zip_demotions.fetch_add(1, Ordering::Relaxed);
                debug!(page = %meta.page_id, "demoted to compressed-only");
                return false;
            }
        }

        let page_id = meta.page_id;
        meta.state = BlockState::RemoveHash;
        inner.page_hash.remove(&page_id);
        inner.lru.remove(block.id());
        inner.freed_page_clock += 1;

        let zip = if meta.compressed_only {
            let spare = inner.spare_frames.pop().unwrap_or_default();
            img.reset(move || spare)
        } else {
            img.reset(Frame::new)
        };
        meta.reset_evicted();
        drop(img);
        drop(meta);

        if let Some(zip) = zip {
            self.collab.zip_alloc.free(zip.into_data());
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(page = %page_id, "page evicted");
        true
    }

    fn hash_page(&self, inner: &mut PoolInner, id: PageId, bid: BlockId) -> Result<()> {
        if inner.page_hash.insert(id, bid).is_some() {
            // Two blocks mapping one id is a bookkeeping bug, not a
            // recoverable condition.
            error!(page = %id, "page id already present in the page hash");
            return Err(Error::AlreadyHashed(id));
        }
        Ok(())
    }

    /// Stamp the freshly-allocated markers and page identity into a
    /// created page's frame.
    fn stamp_fresh(img: &mut PageImage, id: PageId) {
        if let Some(frame) = img.frame_mut() {
            frame.reset();
            let data = frame.as_mut_slice();
            layout::write_u32(data, layout::OFF_PAGE_NO, id.page_no);
            layout::write_u32(data, layout::OFF_SPACE_ID, id.space_id);
            layout::write_u64(data, layout::OFF_ALLOC_MARKER, layout::FRESH_ALLOC_MARKER);
        }
    }

    // ========================================================================
    // Compressed-only promotion
    // ========================================================================

    /// Handle a compressed-only hit: wait out a promotion another
    /// caller already has in flight, otherwise run one. The caller
    /// re-examines the page hash afterwards.
    fn ensure_resident(&self, id: PageId, block: &Arc<ControlBlock>) -> Result<()> {
        let promoting = {
            let meta = block.meta();
            meta.compressed_only && meta.io_fix == IoFix::Read
        };
        if promoting {
            block.wait_read_clear();
            Ok(())
        } else {
            self.promote(id)
        }
    }

    /// Relocate a compressed-only image into a fresh block and
    /// decompress it, leaving the page fully resident.
    ///
    /// The donor block is first gated with `IoFix::Read` so that the
    /// free-block search cannot evict it and concurrent getters park
    /// instead of racing the relocation. The relocation itself is O(1)
    /// under the pool mutex plus both blocks' mutexes (ascending handle
    /// order); the page keeps its hash entry, LRU position and dirty
    /// state. Decompression runs after the pool mutex is released,
    /// behind the new block's gate.
    ///
    /// Races (the image vanished, a promotion was already in flight)
    /// return Ok; the caller's retry loop observes the new state.
    fn promote(&self, id: PageId) -> Result<()> {
        // Gate the donor.
        let old_block = {
            let inner = self.inner.lock();
            let Some(old_block) = inner.page_hash.get(&id).and_then(|&bid| inner.block(bid))
            else {
                return Ok(());
            };
            let mut meta = old_block.meta();
            if meta.state != BlockState::FilePage
                || !meta.compressed_only
                || meta.pin_count != 0
                || meta.io_fix != IoFix::None
            {
                return Ok(());
            }
            meta.io_fix = IoFix::Read;
            drop(meta);
            old_block
        };
        let old_id = old_block.id();

        let free_id = match self.get_free_block() {
            Ok(bid) => bid,
            Err(err) => {
                old_block.meta().io_fix = IoFix::None;
                old_block.notify_io_waiters();
                return Err(err);
            }
        };

        let (new_block, mut new_img) = {
            let mut inner = self.inner.lock();

            let give_back = |inner: &mut PoolInner| {
                if inner.is_retiring(free_id) {
                    return;
                }
                inner.free.push(free_id);
            };
            let ungate = || {
                old_block.meta().io_fix = IoFix::None;
                old_block.notify_io_waiters();
            };

            let new_block = match inner.block(free_id) {
                Some(b) => b,
                None => {
                    ungate();
                    return Ok(());
                }
            };

            // Both block mutexes, ascending handle order.
            let (mut old_meta, mut new_meta) = if old_id < free_id {
                let a = old_block.meta();
                let b = new_block.meta();
                (a, b)
            } else {
                let b = new_block.meta();
                let a = old_block.meta();
                (a, b)
            };

            // The gate kept the donor pinned in place; these can only
            // fail if something bypassed it.
            if !old_meta.compressed_only || old_meta.io_fix != IoFix::Read {
                drop(old_meta);
                drop(new_meta);
                give_back(&mut inner);
                ungate();
                return Ok(());
            }

            let (Some(mut old_img), Some(mut new_img)) = (
                old_block.try_latch_exclusive(),
                new_block.try_latch_exclusive(),
            ) else {
                drop(old_meta);
                drop(new_meta);
                give_back(&mut inner);
                ungate();
                return Ok(());
            };

            let spare = inner.spare_frames.pop().unwrap_or_default();
            let zip = match old_img.take_zip(spare) {
                Ok(zip) => zip,
                Err(frame) => {
                    inner.spare_frames.push(frame);
                    drop(old_img);
                    drop(old_meta);
                    drop(new_meta);
                    give_back(&mut inner);
                    ungate();
                    return Ok(());
                }
            };
            new_img.start_resident(Some(zip));

            new_meta.page_id = id;
            new_meta.state = BlockState::FilePage;
            // Gate callers off the latch until decompression finishes.
            new_meta.io_fix = IoFix::Read;
            new_meta.size_class = old_meta.size_class;
            new_meta.compressed_only = false;
            new_meta.accessed = old_meta.accessed;
            new_meta.access_stamp = old_meta.access_stamp;
            new_meta.newest_modification = old_meta.newest_modification;
            new_meta.oldest_modification = old_meta.oldest_modification;
            new_meta.flush_lsn = old_meta.flush_lsn;
            new_meta.freed_page_clock = old_meta.freed_page_clock;

            inner.page_hash.insert(id, free_id);
            inner.lru.replace(old_id, free_id);
            if inner.flush_list.contains(old_id) {
                inner.flush_list.replace(old_id, free_id);
            }

            old_meta.reset_evicted();
            if !inner.is_retiring(old_id) {
                inner.free.push(old_id);
            }
            self.stats.zip_promotions.fetch_add(1, Ordering::Relaxed);
            debug!(page = %id, from = %old_id, to = %free_id, "compressed image relocated");

            drop(old_img);
            drop(old_meta);
            drop(new_meta);
            (new_block, new_img)
        };

        // Waiters parked on the donor re-examine the hash and find the
        // new block.
        old_block.notify_io_waiters();

        let ok = match &mut *new_img {
            PageImage::Resident {
                frame,
                zip: Some(zip),
            } => codec::decompress(zip, frame).is_some(),
            _ => false,
        };
        drop(new_img);

        new_block.meta().io_fix = IoFix::None;
        new_block.notify_io_waiters();

        if !ok {
            error!(page = %id, "decompression of a resident compressed image failed");
            self.discard_page(&new_block);
            return Err(Error::PageCorrupted(id));
        }
        Ok(())
    }

    /// Unhash and free a block whose content turned out to be unusable.
    fn discard_page(&self, block: &Arc<ControlBlock>) {
        let pinned = {
            let mut inner = self.inner.lock();
            let mut meta = block.meta();
            if meta.state != BlockState::FilePage {
                return;
            }
            inner.page_hash.remove(&meta.page_id);
            inner.lru.remove(block.id());
            inner.flush_list.remove(block.id());
            meta.state = BlockState::RemoveHash;
            meta.pin_count > 0
        };
        if !pinned {
            self.finish_remove(block);
        }
    }

    // ========================================================================
    // Read-ahead
    // ========================================================================

    /// Linear read-ahead, triggered by the first touch of a page on an
    /// area border: if enough of the page's own area was recently
    /// accessed, prefetch the adjacent area in the travel direction.
    fn linear_read_ahead(&self, id: PageId) {
        let area = self.config.read_ahead_area;
        if area == 0 || self.config.read_ahead_threshold as u64 > area as u64 {
            return;
        }
        let Some((lo, hi)) = read_ahead::linear_target(id.page_no, area) else {
            return;
        };

        let (area_lo, area_hi) = read_ahead::area_bounds(id.page_no, area);
        let recent = {
            let inner = self.inner.lock();
            (area_lo..area_hi)
                .filter(|&pno| {
                    inner
                        .page_hash
                        .get(&PageId::new(id.space_id, pno))
                        .and_then(|&bid| inner.block(bid))
                        .map(|b| b.meta().accessed)
                        .unwrap_or(false)
                })
                .count() as u32
        };
        if recent < self.config.read_ahead_threshold {
            return;
        }

        debug!(page = %id, lo, hi, "linear read-ahead triggered");
        let version = self.driver.tablespace_version(id.space_id);
        let size_class = self.driver.size_class_of(id.space_id);
        let mut issued = 0u64;
        for pno in lo..hi {
            let target = PageId::new(id.space_id, pno);
            match self.init_for_read(target, size_class, version) {
                Ok(Some(block)) => {
                    // Edge-of-file reads fail and self-abort; that is
                    // the normal end of a tablespace.
                    if self.driver.issue_read(self, block).is_ok() {
                        issued += 1;
                    }
                }
                Ok(None) => {}
                Err(_) => break,
            }
        }
        self.stats
            .read_ahead_pages
            .fetch_add(issued, Ordering::Relaxed);
    }
}

fn blank_page(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileDriver;
    use tempfile::tempdir;

    fn test_pool(capacity: usize) -> (BufferPool, Arc<FileDriver>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let driver = Arc::new(FileDriver::new(dir.path()).unwrap());
        driver.create_space(0, 0).unwrap();
        let pool = BufferPool::new(PoolConfig::small(capacity), driver.clone());
        (pool, driver, dir)
    }

    #[test]
    fn test_new_pool_all_free() {
        let (pool, _driver, _dir) = test_pool(8);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.free_count(), 8);
        assert_eq!(pool.resident_count(), 0);
        assert_eq!(pool.lru_len(), 0);
    }

    #[test]
    fn test_create_pins_and_heads_lru() {
        let (pool, _driver, _dir) = test_pool(8);
        let mut mtr = Mtr::new();

        let guard = pool.create(PageId::new(0, 7), 0, &mut mtr).unwrap();
        assert_eq!(guard.page_id(), PageId::new(0, 7));
        {
            let meta = guard.block().meta();
            assert_eq!(meta.state, BlockState::FilePage);
            assert_eq!(meta.pin_count, 1);
        }
        assert_eq!(pool.lru_head_page(), Some(PageId::new(0, 7)));
        assert_eq!(pool.free_count(), 7);
        assert_eq!(pool.resident_count(), 1);

        drop(guard);
        assert_eq!(mtr.open_latches(), 0);
        assert_eq!(guard_pin(&pool, PageId::new(0, 7)), 0);
    }

    fn guard_pin(pool: &BufferPool, id: PageId) -> u32 {
        let inner = pool.inner.lock();
        let bid = inner.page_hash[&id];
        let block = inner.block(bid).unwrap();
        let meta = block.meta();
        meta.pin_count
    }

    #[test]
    fn test_create_existing_id_reinitializes() {
        let (pool, _driver, _dir) = test_pool(8);
        let mut mtr = Mtr::new();

        let id = PageId::new(0, 1);
        {
            let mut guard = pool.create(id, 0, &mut mtr).unwrap();
            guard.data_mut()[100] = 0xAA;
        }
        {
            let guard = pool.create(id, 0, &mut mtr).unwrap();
            // Re-created: frame is freshly stamped, old content gone.
            assert_eq!(guard.data()[100], 0);
            assert_eq!(
                layout::read_u64(guard.data(), layout::OFF_ALLOC_MARKER),
                layout::FRESH_ALLOC_MARKER
            );
        }
        assert_eq!(pool.resident_count(), 1);
    }

    #[test]
    fn test_get_only_if_cached_miss() {
        let (pool, _driver, _dir) = test_pool(8);
        let mut mtr = Mtr::new();

        let err = pool.get(
            PageId::new(0, 5),
            LatchMode::Shared,
            None,
            FetchMode::OnlyIfCached,
            &mut mtr,
        );
        assert!(matches!(err, Err(Error::NotFound(_))));
        assert_eq!(pool.stats().snapshot().pages_read, 0);
    }

    #[test]
    fn test_hash_uniqueness_under_reads() {
        let (pool, _driver, _dir) = test_pool(8);
        let mut mtr = Mtr::new();

        for i in 0..4 {
            let mut guard = pool.create(PageId::new(0, i), 0, &mut mtr).unwrap();
            guard.set_modified(1 + i as u64);
        }
        pool.flush_all().unwrap();
        assert_eq!(pool.resident_count(), 4);

        // Re-acquiring hashes the same blocks; nothing duplicates.
        for i in 0..4 {
            let _g = pool
                .get(
                    PageId::new(0, i),
                    LatchMode::Shared,
                    None,
                    FetchMode::Normal,
                    &mut mtr,
                )
                .unwrap();
            assert_eq!(pool.resident_count(), 4);
        }
    }

    #[test]
    fn test_optimistic_get_detects_modification() {
        let (pool, _driver, _dir) = test_pool(8);
        let mut mtr = Mtr::new();

        let id = PageId::new(0, 2);
        let (block, clock) = {
            let guard = pool.create(id, 0, &mut mtr).unwrap();
            (Arc::clone(guard.block()), guard.modify_clock())
        };
        // The exclusive guard's drop bumped the clock.
        let stale = pool.optimistic_get(&block, LatchMode::Shared, clock, &mut mtr);
        assert!(matches!(stale, Err(Error::WouldBlock(_))));

        let clock = block.meta().modify_clock;
        let fresh = pool.optimistic_get(&block, LatchMode::Shared, clock, &mut mtr);
        assert!(fresh.is_ok());
    }

    #[test]
    fn test_get_known_nowait_mid_eviction_fails() {
        let (pool, _driver, _dir) = test_pool(8);
        let mut mtr = Mtr::new();

        let block = {
            let guard = pool.create(PageId::new(0, 3), 0, &mut mtr).unwrap();
            Arc::clone(guard.block())
        };
        block.meta().state = BlockState::RemoveHash;
        let res = pool.get_known_nowait(&block, LatchMode::Shared, KnownMode::KeepOld, &mut mtr);
        assert!(matches!(res, Err(Error::WouldBlock(_))));
        block.meta().state = BlockState::FilePage;

        let res = pool.get_known_nowait(&block, LatchMode::Shared, KnownMode::KeepOld, &mut mtr);
        assert!(res.is_ok());
    }

    #[test]
    fn test_init_for_read_stale_tablespace_version() {
        let (pool, driver, _dir) = test_pool(8);
        let version = driver.tablespace_version(0);

        let res = pool.init_for_read(PageId::new(0, 1), 0, version + 1);
        assert!(matches!(res, Err(Error::TablespaceDeleted(0))));
    }

    #[test]
    fn test_no_free_blocks_when_all_pinned() {
        let (pool, _driver, _dir) = test_pool(2);
        let mut mtr = Mtr::new();

        let _a = pool.create(PageId::new(0, 0), 0, &mut mtr).unwrap();
        let _b = pool.create(PageId::new(0, 1), 0, &mut mtr).unwrap();
        let res = pool.create(PageId::new(0, 2), 0, &mut mtr);
        assert!(matches!(res, Err(Error::NoFreeBlocks)));
    }

    #[test]
    fn test_mark_modified_enters_flush_list() {
        let (pool, _driver, _dir) = test_pool(8);
        let mut mtr = Mtr::new();

        let guard = pool.create(PageId::new(0, 4), 0, &mut mtr).unwrap();
        assert_eq!(pool.flush_list_len(), 0);
        guard.set_modified(10);
        assert_eq!(pool.flush_list_len(), 1);
        // A second modification does not duplicate the entry.
        guard.set_modified(11);
        assert_eq!(pool.flush_list_len(), 1);
        drop(guard);

        pool.flush_all().unwrap();
        assert_eq!(pool.flush_list_len(), 0);
        assert_eq!(pool.stats().snapshot().pages_written, 1);
    }

    #[test]
    fn test_resize_grow() {
        let (pool, _driver, _dir) = test_pool(4);
        pool.resize(10).unwrap();
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.free_count(), 10);
    }
}
