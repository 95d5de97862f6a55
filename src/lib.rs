//! Cachalot - the page-cache core of a disk-based relational storage
//! engine.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           cachalot                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │              Buffer Pool (buffer/)                       │   │
//! │  │   page hash + midpoint LRU + free/flush lists            │   │
//! │  │   ControlBlock state machine + pin/latch protocol        │   │
//! │  │   read-ahead + I/O completion                            │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │            ↓ inline on miss/flush          ↓ traits            │
//! │  ┌───────────────────────────┐  ┌─────────────────────────┐   │
//! │  │  Compressed Codec (codec/) │  │  Collaborators (io/)    │   │
//! │  │  compress / decompress /   │  │  IoDriver + RedoLog +   │   │
//! │  │  modification log          │  │  ChangeBuffer + ...     │   │
//! │  └───────────────────────────┘  └─────────────────────────┘   │
//! │                              ↓                                  │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │           Page Format (page/)                            │   │
//! │  │   Frame + fixed layout + records + checksums             │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! B-tree algorithms, transactions, redo logging and the change buffer
//! live outside this crate and reach the pool through the trait seams
//! in [`io`].
//!
//! # Modules
//! - [`common`] - Shared primitives (PageId, BlockId, Error, config)
//! - [`page`] - The uncompressed page format and its validation
//! - [`codec`] - The compressed page format and its algorithms
//! - [`buffer`] - The buffer pool
//! - [`io`] - External collaborator traits and the file driver
//!
//! # Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use cachalot::io::FileDriver;
//! use cachalot::{BufferPool, FetchMode, LatchMode, Mtr, PageId, PoolConfig};
//!
//! let driver = Arc::new(FileDriver::new("./data").unwrap());
//! driver.create_space(0, 0).unwrap();
//! let pool = BufferPool::new(PoolConfig::default(), driver);
//!
//! let mut mtr = Mtr::new();
//! let mut guard = pool.create(PageId::new(0, 1), 0, &mut mtr).unwrap();
//! guard.data_mut()[64] = 0xAB;
//! guard.set_modified(1);
//! drop(guard);
//!
//! let guard = pool
//!     .get(PageId::new(0, 1), LatchMode::Shared, None, FetchMode::Normal, &mut mtr)
//!     .unwrap();
//! assert_eq!(guard.data()[64], 0xAB);
//! ```

pub mod buffer;
pub mod codec;
pub mod common;
pub mod io;
pub mod page;

// Re-export commonly used items at crate root for convenience
pub use common::config::PAGE_SIZE;
pub use common::{BlockId, ChecksumMode, Error, Lsn, PageId, PoolConfig, Result};

pub use buffer::{
    BufferPool, ControlBlock, FetchMode, KnownMode, LatchMode, Mtr, PageGuard, PoolStats,
    StatsSnapshot,
};
pub use codec::ZipImage;
pub use page::{FieldLayout, Frame};
