//! Error types for cachalot.

use thiserror::Error;

use crate::common::PageId;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
/// This is a common Rust pattern (see `std::io::Result`).
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in the page-cache core.
///
/// Callers pattern-match on the retryable variants (`NotFound`,
/// `WouldBlock`) and propagate the rest.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from tablespace file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page is neither resident nor readable.
    ///
    /// Returned by `OnlyIfCached` fetches and by miss paths that exhausted
    /// their retries.
    #[error("page {0} not found")]
    NotFound(PageId),

    /// A non-blocking latch or fetch attempt failed.
    ///
    /// Retryable: the caller falls back to the blocking path.
    #[error("latch on page {0} would block")]
    WouldBlock(PageId),

    /// Buffer pool has no free blocks and cannot evict any pages.
    ///
    /// This happens when every block is pinned or mid-I/O.
    #[error("no free blocks available in buffer pool")]
    NoFreeBlocks,

    /// The owning tablespace was dropped or re-created while the read
    /// request was in flight.
    #[error("tablespace {0} was dropped or re-created")]
    TablespaceDeleted(u32),

    /// Checksum or structural validation failed for a page read from disk.
    ///
    /// Fatal below the configured force-recovery level.
    #[error("page {0} is corrupted")]
    PageCorrupted(PageId),

    /// A page id was found already present in the page hash during
    /// read-initialization.
    ///
    /// This indicates a bookkeeping bug and is treated as fatal.
    #[error("page {0} already present in page hash")]
    AlreadyHashed(PageId),

    /// A pool maintenance operation could not make progress.
    #[error("buffer pool busy: {0}")]
    Busy(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound(PageId::new(2, 7));
        assert_eq!(format!("{}", err), "page [space 2, page 7] not found");

        let err = Error::NoFreeBlocks;
        assert_eq!(
            format!("{}", err),
            "no free blocks available in buffer pool"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        match err {
            Error::Io(_) => {}
            _ => panic!("expected Io error"),
        }
    }

    #[test]
    fn test_result_type_alias() {
        fn might_fail() -> Result<u32> {
            Ok(42)
        }

        assert_eq!(might_fail().unwrap(), 42);
    }
}
