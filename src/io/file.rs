//! Synchronous tablespace file driver.
//!
//! A real deployment drives the pool from an async I/O subsystem; this
//! driver serves single-process embedding and tests by doing the read,
//! the completion callback, and the flush writes inline.
//!
//! # File Layout
//! Each tablespace is one file, `space_<id>.tbs`, of fixed-size pages
//! laid out sequentially. Page N of an uncompressed space lives at
//! offset `N × 16KiB`; a compressed space stores its pages at the
//! size-class width instead:
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┐
//! │ Page 0  │ Page 1  │  ...    │ Page N  │
//! └─────────┴─────────┴─────────┴─────────┘
//! Offset:  0     W        ...     N×W        (W = page or class size)
//! ```
//!
//! # Thread Safety
//! The space table is a single mutex: I/O is serialized, which is what
//! the tests want and a deliberate non-goal to optimize here.
//!
//! # Durability
//! Every write is followed by `fsync()`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::block::ControlBlock;
use crate::buffer::BufferPool;
use crate::common::config::zip_size;
use crate::common::{Error, PageId, Result, PAGE_SIZE};
use crate::io::{FlushRequest, IoDriver};

struct Space {
    file: File,
    size_class: u8,
    page_count: u32,
}

impl Space {
    fn page_bytes(&self) -> usize {
        page_bytes(self.size_class)
    }
}

fn page_bytes(size_class: u8) -> usize {
    match zip_size(size_class) {
        Some(n) => n,
        None => PAGE_SIZE,
    }
}

/// Space-aware synchronous page file manager.
pub struct FileDriver {
    dir: PathBuf,
    spaces: Mutex<HashMap<u32, Space>>,
    /// Version stamps survive a space being dropped, so a read request
    /// initialized against the old incarnation is refused.
    versions: Mutex<HashMap<u32, u64>>,
}

impl FileDriver {
    /// Open a driver rooted at `dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            spaces: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
        })
    }

    fn space_path(&self, space_id: u32) -> PathBuf {
        self.dir.join(format!("space_{space_id}.tbs"))
    }

    /// Create a new tablespace.
    ///
    /// # Errors
    /// Fails if the space file already exists.
    pub fn create_space(&self, space_id: u32, size_class: u8) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.space_path(space_id))?;

        self.spaces.lock().insert(
            space_id,
            Space {
                file,
                size_class,
                page_count: 0,
            },
        );
        *self.versions.lock().entry(space_id).or_insert(0) += 1;
        Ok(())
    }

    /// Open an existing tablespace file.
    pub fn open_space(&self, space_id: u32, size_class: u8) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.space_path(space_id))?;
        let page_count = (file.metadata()?.len() / page_bytes(size_class) as u64) as u32;

        self.spaces.lock().insert(
            space_id,
            Space {
                file,
                size_class,
                page_count,
            },
        );
        self.versions.lock().entry(space_id).or_insert(1);
        Ok(())
    }

    /// Drop a tablespace: close it, delete the file, and bump the
    /// version so in-flight requests against it are refused.
    pub fn drop_space(&self, space_id: u32) -> Result<()> {
        self.spaces.lock().remove(&space_id);
        *self.versions.lock().entry(space_id).or_insert(0) += 1;
        std::fs::remove_file(self.space_path(space_id))?;
        Ok(())
    }

    /// Pages currently in a space's file.
    pub fn page_count(&self, space_id: u32) -> u32 {
        self.spaces
            .lock()
            .get(&space_id)
            .map(|s| s.page_count)
            .unwrap_or(0)
    }

    fn read_bytes(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let space = spaces
            .get_mut(&page_id.space_id)
            .ok_or(Error::NotFound(page_id))?;
        if page_id.page_no >= space.page_count {
            return Err(Error::NotFound(page_id));
        }
        debug_assert_eq!(buf.len(), space.page_bytes());

        let offset = page_id.page_no as u64 * space.page_bytes() as u64;
        space.file.seek(SeekFrom::Start(offset))?;
        space.file.read_exact(buf)?;
        Ok(())
    }

    fn write_bytes(&self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let space = spaces
            .get_mut(&page_id.space_id)
            .ok_or(Error::NotFound(page_id))?;
        debug_assert_eq!(bytes.len(), space.page_bytes());

        let offset = page_id.page_no as u64 * space.page_bytes() as u64;
        space.file.seek(SeekFrom::Start(offset))?;
        space.file.write_all(bytes)?;
        space.file.sync_all()?;

        if page_id.page_no >= space.page_count {
            space.page_count = page_id.page_no + 1;
        }
        Ok(())
    }
}

impl IoDriver for FileDriver {
    fn issue_read(&self, pool: &BufferPool, block: Arc<ControlBlock>) -> Result<()> {
        let (page_id, size_class) = {
            let meta = block.meta();
            (meta.page_id, meta.size_class)
        };

        let mut buf = vec![0u8; page_bytes(size_class)];
        if let Err(err) = self.read_bytes(page_id, &mut buf) {
            pool.io_abort(&block);
            return Err(err);
        }

        // The IoFix gate keeps callers off the latch until completion,
        // so this write latch is uncontended.
        {
            let mut img = block.latch_exclusive();
            let filled = if size_class == 0 {
                img.frame_mut()
                    .map(|f| f.as_mut_slice().copy_from_slice(&buf))
            } else {
                img.zip_mut()
                    .filter(|z| z.data().len() == buf.len())
                    .map(|z| z.data_mut().copy_from_slice(&buf))
            };
            if filled.is_none() {
                drop(img);
                pool.io_abort(&block);
                return Err(Error::NotFound(page_id));
            }
        }

        pool.io_complete(&block)
    }

    fn issue_flush_batch(&self, pool: &BufferPool, batch: Vec<FlushRequest>) -> Result<()> {
        for req in batch {
            if let Err(err) = self.write_bytes(req.page_id, &req.bytes) {
                pool.write_failed(&req.block);
                return Err(err);
            }
            pool.io_complete(&req.block)?;
        }
        Ok(())
    }

    fn tablespace_version(&self, space_id: u32) -> u64 {
        self.versions.lock().get(&space_id).copied().unwrap_or(0)
    }

    fn size_class_of(&self, space_id: u32) -> u8 {
        self.spaces
            .lock()
            .get(&space_id)
            .map(|s| s.size_class)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_existing_space_fails() {
        let dir = tempdir().unwrap();
        let driver = FileDriver::new(dir.path()).unwrap();

        driver.create_space(1, 0).unwrap();
        assert!(driver.create_space(1, 0).is_err());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempdir().unwrap();
        let driver = FileDriver::new(dir.path()).unwrap();
        driver.create_space(0, 0).unwrap();

        let id = PageId::new(0, 3);
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        driver.write_bytes(id, &page).unwrap();

        // Writing page 3 extends the file through page 3.
        assert_eq!(driver.page_count(0), 4);

        let mut back = vec![0u8; PAGE_SIZE];
        driver.read_bytes(id, &mut back).unwrap();
        assert_eq!(back, page);

        // The hole pages read back as zeros.
        driver.read_bytes(PageId::new(0, 1), &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let driver = FileDriver::new(dir.path()).unwrap();
        driver.create_space(0, 0).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        let err = driver.read_bytes(PageId::new(0, 0), &mut buf);
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_compressed_space_width() {
        let dir = tempdir().unwrap();
        let driver = FileDriver::new(dir.path()).unwrap();
        driver.create_space(7, 2).unwrap();
        assert_eq!(driver.size_class_of(7), 2);

        let bytes = vec![0x11u8; 2048];
        driver.write_bytes(PageId::new(7, 1), &bytes).unwrap();
        assert_eq!(driver.page_count(7), 2);

        let mut back = vec![0u8; 2048];
        driver.read_bytes(PageId::new(7, 1), &mut back).unwrap();
        assert_eq!(back, bytes);
    }

    #[test]
    fn test_drop_space_bumps_version() {
        let dir = tempdir().unwrap();
        let driver = FileDriver::new(dir.path()).unwrap();

        assert_eq!(driver.tablespace_version(5), 0);
        driver.create_space(5, 0).unwrap();
        let v1 = driver.tablespace_version(5);
        assert!(v1 > 0);

        driver.drop_space(5).unwrap();
        assert!(driver.tablespace_version(5) > v1);

        // Re-creating bumps again.
        driver.create_space(5, 0).unwrap();
        assert!(driver.tablespace_version(5) > v1 + 1);

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(driver.read_bytes(PageId::new(5, 0), &mut buf).is_err());
    }

    #[test]
    fn test_open_existing_space() {
        let dir = tempdir().unwrap();
        {
            let driver = FileDriver::new(dir.path()).unwrap();
            driver.create_space(2, 0).unwrap();
            driver
                .write_bytes(PageId::new(2, 0), &vec![9u8; PAGE_SIZE])
                .unwrap();
        }

        let driver = FileDriver::new(dir.path()).unwrap();
        driver.open_space(2, 0).unwrap();
        assert_eq!(driver.page_count(2), 1);

        let mut back = vec![0u8; PAGE_SIZE];
        driver.read_bytes(PageId::new(2, 0), &mut back).unwrap();
        assert_eq!(back[0], 9);
    }
}
