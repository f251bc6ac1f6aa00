//! Data File Handle
//!
//! A single data file with positioned reads and appends.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Shared handle to a data file
pub type FileHandle = Arc<DataFile>;

/// An open data file
///
/// ## Concurrency:
/// - `file`: Mutex around seek + read/write (short critical sections)
/// - `len`: Atomic, only grows through `append` (single appender per file)
/// - Deletion is deferred to `Drop`, so a reader holding a handle keeps the
///   bytes alive until it is done
pub struct DataFile {
    id: u32,
    path: PathBuf,
    file: Mutex<File>,
    len: AtomicU64,
    delete_on_drop: AtomicBool,
}

impl DataFile {
    /// Create a new, empty file (fails if it already exists)
    pub fn create(path: &Path, id: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self::with_file(path, id, file, 0))
    }

    /// Open an existing file
    pub fn open(path: &Path, id: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::with_file(path, id, file, len))
    }

    fn with_file(path: &Path, id: u32, file: File, len: u64) -> Self {
        Self {
            id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len: AtomicU64::new(len),
            delete_on_drop: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length in bytes
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes at `offset`
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Append `bytes` at the end of the file, returning their offset
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut file = self.file.lock();
        let offset = self.len.load(Ordering::Acquire);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        self.len.store(offset + bytes.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// fsync data to disk
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Cut the file at `len` (drops a partially written tail)
    pub fn truncate(&self, len: u64) -> Result<()> {
        let file = self.file.lock();
        file.set_len(len)?;
        file.sync_all()?;
        self.len.store(len, Ordering::Release);
        Ok(())
    }

    /// Unlink the file once the last handle is dropped
    pub(crate) fn mark_deleted(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    pub fn is_marked_deleted(&self) -> bool {
        self.delete_on_drop.load(Ordering::Acquire)
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(file = self.id, "Deleted data file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(file = self.id, error = %e, "Failed to delete data file"),
            }
        }
    }
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}
