//! File Manager
//!
//! Owns the set of data files of one store.
//!
//! ## Responsibilities
//! - Discover existing data files on startup
//! - Allocate monotonically increasing file ids
//! - Track which files are log files (still being appended)
//! - Delete files once compaction is done with them

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Result, SifsError};
use crate::record::{self, HeaderFormat, Record};

use super::{DataFile, FileHandle, Location};

/// File name prefix of current-format data files
pub const DATA_FILE_PREFIX: &str = "sifs2.";

/// File name prefix of legacy-format data files
pub const LEGACY_DATA_FILE_PREFIX: &str = "sifs1.";

/// Manages the data files of a store
///
/// ## Concurrency:
/// - `files`: RwLock (lookups are reads, create/delete are writes)
/// - `log_files`: RwLock, small set of files currently appended to
/// - `next_file_id`: Atomic counter (lock-free)
pub struct FileManager {
    /// Directory where data files are stored
    dir: PathBuf,

    /// Name prefix, which also selects the header format
    prefix: &'static str,

    /// All live files, opened eagerly on discovery
    files: RwLock<HashMap<u32, FileHandle>>,

    /// Files currently owned by a log writer
    log_files: RwLock<HashSet<u32>>,

    /// Next ID for creating new files
    next_file_id: AtomicU32,
}

impl FileManager {
    /// Open or create the data directory and discover files with `prefix`
    pub fn open(dir: &Path, prefix: &'static str) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut files = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_path = entry.path();

            if file_path.is_file() {
                if let Some(id) = Self::parse_file_id(&file_path, prefix) {
                    files.insert(id, Arc::new(DataFile::open(&file_path, id)?));
                }
            }
        }

        // Next ID = max + 1, or 0 if no files exist
        let next_id = files.keys().max().map(|&id| id + 1).unwrap_or(0);
        if !files.is_empty() {
            tracing::debug!(
                dir = %dir.display(),
                count = files.len(),
                next_id,
                "Discovered data files"
            );
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            prefix,
            files: RwLock::new(files),
            log_files: RwLock::new(HashSet::new()),
            next_file_id: AtomicU32::new(next_id),
        })
    }

    /// Get a handle to a file, or `None` if it was deleted
    pub fn get_file(&self, id: u32) -> Option<FileHandle> {
        self.files.read().get(&id).cloned()
    }

    /// Ids of all live files, ascending
    pub fn file_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.files.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    pub fn has_files(&self) -> bool {
        !self.files.read().is_empty()
    }

    /// Sum of the sizes of all live files
    pub fn total_size(&self) -> u64 {
        self.files.read().values().map(|f| f.len()).sum()
    }

    /// Create a new file and register it as a log file
    pub fn create_log_file(&self) -> Result<FileHandle> {
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let file = Arc::new(DataFile::create(&self.file_path(id), id)?);

        self.files.write().insert(id, Arc::clone(&file));
        self.log_files.write().insert(id);

        tracing::debug!(file = id, "Created log file");
        Ok(file)
    }

    /// The file is no longer appended to
    pub fn close_log_file(&self, id: u32) {
        self.log_files.write().remove(&id);
    }

    pub fn is_log_file(&self, id: u32) -> bool {
        self.log_files.read().contains(&id)
    }

    /// Remove a file; it is unlinked when the last handle goes away
    pub fn delete_file(&self, id: u32) -> bool {
        self.log_files.write().remove(&id);
        match self.files.write().remove(&id) {
            Some(file) => {
                file.mark_deleted();
                true
            }
            None => false,
        }
    }

    /// Delete every file
    pub fn clear(&self) {
        let removed: Vec<FileHandle> = self.files.write().drain().map(|(_, f)| f).collect();
        self.log_files.write().clear();
        for file in &removed {
            file.mark_deleted();
        }
        tracing::debug!(count = removed.len(), "Cleared data files");
    }

    /// Read and verify the record at `location`
    ///
    /// Returns `None` if the file was deleted in the meantime.
    pub fn read_record(&self, location: Location) -> Result<Option<Record>> {
        let Some(file) = self.get_file(location.file) else {
            return Ok(None);
        };
        let buf = file.read_at(location.offset, location.len as usize)?;
        let decoded = record::decode(Bytes::from(buf), HeaderFormat::Current).map_err(|reason| {
            SifsError::Corruption {
                file: location.file,
                offset: location.offset,
                reason,
            }
        })?;
        Ok(Some(decoded.into_record()))
    }

    /// Get the data directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Get the next file ID (for testing/debugging)
    pub fn next_file_id(&self) -> u32 {
        self.next_file_id.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Generate the file path for a data file with given ID
    fn file_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, id))
    }

    /// Parse file ID from filename
    /// "sifs2.42" → Some(42)
    fn parse_file_id(path: &Path, prefix: &str) -> Option<u32> {
        let name = path.file_name()?.to_str()?;
        let id_str = name.strip_prefix(prefix)?;
        id_str.parse().ok()
    }
}
