//! Log Writer
//!
//! Appends encoded records to the current log file, rotating to a fresh file
//! when the next record would push it past `max_file_size`.

use std::sync::Arc;

use crate::config::SyncStrategy;
use crate::error::{Result, SifsError};

use super::{FileHandle, FileManager, Location, StatsTable};

/// Single-owner appender over a sequence of log files
///
/// The store runs two of these: one for client writes and one for the
/// compactor, so compaction never contends with foreground appends for the
/// same file.
pub struct LogWriter {
    /// Owner name, for logging
    name: &'static str,
    files: Arc<FileManager>,
    stats: Arc<StatsTable>,
    max_file_size: u64,
    sync_strategy: SyncStrategy,
    current: Option<FileHandle>,
    /// Appends since the last fsync
    unsynced: usize,
}

impl LogWriter {
    pub fn new(
        name: &'static str,
        files: Arc<FileManager>,
        stats: Arc<StatsTable>,
        max_file_size: u64,
        sync_strategy: SyncStrategy,
    ) -> Self {
        Self {
            name,
            files,
            stats,
            max_file_size,
            sync_strategy,
            current: None,
            unsynced: 0,
        }
    }

    /// Append one encoded record
    pub fn append(&mut self, record: &[u8], expiration: i64) -> Result<Location> {
        let len = u32::try_from(record.len()).map_err(|_| SifsError::RecordTooLarge {
            len: record.len() as u64,
            max: u32::MAX as u64,
        })?;
        let file = self.rotate_if_needed(len as u64)?;

        let offset = file.append(record)?;
        self.stats
            .record_append(file.id(), record.len() as u64, expiration);

        match self.sync_strategy {
            SyncStrategy::EveryWrite => file.sync()?,
            SyncStrategy::EveryNEntries { count } => {
                self.unsynced += 1;
                if self.unsynced >= count {
                    file.sync()?;
                    self.unsynced = 0;
                }
            }
            SyncStrategy::Never => {}
        }

        Ok(Location {
            file: file.id(),
            offset,
            len,
        })
    }

    /// Make sure the current file can take `len` more bytes
    ///
    /// A record larger than `max_file_size` still goes into an empty file.
    pub fn rotate_if_needed(&mut self, len: u64) -> Result<FileHandle> {
        let needs_rotation = match &self.current {
            Some(file) => !file.is_empty() && file.len() + len > self.max_file_size,
            None => true,
        };
        if needs_rotation {
            self.rotate()?;
        }
        match &self.current {
            Some(file) => Ok(Arc::clone(file)),
            None => self.open_new(),
        }
    }

    /// Close the current file (if any) and start a new one
    pub fn rotate(&mut self) -> Result<()> {
        self.close_current(true)?;
        self.open_new()?;
        Ok(())
    }

    /// Close the current file at shutdown without scheduling compaction
    pub fn finish(&mut self) -> Result<()> {
        self.close_current(false)
    }

    /// Forget the current file; used after its files were cleared
    pub fn reset(&mut self) {
        self.current = None;
        self.unsynced = 0;
    }

    pub fn current_file(&self) -> Option<u32> {
        self.current.as_ref().map(|f| f.id())
    }

    fn open_new(&mut self) -> Result<FileHandle> {
        let file = self.files.create_log_file()?;
        self.stats.register(file.id());
        self.current = Some(Arc::clone(&file));
        Ok(file)
    }

    fn close_current(&mut self, schedule: bool) -> Result<()> {
        let Some(file) = self.current.take() else {
            return Ok(());
        };

        if file.is_empty() && !schedule {
            self.stats.remove(file.id());
            self.files.delete_file(file.id());
            return Ok(());
        }

        file.sync()?;
        self.unsynced = 0;
        self.files.close_log_file(file.id());
        self.stats.complete(file.id(), schedule);

        tracing::debug!(
            writer = self.name,
            file = file.id(),
            size = file.len(),
            "Completed log file"
        );
        Ok(())
    }
}
