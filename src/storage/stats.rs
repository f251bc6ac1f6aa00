//! File Statistics
//!
//! Per-file byte accounting used to decide when a file is worth compacting,
//! and the stats file that carries it across a clean restart.
//!
//! ## Stats File Format
//! ```text
//! ┌──────────────────────────────┬──────────┐
//! │ bincode(StatsFile)           │ CRC32(4) │
//! └──────────────────────────────┴──────────┘
//! ```
//! The file only exists between a clean stop and the next start, so its
//! absence on startup means the previous run did not shut down cleanly.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::compactor::CompactorMsg;
use crate::error::Result;

/// Name of the stats file inside the index directory
pub const STATS_FILE_NAME: &str = "index.stats";

const STATS_FILE_VERSION: u32 = 1;

// =============================================================================
// Per-file Stats
// =============================================================================

/// Byte accounting of one data file
///
/// All fields are atomics so writers, readers and the compactor can update
/// a file's stats without a lock.
#[derive(Debug)]
pub struct FileStats {
    total: AtomicU64,
    free: AtomicU64,
    /// Earliest expiration of any record in the file, -1 if none
    next_expiration: AtomicI64,
    completed: AtomicBool,
    scheduled: AtomicBool,
    marked_for_deletion: AtomicBool,
}

impl FileStats {
    fn new(total: u64, free: u64, next_expiration: i64, completed: bool) -> Self {
        Self {
            total: AtomicU64::new(total),
            free: AtomicU64::new(free),
            next_expiration: AtomicI64::new(next_expiration),
            completed: AtomicBool::new(completed),
            scheduled: AtomicBool::new(false),
            marked_for_deletion: AtomicBool::new(false),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn free(&self) -> u64 {
        self.free.load(Ordering::Acquire)
    }

    pub fn next_expiration(&self) -> i64 {
        self.next_expiration.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    /// Free bytes as a fraction of total bytes
    pub fn free_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.free() as f64 / total as f64
        }
    }

    fn lower_next_expiration(&self, expiration: i64) {
        if expiration < 0 {
            return;
        }
        let _ = self
            .next_expiration
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < 0 || expiration < current).then_some(expiration)
            });
    }

    /// Claim the file for compaction if it crossed the threshold
    fn try_schedule(&self, threshold: f64) -> bool {
        let total = self.total();
        self.is_completed()
            && !self.is_marked_for_deletion()
            && total > 0
            && self.free() as f64 >= total as f64 * threshold
            && self
                .scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// Serializable snapshot of one file's stats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatsSnapshot {
    pub file: u32,
    pub total: u64,
    pub free: u64,
    pub next_expiration: i64,
}

// =============================================================================
// Stats Table
// =============================================================================

/// Concurrent map of file id → stats
///
/// Sends `CompactorMsg::Compact` as soon as a completed file's free ratio
/// reaches the threshold.
pub struct StatsTable {
    files: DashMap<u32, Arc<FileStats>>,
    threshold: f64,
    trigger: Sender<CompactorMsg>,
}

impl StatsTable {
    pub fn new(threshold: f64, trigger: Sender<CompactorMsg>) -> Self {
        Self {
            files: DashMap::new(),
            threshold,
            trigger,
        }
    }

    /// Start tracking a new, empty log file
    pub fn register(&self, file: u32) {
        self.files
            .entry(file)
            .or_insert_with(|| Arc::new(FileStats::new(0, 0, -1, false)));
    }

    /// Account for `len` bytes appended to `file`
    pub fn record_append(&self, file: u32, len: u64, expiration: i64) {
        if let Some(stats) = self.get(file) {
            stats.total.fetch_add(len, Ordering::AcqRel);
            stats.lower_next_expiration(expiration);
        }
    }

    /// Mark `len` bytes of `file` as dead
    pub fn free(&self, file: u32, len: u64) {
        if let Some(stats) = self.get(file) {
            stats.free.fetch_add(len, Ordering::AcqRel);
            self.maybe_schedule(file, &stats);
        }
    }

    /// The file will not be appended to anymore
    pub fn complete(&self, file: u32, schedule: bool) {
        if let Some(stats) = self.get(file) {
            stats.completed.store(true, Ordering::Release);
            if schedule {
                self.maybe_schedule(file, &stats);
            }
        }
    }

    /// Add stats rebuilt by recovery or read from the stats file
    pub fn insert_completed(&self, snapshot: FileStatsSnapshot) {
        self.files.insert(
            snapshot.file,
            Arc::new(FileStats::new(
                snapshot.total,
                snapshot.free,
                snapshot.next_expiration,
                true,
            )),
        );
    }

    pub fn get(&self, file: u32) -> Option<Arc<FileStats>> {
        self.files.get(&file).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, file: u32) -> Option<Arc<FileStats>> {
        self.files.remove(&file).map(|(_, s)| s)
    }

    pub fn mark_for_deletion(&self, file: u32) {
        if let Some(stats) = self.get(file) {
            stats.marked_for_deletion.store(true, Ordering::Release);
        }
    }

    /// Allow the file to be scheduled again after a failed compaction
    pub fn reset_scheduled(&self, file: u32) {
        if let Some(stats) = self.get(file) {
            stats.scheduled.store(false, Ordering::Release);
        }
    }

    /// Schedule every file that is already eligible
    pub fn schedule_ready(&self) {
        let all: Vec<(u32, Arc<FileStats>)> = self
            .files
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        for (file, stats) in all {
            self.maybe_schedule(file, &stats);
        }
    }

    /// Completed files with an elapsed `next_expiration`
    pub fn files_expiring_by(&self, now: i64) -> Vec<u32> {
        let mut files: Vec<u32> = self
            .files
            .iter()
            .filter(|e| {
                let next = e.value().next_expiration();
                e.value().is_completed() && next >= 0 && next <= now
            })
            .map(|e| *e.key())
            .collect();
        files.sort_unstable();
        files
    }

    /// Completed files not yet handed to deletion, ascending
    pub fn completed_files(&self) -> Vec<u32> {
        let mut files: Vec<u32> = self
            .files
            .iter()
            .filter(|e| e.value().is_completed() && !e.value().is_marked_for_deletion())
            .map(|e| *e.key())
            .collect();
        files.sort_unstable();
        files
    }

    /// Snapshot of all stats, ordered by file id
    pub fn snapshot(&self) -> Vec<FileStatsSnapshot> {
        let mut all: Vec<FileStatsSnapshot> = self
            .files
            .iter()
            .map(|e| FileStatsSnapshot {
                file: *e.key(),
                total: e.value().total(),
                free: e.value().free(),
                next_expiration: e.value().next_expiration(),
            })
            .collect();
        all.sort_unstable_by_key(|s| s.file);
        all
    }

    /// (total bytes, free bytes) across all files
    pub fn totals(&self) -> (u64, u64) {
        self.files.iter().fold((0, 0), |(total, free), e| {
            (total + e.value().total(), free + e.value().free())
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&self) {
        self.files.clear();
    }

    fn maybe_schedule(&self, file: u32, stats: &FileStats) {
        if stats.try_schedule(self.threshold) {
            tracing::debug!(
                file,
                total = stats.total(),
                free = stats.free(),
                "Scheduling file for compaction"
            );
            if self.trigger.send(CompactorMsg::Compact { file }).is_err() {
                // Compactor already stopped
                stats.scheduled.store(false, Ordering::Release);
            }
        }
    }
}

// =============================================================================
// Stats File
// =============================================================================

/// Contents of `index.stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsFile {
    pub version: u32,
    /// Highest sequence id handed out before the stop
    pub max_seq_id: u64,
    /// Cache segment count the index was built with
    pub segment_count: u32,
    pub files: Vec<FileStatsSnapshot>,
}

impl StatsFile {
    pub fn new(max_seq_id: u64, segment_count: u32, files: Vec<FileStatsSnapshot>) -> Self {
        Self {
            version: STATS_FILE_VERSION,
            max_seq_id,
            segment_count,
            files,
        }
    }
}

/// Write the stats file atomically (temp file + rename)
pub fn write_stats_file(dir: &Path, stats: &StatsFile) -> Result<()> {
    let mut bytes = bincode::serialize(stats)?;
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());

    let tmp = dir.join(format!("{}.tmp", STATS_FILE_NAME));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(STATS_FILE_NAME))?;
    Ok(())
}

/// Read the stats file
///
/// Returns `Ok(None)` if it is missing, damaged or of another version.
pub fn read_stats_file(dir: &Path) -> Result<Option<StatsFile>> {
    let bytes = match fs::read(dir.join(STATS_FILE_NAME)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < 4 {
        tracing::warn!("Stats file too short, ignoring it");
        return Ok(None);
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != stored {
        tracing::warn!("Stats file checksum mismatch, ignoring it");
        return Ok(None);
    }

    match bincode::deserialize::<StatsFile>(body) {
        Ok(stats) if stats.version == STATS_FILE_VERSION => Ok(Some(stats)),
        Ok(stats) => {
            tracing::warn!(version = stats.version, "Unknown stats file version");
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Stats file unreadable, ignoring it");
            Ok(None)
        }
    }
}

/// Delete the stats file if present
pub fn remove_stats_file(dir: &Path) -> Result<()> {
    match fs::remove_file(dir.join(STATS_FILE_NAME)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
