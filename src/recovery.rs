//! Recovery / Bootstrap
//!
//! Brings the index and file stats in line with the data files on startup.
//!
//! ## Strategy
//! ```text
//!                 ┌─────────────────────┐
//!                 │ purge_on_startup ?  │──yes──▶ delete everything
//!                 └──────────┬──────────┘
//!                            │ no
//!                 ┌──────────▼──────────┐
//!                 │ stats file present  │──no───┐
//!                 │ and matches files ? │       │
//!                 └──────────┬──────────┘       │
//!                            │ yes              │
//!                 ┌──────────▼──────────┐       │
//!                 │ all index trees     │──no───┤
//!                 │ closed cleanly ?    │       │
//!                 └──────────┬──────────┘       │
//!                            │ yes       ┌──────▼──────┐
//!                         LOADED         │   REBUILD   │
//!                                        └─────────────┘
//! ```
//!
//! A rebuild scans every data file in id order, cuts each file at its first
//! damaged record, and keeps the newest record per key. Damage is logged,
//! never returned as an error: partial writes are expected after a crash.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;

use crate::error::Result;
use crate::index::{Index, IndexEntry, PutOutcome};
use crate::partition::KeyPartitioner;
use crate::record::{is_expired_at, HeaderFormat, Record, RecordScanner, Scan};
use crate::storage::{
    read_stats_file, remove_stats_file, FileManager, Location, StatsTable,
    LEGACY_DATA_FILE_PREFIX,
};
use crate::time::TimeService;

/// How the store came up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Existing data was deleted
    Purged,
    /// Index and stats from the previous clean stop were reused
    Loaded,
    /// Index and stats were rebuilt by scanning the data files
    Rebuilt,
}

/// Outcome of startup recovery
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub mode: RecoveryMode,
    pub files_scanned: usize,
    pub records_scanned: u64,
    /// (file, offset) of every truncation
    pub truncated: Vec<(u32, u64)>,
    pub tombstones_dropped: u64,
    /// Highest sequence id found; new writes continue after it
    pub max_seq_id: u64,
    /// Records imported from legacy-format files
    pub legacy_records: u64,
}

impl RecoveryReport {
    fn new(mode: RecoveryMode) -> Self {
        Self {
            mode,
            files_scanned: 0,
            records_scanned: 0,
            truncated: Vec::new(),
            tombstones_dropped: 0,
            max_seq_id: 0,
            legacy_records: 0,
        }
    }
}

/// Startup recovery over one store's components
pub struct Recovery<'a> {
    pub files: &'a FileManager,
    pub index: &'a Index,
    pub stats: &'a StatsTable,
    pub partitioner: &'a dyn KeyPartitioner,
    pub time: &'a dyn TimeService,
}

impl Recovery<'_> {
    /// Purge, load or rebuild
    pub fn run(&self, purge: bool) -> Result<RecoveryReport> {
        if purge {
            self.purge()?;
            return Ok(RecoveryReport::new(RecoveryMode::Purged));
        }

        if let Some(max_seq_id) = self.try_load()? {
            let mut report = RecoveryReport::new(RecoveryMode::Loaded);
            report.max_seq_id = max_seq_id;
            tracing::info!(
                files = self.files.file_count(),
                entries = self.index.entry_count(),
                "Loaded index from clean shutdown"
            );
            return Ok(report);
        }

        self.rebuild()
    }

    /// Delete all data, legacy data, index and stats files
    pub fn purge(&self) -> Result<()> {
        self.files.clear();
        purge_legacy(self.files.dir())?;
        self.index.clear();
        self.stats.clear();
        self.index.delete_files()?;
        remove_stats_file(self.index.dir())?;
        tracing::info!("Purged store on startup");
        Ok(())
    }

    /// Reuse the persisted index; returns the max sequence id on success
    fn try_load(&self) -> Result<Option<u64>> {
        let dir = self.index.dir();
        let Some(stats_file) = read_stats_file(dir)? else {
            tracing::debug!("No usable stats file");
            return Ok(None);
        };
        // Its absence marks every later run as dirty until the next clean stop
        remove_stats_file(dir)?;

        if stats_file.segment_count != self.index.cache_segments() {
            tracing::warn!(
                stored = stats_file.segment_count,
                configured = self.index.cache_segments(),
                "Segment count changed"
            );
            return Ok(None);
        }

        let file_ids = self.files.file_ids();
        let stats_ids: Vec<u32> = stats_file.files.iter().map(|s| s.file).collect();
        if file_ids != stats_ids {
            tracing::warn!(
                files = file_ids.len(),
                stats = stats_ids.len(),
                "Stats file does not match data files"
            );
            return Ok(None);
        }
        for snapshot in &stats_file.files {
            let size = self.files.get_file(snapshot.file).map(|f| f.len());
            if size != Some(snapshot.total) || snapshot.free > snapshot.total {
                tracing::warn!(
                    file = snapshot.file,
                    size = ?size,
                    recorded = snapshot.total,
                    "Stats file does not match data file size"
                );
                return Ok(None);
            }
        }

        if !self.index.load()? {
            tracing::warn!("Index was not closed cleanly");
            return Ok(None);
        }

        for snapshot in stats_file.files {
            self.stats.insert_completed(snapshot);
        }
        Ok(Some(stats_file.max_seq_id.max(self.index.max_seq_id())))
    }

    /// Reconstruct index and stats from the data files
    fn rebuild(&self) -> Result<RecoveryReport> {
        tracing::warn!(
            files = self.files.file_count(),
            "Rebuilding index from data files"
        );
        self.index.clear();
        self.stats.clear();
        self.index.delete_files()?;

        let mut report = RecoveryReport::new(RecoveryMode::Rebuilt);
        for id in self.files.file_ids() {
            let Some(handle) = self.files.get_file(id) else {
                continue;
            };
            self.stats.register(id);
            report.files_scanned += 1;

            let mut scanner = RecordScanner::open(handle.path(), HeaderFormat::Current, None)?;
            loop {
                match scanner.next_record()? {
                    Scan::Record {
                        offset,
                        decoded,
                        raw,
                    } => {
                        let header = decoded.header;
                        let location = Location {
                            file: id,
                            offset,
                            len: raw.len() as u32,
                        };
                        self.stats.record_append(id, raw.len() as u64, header.expiration);
                        report.records_scanned += 1;
                        report.max_seq_id = report.max_seq_id.max(header.seq_id);

                        let segment = self.partitioner.segment_of(&decoded.key);
                        let entry = IndexEntry::new(
                            location,
                            header.seq_id,
                            header.expiration,
                            header.is_tombstone(),
                        );
                        match self.index.put(segment, &decoded.key, entry) {
                            PutOutcome::Applied {
                                previous: Some(previous),
                            } => self
                                .stats
                                .free(previous.location.file, previous.location.len as u64),
                            PutOutcome::Applied { previous: None } => {}
                            PutOutcome::Stale => self.stats.free(id, location.len as u64),
                        }
                    }
                    Scan::Truncated { offset, reason } => {
                        tracing::warn!(
                            file = id,
                            offset,
                            size = handle.len(),
                            reason = %reason,
                            "Truncating data file at damaged record"
                        );
                        handle.truncate(offset)?;
                        report.truncated.push((id, offset));
                        break;
                    }
                    Scan::End => break,
                }
            }
            self.stats.complete(id, false);
        }

        report.tombstones_dropped = self.drop_expired_tombstones();

        tracing::info!(
            files = report.files_scanned,
            records = report.records_scanned,
            entries = self.index.entry_count(),
            truncated = report.truncated.len(),
            "Rebuilt index"
        );
        Ok(report)
    }

    /// Forget tombstones that are the only record of their key and whose
    /// retention has passed
    fn drop_expired_tombstones(&self) -> u64 {
        let now = self.time.wall_clock_millis();
        let dead = self.index.collect_where(|_, e| {
            e.tombstone && e.records <= 1 && is_expired_at(e.expiration, now)
        });

        let mut dropped = 0;
        for (key, entry) in dead {
            if self
                .index
                .remove_if_at(key.segment, &key.key, entry.location)
                .is_some()
            {
                self.stats
                    .free(entry.location.file, entry.location.len as u64);
                dropped += 1;
            }
        }
        dropped
    }
}

/// Replay legacy-format files found in `dir` through `write`, deleting them
/// afterwards
///
/// Legacy stores may hold stale copies of a key in newer files, so every file
/// is scanned first and only the newest record per key is replayed, oldest
/// first. Returns the number of records replayed.
pub fn import_legacy(dir: &Path, mut write: impl FnMut(Record) -> Result<()>) -> Result<u64> {
    let legacy = FileManager::open(dir, LEGACY_DATA_FILE_PREFIX)?;
    if !legacy.has_files() {
        return Ok(0);
    }

    let mut newest: HashMap<Bytes, (u64, Record)> = HashMap::new();
    let mut scanned = 0u64;
    for id in legacy.file_ids() {
        let Some(handle) = legacy.get_file(id) else {
            continue;
        };
        let mut scanner = RecordScanner::open(handle.path(), HeaderFormat::Legacy, None)?;
        loop {
            match scanner.next_record()? {
                Scan::Record { decoded, .. } => {
                    scanned += 1;
                    let seq_id = decoded.header.seq_id;
                    let record = decoded.into_record();
                    let replace = match newest.get(&record.key) {
                        Some((kept_seq, kept)) => {
                            legacy_supersedes(seq_id, &record, *kept_seq, kept)
                        }
                        None => true,
                    };
                    if replace {
                        newest.insert(record.key.clone(), (seq_id, record));
                    }
                }
                Scan::Truncated { offset, reason } => {
                    tracing::warn!(
                        file = id,
                        offset,
                        reason = %reason,
                        "Legacy file ends in a damaged record"
                    );
                    break;
                }
                Scan::End => break,
            }
        }
    }

    let mut winners: Vec<(u64, Record)> = newest.into_values().collect();
    winners.sort_by_key(|(seq_id, _)| *seq_id);
    let imported = winners.len() as u64;
    for (_, record) in winners {
        write(record)?;
    }

    for id in legacy.file_ids() {
        legacy.delete_file(id);
    }

    tracing::info!(scanned, records = imported, "Imported legacy data files");
    Ok(imported)
}

/// Delete legacy-format files found in `dir` without reading them
pub fn purge_legacy(dir: &Path) -> Result<()> {
    let legacy = FileManager::open(dir, LEGACY_DATA_FILE_PREFIX)?;
    if legacy.has_files() {
        tracing::info!(files = legacy.file_count(), "Purging legacy data files");
        legacy.clear();
    }
    Ok(())
}

/// Higher seq wins; on a tie a tombstone beats a value
fn legacy_supersedes(seq_id: u64, record: &Record, kept_seq: u64, kept: &Record) -> bool {
    seq_id > kept_seq || (seq_id == kept_seq && record.is_tombstone() && !kept.is_tombstone())
}
