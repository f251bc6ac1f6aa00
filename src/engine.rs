//! Engine Module
//!
//! The synchronous core of the store, coordinating every component.
//!
//! ## Responsibilities
//! - Hold the process lock for the lifetime of the store
//! - Run recovery and the legacy import on open
//! - Append records and keep the index pointing at the newest one
//! - Serve lookups, iteration, clear and expiration passes
//! - Persist the index and file stats on a clean stop

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel;
use parking_lot::Mutex;

use crate::compactor::{
    Compactor, CompactorContext, ExpirationObserver, ExpirationReaper, LoggingObserver,
};
use crate::config::StoreConfig;
use crate::error::{Result, SifsError};
use crate::index::{Index, IndexEntry, IndexIter, PutOutcome};
use crate::lock::StoreLock;
use crate::partition::{HashPartitioner, KeyPartitioner};
use crate::record::{self, is_expired_at, Record, NO_EXPIRATION};
use crate::recovery::{self, Recovery, RecoveryReport};
use crate::storage::{
    remove_stats_file, write_stats_file, FileManager, Location, LogWriter, StatsFile, StatsTable,
    DATA_FILE_PREFIX,
};
use crate::time::{SystemTimeService, TimeService};

/// Pluggable collaborators of an engine
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub partitioner: Arc<dyn KeyPartitioner>,
    pub time: Arc<dyn TimeService>,
    /// Receives the outcome of background expiration passes
    pub observer: Arc<dyn ExpirationObserver>,
}

impl Collaborators {
    /// Hash partitioning, the system clock and a logging observer
    pub fn for_config(config: &StoreConfig) -> Self {
        Self {
            partitioner: Arc::new(HashPartitioner::new(config.effective_segments())),
            time: Arc::new(SystemTimeService),
            observer: Arc::new(LoggingObserver::default()),
        }
    }
}

/// Point-in-time view of store occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub data_files: usize,
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Non-tombstone index entries
    pub live_entries: u64,
    /// All index entries, tombstones included
    pub index_entries: usize,
}

/// The storage engine
///
/// ## Concurrency Model
///
/// - **Writes**: sequence ids are allocated and records appended under the
///   `appender` mutex; the index update happens under the same lock so that
///   `clear` never races a half-finished write
/// - **Reads**: lock-free apart from the index tree's read lock; a read that
///   loses its file to compaction looks the key up again
/// - **Compaction**: a separate thread with its own log writer; it only
///   moves index entries by compare-and-set
pub struct Engine {
    config: StoreConfig,
    collab: Collaborators,

    files: Arc<FileManager>,
    stats: Arc<StatsTable>,
    index: Arc<Index>,

    /// Client log writer; also serializes appends
    appender: Mutex<LogWriter>,

    /// Next sequence id to hand out
    next_seq: AtomicU64,

    compactor: Compactor,
    reaper: Mutex<Option<ExpirationReaper>>,
    lock: Mutex<Option<StoreLock>>,

    running: AtomicBool,
    report: RecoveryReport,
}

impl Engine {
    /// Open the store described by `config`
    ///
    /// On startup:
    /// 1. Lock the data and index roots
    /// 2. Purge, load the persisted index, or rebuild it from data files
    /// 3. Start the compactor
    /// 4. Import legacy data files through the write path
    /// 5. Schedule compaction of fragmented files, start the reaper
    pub fn open(config: StoreConfig, collab: Collaborators) -> Result<Self> {
        if collab.partitioner.segment_count() != config.effective_segments() {
            return Err(SifsError::Config(format!(
                "partitioner has {} segments, configuration has {}",
                collab.partitioner.segment_count(),
                config.effective_segments()
            )));
        }

        // Step 1: Nothing touches the directories before the lock is ours
        let lock = StoreLock::acquire(&[config.data_root(), config.index_root()], config.lock_timeout)?;

        // Step 2: Components
        let files = Arc::new(FileManager::open(&config.data_dir(), DATA_FILE_PREFIX)?);
        let (sender, receiver) = channel::unbounded();
        let stats = Arc::new(StatsTable::new(config.compaction_threshold, sender.clone()));
        let index = Arc::new(Index::new(
            &config.index_dir(),
            config.effective_segments(),
            config.index_segments,
            config.max_node_entries,
        )?);

        // Step 3: Recovery
        let report = Recovery {
            files: &files,
            index: &index,
            stats: &stats,
            partitioner: collab.partitioner.as_ref(),
            time: collab.time.as_ref(),
        }
        .run(config.purge_on_startup)?;

        // Step 4: Compactor
        let compactor = Compactor::start(
            CompactorContext {
                files: Arc::clone(&files),
                stats: Arc::clone(&stats),
                index: Arc::clone(&index),
                partitioner: Arc::clone(&collab.partitioner),
                time: Arc::clone(&collab.time),
                max_file_size: config.max_file_size,
                sync_strategy: config.sync_strategy,
                tombstone_retention: config.tombstone_retention,
            },
            sender,
            receiver,
        )?;

        let appender = LogWriter::new(
            "appender",
            Arc::clone(&files),
            Arc::clone(&stats),
            config.max_file_size,
            config.sync_strategy,
        );

        let mut engine = Self {
            next_seq: AtomicU64::new(report.max_seq_id + 1),
            config,
            collab,
            files,
            stats,
            index,
            appender: Mutex::new(appender),
            compactor,
            reaper: Mutex::new(None),
            lock: Mutex::new(Some(lock)),
            running: AtomicBool::new(true),
            report,
        };

        // Step 5: Legacy files are rewritten in the current format
        let imported = recovery::import_legacy(engine.files.dir(), |record| engine.write(record))?;
        engine.report.legacy_records = imported;

        // Step 6: Background work
        engine.stats.schedule_ready();
        let interval = engine.config.expiration_wake_up_interval;
        if !interval.is_zero() {
            let reaper = ExpirationReaper::start(
                interval,
                engine.compactor.sender(),
                Arc::clone(&engine.collab.observer),
            )?;
            *engine.reaper.lock() = Some(reaper);
        }

        tracing::info!(
            cache = %engine.config.cache_name,
            mode = ?engine.report.mode,
            files = engine.files.file_count(),
            entries = engine.index.entry_count(),
            next_seq = engine.next_seq.load(Ordering::Acquire),
            "Store started"
        );
        Ok(engine)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append a record and index it
    ///
    /// A record without a value is a tombstone and deletes the key. A
    /// tombstone without an expiration is kept for `tombstone_retention`.
    pub fn write(&self, record: Record) -> Result<()> {
        let record = if record.is_tombstone() && record.expiration == NO_EXPIRATION {
            let retention = self.config.tombstone_retention.as_millis() as i64;
            let expiration = self.collab.time.wall_clock_millis().saturating_add(retention);
            record.with_expiration(expiration)
        } else {
            record
        };
        let segment = self.collab.partitioner.segment_of(&record.key);

        let mut appender = self.appender.lock();
        if !self.running.load(Ordering::Acquire) {
            return Err(SifsError::NotRunning);
        }

        let seq_id = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let bytes = record::encode(&record, segment, seq_id)?;
        let location = appender.append(&bytes, record.expiration)?;

        let entry = IndexEntry::new(location, seq_id, record.expiration, record.is_tombstone());
        match self.index.put(segment, &record.key, entry) {
            PutOutcome::Applied {
                previous: Some(previous),
            } => self
                .stats
                .free(previous.location.file, previous.location.len as u64),
            PutOutcome::Applied { previous: None } => {}
            PutOutcome::Stale => self.stats.free(location.file, location.len as u64),
        }
        Ok(())
    }

    /// Delete a key
    ///
    /// Returns whether a live value was present. Absent keys and keys that are
    /// already deleted get no new tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.ensure_running()?;
        let key = Bytes::copy_from_slice(key);
        let segment = self.collab.partitioner.segment_of(&key);

        let Some(entry) = self.index.get(segment, &key) else {
            return Ok(false);
        };
        if entry.tombstone {
            return Ok(false);
        }

        let now = self.collab.time.wall_clock_millis();
        self.write(Record::tombstone(key))?;
        Ok(!is_expired_at(entry.expiration, now))
    }

    /// Delete all data, index and stats files
    pub fn clear(&self) -> Result<()> {
        self.ensure_running()?;

        let mut appender = self.appender.lock();
        let _paused = self.compactor.pause_for_clear()?;

        self.index.clear();
        self.stats.clear();
        self.files.clear();
        appender.reset();
        self.index.delete_files()?;
        remove_stats_file(self.index.dir())?;

        tracing::info!(cache = %self.config.cache_name, "Store cleared");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Load the live record of a key
    pub fn load(&self, key: &[u8]) -> Result<Option<Record>> {
        self.ensure_running()?;
        let key = Bytes::copy_from_slice(key);
        let segment = self.collab.partitioner.segment_of(&key);
        self.read_live(segment, &key, false)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.ensure_running()?;
        let key = Bytes::copy_from_slice(key);
        let segment = self.collab.partitioner.segment_of(&key);
        let now = self.collab.time.wall_clock_millis();
        Ok(self
            .index
            .get(segment, &key)
            .map(|e| !e.tombstone && !is_expired_at(e.expiration, now))
            .unwrap_or(false))
    }

    /// Live entries, including expired ones not yet purged
    pub fn size(&self) -> u64 {
        self.index.size()
    }

    /// Live entries of the given segments
    pub fn size_of(&self, segments: &[u32]) -> u64 {
        self.index.size_of(segments)
    }

    /// Lazily iterate keys of live, unexpired entries accepted by `filter`
    pub fn keys(&self, segments: Option<&[u32]>, filter: Option<KeyFilter>) -> Keys {
        Keys {
            now: self.collab.time.wall_clock_millis(),
            inner: self.index.iter(segments),
            filter,
        }
    }

    /// Lazily iterate live records whose key is accepted by `filter`
    ///
    /// The filter runs before the data file is read. Without `include_values`
    /// the records carry metadata only and their `value` is `None`.
    pub fn entries(
        self: &Arc<Self>,
        segments: Option<&[u32]>,
        filter: Option<KeyFilter>,
        include_values: bool,
        include_expired: bool,
    ) -> Entries {
        Entries {
            engine: Arc::clone(self),
            inner: self.index.iter(segments),
            filter,
            include_values,
            include_expired,
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact every closed file and wait for it
    pub fn force_compaction(&self) -> Result<()> {
        self.ensure_running()?;
        self.compactor.force_compaction()
    }

    /// Run an expiration pass now, reporting to `observer`
    pub fn purge_expired(&self, observer: Arc<dyn ExpirationObserver>) -> Result<()> {
        self.ensure_running()?;
        self.compactor.expire(observer)
    }

    pub fn stats(&self) -> StoreStats {
        let (total_bytes, free_bytes) = self.stats.totals();
        StoreStats {
            data_files: self.files.file_count(),
            total_bytes,
            free_bytes,
            live_entries: self.index.size(),
            index_entries: self.index.entry_count(),
        }
    }

    /// Running, with both directories in place
    pub fn is_available(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.config.data_dir().is_dir()
            && self.config.index_dir().is_dir()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop background work, persist the index and release the lock
    ///
    /// Calling it again is a no-op.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(mut reaper) = self.reaper.lock().take() {
            reaper.stop();
        }
        self.compactor.stop();

        // The lock goes even if persisting fails; the next start rebuilds
        let result = self.persist();
        if let Some(lock) = self.lock.lock().take() {
            lock.release();
        }

        match &result {
            Ok(()) => tracing::info!(cache = %self.config.cache_name, "Store stopped"),
            Err(e) => tracing::error!(cache = %self.config.cache_name, error = %e, "Store stopped without persisting"),
        }
        result
    }

    fn persist(&self) -> Result<()> {
        self.appender.lock().finish()?;
        self.index.persist()?;

        let max_seq_id = self.next_seq.load(Ordering::Acquire).saturating_sub(1);
        let stats_file = StatsFile::new(max_seq_id, self.index.cache_segments(), self.stats.snapshot());
        write_stats_file(self.index.dir(), &stats_file)
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    pub fn file_stats(&self) -> &Arc<StatsTable> {
        &self.stats
    }

    pub fn segment_of(&self, key: &[u8]) -> u32 {
        self.collab.partitioner.segment_of(key)
    }

    /// Read the record at `location`, or `None` if its file is gone
    pub fn read_at(&self, location: Location) -> Result<Option<Record>> {
        self.files.read_record(location)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SifsError::NotRunning)
        }
    }

    /// Follow the index to the newest live record of `key`
    fn read_live(&self, segment: u32, key: &Bytes, include_expired: bool) -> Result<Option<Record>> {
        loop {
            let Some(entry) = self.index.get(segment, key) else {
                return Ok(None);
            };
            if entry.tombstone {
                return Ok(None);
            }
            if !include_expired && is_expired_at(entry.expiration, self.collab.time.wall_clock_millis()) {
                return Ok(None);
            }

            match self.read_at(entry.location)? {
                Some(record) if record.key == *key => return Ok(Some(record)),
                Some(_) => {
                    return Err(SifsError::Index(format!(
                        "entry at file {} offset {} holds another key",
                        entry.location.file, entry.location.offset
                    )))
                }
                None => {
                    // Compacted away between lookup and read; a moved entry
                    // points elsewhere now
                    let moved = self
                        .index
                        .get(segment, key)
                        .map(|e| e.location != entry.location)
                        .unwrap_or(false);
                    if !moved {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "Failed to stop store on drop");
        }
    }
}

// =============================================================================
// Iterators
// =============================================================================

/// Predicate over raw keys, applied by [`Engine::keys`] and [`Engine::entries`]
pub type KeyFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

fn accepts(filter: &Option<KeyFilter>, key: &[u8]) -> bool {
    filter.as_ref().map_or(true, |f| f(key))
}

/// Keys of live, unexpired entries
pub struct Keys {
    now: i64,
    inner: IndexIter,
    filter: Option<KeyFilter>,
}

impl Iterator for Keys {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        for (key, entry) in self.inner.by_ref() {
            if !entry.tombstone
                && !is_expired_at(entry.expiration, self.now)
                && accepts(&self.filter, &key.key)
            {
                return Some(key.key);
            }
        }
        None
    }
}

/// Live records, read from their data files on demand
pub struct Entries {
    engine: Arc<Engine>,
    inner: IndexIter,
    filter: Option<KeyFilter>,
    include_values: bool,
    include_expired: bool,
}

impl Iterator for Entries {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        for (key, entry) in self.inner.by_ref() {
            if entry.tombstone || !accepts(&self.filter, &key.key) {
                continue;
            }
            match self
                .engine
                .read_live(key.segment, &key.key, self.include_expired)
            {
                Ok(Some(mut record)) => {
                    if !self.include_values {
                        record.value = None;
                    }
                    return Some(Ok(record));
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
