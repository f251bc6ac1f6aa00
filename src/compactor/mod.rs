//! Compactor Module
//!
//! Background worker that reclaims space by rewriting the live records of
//! fragmented files into its own log file and deleting the originals.
//!
//! ## Responsibilities
//! - Compact files whose free ratio crossed the threshold
//! - Force-compact every closed file on request
//! - Run expiration passes and notify observers
//! - Never corrupt the index when racing client writes
//!
//! ## Per-record Decision (closed file)
//! ```text
//! index entry for key          record                     action
//! ───────────────────────────  ─────────────────────────  ───────────────────────
//! none                         any                        drop
//! points elsewhere             any                        drop, release record
//! points here                  tombstone, sole record,    remove from index
//!                              retention elapsed
//! points here                  value, expired (expire     tombstone + notify
//!                              pass only)
//! points here                  otherwise                  copy + compare-and-move
//! ```
//!
//! A copy that loses its compare-and-move to a concurrent client write is
//! left behind as free space in the compactor's file.

mod expiration;
mod reaper;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::SyncStrategy;
use crate::error::{Result, SifsError};
use crate::index::{Index, IndexEntry};
use crate::partition::KeyPartitioner;
use crate::record::{self, is_expired_at, HeaderFormat, Record, RecordScanner, Scan};
use crate::storage::{FileManager, Location, LogWriter, StatsTable};
use crate::time::TimeService;

pub use expiration::{EntryPosition, ExpirationObserver, LoggingObserver};
pub use reaper::ExpirationReaper;

/// Messages understood by the compactor thread
pub enum CompactorMsg {
    /// A file crossed the free ratio threshold
    Compact { file: u32 },

    /// Compact every closed file
    ForceAll { done: oneshot::Sender<Result<()>> },

    /// Retire expired values
    Expire {
        observer: Arc<dyn ExpirationObserver>,
        done: oneshot::Sender<Result<()>>,
    },

    /// Drop the current log file and wait until the store was cleared
    Clear {
        paused: oneshot::Sender<()>,
        resume: Receiver<()>,
    },

    Stop,
}

/// Everything the compactor works on
#[derive(Clone)]
pub struct CompactorContext {
    pub files: Arc<FileManager>,
    pub stats: Arc<StatsTable>,
    pub index: Arc<Index>,
    pub partitioner: Arc<dyn KeyPartitioner>,
    pub time: Arc<dyn TimeService>,
    pub max_file_size: u64,
    pub sync_strategy: SyncStrategy,
    pub tombstone_retention: Duration,
}

/// Handle to the compactor thread
pub struct Compactor {
    sender: Sender<CompactorMsg>,
    terminate: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    /// Spawn the compactor thread
    ///
    /// `sender` must feed `receiver`; the stats table holds another clone of
    /// it to schedule files.
    pub fn start(
        ctx: CompactorContext,
        sender: Sender<CompactorMsg>,
        receiver: Receiver<CompactorMsg>,
    ) -> Result<Self> {
        let terminate = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            log: LogWriter::new(
                "compactor",
                Arc::clone(&ctx.files),
                Arc::clone(&ctx.stats),
                ctx.max_file_size,
                ctx.sync_strategy,
            ),
            ctx,
            terminate: Arc::clone(&terminate),
        };

        let handle = thread::Builder::new()
            .name("sifs-compactor".to_string())
            .spawn(move || worker.run(receiver))?;

        Ok(Self {
            sender,
            terminate,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Compact every closed file and wait for completion
    pub fn force_compaction(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(CompactorMsg::ForceAll { done })?;
        wait.blocking_recv().map_err(|_| SifsError::NotRunning)?
    }

    /// Run an expiration pass and wait for completion
    pub fn expire(&self, observer: Arc<dyn ExpirationObserver>) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(CompactorMsg::Expire { observer, done })?;
        wait.blocking_recv().map_err(|_| SifsError::NotRunning)?
    }

    /// Park the compactor until the returned guard is dropped
    pub fn pause_for_clear(&self) -> Result<ClearGuard> {
        let (paused, wait) = oneshot::channel();
        let (resume_tx, resume) = channel::bounded(1);
        self.send(CompactorMsg::Clear { paused, resume })?;
        wait.blocking_recv().map_err(|_| SifsError::NotRunning)?;
        Ok(ClearGuard { resume: resume_tx })
    }

    /// A sender for requests, for background tasks
    pub fn sender(&self) -> Sender<CompactorMsg> {
        self.sender.clone()
    }

    /// Let the current file finish, then stop the thread
    pub fn stop(&self) {
        self.terminate.store(true, Ordering::Release);
        let _ = self.sender.send(CompactorMsg::Stop);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Compactor thread panicked");
            }
        }
    }

    fn send(&self, msg: CompactorMsg) -> Result<()> {
        if self.terminate.load(Ordering::Acquire) {
            return Err(SifsError::NotRunning);
        }
        self.sender.send(msg).map_err(|_| SifsError::NotRunning)
    }
}

/// Resumes the compactor when dropped
pub struct ClearGuard {
    resume: Sender<()>,
}

impl Drop for ClearGuard {
    fn drop(&mut self) {
        let _ = self.resume.send(());
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Counters of one compaction run
#[derive(Debug, Default)]
struct CompactionCounts {
    moved: u64,
    dropped: u64,
    expired: u64,
}

struct Worker {
    ctx: CompactorContext,
    log: LogWriter,
    terminate: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self, receiver: Receiver<CompactorMsg>) {
        tracing::debug!("Compactor started");

        for msg in receiver.iter() {
            let stopping = self.terminate.load(Ordering::Acquire);
            match msg {
                CompactorMsg::Compact { file } => {
                    if !stopping {
                        self.compact_scheduled(file);
                    }
                }
                CompactorMsg::ForceAll { done } => {
                    let result = if stopping {
                        Err(SifsError::NotRunning)
                    } else {
                        self.force_all()
                    };
                    let _ = done.send(result);
                }
                CompactorMsg::Expire { observer, done } => {
                    let result = if stopping {
                        Err(SifsError::NotRunning)
                    } else {
                        self.expire_all(observer.as_ref())
                    };
                    match &result {
                        Ok(()) => observer.on_complete(),
                        Err(e) => observer.on_error(e),
                    }
                    let _ = done.send(result);
                }
                CompactorMsg::Clear { paused, resume } => {
                    self.log.reset();
                    let _ = paused.send(());
                    let _ = resume.recv();
                }
                CompactorMsg::Stop => break,
            }
        }

        if let Err(e) = self.log.finish() {
            tracing::error!(error = %e, "Failed to complete compactor log file");
        }
        tracing::debug!("Compactor stopped");
    }

    fn compact_scheduled(&mut self, file: u32) {
        if self.ctx.files.is_log_file(file) {
            return;
        }
        if let Err(e) = self.compact_file(file, None) {
            tracing::error!(file, error = %e, "Compaction failed");
            self.ctx.stats.reset_scheduled(file);
        }
    }

    fn force_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for file in self.ctx.stats.completed_files() {
            if self.terminate.load(Ordering::Acquire) {
                break;
            }
            if self.ctx.files.is_log_file(file) {
                continue;
            }
            if let Err(e) = self.compact_file(file, None) {
                tracing::error!(file, error = %e, "Forced compaction failed");
                self.ctx.stats.reset_scheduled(file);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn expire_all(&mut self, observer: &dyn ExpirationObserver) -> Result<()> {
        let now = self.ctx.time.wall_clock_millis();
        let expiring = self.ctx.stats.files_expiring_by(now);

        for file in self.ctx.files.file_ids() {
            if self.terminate.load(Ordering::Acquire) {
                break;
            }
            if self.ctx.files.is_log_file(file) {
                self.expire_log_file(file, observer, now)?;
            } else if expiring.binary_search(&file).is_ok() {
                self.compact_file(file, Some(observer))?;
            }
        }
        Ok(())
    }

    /// Rewrite the live records of a closed file, then delete it
    fn compact_file(&mut self, file: u32, observer: Option<&dyn ExpirationObserver>) -> Result<()> {
        let Some(handle) = self.ctx.files.get_file(file) else {
            self.ctx.stats.remove(file);
            return Ok(());
        };
        let Some(stats) = self.ctx.stats.get(file) else {
            // Already compacted, or the store was cleared
            return Ok(());
        };
        if stats.is_marked_for_deletion() {
            return Ok(());
        }

        tracing::debug!(
            file,
            total = stats.total(),
            free = stats.free(),
            expiring = observer.is_some(),
            "Compacting file"
        );

        let now = self.ctx.time.wall_clock_millis();
        let index = Arc::clone(&self.ctx.index);
        let mut counts = CompactionCounts::default();
        let mut scanner = RecordScanner::open(handle.path(), HeaderFormat::Current, Some(handle.len()))?;

        loop {
            let (offset, decoded, raw) = match scanner.next_record()? {
                Scan::Record {
                    offset,
                    decoded,
                    raw,
                } => (offset, decoded, raw),
                Scan::Truncated { offset, reason } => {
                    tracing::warn!(file, offset, reason = %reason, "Stopping compaction at damaged record");
                    break;
                }
                Scan::End => break,
            };

            let here = Location {
                file,
                offset,
                len: raw.len() as u32,
            };
            let segment = self.ctx.partitioner.segment_of(&decoded.key);
            let key = &decoded.key;

            let Some(current) = index.get(segment, key) else {
                counts.dropped += 1;
                continue;
            };
            if current.location != here {
                index.release_record(segment, key);
                counts.dropped += 1;
                continue;
            }

            if decoded.header.is_tombstone() {
                if current.records <= 1 && is_expired_at(decoded.header.expiration, now) {
                    if index.remove_if_at(segment, key, here).is_some() {
                        self.ctx.stats.free(file, here.len as u64);
                    } else {
                        index.release_record(segment, key);
                    }
                    counts.dropped += 1;
                    continue;
                }
            } else if let Some(observer) = observer {
                if is_expired_at(decoded.header.expiration, now) {
                    let seq_id = decoded.header.seq_id;
                    if self.retire_expired(segment, key, here, seq_id, now, false)? {
                        observer.on_entry_record(segment, &decoded.into_record());
                        counts.expired += 1;
                    } else {
                        counts.dropped += 1;
                    }
                    continue;
                }
            }

            let new = self.log.append(&raw, decoded.header.expiration)?;
            if index.compare_and_move(segment, key, here, new) {
                self.ctx.stats.free(file, here.len as u64);
                counts.moved += 1;
            } else {
                // A client write won; the copy is dead on arrival
                self.ctx.stats.free(new.file, new.len as u64);
                counts.dropped += 1;
            }
        }

        self.ctx.stats.mark_for_deletion(file);
        self.ctx.stats.remove(file);
        self.ctx.files.delete_file(file);

        tracing::debug!(
            file,
            moved = counts.moved,
            dropped = counts.dropped,
            expired = counts.expired,
            "Compacted file"
        );
        Ok(())
    }

    /// Replace expired values of a log file with tombstones, in place
    fn expire_log_file(&mut self, file: u32, observer: &dyn ExpirationObserver, now: i64) -> Result<()> {
        let Some(handle) = self.ctx.files.get_file(file) else {
            return Ok(());
        };
        let index = Arc::clone(&self.ctx.index);
        let mut scanner = RecordScanner::open(handle.path(), HeaderFormat::Current, Some(handle.len()))?;

        loop {
            let (offset, decoded, raw) = match scanner.next_record()? {
                Scan::Record {
                    offset,
                    decoded,
                    raw,
                } => (offset, decoded, raw),
                Scan::Truncated { .. } | Scan::End => break,
            };
            if decoded.header.is_tombstone() || !is_expired_at(decoded.header.expiration, now) {
                continue;
            }

            let here = Location {
                file,
                offset,
                len: raw.len() as u32,
            };
            let segment = self.ctx.partitioner.segment_of(&decoded.key);
            let current = index.get(segment, &decoded.key);
            if current.map(|c| c.location) != Some(here) {
                continue;
            }

            if self.retire_expired(segment, &decoded.key, here, decoded.header.seq_id, now, true)? {
                observer.on_entry_position(&EntryPosition {
                    segment,
                    key: decoded.key.clone(),
                    location: here,
                });
            }
        }
        Ok(())
    }

    /// Supersede the expired value at `here` with a tombstone
    ///
    /// The tombstone reuses the value's sequence id so a client write issued
    /// meanwhile still wins. Returns whether the index now points at the
    /// tombstone.
    fn retire_expired(
        &mut self,
        segment: u32,
        key: &Bytes,
        here: Location,
        seq_id: u64,
        now: i64,
        value_stays: bool,
    ) -> Result<bool> {
        let expiration = now.saturating_add(self.ctx.tombstone_retention.as_millis() as i64);
        let tombstone = Record::tombstone(key.clone()).with_expiration(expiration);
        let bytes = record::encode(&tombstone, segment, seq_id)?;
        let at = self.log.append(&bytes, expiration)?;

        let entry = IndexEntry::new(at, seq_id, expiration, true);
        let replaced = self.ctx.index.replace_if_at(segment, key, here, entry).is_some();
        if replaced {
            self.ctx.stats.free(here.file, here.len as u64);
        } else {
            self.ctx.stats.free(at.file, at.len as u64);
        }

        // The tombstone is a new record; a value in a closed file goes away
        // with its file, one in a log file stays
        if value_stays {
            self.ctx.index.add_record(segment, key);
        }
        Ok(replaced)
    }
}
