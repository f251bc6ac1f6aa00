//! Storage Module
//!
//! Append-only data files holding encoded records.
//!
//! ## Responsibilities
//! - Discover, create and delete data files under `{cache}/data/`
//! - Hand out reference-counted file handles; unlink only after the last
//!   reader lets go
//! - Append through log writers that rotate at `max_file_size`
//! - Track per-file total and free bytes to drive compaction
//!
//! ## Directory Layout
//! ```text
//! {data_location}/{cache_name}/data/
//! ├── sifs2.0        (closed, compaction candidate)
//! ├── sifs2.1        (closed)
//! ├── sifs2.2        (log file of the appender)
//! └── sifs2.3        (log file of the compactor)
//! ```
//!
//! ## File Lifecycle
//! ```text
//! ACTIVE ──rotate──▶ CLOSED ──free ≥ threshold──▶ ELIGIBLE ──▶ COMPACTING ──▶ DELETED
//! ```

mod file;
mod log;
mod manager;
mod stats;

use serde::{Deserialize, Serialize};

pub use file::{DataFile, FileHandle};
pub use log::LogWriter;
pub use manager::{FileManager, DATA_FILE_PREFIX, LEGACY_DATA_FILE_PREFIX};
pub use stats::{
    read_stats_file, remove_stats_file, write_stats_file, FileStats, FileStatsSnapshot,
    StatsFile, StatsTable, STATS_FILE_NAME,
};

/// Where a record lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: u32,
    pub offset: u64,
    pub len: u32,
}
