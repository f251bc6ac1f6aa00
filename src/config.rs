//! Configuration for SIFS
//!
//! One flat configuration struct, validated once by [`StoreConfigBuilder::build`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SifsError};

/// Smallest accepted data file size
pub const MIN_FILE_SIZE: u64 = 1024;

/// Main configuration for a store instance
#[derive(Debug, Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Location Configuration
    // -------------------------------------------------------------------------
    /// Name of the cache, used as a subdirectory of both roots
    pub cache_name: String,

    /// Root for data files
    /// Internal structure:
    ///   {data_location}/{cache_name}/
    ///     ├── sifs.lock
    ///     └── data/         (sifs2.<id> data files)
    pub data_location: PathBuf,

    /// Root for index files
    /// Internal structure:
    ///   {index_location}/{cache_name}/index/
    ///     ├── index.<n>     (one per index segment)
    ///     └── index.stats   (file stats, present only after a clean stop)
    pub index_location: PathBuf,

    // -------------------------------------------------------------------------
    // Data File Configuration
    // -------------------------------------------------------------------------
    /// Rotation threshold for data files (in bytes)
    pub max_file_size: u64,

    /// How often appended data is fsynced
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Segmentation / Index Configuration
    // -------------------------------------------------------------------------
    /// Partition keys by cache segment
    pub segmented: bool,

    /// Number of cache segments (ignored when `segmented` is false)
    pub segment_count: u32,

    /// Number of independent index trees
    pub index_segments: u32,

    /// Capacity of an index node before it splits
    pub max_node_entries: usize,

    // -------------------------------------------------------------------------
    // Compaction / Expiration Configuration
    // -------------------------------------------------------------------------
    /// Free ratio at which a completed file becomes eligible for compaction
    pub compaction_threshold: f64,

    /// How often the expiration reaper runs (zero disables it)
    pub expiration_wake_up_interval: Duration,

    /// How long a tombstone is kept before it may be purged
    pub tombstone_retention: Duration,

    // -------------------------------------------------------------------------
    // Lifecycle Configuration
    // -------------------------------------------------------------------------
    /// Delete all existing data when the store starts
    pub purge_on_startup: bool,

    /// Max concurrent blocking I/O operations issued by the async facade
    pub io_threads: usize,

    /// How long to wait for the process lock at startup
    pub lock_timeout: Duration,
}

/// Data file sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every append (safest, slowest)
    EveryWrite,

    /// fsync after N appends
    EveryNEntries { count: usize },

    /// Leave flushing to the OS; files are still synced on rotation and stop
    Never,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            data_location: PathBuf::from("./sifs_data"),
            index_location: PathBuf::from("./sifs_data"),
            max_file_size: 16 * 1024 * 1024, // 16 MB
            sync_strategy: SyncStrategy::Never,
            segmented: true,
            segment_count: 256,
            index_segments: 16,
            max_node_entries: 64,
            compaction_threshold: 0.5,
            expiration_wake_up_interval: Duration::from_secs(60),
            tombstone_retention: Duration::from_secs(60),
            purge_on_startup: false,
            io_threads: 4,
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// `{data_location}/{cache_name}`
    pub fn data_root(&self) -> PathBuf {
        self.data_location.join(&self.cache_name)
    }

    /// `{index_location}/{cache_name}`
    pub fn index_root(&self) -> PathBuf {
        self.index_location.join(&self.cache_name)
    }

    /// Directory holding data files
    pub fn data_dir(&self) -> PathBuf {
        self.data_root().join("data")
    }

    /// Directory holding index files and the stats file
    pub fn index_dir(&self) -> PathBuf {
        self.index_root().join("index")
    }

    /// Number of cache segments actually used for partitioning
    pub fn effective_segments(&self) -> u32 {
        if self.segmented {
            self.segment_count
        } else {
            1
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cache_name.is_empty()
            || self.cache_name.contains(['/', '\\'])
            || self.cache_name == "."
            || self.cache_name == ".."
        {
            return Err(SifsError::Config(format!(
                "invalid cache name '{}'",
                self.cache_name
            )));
        }
        if self.max_file_size < MIN_FILE_SIZE || self.max_file_size > u32::MAX as u64 {
            return Err(SifsError::Config(format!(
                "max_file_size must be between {} and {} bytes, got {}",
                MIN_FILE_SIZE,
                u32::MAX,
                self.max_file_size
            )));
        }
        if self.segment_count == 0 {
            return Err(SifsError::Config("segment_count must be at least 1".into()));
        }
        if self.index_segments == 0 {
            return Err(SifsError::Config("index_segments must be at least 1".into()));
        }
        if self.max_node_entries < 4 {
            return Err(SifsError::Config(format!(
                "max_node_entries must be at least 4, got {}",
                self.max_node_entries
            )));
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(SifsError::Config(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        if self.io_threads == 0 {
            return Err(SifsError::Config("io_threads must be at least 1".into()));
        }
        if let SyncStrategy::EveryNEntries { count: 0 } = self.sync_strategy {
            return Err(SifsError::Config(
                "sync strategy EveryNEntries needs a count of at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the cache name (subdirectory under both roots)
    pub fn cache_name(mut self, name: impl Into<String>) -> Self {
        self.config.cache_name = name.into();
        self
    }

    /// Set the data root
    pub fn data_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_location = path.into();
        self
    }

    /// Set the index root
    pub fn index_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.index_location = path.into();
        self
    }

    /// Use the same root for data and index
    pub fn location(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.config.data_location = path.clone();
        self.config.index_location = path;
        self
    }

    /// Set the data file rotation threshold (in bytes)
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.config.max_file_size = size;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Enable or disable segment partitioning
    pub fn segmented(mut self, segmented: bool) -> Self {
        self.config.segmented = segmented;
        self
    }

    pub fn segment_count(mut self, count: u32) -> Self {
        self.config.segment_count = count;
        self
    }

    pub fn index_segments(mut self, count: u32) -> Self {
        self.config.index_segments = count;
        self
    }

    /// Set the index node capacity
    pub fn max_node_entries(mut self, count: usize) -> Self {
        self.config.max_node_entries = count;
        self
    }

    /// Set the free ratio that makes a file eligible for compaction
    pub fn compaction_threshold(mut self, ratio: f64) -> Self {
        self.config.compaction_threshold = ratio;
        self
    }

    /// Set the expiration reaper interval (zero disables it)
    pub fn expiration_wake_up_interval(mut self, interval: Duration) -> Self {
        self.config.expiration_wake_up_interval = interval;
        self
    }

    pub fn tombstone_retention(mut self, retention: Duration) -> Self {
        self.config.tombstone_retention = retention;
        self
    }

    /// Delete existing data when the store starts
    pub fn purge_on_startup(mut self, purge: bool) -> Self {
        self.config.purge_on_startup = purge;
        self
    }

    pub fn io_threads(mut self, count: usize) -> Self {
        self.config.io_threads = count;
        self
    }

    /// Set how long startup waits for the process lock
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<StoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
