//! # SIFS
//!
//! Soft-Index File Store: a persistent key/value cache store with:
//! - Append-only data files with checksummed records
//! - A rebuildable, segmented B+-tree index ("soft" index)
//! - Background compaction and expiration
//! - Crash recovery by truncating partial writes and rescanning
//! - A process lock so one location is owned by one store
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SoftIndexFileStore (async)                  │
//! │          spawn_blocking + Semaphore, Publisher streams       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                       Engine (sync)                          │
//! │        seq ids, write / load / delete / clear / stop         │
//! └───────┬──────────────────┬────────────────────┬─────────────┘
//!         │                  │                    │
//!         ▼                  ▼                    ▼
//!  ┌─────────────┐    ┌─────────────┐     ┌──────────────┐
//!  │    Index    │    │   Storage   │◀────│  Compactor   │
//!  │ (B+-trees)  │◀───│ (log files, │     │  + Reaper    │
//!  └─────────────┘    │  file stats)│     │  (threads)   │
//!                     └─────────────┘     └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod time;
pub mod partition;
pub mod record;
pub mod storage;
pub mod index;
pub mod compactor;
pub mod recovery;
pub mod lock;
pub mod engine;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorKind, PersistenceError, Result, SifsError};
pub use config::{StoreConfig, StoreConfigBuilder, SyncStrategy};
pub use engine::{Collaborators, Engine, KeyFilter, StoreStats};
pub use record::Record;
pub use store::{Publisher, SoftIndexFileStore, StoreResult};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of SIFS
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
