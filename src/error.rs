//! Error types for SIFS
//!
//! Internal modules return [`SifsError`]. The asynchronous store boundary
//! wraps every failure into a single [`PersistenceError`] whose
//! [`ErrorKind`] lets callers tell a lock conflict apart from an I/O fault
//! without matching on engine internals.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using SifsError
pub type Result<T> = std::result::Result<T, SifsError>;

/// Unified error type for engine operations
#[derive(Debug, Error)]
pub enum SifsError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Record / Corruption Errors
    // -------------------------------------------------------------------------
    #[error("Corrupted record in file {file} at offset {offset}: {reason}")]
    Corruption {
        file: u32,
        offset: u64,
        reason: String,
    },

    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Record too large: {len} bytes (max {max})")]
    RecordTooLarge { len: u64, max: u64 },

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    #[error("Index error: {0}")]
    Index(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Concurrency / Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Store location {} is locked by another process", path.display())]
    LockConflict { path: PathBuf },

    #[error("Store is not running")]
    NotRunning,

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl From<bincode::Error> for SifsError {
    fn from(err: bincode::Error) -> Self {
        SifsError::Serialization(err.to_string())
    }
}

// =============================================================================
// Store Boundary Error
// =============================================================================

/// Coarse classification of a [`PersistenceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Config,
    LockConflict,
    NotRunning,
    Corruption,
    Internal,
}

/// The only error type surfaced by [`crate::SoftIndexFileStore`]
#[derive(Debug, Error)]
#[error("Persistence failure ({kind:?}): {source}")]
pub struct PersistenceError {
    kind: ErrorKind,
    #[source]
    source: SifsError,
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True when another process (or store instance) holds the location
    pub fn is_lock_conflict(&self) -> bool {
        self.kind == ErrorKind::LockConflict
    }

    /// The engine error that caused this failure
    pub fn cause(&self) -> &SifsError {
        &self.source
    }
}

impl From<SifsError> for PersistenceError {
    fn from(source: SifsError) -> Self {
        let kind = match &source {
            SifsError::Io(_) => ErrorKind::Io,
            SifsError::Config(_)
            | SifsError::KeyTooLong { .. }
            | SifsError::RecordTooLarge { .. } => ErrorKind::Config,
            SifsError::LockConflict { .. } => ErrorKind::LockConflict,
            SifsError::NotRunning => ErrorKind::NotRunning,
            SifsError::Corruption { .. } => ErrorKind::Corruption,
            SifsError::Index(_)
            | SifsError::Serialization(_)
            | SifsError::TaskFailed(_) => ErrorKind::Internal,
        };
        Self { kind, source }
    }
}
