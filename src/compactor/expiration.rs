//! Expiration notifications
//!
//! An expiration pass reports every value it retires. Values still sitting
//! in a log file are reported by position so the consumer can decide whether
//! to read them; values found while compacting a closed file are reported
//! with the full record, since that file is about to disappear.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::SifsError;
use crate::record::Record;
use crate::storage::Location;

/// Position of an expired value inside a log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPosition {
    pub segment: u32,
    pub key: Bytes,
    pub location: Location,
}

/// Receives the outcome of an expiration pass
///
/// Callbacks run on the compactor thread and should return quickly.
pub trait ExpirationObserver: Send + Sync + Debug {
    fn on_entry_position(&self, _position: &EntryPosition) {}

    fn on_entry_record(&self, _segment: u32, _record: &Record) {}

    fn on_complete(&self) {}

    fn on_error(&self, _error: &SifsError) {}
}

/// Default observer: counts and logs
#[derive(Debug, Default)]
pub struct LoggingObserver {
    expired: AtomicU64,
}

impl LoggingObserver {
    /// Entries reported since the last completed pass
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

impl ExpirationObserver for LoggingObserver {
    fn on_entry_position(&self, _position: &EntryPosition) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn on_entry_record(&self, _segment: u32, _record: &Record) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn on_complete(&self) {
        let expired = self.expired.swap(0, Ordering::Relaxed);
        if expired > 0 {
            tracing::debug!(expired, "Expiration pass complete");
        }
    }

    fn on_error(&self, error: &SifsError) {
        tracing::error!(error = %error, "Expiration pass failed");
    }
}
