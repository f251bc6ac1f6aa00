//! Key to segment partitioning
//!
//! The owning cache decides which segment a key belongs to. Every lookup,
//! recovery scan and compaction move asks the partitioner again; the segment
//! written into record headers is informational only.

use std::fmt::Debug;

/// Maps a key to its cache segment
pub trait KeyPartitioner: Send + Sync + Debug {
    fn segment_of(&self, key: &[u8]) -> u32;

    fn segment_count(&self) -> u32;
}

/// CRC32-based partitioner
#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
    segments: u32,
}

impl HashPartitioner {
    pub fn new(segments: u32) -> Self {
        Self {
            segments: segments.max(1),
        }
    }
}

impl KeyPartitioner for HashPartitioner {
    fn segment_of(&self, key: &[u8]) -> u32 {
        crc32fast::hash(key) % self.segments
    }

    fn segment_count(&self) -> u32 {
        self.segments
    }
}
