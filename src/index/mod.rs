//! Index Module
//!
//! The soft index: a rebuildable map from `(segment, key)` to the location of
//! the newest record of that key.
//!
//! ## Responsibilities
//! - Point lookups without touching data files
//! - Per-key ordering through sequence ids (newest write wins)
//! - Compare-and-set moves for the compactor
//! - Lazy per-segment iteration
//! - Persist on clean shutdown, load on clean startup
//!
//! ## Layout
//! ```text
//!   cache segment s ──▶ tree[s % index_segments]  (own RwLock)
//!
//!                 ┌──────────────┐
//!                 │ Inner (root) │  keys: (seg, key) separators
//!                 └──┬────────┬──┘
//!          ┌─────────┘        └─────────┐
//!   ┌──────▼───────┐             ┌──────▼───────┐
//!   │ Leaf         │             │ Leaf         │
//!   │ (0,"a")→loc  │             │ (3,"k")→loc  │
//!   │ (0,"f")→loc  │             │ (7,"b")→loc  │
//!   │ (3,"c")→loc  │             │ ...          │
//!   └──────────────┘             └──────────────┘
//! ```

mod iter;
mod node;
mod persist;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;
use crate::storage::Location;

pub use iter::IndexIter;
pub use node::{Change, IndexEntry, IndexKey, NodeId, Tree};
pub use persist::{read_tree, write_tree, TreeLayout};

/// File name prefix of index tree files
pub const INDEX_FILE_PREFIX: &str = "index.";

/// Result of a sequence-guarded [`Index::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry was stored; `previous` is the entry it replaced
    Applied { previous: Option<IndexEntry> },
    /// A newer entry was already indexed; only the record count changed
    Stale,
}

/// Whether `candidate` should replace `current` for the same key
///
/// Higher sequence ids win. On a tie a tombstone beats a value: the
/// expiration pass retires a value with a tombstone carrying the value's own
/// sequence id, so that any later client write still wins over it.
pub fn supersedes(candidate: &IndexEntry, current: &IndexEntry) -> bool {
    candidate.seq_id > current.seq_id
        || (candidate.seq_id == current.seq_id && candidate.tombstone && !current.tombstone)
}

/// Segment-partitioned persistent index
///
/// ## Concurrency:
/// - One `RwLock` per index tree, so keys of different trees never contend
/// - Live entry counts per cache segment are atomics
pub struct Index {
    dir: PathBuf,
    trees: Vec<RwLock<Tree>>,
    /// Non-tombstone entries per cache segment
    segment_sizes: Vec<AtomicI64>,
    layout: TreeLayout,
    capacity: usize,
}

impl Index {
    pub fn new(dir: &Path, cache_segments: u32, index_segments: u32, capacity: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            trees: (0..index_segments)
                .map(|_| RwLock::new(Tree::new(capacity)))
                .collect(),
            segment_sizes: (0..cache_segments).map(|_| AtomicI64::new(0)).collect(),
            layout: TreeLayout {
                cache_segments,
                index_segments,
            },
            capacity,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_segments(&self) -> u32 {
        self.layout.cache_segments
    }

    pub fn index_segments(&self) -> u32 {
        self.layout.index_segments
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get(&self, segment: u32, key: &Bytes) -> Option<IndexEntry> {
        let probe = IndexKey::new(segment, key.clone());
        self.tree(segment).read().get(&probe).copied()
    }

    /// Live (non-tombstone) entries across all segments
    pub fn size(&self) -> u64 {
        self.segment_sizes
            .iter()
            .map(|s| s.load(Ordering::Acquire).max(0) as u64)
            .sum()
    }

    /// Live entries of the given segments
    pub fn size_of(&self, segments: &[u32]) -> u64 {
        segments
            .iter()
            .filter_map(|&s| self.segment_sizes.get(s as usize))
            .map(|s| s.load(Ordering::Acquire).max(0) as u64)
            .sum()
    }

    /// All entries, tombstones included
    pub fn entry_count(&self) -> usize {
        self.trees.iter().map(|t| t.read().len()).sum()
    }

    /// Bytes of all records the index points at
    pub fn live_bytes(&self) -> u64 {
        let mut total = 0u64;
        for tree in &self.trees {
            tree.read()
                .for_each(|_, entry| total += entry.location.len as u64);
        }
        total
    }

    /// Highest sequence id of any indexed entry
    pub fn max_seq_id(&self) -> u64 {
        let mut max = 0u64;
        for tree in &self.trees {
            tree.read().for_each(|_, entry| max = max.max(entry.seq_id));
        }
        max
    }

    /// Entries matching `filter`, collected tree by tree
    pub fn collect_where(
        &self,
        mut filter: impl FnMut(&IndexKey, &IndexEntry) -> bool,
    ) -> Vec<(IndexKey, IndexEntry)> {
        let mut found = Vec::new();
        for tree in &self.trees {
            tree.read().for_each(|k, e| {
                if filter(k, e) {
                    found.push((k.clone(), *e));
                }
            });
        }
        found
    }

    /// Lazily iterate entries, optionally restricted to some segments
    pub fn iter(self: &Arc<Self>, segments: Option<&[u32]>) -> IndexIter {
        IndexIter::new(Arc::clone(self), segments)
    }

    /// Height of each tree (for testing/debugging)
    pub fn tree_heights(&self) -> Vec<usize> {
        self.trees.iter().map(|t| t.read().height()).collect()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Index a newly appended record
    ///
    /// The entry wins only if it supersedes the indexed one (see
    /// [`supersedes`]). Either way the key gains one on-disk record.
    pub fn put(&self, segment: u32, key: &Bytes, entry: IndexEntry) -> PutOutcome {
        let mut stale = false;
        let (previous, _) = self.apply(segment, key, |current| match current {
            None => Change::Set(IndexEntry { records: 1, ..entry }),
            Some(current) if supersedes(&entry, current) => Change::Set(IndexEntry {
                records: current.records.saturating_add(1),
                ..entry
            }),
            Some(current) => {
                stale = true;
                Change::Set(IndexEntry {
                    records: current.records.saturating_add(1),
                    ..*current
                })
            }
        });
        if stale {
            PutOutcome::Stale
        } else {
            self.adjust_size(segment, previous.as_ref(), Some(&entry));
            PutOutcome::Applied { previous }
        }
    }

    /// Point the key at `new` if it still points at `expected`
    pub fn compare_and_move(&self, segment: u32, key: &Bytes, expected: Location, new: Location) -> bool {
        let (_, changed) = self.apply(segment, key, |current| match current {
            Some(current) if current.location == expected => Change::Set(IndexEntry {
                location: new,
                ..*current
            }),
            _ => Change::Keep,
        });
        changed
    }

    /// Replace the entry with `entry` if it still points at `expected`
    ///
    /// Used when an expired value is superseded by a tombstone. The record
    /// count is left alone; callers adjust it with [`Index::add_record`] or
    /// [`Index::release_record`]. Returns the replaced entry.
    pub fn replace_if_at(
        &self,
        segment: u32,
        key: &Bytes,
        expected: Location,
        entry: IndexEntry,
    ) -> Option<IndexEntry> {
        let (previous, changed) = self.apply(segment, key, |current| match current {
            Some(current) if current.location == expected => Change::Set(IndexEntry {
                records: current.records,
                ..entry
            }),
            _ => Change::Keep,
        });
        if changed {
            self.adjust_size(segment, previous.as_ref(), Some(&entry));
            previous
        } else {
            None
        }
    }

    /// Remove the entry if it still points at `expected`
    pub fn remove_if_at(&self, segment: u32, key: &Bytes, expected: Location) -> Option<IndexEntry> {
        let (previous, changed) = self.apply(segment, key, |current| match current {
            Some(current) if current.location == expected => Change::Remove,
            _ => Change::Keep,
        });
        if changed {
            self.adjust_size(segment, previous.as_ref(), None);
            previous
        } else {
            None
        }
    }

    /// Unconditionally remove the entry
    pub fn remove(&self, segment: u32, key: &Bytes) -> Option<IndexEntry> {
        let (previous, _) = self.apply(segment, key, |current| match current {
            Some(_) => Change::Remove,
            None => Change::Keep,
        });
        self.adjust_size(segment, previous.as_ref(), None);
        previous
    }

    /// The key gained an on-disk record that is not indexed
    pub fn add_record(&self, segment: u32, key: &Bytes) {
        self.apply(segment, key, |current| match current {
            Some(current) => Change::Set(IndexEntry {
                records: current.records.saturating_add(1),
                ..*current
            }),
            None => Change::Keep,
        });
    }

    /// One superseded on-disk record of the key was destroyed
    pub fn release_record(&self, segment: u32, key: &Bytes) {
        self.apply(segment, key, |current| match current {
            Some(current) if current.records > 1 => Change::Set(IndexEntry {
                records: current.records - 1,
                ..*current
            }),
            _ => Change::Keep,
        });
    }

    /// Drop all entries
    pub fn clear(&self) {
        for tree in &self.trees {
            *tree.write() = Tree::new(self.capacity);
        }
        for size in &self.segment_sizes {
            size.store(0, Ordering::Release);
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write every tree to its index file
    pub fn persist(&self) -> Result<()> {
        for (i, tree) in self.trees.iter().enumerate() {
            write_tree(&self.tree_path(i), &tree.read(), self.layout)?;
        }
        tracing::debug!(
            trees = self.trees.len(),
            entries = self.entry_count(),
            "Persisted index"
        );
        Ok(())
    }

    /// Load every tree; all or nothing
    ///
    /// Returns `false` (leaving the index empty) if any tree file is missing
    /// or was not closed cleanly.
    pub fn load(&self) -> Result<bool> {
        let mut loaded = Vec::with_capacity(self.trees.len());
        for i in 0..self.trees.len() {
            match read_tree(&self.tree_path(i), self.layout, self.capacity)? {
                Some(tree) => loaded.push(tree),
                None => {
                    self.clear();
                    return Ok(false);
                }
            }
        }

        for (slot, tree) in self.trees.iter().zip(loaded) {
            *slot.write() = tree;
        }
        self.recompute_sizes();
        Ok(true)
    }

    /// Remove all index files
    pub fn delete_files(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_tree_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(INDEX_FILE_PREFIX))
                .map(|suffix| suffix.parse::<u32>().is_ok())
                .unwrap_or(false);
            if is_tree_file {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn tree(&self, segment: u32) -> &RwLock<Tree> {
        &self.trees[(segment % self.layout.index_segments) as usize]
    }

    fn tree_path(&self, index_segment: usize) -> PathBuf {
        self.dir.join(format!("{}{}", INDEX_FILE_PREFIX, index_segment))
    }

    fn apply(
        &self,
        segment: u32,
        key: &Bytes,
        decide: impl FnOnce(Option<&IndexEntry>) -> Change,
    ) -> (Option<IndexEntry>, bool) {
        // Own the key bytes so the index never pins a larger record buffer
        let key = IndexKey::new(segment, Bytes::copy_from_slice(key));
        self.tree(segment).write().apply(key, decide)
    }

    fn adjust_size(&self, segment: u32, before: Option<&IndexEntry>, after: Option<&IndexEntry>) {
        let live = |e: Option<&IndexEntry>| e.map(|e| !e.tombstone).unwrap_or(false) as i64;
        let delta = live(after) - live(before);
        if delta != 0 {
            if let Some(size) = self.segment_sizes.get(segment as usize) {
                size.fetch_add(delta, Ordering::AcqRel);
            }
        }
    }

    fn recompute_sizes(&self) {
        let counts: Vec<i64> = {
            let mut counts = vec![0i64; self.segment_sizes.len()];
            for tree in &self.trees {
                tree.read().for_each(|k, e| {
                    if !e.tombstone {
                        if let Some(c) = counts.get_mut(k.segment as usize) {
                            *c += 1;
                        }
                    }
                });
            }
            counts
        };
        for (size, count) in self.segment_sizes.iter().zip(counts) {
            size.store(count, Ordering::Release);
        }
    }
}
