//! Index Iterator
//!
//! Lazy iteration over index entries. Each step takes the tree's read lock
//! just long enough to copy the tail of one leaf, then resumes from the last
//! key it returned. Concurrent splits and removals therefore never
//! invalidate the iterator; entries inserted behind the cursor are simply not
//! seen.

use std::collections::VecDeque;
use std::sync::Arc;

use super::{Index, IndexEntry, IndexKey};

/// One tree to walk and the segment range wanted from it
#[derive(Debug)]
struct TreeScan {
    tree: usize,
    /// Sorted segments wanted from this tree; `None` means all
    segments: Option<Vec<u32>>,
}

impl TreeScan {
    fn start(&self) -> IndexKey {
        let first = self
            .segments
            .as_ref()
            .and_then(|s| s.first().copied())
            .unwrap_or(0);
        IndexKey::segment_start(first)
    }

    fn past_end(&self, key: &IndexKey) -> bool {
        match &self.segments {
            Some(segments) => segments.last().map(|&max| key.segment > max).unwrap_or(true),
            None => false,
        }
    }

    fn wants(&self, key: &IndexKey) -> bool {
        match &self.segments {
            Some(segments) => segments.binary_search(&key.segment).is_ok(),
            None => true,
        }
    }
}

/// Iterator over `(key, entry)` pairs
pub struct IndexIter {
    index: Arc<Index>,
    scans: Vec<TreeScan>,
    current: usize,
    /// Last key handed out by the current scan
    cursor: Option<IndexKey>,
    buffer: VecDeque<(IndexKey, IndexEntry)>,
}

impl IndexIter {
    pub(super) fn new(index: Arc<Index>, segments: Option<&[u32]>) -> Self {
        let trees = index.index_segments();
        let scans = match segments {
            None => (0..trees as usize)
                .map(|tree| TreeScan {
                    tree,
                    segments: None,
                })
                .collect(),
            Some(segments) => {
                let mut per_tree: Vec<Vec<u32>> = vec![Vec::new(); trees as usize];
                for &segment in segments {
                    per_tree[(segment % trees) as usize].push(segment);
                }
                per_tree
                    .into_iter()
                    .enumerate()
                    .filter(|(_, s)| !s.is_empty())
                    .map(|(tree, mut s)| {
                        s.sort_unstable();
                        s.dedup();
                        TreeScan {
                            tree,
                            segments: Some(s),
                        }
                    })
                    .collect()
            }
        };

        Self {
            index,
            scans,
            current: 0,
            cursor: None,
            buffer: VecDeque::new(),
        }
    }

    /// Refill the buffer with the next leaf tail; false when exhausted
    fn refill(&mut self) -> bool {
        while let Some(scan) = self.scans.get(self.current) {
            let batch = {
                let tree = self.index.trees[scan.tree].read();
                match &self.cursor {
                    Some(cursor) => tree.batch_from(cursor, false),
                    None => tree.batch_from(&scan.start(), true),
                }
            };

            let exhausted = match batch.first() {
                Some((first, _)) => scan.past_end(first),
                None => true,
            };
            if exhausted {
                self.current += 1;
                self.cursor = None;
                continue;
            }

            self.cursor = batch.last().map(|(k, _)| k.clone());
            self.buffer
                .extend(batch.into_iter().filter(|(k, _)| scan.wants(k)));
            return true;
        }
        false
    }
}

impl Iterator for IndexIter {
    type Item = (IndexKey, IndexEntry);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if !self.refill() {
                return None;
            }
        }
    }
}
