//! Tests for the index
//!
//! These tests verify:
//! - B+-tree inserts, splits and removals
//! - Sequence-guarded puts and compare-and-set moves
//! - Per-segment sizes
//! - Lazy iteration, including segments that start in a distant leaf
//! - Persistence with clean/dirty detection

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use sifs::index::{
    supersedes, Change, Index, IndexEntry, IndexKey, PutOutcome, Tree, INDEX_FILE_PREFIX,
};
use sifs::storage::Location;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_index(cache_segments: u32, index_segments: u32, capacity: usize) -> (TempDir, PathBuf, Arc<Index>) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("index");
    let index = Index::new(&path, cache_segments, index_segments, capacity).unwrap();
    (temp_dir, path, Arc::new(index))
}

fn loc(file: u32, offset: u64) -> Location {
    Location {
        file,
        offset,
        len: 64,
    }
}

fn entry(file: u32, offset: u64, seq_id: u64) -> IndexEntry {
    IndexEntry::new(loc(file, offset), seq_id, -1, false)
}

fn key(i: usize) -> Bytes {
    Bytes::from(format!("key_{:05}", i))
}

fn insert(tree: &mut Tree, segment: u32, k: Bytes, e: IndexEntry) {
    tree.apply(IndexKey::new(segment, k), |_| Change::Set(e));
}

// =============================================================================
// Tree Tests
// =============================================================================

#[test]
fn test_tree_splits_and_finds_everything() {
    let mut tree = Tree::new(4);
    for i in 0..200 {
        insert(&mut tree, 0, key(i), entry(0, i as u64, i as u64));
    }

    assert_eq!(tree.len(), 200);
    assert!(tree.height() >= 3);
    for i in 0..200 {
        let found = tree.get(&IndexKey::new(0, key(i))).unwrap();
        assert_eq!(found.seq_id, i as u64);
    }
    assert!(tree.get(&IndexKey::new(1, key(0))).is_none());
}

#[test]
fn test_tree_for_each_is_ordered() {
    let mut tree = Tree::new(4);
    // Insert in reverse, across segments
    for i in (0..60).rev() {
        insert(&mut tree, (i % 3) as u32, key(i), entry(0, 0, 1));
    }

    let mut seen = Vec::new();
    tree.for_each(|k, _| seen.push(k.clone()));

    assert_eq!(seen.len(), 60);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen[0].segment, 0);
    assert_eq!(seen[59].segment, 2);
}

#[test]
fn test_tree_remove_everything() {
    let mut tree = Tree::new(4);
    for i in 0..100 {
        insert(&mut tree, 0, key(i), entry(0, 0, 1));
    }
    let grown = tree.node_count();

    for i in 0..100 {
        let (previous, changed) = tree.apply(IndexKey::new(0, key(i)), |_| Change::Remove);
        assert!(previous.is_some());
        assert!(changed);
    }

    assert!(tree.is_empty());
    assert!(tree.node_count() < grown);
    assert!(tree.get(&IndexKey::new(0, key(7))).is_none());

    // Still usable after shrinking
    insert(&mut tree, 0, key(1), entry(0, 0, 2));
    assert_eq!(tree.len(), 1);
}

#[test]
fn test_tree_keep_does_not_insert() {
    let mut tree = Tree::new(4);
    let (previous, changed) = tree.apply(IndexKey::new(0, key(1)), |_| Change::Keep);

    assert!(previous.is_none());
    assert!(!changed);
    assert!(tree.is_empty());
}

#[test]
fn test_batch_from_probes_following_leaves() {
    let mut tree = Tree::new(4);
    for i in 0..40 {
        insert(&mut tree, 0, key(i), entry(0, 0, 1));
    }
    for i in 0..5 {
        insert(&mut tree, 9, key(i), entry(0, 0, 1));
    }

    // Segment 4 has no entries; the descent lands on the last leaf of
    // segment 0 and must move on to find segment 9
    let batch = tree.batch_from(&IndexKey::segment_start(4), true);
    assert!(!batch.is_empty());
    assert_eq!(batch[0].0, IndexKey::new(9, key(0)));
}

// =============================================================================
// Index Mutation Tests
// =============================================================================

#[test]
fn test_put_newer_wins() {
    let (_temp, _path, index) = setup_temp_index(4, 2, 8);
    let k = key(1);

    assert_eq!(index.put(1, &k, entry(0, 0, 1)), PutOutcome::Applied { previous: None });

    match index.put(1, &k, entry(0, 100, 2)) {
        PutOutcome::Applied { previous: Some(p) } => assert_eq!(p.seq_id, 1),
        other => panic!("unexpected outcome {:?}", other),
    }

    let current = index.get(1, &k).unwrap();
    assert_eq!(current.seq_id, 2);
    assert_eq!(current.location, loc(0, 100));
    assert_eq!(current.records, 2);
}

#[test]
fn test_put_stale_is_rejected() {
    let (_temp, _path, index) = setup_temp_index(4, 2, 8);
    let k = key(1);

    index.put(0, &k, entry(0, 0, 10));
    assert_eq!(index.put(0, &k, entry(1, 0, 5)), PutOutcome::Stale);

    let current = index.get(0, &k).unwrap();
    assert_eq!(current.seq_id, 10);
    assert_eq!(current.location, loc(0, 0));
    // The stale record still exists on disk
    assert_eq!(current.records, 2);
}

#[test]
fn test_tombstone_wins_tie() {
    let value = entry(0, 0, 7);
    let tombstone = IndexEntry::new(loc(1, 0), 7, 1_000, true);

    assert!(supersedes(&tombstone, &value));
    assert!(!supersedes(&value, &tombstone));
    assert!(!supersedes(&value, &value));
}

#[test]
fn test_compare_and_move() {
    let (_temp, _path, index) = setup_temp_index(4, 2, 8);
    let k = key(1);
    index.put(2, &k, entry(0, 0, 1));

    // Wrong expectation: nothing happens
    assert!(!index.compare_and_move(2, &k, loc(0, 64), loc(5, 0)));
    assert_eq!(index.get(2, &k).unwrap().location, loc(0, 0));

    assert!(index.compare_and_move(2, &k, loc(0, 0), loc(5, 0)));
    let moved = index.get(2, &k).unwrap();
    assert_eq!(moved.location, loc(5, 0));
    assert_eq!(moved.seq_id, 1);
}

#[test]
fn test_remove_if_at() {
    let (_temp, _path, index) = setup_temp_index(4, 2, 8);
    let k = key(1);
    index.put(0, &k, entry(0, 0, 1));

    assert!(index.remove_if_at(0, &k, loc(9, 9)).is_none());
    assert!(index.remove_if_at(0, &k, loc(0, 0)).is_some());
    assert!(index.get(0, &k).is_none());
}

#[test]
fn test_release_record_keeps_at_least_one() {
    let (_temp, _path, index) = setup_temp_index(4, 2, 8);
    let k = key(1);
    index.put(0, &k, entry(0, 0, 1));
    index.put(0, &k, entry(0, 64, 2));
    assert_eq!(index.get(0, &k).unwrap().records, 2);

    index.release_record(0, &k);
    index.release_record(0, &k);
    assert_eq!(index.get(0, &k).unwrap().records, 1);

    index.add_record(0, &k);
    assert_eq!(index.get(0, &k).unwrap().records, 2);
}

#[test]
fn test_sizes_count_live_entries() {
    let (_temp, _path, index) = setup_temp_index(4, 2, 8);
    index.put(0, &key(1), entry(0, 0, 1));
    index.put(1, &key(2), entry(0, 64, 2));
    index.put(1, &key(3), entry(0, 128, 3));
    index.put(3, &key(4), IndexEntry::new(loc(0, 192), 4, 100, true));

    assert_eq!(index.size(), 3);
    assert_eq!(index.size_of(&[1]), 2);
    assert_eq!(index.size_of(&[3]), 0);
    assert_eq!(index.entry_count(), 4);

    // Value replaced by a tombstone
    index.put(1, &key(2), IndexEntry::new(loc(0, 256), 5, 100, true));
    assert_eq!(index.size_of(&[1]), 1);

    index.remove(0, &key(1));
    assert_eq!(index.size(), 1);
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_iter_all_entries() {
    let (_temp, _path, index) = setup_temp_index(8, 2, 4);
    for i in 0..100 {
        index.put((i % 8) as u32, &key(i), entry(0, 0, i as u64 + 1));
    }

    let all: Vec<_> = index.iter(None).collect();
    assert_eq!(all.len(), 100);
}

#[test]
fn test_iter_segment_after_empty_segment() {
    let (_temp, _path, index) = setup_temp_index(8, 1, 4);
    for i in 0..50 {
        index.put(0, &key(i), entry(0, 0, 1));
    }
    for i in 0..20 {
        index.put(5, &key(i), entry(0, 0, 1));
    }
    for i in 0..10 {
        index.put(7, &key(i), entry(0, 0, 1));
    }

    // Segment 3 is empty: the scan must still reach segment 5
    let found: Vec<_> = index.iter(Some(&[3, 5])).collect();
    assert_eq!(found.len(), 20);
    assert!(found.iter().all(|(k, _)| k.segment == 5));

    let none: Vec<_> = index.iter(Some(&[2])).collect();
    assert!(none.is_empty());
}

#[test]
fn test_iter_sees_inserts_ahead_of_cursor() {
    let (_temp, _path, index) = setup_temp_index(1, 1, 4);
    for i in 0..20 {
        index.put(0, &key(i), entry(0, 0, 1));
    }

    let mut iter = index.iter(None);
    let first: Vec<_> = iter.by_ref().take(3).collect();
    assert_eq!(first[0].0.key, key(0));

    // Splits while the iterator is parked
    for i in 100..140 {
        index.put(0, &key(i), entry(0, 0, 1));
    }

    let rest: Vec<_> = iter.collect();
    assert_eq!(first.len() + rest.len(), 60);
    assert!(rest.windows(2).all(|w| w[0].0 < w[1].0));
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_persist_and_load() {
    let (_temp, path, index) = setup_temp_index(8, 4, 4);
    for i in 0..300 {
        index.put((i % 8) as u32, &key(i), entry(1, i as u64 * 64, i as u64 + 1));
    }
    index.put(2, &key(1000), IndexEntry::new(loc(1, 0), 999, 50, true));
    index.persist().unwrap();

    assert!(path.join(format!("{}0", INDEX_FILE_PREFIX)).exists());

    let reloaded = Index::new(&path, 8, 4, 4).unwrap();
    assert!(reloaded.load().unwrap());
    assert_eq!(reloaded.entry_count(), 301);
    assert_eq!(reloaded.size(), 300);
    assert_eq!(reloaded.max_seq_id(), 999);
    assert_eq!(reloaded.get(5, &key(5)).unwrap().location, loc(1, 5 * 64));
}

#[test]
fn test_loaded_index_is_dirty() {
    let (_temp, path, index) = setup_temp_index(4, 2, 8);
    index.put(0, &key(1), entry(0, 0, 1));
    index.persist().unwrap();

    let first = Index::new(&path, 4, 2, 8).unwrap();
    assert!(first.load().unwrap());

    // No persist after loading: a second load must refuse
    let second = Index::new(&path, 4, 2, 8).unwrap();
    assert!(!second.load().unwrap());
    assert_eq!(second.entry_count(), 0);
}

#[test]
fn test_load_rejects_other_layout() {
    let (_temp, path, index) = setup_temp_index(4, 2, 8);
    index.put(0, &key(1), entry(0, 0, 1));
    index.persist().unwrap();

    let other = Index::new(&path, 8, 2, 8).unwrap();
    assert!(!other.load().unwrap());
}

#[test]
fn test_load_missing_files() {
    let (_temp, path, _index) = setup_temp_index(4, 2, 8);
    let fresh = Index::new(&path, 4, 2, 8).unwrap();
    assert!(!fresh.load().unwrap());
}

#[test]
fn test_delete_files() {
    let (_temp, path, index) = setup_temp_index(4, 2, 8);
    index.persist().unwrap();
    std::fs::write(path.join("index.stats"), b"x").unwrap();

    index.delete_files().unwrap();

    let remaining: Vec<_> = std::fs::read_dir(&path)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(remaining, vec!["index.stats".to_string()]);
}
