//! Tests for startup recovery
//!
//! These tests verify:
//! - A clean stop is followed by a load of the persisted index
//! - Missing or stale index state triggers a rebuild from data files
//! - Damaged file tails are cut off and earlier records survive
//! - File accounting after restart matches the index
//! - Sequence ids continue across restarts
//! - Legacy data files are imported newest-per-key and removed
//! - purge_on_startup and the process lock

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use sifs::engine::Collaborators;
use sifs::record::{encode, encode_legacy};
use sifs::recovery::RecoveryMode;
use sifs::storage::STATS_FILE_NAME;
use sifs::{Engine, Record, SifsError, StoreConfig};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(dir: &Path) -> StoreConfig {
    StoreConfig::builder()
        .location(dir)
        .segment_count(16)
        .index_segments(4)
        .max_node_entries(8)
        .expiration_wake_up_interval(Duration::ZERO)
        .lock_timeout(Duration::from_millis(200))
        .build()
        .unwrap()
}

fn open_engine(config: StoreConfig) -> Engine {
    let collab = Collaborators::for_config(&config);
    Engine::open(config, collab).unwrap()
}

fn setup_temp_engine() -> (TempDir, StoreConfig, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    let engine = open_engine(config.clone());
    (temp_dir, config, engine)
}

fn key(i: usize) -> Vec<u8> {
    format!("key_{:03}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value_{}", i).into_bytes()
}

fn write_keys(engine: &Engine, count: usize) {
    for i in 0..count {
        engine.write(Record::new(key(i), value(i))).unwrap();
    }
}

fn data_file_sizes(config: &StoreConfig) -> u64 {
    fs::read_dir(config.data_dir())
        .unwrap()
        .map(|e| e.unwrap().metadata().unwrap().len())
        .sum()
}

fn assert_accounting(config: &StoreConfig, engine: &Engine) {
    let stats = engine.stats();
    assert_eq!(stats.total_bytes, data_file_sizes(config));
    assert_eq!(stats.total_bytes - stats.free_bytes, engine.index().live_bytes());
}

// =============================================================================
// Load / Rebuild Tests
// =============================================================================

#[test]
fn test_clean_restart_loads_index() {
    let (_temp, config, engine) = setup_temp_engine();
    write_keys(&engine, 10);
    assert!(engine.delete(&key(3)).unwrap());
    engine.stop().unwrap();
    drop(engine);

    assert!(config.index_dir().join(STATS_FILE_NAME).exists());
    let engine = open_engine(config.clone());

    assert_eq!(engine.recovery_report().mode, RecoveryMode::Loaded);
    assert_eq!(engine.size(), 9);
    assert!(engine.load(&key(3)).unwrap().is_none());
    for i in (0..10).filter(|i| *i != 3) {
        let loaded = engine.load(&key(i)).unwrap().unwrap();
        assert_eq!(loaded.value.unwrap(), Bytes::from(value(i)));
    }
    // Consumed on load, written again on the next clean stop
    assert!(!config.index_dir().join(STATS_FILE_NAME).exists());
}

#[test]
fn test_missing_index_rebuilds() {
    let (_temp, config, engine) = setup_temp_engine();
    write_keys(&engine, 10);
    assert!(engine.delete(&key(3)).unwrap());
    engine.stop().unwrap();
    drop(engine);

    fs::remove_dir_all(config.index_dir()).unwrap();
    let engine = open_engine(config.clone());

    let report = engine.recovery_report();
    assert_eq!(report.mode, RecoveryMode::Rebuilt);
    assert_eq!(report.records_scanned, 11);
    assert!(report.truncated.is_empty());
    assert_eq!(engine.size(), 9);
    assert!(engine.load(&key(3)).unwrap().is_none());
    assert!(engine.load(&key(4)).unwrap().is_some());
}

#[test]
fn test_crash_without_stats_file_rebuilds() {
    let (_temp, config, engine) = setup_temp_engine();
    write_keys(&engine, 5);
    engine.stop().unwrap();
    drop(engine);

    fs::remove_file(config.index_dir().join(STATS_FILE_NAME)).unwrap();
    let engine = open_engine(config.clone());

    assert_eq!(engine.recovery_report().mode, RecoveryMode::Rebuilt);
    assert_eq!(engine.size(), 5);
}

#[test]
fn test_unknown_data_file_rebuilds() {
    let (_temp, config, engine) = setup_temp_engine();
    write_keys(&engine, 5);
    engine.stop().unwrap();
    drop(engine);

    // A data file the stats file knows nothing about
    let extra = encode(&Record::new("extra", "late"), 0, 1_000).unwrap();
    fs::write(config.data_dir().join("sifs2.99"), &extra).unwrap();
    let engine = open_engine(config.clone());

    assert_eq!(engine.recovery_report().mode, RecoveryMode::Rebuilt);
    assert_eq!(engine.size(), 6);
    let loaded = engine.load(b"extra").unwrap().unwrap();
    assert_eq!(loaded.value.unwrap(), Bytes::from("late"));
}

#[test]
fn test_changed_segment_count_rebuilds() {
    let (temp, config, engine) = setup_temp_engine();
    write_keys(&engine, 10);
    engine.stop().unwrap();
    drop(engine);

    let mut wider = test_config(temp.path());
    wider.segment_count = 32;
    let engine = open_engine(wider);

    assert_eq!(engine.recovery_report().mode, RecoveryMode::Rebuilt);
    assert_eq!(engine.size(), 10);
    for i in 0..10 {
        assert!(engine.load(&key(i)).unwrap().is_some());
    }
    assert_accounting(&config, &engine);
}

// =============================================================================
// Damage Tests
// =============================================================================

#[test]
fn test_partial_tail_is_truncated() {
    let (_temp, config, engine) = setup_temp_engine();
    write_keys(&engine, 10);
    engine.stop().unwrap();
    drop(engine);

    let path = config.data_dir().join("sifs2.0");
    let clean_len = fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x51, 0xF5, 0x02, 0x00, 0x07]).unwrap();
    drop(file);

    let engine = open_engine(config.clone());

    let report = engine.recovery_report();
    assert_eq!(report.mode, RecoveryMode::Rebuilt);
    assert_eq!(report.truncated, vec![(0, clean_len)]);
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
    assert_eq!(engine.size(), 10);
    assert_accounting(&config, &engine);
}

#[test]
fn test_corrupted_record_cuts_rest_of_file() {
    let (_temp, config, engine) = setup_temp_engine();
    write_keys(&engine, 5);
    let segment = engine.segment_of(&key(2));
    let damaged = engine
        .index()
        .get(segment, &Bytes::from(key(2)))
        .unwrap()
        .location;
    engine.stop().unwrap();
    drop(engine);

    let path = config.data_dir().join(format!("sifs2.{}", damaged.file));
    let mut bytes = fs::read(&path).unwrap();
    let last = (damaged.offset + damaged.len as u64 - 1) as usize;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes).unwrap();
    // Same size as before, so only a missing stats file forces the scan
    fs::remove_file(config.index_dir().join(STATS_FILE_NAME)).unwrap();

    let engine = open_engine(config.clone());

    assert_eq!(
        engine.recovery_report().truncated,
        vec![(damaged.file, damaged.offset)]
    );
    assert!(engine.load(&key(0)).unwrap().is_some());
    assert!(engine.load(&key(1)).unwrap().is_some());
    for i in 2..5 {
        assert!(engine.load(&key(i)).unwrap().is_none());
    }
    assert_eq!(engine.size(), 2);
}

// =============================================================================
// Accounting / Sequence Tests
// =============================================================================

#[test]
fn test_accounting_survives_restart() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.max_file_size = 1024;
    let engine = open_engine(config.clone());

    for round in 0..3 {
        for i in 0..30 {
            let v = format!("value_{}_{}", i, round);
            engine.write(Record::new(key(i), v)).unwrap();
        }
    }
    for i in 0..5 {
        engine.delete(&key(i)).unwrap();
    }
    engine.stop().unwrap();
    drop(engine);

    let engine = open_engine(config.clone());
    assert_eq!(engine.recovery_report().mode, RecoveryMode::Loaded);
    assert_eq!(engine.size(), 25);
    assert_accounting(&config, &engine);
    engine.stop().unwrap();
    drop(engine);

    fs::remove_dir_all(config.index_dir()).unwrap();
    let engine = open_engine(config.clone());
    assert_eq!(engine.recovery_report().mode, RecoveryMode::Rebuilt);
    assert_eq!(engine.size(), 25);
    assert_accounting(&config, &engine);
}

#[test]
fn test_sequence_continues_after_restart() {
    let (_temp, config, engine) = setup_temp_engine();
    engine.write(Record::new("k", "first")).unwrap();
    engine.stop().unwrap();
    drop(engine);

    fs::remove_dir_all(config.index_dir()).unwrap();
    let engine = open_engine(config.clone());
    assert_eq!(engine.recovery_report().max_seq_id, 1);
    engine.write(Record::new("k", "second")).unwrap();
    engine.stop().unwrap();
    drop(engine);

    // Both records are scanned again; the later write must win
    fs::remove_dir_all(config.index_dir()).unwrap();
    let engine = open_engine(config.clone());
    let loaded = engine.load(b"k").unwrap().unwrap();
    assert_eq!(loaded.value.unwrap(), Bytes::from("second"));
    assert_eq!(engine.recovery_report().max_seq_id, 2);
}

// =============================================================================
// Legacy / Purge / Lock Tests
// =============================================================================

#[test]
fn test_legacy_files_are_imported() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    fs::create_dir_all(config.data_dir()).unwrap();
    let legacy_path = config.data_dir().join("sifs1.0");
    let mut legacy = Vec::new();
    legacy.extend_from_slice(&encode_legacy(&Record::new("old", "data"), 1).unwrap());
    legacy.extend_from_slice(&encode_legacy(&Record::new("older", "stuff"), 2).unwrap());
    fs::write(&legacy_path, legacy).unwrap();

    let engine = open_engine(config.clone());

    assert_eq!(engine.recovery_report().legacy_records, 2);
    assert!(!legacy_path.exists());
    let loaded = engine.load(b"old").unwrap().unwrap();
    assert_eq!(loaded.value.unwrap(), Bytes::from("data"));
    assert_eq!(engine.size(), 2);

    // Imported records live on in the current format
    engine.stop().unwrap();
    drop(engine);
    let engine = open_engine(config);
    assert_eq!(engine.recovery_report().legacy_records, 0);
    assert!(engine.load(b"older").unwrap().is_some());
}

#[test]
fn test_legacy_import_keeps_newest_record_per_key() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    fs::create_dir_all(config.data_dir()).unwrap();

    // The later file holds an older copy of "k"; "d" is deleted at the same seq
    let mut first = Vec::new();
    first.extend_from_slice(&encode_legacy(&Record::new("k", "newest"), 5).unwrap());
    first.extend_from_slice(&encode_legacy(&Record::new("d", "doomed"), 3).unwrap());
    fs::write(config.data_dir().join("sifs1.0"), first).unwrap();

    let mut second = Vec::new();
    second.extend_from_slice(&encode_legacy(&Record::new("k", "stale"), 1).unwrap());
    second.extend_from_slice(&encode_legacy(&Record::tombstone("d"), 3).unwrap());
    second.extend_from_slice(&encode_legacy(&Record::new("other", "x"), 2).unwrap());
    fs::write(config.data_dir().join("sifs1.1"), second).unwrap();

    let engine = open_engine(config.clone());

    let loaded = engine.load(b"k").unwrap().unwrap();
    assert_eq!(loaded.value.unwrap(), Bytes::from("newest"));
    assert!(engine.load(b"d").unwrap().is_none());
    assert!(engine.load(b"other").unwrap().is_some());
    assert_eq!(engine.recovery_report().legacy_records, 3);
    assert_eq!(engine.size(), 2);
    assert!(!config.data_dir().join("sifs1.0").exists());
    assert!(!config.data_dir().join("sifs1.1").exists());
}

#[test]
fn test_purge_on_startup_deletes_legacy_files() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.purge_on_startup = true;

    fs::create_dir_all(config.data_dir()).unwrap();
    let legacy_path = config.data_dir().join("sifs1.0");
    fs::write(&legacy_path, encode_legacy(&Record::new("old", "data"), 1).unwrap()).unwrap();

    let engine = open_engine(config);

    assert_eq!(engine.recovery_report().mode, RecoveryMode::Purged);
    assert_eq!(engine.recovery_report().legacy_records, 0);
    assert_eq!(engine.size(), 0);
    assert!(engine.load(b"old").unwrap().is_none());
    assert!(!legacy_path.exists());
}

#[test]
fn test_purge_on_startup_deletes_data() {
    let (temp, _config, engine) = setup_temp_engine();
    write_keys(&engine, 10);
    engine.stop().unwrap();
    drop(engine);

    let mut purging = test_config(temp.path());
    purging.purge_on_startup = true;
    let engine = open_engine(purging);

    assert_eq!(engine.recovery_report().mode, RecoveryMode::Purged);
    assert_eq!(engine.size(), 0);
    assert_eq!(engine.stats().data_files, 0);
    assert!(engine.load(&key(0)).unwrap().is_none());
}

#[test]
fn test_second_open_conflicts_on_lock() {
    let (_temp, config, engine) = setup_temp_engine();

    let collab = Collaborators::for_config(&config);
    let second = Engine::open(config.clone(), collab);
    assert!(matches!(second, Err(SifsError::LockConflict { .. })));

    engine.stop().unwrap();
    let reopened = open_engine(config);
    assert!(reopened.is_available());
}

#[test]
fn test_mismatched_partitioner_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    let mut collab = Collaborators::for_config(&config);
    collab.partitioner = std::sync::Arc::new(sifs::partition::HashPartitioner::new(3));

    let result = Engine::open(config, collab);
    assert!(matches!(result, Err(SifsError::Config(_))));
}
