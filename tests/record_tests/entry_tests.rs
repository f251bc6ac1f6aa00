//! Tests for the record codec and scanner
//!
//! These tests verify:
//! - Encoding/decoding of values and tombstones
//! - Checksum detection of flipped bytes
//! - Key length and total record length limits
//! - Scanning stops at the first damaged record
//! - Legacy header decoding

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sifs::record::{
    decode, encode, encode_legacy, encoded_len, is_expired_at, EntryHeader, HeaderFormat,
    Record, RecordScanner, Scan, HEADER_SIZE, LEGACY_HEADER_SIZE, MAX_KEY_LENGTH, NO_EXPIRATION,
};
use sifs::SifsError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("sifs2.0");
    (temp_dir, path)
}

fn write_records(path: &Path, records: &[Bytes]) {
    let mut file = File::create(path).unwrap();
    for record in records {
        file.write_all(record).unwrap();
    }
    file.sync_all().unwrap();
}

fn collect_scan(path: &Path, format: HeaderFormat) -> (Vec<(u64, Record)>, Option<u64>) {
    let mut scanner = RecordScanner::open(path, format, None).unwrap();
    let mut records = Vec::new();
    loop {
        match scanner.next_record().unwrap() {
            Scan::Record { offset, decoded, .. } => records.push((offset, decoded.into_record())),
            Scan::Truncated { offset, .. } => return (records, Some(offset)),
            Scan::End => return (records, None),
        }
    }
}

// =============================================================================
// Encode/Decode Tests
// =============================================================================

#[test]
fn test_value_roundtrip_keeps_metadata() {
    let record = Record::new("user:1", "alice")
        .with_expiration(5_000)
        .with_timestamps(1_000, 2_000);

    let bytes = encode(&record, 7, 42).unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE + 6 + 5);

    let decoded = decode(bytes, HeaderFormat::Current).unwrap();
    assert_eq!(decoded.header.segment, 7);
    assert_eq!(decoded.header.seq_id, 42);
    assert!(!decoded.header.is_tombstone());
    assert_eq!(decoded.into_record(), record);
}

#[test]
fn test_tombstone_roundtrip() {
    let record = Record::tombstone("gone").with_expiration(9_000);

    let bytes = encode(&record, 0, 3).unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE + 4);

    let decoded = decode(bytes, HeaderFormat::Current).unwrap();
    assert!(decoded.header.is_tombstone());
    assert_eq!(decoded.value, None);
    assert!(decoded.into_record().is_tombstone());
}

#[test]
fn test_empty_value_is_not_a_tombstone() {
    let record = Record::new("k", Bytes::new());
    let decoded = decode(encode(&record, 0, 1).unwrap(), HeaderFormat::Current).unwrap();

    assert!(!decoded.header.is_tombstone());
    assert_eq!(decoded.value, Some(Bytes::new()));
}

#[test]
fn test_flipped_byte_fails_checksum() {
    let bytes = encode(&Record::new("key", "value"), 0, 1).unwrap();

    // Flip one byte in the value
    let mut damaged = bytes.to_vec();
    let last = damaged.len() - 1;
    damaged[last] ^= 0xFF;

    let err = decode(Bytes::from(damaged), HeaderFormat::Current).unwrap_err();
    assert!(err.contains("checksum"));
}

#[test]
fn test_decode_rejects_short_buffer() {
    let bytes = encode(&Record::new("key", "value"), 0, 1).unwrap();
    let short = bytes.slice(..bytes.len() - 2);

    assert!(decode(short, HeaderFormat::Current).is_err());
}

#[test]
fn test_header_rejects_bad_magic() {
    let mut bytes = encode(&Record::new("key", "value"), 0, 1).unwrap().to_vec();
    bytes[0] = 0;
    bytes[1] = 0;

    let err = EntryHeader::parse(&bytes, HeaderFormat::Current).unwrap_err();
    assert!(err.contains("magic"));
}

#[test]
fn test_key_too_long() {
    let key = vec![b'k'; MAX_KEY_LENGTH + 1];
    let result = encode(&Record::new(key, "v"), 0, 1);

    assert!(matches!(result, Err(SifsError::KeyTooLong { .. })));
}

#[test]
fn test_record_length_must_fit_u32() {
    let key_len = 16;
    let largest_value = u32::MAX as usize - HEADER_SIZE - key_len;

    assert_eq!(encoded_len(key_len, Some(largest_value)).unwrap(), u32::MAX);
    assert!(matches!(
        encoded_len(key_len, Some(largest_value + 1)),
        Err(SifsError::RecordTooLarge { .. })
    ));
    assert!(matches!(
        encoded_len(MAX_KEY_LENGTH, Some(u32::MAX as usize)),
        Err(SifsError::RecordTooLarge { .. })
    ));
    assert_eq!(encoded_len(3, None).unwrap(), HEADER_SIZE as u32 + 3);
}

#[test]
fn test_expiration_rules() {
    assert!(!is_expired_at(NO_EXPIRATION, i64::MAX));
    assert!(is_expired_at(100, 100));
    assert!(is_expired_at(100, 101));
    assert!(!is_expired_at(100, 99));
}

// =============================================================================
// Scanner Tests
// =============================================================================

#[test]
fn test_scan_all_records() {
    let (_temp, path) = setup_temp_file();
    let first = encode(&Record::new("a", "1"), 0, 1).unwrap();
    let second = encode(&Record::tombstone("b"), 0, 2).unwrap();
    write_records(&path, &[first.clone(), second]);

    let (records, truncated) = collect_scan(&path, HeaderFormat::Current);

    assert_eq!(truncated, None);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].0, 0);
    assert_eq!(records[1].0, first.len() as u64);
    assert!(records[1].1.is_tombstone());
}

#[test]
fn test_scan_stops_at_partial_tail() {
    let (_temp, path) = setup_temp_file();
    let first = encode(&Record::new("a", "1"), 0, 1).unwrap();
    let second = encode(&Record::new("b", "2"), 0, 2).unwrap();
    write_records(&path, &[first.clone(), second.slice(..second.len() - 3)]);

    let (records, truncated) = collect_scan(&path, HeaderFormat::Current);

    assert_eq!(records.len(), 1);
    assert_eq!(truncated, Some(first.len() as u64));
}

#[test]
fn test_scan_stops_at_partial_header() {
    let (_temp, path) = setup_temp_file();
    let first = encode(&Record::new("a", "1"), 0, 1).unwrap();
    write_records(&path, &[first.clone()]);

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x51, 0xF5, 0, 0]).unwrap();

    let (records, truncated) = collect_scan(&path, HeaderFormat::Current);

    assert_eq!(records.len(), 1);
    assert_eq!(truncated, Some(first.len() as u64));
}

#[test]
fn test_scan_stops_at_corrupted_record() {
    let (_temp, path) = setup_temp_file();
    let first = encode(&Record::new("a", "1"), 0, 1).unwrap();
    let mut second = encode(&Record::new("b", "2"), 0, 2).unwrap().to_vec();
    let last = second.len() - 1;
    second[last] ^= 0x01;
    let third = encode(&Record::new("c", "3"), 0, 3).unwrap();
    write_records(&path, &[first.clone(), Bytes::from(second), third]);

    let (records, truncated) = collect_scan(&path, HeaderFormat::Current);

    // Records after the damaged one are not trusted
    assert_eq!(records.len(), 1);
    assert_eq!(truncated, Some(first.len() as u64));
}

#[test]
fn test_scan_respects_limit() {
    let (_temp, path) = setup_temp_file();
    let first = encode(&Record::new("a", "1"), 0, 1).unwrap();
    let second = encode(&Record::new("b", "2"), 0, 2).unwrap();
    write_records(&path, &[first.clone(), second]);

    let mut scanner =
        RecordScanner::open(&path, HeaderFormat::Current, Some(first.len() as u64)).unwrap();
    assert!(matches!(scanner.next_record().unwrap(), Scan::Record { .. }));
    assert!(matches!(scanner.next_record().unwrap(), Scan::End));
    assert_eq!(scanner.offset(), first.len() as u64);
}

#[test]
fn test_scan_empty_file() {
    let (_temp, path) = setup_temp_file();
    File::create(&path).unwrap();

    let (records, truncated) = collect_scan(&path, HeaderFormat::Current);
    assert!(records.is_empty());
    assert_eq!(truncated, None);
}

// =============================================================================
// Legacy Format Tests
// =============================================================================

#[test]
fn test_legacy_scan() {
    let (_temp, path) = setup_temp_file();
    let value = encode_legacy(&Record::new("old", "data").with_expiration(77), 5).unwrap();
    let tombstone = encode_legacy(&Record::tombstone("dead"), 6).unwrap();
    assert_eq!(value.len(), LEGACY_HEADER_SIZE + 3 + 4);
    write_records(&path, &[value, tombstone]);

    let (records, truncated) = collect_scan(&path, HeaderFormat::Legacy);

    assert_eq!(truncated, None);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].1.key, Bytes::from("old"));
    assert_eq!(records[0].1.value, Some(Bytes::from("data")));
    assert_eq!(records[0].1.expiration, 77);
    assert!(records[1].1.is_tombstone());
}
