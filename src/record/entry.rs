//! Record definitions and the header codec

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SifsError};

/// Leading magic of every current-format header
pub const MAGIC: u16 = 0x51F5;

/// Size of the current header in bytes
pub const HEADER_SIZE: usize = 52;

/// Size of the legacy header in bytes
pub const LEGACY_HEADER_SIZE: usize = 22;

/// Value length marking a tombstone in the current layout
pub const TOMBSTONE_MARKER: u32 = u32::MAX;

/// Longest accepted key
pub const MAX_KEY_LENGTH: usize = 32 * 1024;

/// Expiration value meaning "never expires"
pub const NO_EXPIRATION: i64 = -1;

const FLAG_TOMBSTONE: u8 = 0x01;
const CHECKSUM_OFFSET: usize = 48;

/// True when `expiration` is set and not later than `now`
pub fn is_expired_at(expiration: i64, now: i64) -> bool {
    expiration >= 0 && expiration <= now
}

// =============================================================================
// Record
// =============================================================================

/// A stored record: key, optional value and metadata
///
/// A record without a value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Option<Bytes>,
    /// Epoch millis, or [`NO_EXPIRATION`]
    pub expiration: i64,
    pub created: i64,
    pub last_used: i64,
}

impl Record {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            expiration: NO_EXPIRATION,
            created: -1,
            last_used: -1,
        }
    }

    pub fn tombstone(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
            expiration: NO_EXPIRATION,
            created: -1,
            last_used: -1,
        }
    }

    pub fn with_expiration(mut self, expiration: i64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_timestamps(mut self, created: i64, last_used: i64) -> Self {
        self.created = created;
        self.last_used = last_used;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        is_expired_at(self.expiration, now)
    }
}

// =============================================================================
// Header
// =============================================================================

/// On-disk header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    Current,
    Legacy,
}

impl HeaderFormat {
    pub fn header_size(self) -> usize {
        match self {
            HeaderFormat::Current => HEADER_SIZE,
            HeaderFormat::Legacy => LEGACY_HEADER_SIZE,
        }
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub format: HeaderFormat,
    pub key_len: u32,
    /// `None` for tombstones
    pub value_len: Option<u32>,
    pub segment: u32,
    pub seq_id: u64,
    pub expiration: i64,
    pub created: i64,
    pub last_used: i64,
    pub checksum: u32,
}

impl EntryHeader {
    pub fn is_tombstone(&self) -> bool {
        self.value_len.is_none()
    }

    pub fn header_size(&self) -> usize {
        self.format.header_size()
    }

    /// Total encoded length of the record (header + key + value)
    pub fn record_len(&self) -> u64 {
        self.header_size() as u64 + self.key_len as u64 + self.value_len.unwrap_or(0) as u64
    }

    /// Parse a header from the front of `buf`
    ///
    /// Errors are plain reasons: a bad header is a truncation point, not a
    /// fatal condition.
    pub fn parse(buf: &[u8], format: HeaderFormat) -> std::result::Result<Self, String> {
        if buf.len() < format.header_size() {
            return Err(format!(
                "header needs {} bytes, only {} available",
                format.header_size(),
                buf.len()
            ));
        }
        let header = match format {
            HeaderFormat::Current => Self::parse_current(buf)?,
            HeaderFormat::Legacy => Self::parse_legacy(buf),
        };
        if header.key_len as usize > MAX_KEY_LENGTH {
            return Err(format!("key length {} exceeds maximum", header.key_len));
        }
        Ok(header)
    }

    fn parse_current(buf: &[u8]) -> std::result::Result<Self, String> {
        let magic = u16::from_le_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(format!("bad magic {:#06x}", magic));
        }
        let flags = buf[2];
        let key_len = read_u32(buf, 4);
        let raw_value_len = read_u32(buf, 8);
        let tombstone = flags & FLAG_TOMBSTONE != 0;
        if tombstone != (raw_value_len == TOMBSTONE_MARKER) {
            return Err("tombstone flag disagrees with value length".to_string());
        }
        Ok(Self {
            format: HeaderFormat::Current,
            key_len,
            value_len: (!tombstone).then_some(raw_value_len),
            segment: read_u32(buf, 12),
            seq_id: read_u64(buf, 16),
            expiration: read_u64(buf, 24) as i64,
            created: read_u64(buf, 32) as i64,
            last_used: read_u64(buf, 40) as i64,
            checksum: read_u32(buf, CHECKSUM_OFFSET),
        })
    }

    fn parse_legacy(buf: &[u8]) -> Self {
        let value_len = read_u32(buf, 2);
        Self {
            format: HeaderFormat::Legacy,
            key_len: u16::from_le_bytes([buf[0], buf[1]]) as u32,
            value_len: (value_len != 0).then_some(value_len),
            segment: 0,
            seq_id: read_u64(buf, 6),
            expiration: read_u64(buf, 14) as i64,
            created: -1,
            last_used: -1,
            checksum: 0,
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

// =============================================================================
// Encoding
// =============================================================================

/// Encoded length of a current-layout record, rejecting records whose
/// length does not fit the `u32` an index entry stores
pub fn encoded_len(key_len: usize, value_len: Option<usize>) -> Result<u32> {
    if key_len > MAX_KEY_LENGTH {
        return Err(SifsError::KeyTooLong {
            len: key_len,
            max: MAX_KEY_LENGTH,
        });
    }
    let total = HEADER_SIZE as u64 + key_len as u64 + value_len.unwrap_or(0) as u64;
    u32::try_from(total).map_err(|_| SifsError::RecordTooLarge {
        len: total,
        max: u32::MAX as u64,
    })
}

/// Encode a record in the current layout
pub fn encode(record: &Record, segment: u32, seq_id: u64) -> Result<Bytes> {
    let value = record.value.as_deref();
    let total = encoded_len(record.key.len(), value.map(|v| v.len()))?;

    let mut buf = BytesMut::with_capacity(total as usize);

    buf.put_u16_le(MAGIC);
    buf.put_u8(if value.is_none() { FLAG_TOMBSTONE } else { 0 });
    buf.put_u8(0);
    buf.put_u32_le(record.key.len() as u32);
    buf.put_u32_le(value.map(|v| v.len() as u32).unwrap_or(TOMBSTONE_MARKER));
    buf.put_u32_le(segment);
    buf.put_u64_le(seq_id);
    buf.put_i64_le(record.expiration);
    buf.put_i64_le(record.created);
    buf.put_i64_le(record.last_used);

    let checksum = checksum(&buf[..CHECKSUM_OFFSET], &record.key, value.unwrap_or(&[]));
    buf.put_u32_le(checksum);
    buf.put_slice(&record.key);
    if let Some(v) = value {
        buf.put_slice(v);
    }

    Ok(buf.freeze())
}

/// Encode a record in the legacy layout
///
/// Only used to produce fixtures of old stores; the engine never writes it.
/// Empty values cannot be represented since a zero length marks a tombstone.
pub fn encode_legacy(record: &Record, seq_id: u64) -> Result<Bytes> {
    if record.key.len() > u16::MAX as usize {
        return Err(SifsError::KeyTooLong {
            len: record.key.len(),
            max: u16::MAX as usize,
        });
    }
    let value = record.value.as_deref().unwrap_or(&[]);
    let mut buf = BytesMut::with_capacity(LEGACY_HEADER_SIZE + record.key.len() + value.len());
    buf.put_u16_le(record.key.len() as u16);
    buf.put_u32_le(value.len() as u32);
    buf.put_u64_le(seq_id);
    buf.put_i64_le(record.expiration);
    buf.put_slice(&record.key);
    buf.put_slice(value);
    Ok(buf.freeze())
}

fn checksum(header: &[u8], key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

// =============================================================================
// Decoding
// =============================================================================

/// A fully decoded record with its header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub header: EntryHeader,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl DecodedRecord {
    pub fn into_record(self) -> Record {
        Record {
            key: self.key,
            value: self.value,
            expiration: self.header.expiration,
            created: self.header.created,
            last_used: self.header.last_used,
        }
    }
}

/// Decode one complete record from `buf`
///
/// Verifies that declared lengths fit `buf` and, for the current layout,
/// the checksum.
pub fn decode(buf: Bytes, format: HeaderFormat) -> std::result::Result<DecodedRecord, String> {
    let header = EntryHeader::parse(&buf, format)?;
    let record_len = header.record_len();
    if record_len > buf.len() as u64 {
        return Err(format!(
            "record declares {} bytes, only {} available",
            record_len,
            buf.len()
        ));
    }

    let key_start = header.header_size();
    let key_end = key_start + header.key_len as usize;
    let value_end = record_len as usize;
    let key = buf.slice(key_start..key_end);
    let value = header.value_len.map(|_| buf.slice(key_end..value_end));

    if format == HeaderFormat::Current {
        let actual = checksum(
            &buf[..CHECKSUM_OFFSET],
            &key,
            value.as_deref().unwrap_or(&[]),
        );
        if actual != header.checksum {
            return Err(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                header.checksum, actual
            ));
        }
    }

    Ok(DecodedRecord { header, key, value })
}
