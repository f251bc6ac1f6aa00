//! Record Module
//!
//! Binary encoding of a single stored record and sequential scanning of data
//! files.
//!
//! ## Responsibilities
//! - Encode records with a fixed-size header followed by key and value
//! - CRC32 checksums over header and payload
//! - Detect partially written trailing records and report them as truncation
//! - Read the legacy header layout for import of old stores
//!
//! ## Record Format (current)
//! ```text
//! ┌──────────┬─────────┬──────────┬─────────┬───────────┬─────────┬────────┐
//! │ Magic(2) │Flags(1) │ Rsvd(1)  │KeyLen(4)│ValueLen(4)│ Seg(4)  │Seq(8)  │
//! ├──────────┴─────────┴──────────┴─────────┴───────────┴─────────┴────────┤
//! │ Expiration(8) │ Created(8) │ LastUsed(8) │ CRC(4)                      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │ Key (KeyLen bytes) │ Value (ValueLen bytes, absent for tombstones)      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ValueLen = 0xFFFFFFFF marks a tombstone
//! ```
//!
//! ## Record Format (legacy, read-only)
//! ```text
//! ┌───────────┬─────────────┬─────────┬───────────────┬─────┬───────┐
//! │ KeyLen(2) │ ValueLen(4) │ Seq(8)  │ Expiration(8) │ Key │ Value │
//! └───────────┴─────────────┴─────────┴───────────────┴─────┴───────┘
//! ValueLen = 0 marks a tombstone
//! ```

mod entry;
mod reader;

pub use entry::{
    decode, encode, encode_legacy, encoded_len, is_expired_at, DecodedRecord, EntryHeader,
    HeaderFormat, Record, HEADER_SIZE, LEGACY_HEADER_SIZE, MAGIC, MAX_KEY_LENGTH, NO_EXPIRATION,
    TOMBSTONE_MARKER,
};
pub use reader::{RecordScanner, Scan};
