//! Record Scanner
//!
//! Sequential iteration over the records of a data file, used by recovery,
//! compaction and legacy import.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use bytes::{Bytes, BytesMut};

use crate::error::Result;

use super::entry::{decode, DecodedRecord, EntryHeader, HeaderFormat};

/// One step of a scan
#[derive(Debug)]
pub enum Scan {
    /// A complete, verified record
    Record {
        offset: u64,
        decoded: DecodedRecord,
        /// The encoded bytes, suitable for copying to another file unchanged
        raw: Bytes,
    },

    /// Bytes from `offset` on do not form a valid record
    Truncated { offset: u64, reason: String },

    /// All bytes up to the limit were consumed
    End,
}

/// Reads records front to back, stopping at the first invalid one
pub struct RecordScanner {
    reader: BufReader<File>,
    format: HeaderFormat,
    /// Current position in file
    offset: u64,
    /// Stop reading at this offset
    limit: u64,
    done: bool,
}

impl RecordScanner {
    /// Open a scanner over `path`
    ///
    /// `limit` bounds the scan, which matters for a file that is still being
    /// appended to; `None` scans to the current end of file.
    pub fn open(path: &Path, format: HeaderFormat, limit: Option<u64>) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            format,
            offset: 0,
            limit: limit.map(|l| l.min(len)).unwrap_or(len),
            done: false,
        })
    }

    /// Offset of the next record to be read
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record
    ///
    /// Only genuine I/O failures are errors. Short or inconsistent data is
    /// reported as [`Scan::Truncated`], after which the scan is over.
    pub fn next_record(&mut self) -> Result<Scan> {
        if self.done {
            return Ok(Scan::End);
        }

        let remaining = self.limit - self.offset;
        if remaining == 0 {
            self.done = true;
            return Ok(Scan::End);
        }

        let header_size = self.format.header_size();
        if remaining < header_size as u64 {
            return Ok(self.truncated(format!("partial header of {} bytes", remaining)));
        }

        let mut buf = BytesMut::zeroed(header_size);
        if let Err(e) = self.reader.read_exact(&mut buf) {
            return self.eof_as_truncation(e);
        }

        let header = match EntryHeader::parse(&buf, self.format) {
            Ok(header) => header,
            Err(reason) => return Ok(self.truncated(reason)),
        };

        let record_len = header.record_len();
        if record_len > remaining {
            return Ok(self.truncated(format!(
                "record declares {} bytes, only {} remain",
                record_len, remaining
            )));
        }

        buf.resize(record_len as usize, 0);
        if let Err(e) = self.reader.read_exact(&mut buf[header_size..]) {
            return self.eof_as_truncation(e);
        }

        let raw = buf.freeze();
        match decode(raw.clone(), self.format) {
            Ok(decoded) => {
                let offset = self.offset;
                self.offset += record_len;
                Ok(Scan::Record {
                    offset,
                    decoded,
                    raw,
                })
            }
            Err(reason) => Ok(self.truncated(reason)),
        }
    }

    fn truncated(&mut self, reason: String) -> Scan {
        self.done = true;
        Scan::Truncated {
            offset: self.offset,
            reason,
        }
    }

    fn eof_as_truncation(&mut self, err: io::Error) -> Result<Scan> {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Ok(self.truncated("unexpected end of file".to_string()))
        } else {
            Err(err.into())
        }
    }
}
