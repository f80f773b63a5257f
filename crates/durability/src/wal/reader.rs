//! WAL reader for recovery and replay.
//!
//! The reader walks segments in order starting at a given LSN and stops at
//! the first record that is incomplete or fails its checksum. Everything
//! before that point is the valid log; everything after is a torn tail
//! that the writer truncates away when it reopens the log.

use crate::format::{WalRecord, WalRecordError, WalSegment, SEGMENT_HEADER_SIZE};
use relstore_core::{Error, IoOp, Lsn, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A record together with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecord {
    /// Position of the first byte of the record
    pub start: Lsn,
    /// Position just past the record
    pub end: Lsn,
    /// The record
    pub record: WalRecord,
}

/// Why reading stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Clean end of the last segment
    EndOfData,
    /// Incomplete record at the end (crash during write)
    PartialRecord {
        /// Offset of the incomplete record in its segment
        offset: u64,
    },
    /// Record failed its CRC
    ChecksumMismatch {
        /// Offset of the bad record in its segment
        offset: u64,
    },
    /// Framing was intact but unreadable
    ParseError {
        /// Offset of the bad record in its segment
        offset: u64,
        /// Decoder message
        detail: String,
    },
}

/// Result of reading the log.
#[derive(Debug, Clone)]
pub struct WalReadResult {
    /// Records in log order
    pub records: Vec<LoggedRecord>,
    /// Position just past the last valid record
    pub end_of_log: Lsn,
    /// Why the reader stopped
    pub stop_reason: ReadStopReason,
}

/// WAL reader over a directory of segments.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    /// Create a reader over `wal_dir`.
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        WalReader {
            wal_dir: wal_dir.into(),
        }
    }

    /// WAL directory.
    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Read all valid records from one segment.
    ///
    /// Returns the records, the byte offset where valid data ends, and the
    /// stop reason.
    pub fn read_segment(
        &self,
        segment_number: u64,
    ) -> Result<(Vec<LoggedRecord>, u64, ReadStopReason)> {
        let path = WalSegment::segment_path(&self.wal_dir, segment_number);
        let describe = path.display().to_string();
        let mut segment = WalSegment::open_read(&self.wal_dir, segment_number).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                Error::Wal(format!("{}: {}", describe, e))
            } else {
                Error::open(describe.clone(), e)
            }
        })?;
        let buffer = segment
            .read_body()
            .map_err(|e| Error::io(IoOp::Read, describe.clone(), e))?;

        let seg = segment_number as u32;
        let hdr = SEGMENT_HEADER_SIZE as u64;
        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut stop_reason = ReadStopReason::EndOfData;

        while offset < buffer.len() {
            match WalRecord::from_bytes(&buffer[offset..]) {
                Ok((record, consumed)) => {
                    let start = Lsn::from_parts(seg, (hdr + offset as u64) as u32);
                    offset += consumed;
                    let end = Lsn::from_parts(seg, (hdr + offset as u64) as u32);
                    records.push(LoggedRecord { start, end, record });
                }
                Err(WalRecordError::InsufficientData) => {
                    stop_reason = ReadStopReason::PartialRecord {
                        offset: hdr + offset as u64,
                    };
                    break;
                }
                Err(WalRecordError::ChecksumMismatch { .. }) => {
                    stop_reason = ReadStopReason::ChecksumMismatch {
                        offset: hdr + offset as u64,
                    };
                    break;
                }
                Err(e) => {
                    stop_reason = ReadStopReason::ParseError {
                        offset: hdr + offset as u64,
                        detail: e.to_string(),
                    };
                    break;
                }
            }
        }

        if stop_reason != ReadStopReason::EndOfData {
            warn!(
                target: "relstore::redo",
                segment = segment_number,
                ?stop_reason,
                "WAL segment ends with an invalid record"
            );
        }

        Ok((records, hdr + offset as u64, stop_reason))
    }

    /// Read every valid record at or after `start`.
    ///
    /// Reading stops at the first torn or corrupt record, or at a gap in
    /// the segment sequence. An invalid `start` reads from the first segment.
    pub fn read_from(&self, start: Lsn) -> Result<WalReadResult> {
        let segments = self.list_segments()?;

        let mut records = Vec::new();
        let mut end_of_log = Lsn::INVALID;
        let mut stop_reason = ReadStopReason::EndOfData;
        let mut previous: Option<u64> = None;

        for segment_number in segments {
            if start.is_valid() && segment_number < start.segment() as u64 {
                continue;
            }
            if let Some(prev) = previous {
                if segment_number != prev + 1 {
                    warn!(
                        target: "relstore::redo",
                        expected = prev + 1,
                        found = segment_number,
                        "gap in WAL segment sequence"
                    );
                    break;
                }
            }
            previous = Some(segment_number);

            let (segment_records, valid_end, reason) = self.read_segment(segment_number)?;
            records.extend(segment_records.into_iter().filter(|r| r.start >= start));
            end_of_log = Lsn::from_parts(segment_number as u32, valid_end as u32);
            stop_reason = reason;
            if stop_reason != ReadStopReason::EndOfData {
                break;
            }
        }

        Ok(WalReadResult {
            records,
            end_of_log,
            stop_reason,
        })
    }

    /// List all segment numbers in ascending order.
    pub fn list_segments(&self) -> Result<Vec<u64>> {
        list_segments(&self.wal_dir)
    }
}

/// Segment numbers present in `wal_dir`, ascending. A missing directory is empty.
pub fn list_segments(wal_dir: &Path) -> Result<Vec<u64>> {
    let entries = match std::fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::open(wal_dir.display().to_string(), e)),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(IoOp::Read, wal_dir.display().to_string(), e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(num) = WalSegment::parse_segment_name(&name) {
            segments.push(num);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}
