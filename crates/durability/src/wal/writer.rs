//! WAL writer.
//!
//! The writer appends framed records to the active segment and hands back
//! their start and end LSNs. Nothing is durable until [`WalWriter::flush`]
//! covers the record's end position; callers that must not let a physical
//! change reach disk before its log record (create, truncate, commit) flush
//! explicitly.

use crate::format::{WalRecord, WalSegment, SEGMENT_HEADER_SIZE};
use crate::wal::config::WalConfig;
use crate::wal::reader::{list_segments, WalReader};
use relstore_core::{Error, IoOp, Lsn, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// Cumulative WAL operation counters.
///
/// These counters accumulate over the lifetime of the WalWriter
/// and are never reset.
#[derive(Debug, Clone, Default)]
pub struct WalCounters {
    /// Total records inserted
    pub records_inserted: u64,
    /// Total flush calls that reached the disk
    pub sync_calls: u64,
    /// Total bytes written to WAL segments
    pub bytes_written: u64,
    /// Total nanoseconds spent in fsync
    pub sync_nanos: u64,
    /// Segments created after the first
    pub segment_rotations: u64,
}

/// Appends records to a directory of WAL segments.
pub struct WalWriter {
    segment: WalSegment,
    wal_dir: PathBuf,
    cluster_uuid: [u8; 16],
    config: WalConfig,
    flushed_upto: Lsn,
    counters: WalCounters,
}

impl WalWriter {
    /// Open the log in `wal_dir`, creating the first segment if none exists.
    ///
    /// An existing last segment is reopened for appending after any torn
    /// tail has been cut off, so new records follow the last valid one.
    pub fn open(wal_dir: &Path, cluster_uuid: [u8; 16], config: WalConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(wal_dir)
            .map_err(|e| Error::io(IoOp::Open, wal_dir.display().to_string(), e))?;

        let segments = list_segments(wal_dir)?;
        let segment = match segments.last() {
            Some(&num) => {
                let (_, valid_end, _) = WalReader::new(wal_dir).read_segment(num)?;
                let describe = WalSegment::segment_path(wal_dir, num).display().to_string();
                let mut segment = WalSegment::open_append(wal_dir, num)
                    .map_err(|e| Error::open(describe.clone(), e))?;
                if segment.cluster_uuid() != cluster_uuid {
                    return Err(Error::Wal(format!(
                        "{} belongs to a different cluster",
                        describe
                    )));
                }
                if valid_end < segment.size() {
                    warn!(
                        target: "relstore::redo",
                        segment = num,
                        valid_end,
                        size = segment.size(),
                        "truncating torn WAL tail"
                    );
                    segment
                        .truncate(valid_end)
                        .map_err(|e| Error::io(IoOp::Truncate, describe, e))?;
                }
                segment
            }
            None => WalSegment::create(wal_dir, 1, cluster_uuid).map_err(|e| {
                Error::open(WalSegment::segment_path(wal_dir, 1).display().to_string(), e)
            })?,
        };

        let position = Lsn::from_parts(segment.segment_number() as u32, segment.size() as u32);
        debug!(target: "relstore::redo", %position, "WAL opened for writing");

        Ok(WalWriter {
            segment,
            wal_dir: wal_dir.to_path_buf(),
            cluster_uuid,
            config,
            flushed_upto: position,
            counters: WalCounters::default(),
        })
    }

    /// Position the next record will start at.
    pub fn insert_position(&self) -> Lsn {
        Lsn::from_parts(
            self.segment.segment_number() as u32,
            self.segment.size() as u32,
        )
    }

    /// Everything before this position is on disk.
    pub fn flushed_upto(&self) -> Lsn {
        self.flushed_upto
    }

    /// Append a record. Returns its (start, end) positions.
    pub fn insert(&mut self, record: &WalRecord) -> Result<(Lsn, Lsn)> {
        let bytes = record.to_bytes();
        if bytes.len() as u64 > self.config.max_record_bytes() {
            return Err(Error::Wal(format!(
                "record of {} bytes exceeds WAL segment capacity",
                bytes.len()
            )));
        }

        if self.segment.size() + bytes.len() as u64 > self.config.segment_size {
            self.rotate_segment()?;
        }

        let start = self.insert_position();
        let describe = self.segment.path().display().to_string();
        self.segment
            .write(&bytes)
            .map_err(|e| Error::io(IoOp::Write, describe, e))?;
        let end = self.insert_position();

        self.counters.records_inserted += 1;
        self.counters.bytes_written += bytes.len() as u64;
        Ok((start, end))
    }

    /// Make every record ending at or before `upto` durable.
    pub fn flush(&mut self, upto: Lsn) -> Result<()> {
        if upto <= self.flushed_upto {
            return Ok(());
        }
        let started = Instant::now();
        let describe = self.segment.path().display().to_string();
        self.segment
            .sync()
            .map_err(|e| Error::io(IoOp::Fsync, describe, e))?;
        self.counters.sync_calls += 1;
        self.counters.sync_nanos += started.elapsed().as_nanos() as u64;
        self.flushed_upto = self.insert_position();
        Ok(())
    }

    /// Flush everything inserted so far.
    pub fn flush_all(&mut self) -> Result<()> {
        let end = self.insert_position();
        self.flush(end)
    }

    fn rotate_segment(&mut self) -> Result<()> {
        let describe = self.segment.path().display().to_string();
        self.segment
            .close()
            .map_err(|e| Error::io(IoOp::Fsync, describe, e))?;
        // close() synced the old segment
        self.flushed_upto = self.insert_position();

        let next = self.segment.segment_number() + 1;
        if next > u32::MAX as u64 {
            return Err(Error::Wal("WAL segment numbers exhausted".into()));
        }
        self.segment = WalSegment::create(&self.wal_dir, next, self.cluster_uuid).map_err(|e| {
            Error::open(
                WalSegment::segment_path(&self.wal_dir, next)
                    .display()
                    .to_string(),
                e,
            )
        })?;
        self.counters.segment_rotations += 1;
        debug!(target: "relstore::redo", segment = next, "switched to new WAL segment");
        Ok(())
    }

    /// Remove segments that lie entirely before `redo`. Returns how many were removed.
    pub fn remove_segments_before(&mut self, redo: Lsn) -> Result<usize> {
        let mut removed = 0;
        for num in list_segments(&self.wal_dir)? {
            if num >= redo.segment() as u64 || num >= self.segment.segment_number() {
                break;
            }
            let path = WalSegment::segment_path(&self.wal_dir, num);
            std::fs::remove_file(&path)
                .map_err(|e| Error::io(IoOp::Unlink, path.display().to_string(), e))?;
            removed += 1;
        }
        if removed > 0 {
            debug!(target: "relstore::checkpoint", removed, %redo, "removed old WAL segments");
        }
        Ok(removed)
    }

    /// Get a snapshot of cumulative WAL counters.
    pub fn counters(&self) -> WalCounters {
        self.counters.clone()
    }

    /// Get the WAL directory path.
    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// First record position of a segment.
    pub fn segment_start(segment_number: u32) -> Lsn {
        Lsn::from_parts(segment_number, SEGMENT_HEADER_SIZE as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RmgrId;
    use crate::wal::reader::ReadStopReason;
    use std::io::Write;
    use tempfile::tempdir;

    const UUID: [u8; 16] = [7u8; 16];

    fn rec(size: usize) -> WalRecord {
        WalRecord::new(RmgrId::Xlog, 0xB0, vec![0xAB; size])
    }

    #[test]
    fn test_insert_returns_positions() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        let first = wal.insert_position();
        assert_eq!(first, WalWriter::segment_start(1));

        let (start, end) = wal.insert(&rec(10)).unwrap();
        assert_eq!(start, first);
        assert_eq!(end.0 - start.0, rec(10).encoded_len() as u64);
        assert_eq!(wal.insert_position(), end);
    }

    #[test]
    fn test_flush_is_monotonic() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        let (_, end) = wal.insert(&rec(10)).unwrap();
        assert!(wal.flushed_upto() < end);
        wal.flush(end).unwrap();
        assert_eq!(wal.flushed_upto(), end);
        wal.flush(end).unwrap();
        assert_eq!(wal.counters().sync_calls, 1);
    }

    #[test]
    fn test_rotation() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        let big = rec(200 * 1024);
        let (a, _) = wal.insert(&big).unwrap();
        let (b, _) = wal.insert(&big).unwrap();
        let (c, _) = wal.insert(&big).unwrap();
        assert_eq!(a.segment(), 1);
        assert_eq!(b.segment(), 1);
        assert_eq!(c, WalWriter::segment_start(2));
        assert_eq!(wal.counters().segment_rotations, 1);

        let result = WalReader::new(dir.path()).read_from(Lsn::INVALID).unwrap();
        assert_eq!(result.records.len(), 3);
    }

    #[test]
    fn test_reopen_appends_after_last_record() {
        let dir = tempdir().unwrap();
        let end = {
            let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
            let (_, end) = wal.insert(&rec(10)).unwrap();
            wal.flush(end).unwrap();
            end
        };
        let wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        assert_eq!(wal.insert_position(), end);
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let end = {
            let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
            let (_, end) = wal.insert(&rec(10)).unwrap();
            wal.flush_all().unwrap();
            end
        };
        let path = WalSegment::segment_path(dir.path(), 1);
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&rec(10).to_bytes()[..9]).unwrap();
        drop(file);

        let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        assert_eq!(wal.insert_position(), end);
        wal.insert(&rec(3)).unwrap();
        wal.flush_all().unwrap();

        let result = WalReader::new(dir.path()).read_from(Lsn::INVALID).unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.stop_reason, ReadStopReason::EndOfData);
    }

    #[test]
    fn test_foreign_cluster_rejected() {
        let dir = tempdir().unwrap();
        WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        assert!(matches!(
            WalWriter::open(dir.path(), [8u8; 16], WalConfig::for_testing()),
            Err(Error::Wal(_))
        ));
    }

    #[test]
    fn test_remove_segments_before() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        let big = rec(300 * 1024);
        wal.insert(&big).unwrap();
        wal.insert(&big).unwrap();
        let (start, _) = wal.insert(&big).unwrap();
        assert_eq!(start.segment(), 3);

        assert_eq!(wal.remove_segments_before(start).unwrap(), 2);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![3]);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = tempdir().unwrap();
        let mut wal = WalWriter::open(dir.path(), UUID, WalConfig::for_testing()).unwrap();
        assert!(wal.insert(&rec(600 * 1024)).is_err());
    }
}
