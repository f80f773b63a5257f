//! WAL segment file and record format.
//!
//! WAL segments are named `wal-NNNNNN.seg` where `NNNNNN` is a zero-padded segment number.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ Record 2                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬────────────┬──────────┬──────────┬─────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format (1) │ Rmgr (1) │ Info (1) │ Payload (variable)  │ CRC32 (4)│
//! └─────────────────┴────────────┴──────────┴──────────┴─────────────────────┴──────────┘
//! ```
//!
//! The length covers everything after itself, CRC included. The CRC covers
//! format byte, resource-manager id, info byte and payload.

use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a WAL segment file: "RSWL"
pub const SEGMENT_MAGIC: [u8; 4] = *b"RSWL";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Current WAL record format version
pub const WAL_RECORD_FORMAT_VERSION: u8 = 1;

/// Bytes of framing around a record payload: length, format, rmgr, info, crc.
pub const RECORD_OVERHEAD: usize = 4 + 3 + 4;

/// Upper bound on a single record, used to reject garbage length fields.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// WAL segment header (32 bytes).
///
/// The header is written at the beginning of each segment file and contains
/// metadata for validation and compatibility checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentHeader {
    /// Magic bytes: "RSWL"
    pub magic: [u8; 4],

    /// Format version for forward compatibility
    pub format_version: u32,

    /// Segment number (monotonically increasing, starts at 1)
    pub segment_number: u64,

    /// Cluster UUID (for integrity checking across segments)
    pub cluster_uuid: [u8; 16],
}

impl SegmentHeader {
    /// Create a new segment header.
    pub fn new(segment_number: u64, cluster_uuid: [u8; 16]) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_number,
            cluster_uuid,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.cluster_uuid);
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        Some(SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            segment_number: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            cluster_uuid: bytes[16..32].try_into().ok()?,
        })
    }

    /// Validate magic bytes and version.
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.format_version == SEGMENT_FORMAT_VERSION
    }
}

fn invalid_data(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// WAL segment file handle.
///
/// A segment is a single WAL file containing multiple records.
/// Only the active segment is writable; closed segments are immutable.
pub struct WalSegment {
    file: File,
    segment_number: u64,
    write_position: u64,
    path: PathBuf,
    closed: bool,
    cluster_uuid: [u8; 16],
}

impl WalSegment {
    /// Create a new WAL segment and write its header.
    pub fn create(
        dir: &Path,
        segment_number: u64,
        cluster_uuid: [u8; 16],
    ) -> std::io::Result<Self> {
        let path = Self::segment_path(dir, segment_number);

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;

        let header = SegmentHeader::new(segment_number, cluster_uuid);
        file.write_all(&header.to_bytes())?;

        Ok(WalSegment {
            file,
            segment_number,
            write_position: SEGMENT_HEADER_SIZE as u64,
            path,
            closed: false,
            cluster_uuid,
        })
    }

    fn open_with(dir: &Path, segment_number: u64, writable: bool) -> std::io::Result<Self> {
        let path = Self::segment_path(dir, segment_number);

        let mut file = OpenOptions::new().read(true).write(writable).open(&path)?;

        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;

        let header = SegmentHeader::from_bytes(&header_bytes)
            .ok_or_else(|| invalid_data("invalid segment header".to_string()))?;

        if !header.is_valid() {
            return Err(invalid_data(format!(
                "invalid magic or version in {}",
                path.display()
            )));
        }

        if header.segment_number != segment_number {
            return Err(invalid_data(format!(
                "segment number mismatch: expected {}, got {}",
                segment_number, header.segment_number
            )));
        }

        let write_position = file.seek(SeekFrom::End(0))?;

        Ok(WalSegment {
            file,
            segment_number,
            write_position,
            path,
            closed: !writable,
            cluster_uuid: header.cluster_uuid,
        })
    }

    /// Open an existing WAL segment for reading.
    pub fn open_read(dir: &Path, segment_number: u64) -> std::io::Result<Self> {
        Self::open_with(dir, segment_number, false)
    }

    /// Open an existing WAL segment for appending.
    pub fn open_append(dir: &Path, segment_number: u64) -> std::io::Result<Self> {
        Self::open_with(dir, segment_number, true)
    }

    /// Segment file path: `wal-NNNNNN.seg`.
    pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
        dir.join(format!("wal-{:06}.seg", segment_number))
    }

    /// Parse a segment number out of a file name.
    pub fn parse_segment_name(name: &str) -> Option<u64> {
        name.strip_prefix("wal-")?
            .strip_suffix(".seg")?
            .parse::<u64>()
            .ok()
    }

    /// Get segment number.
    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    /// Get current segment size in bytes.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// Get the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get cluster UUID.
    pub fn cluster_uuid(&self) -> [u8; 16] {
        self.cluster_uuid
    }

    /// Write bytes at the end of the segment.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "cannot write to closed segment",
            ));
        }

        self.file.write_all(data)?;
        self.write_position += data.len() as u64;
        Ok(())
    }

    /// Sync segment data to disk.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Sync and mark the segment immutable.
    pub fn close(&mut self) -> std::io::Result<()> {
        if !self.closed {
            self.file.sync_all()?;
            self.closed = true;
        }
        Ok(())
    }

    /// Read everything after the header.
    pub fn read_body(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE as u64))?;
        self.file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Truncate segment at the given position.
    ///
    /// Used when reopening after a crash to drop a torn tail.
    pub fn truncate(&mut self, position: u64) -> std::io::Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "cannot truncate closed segment",
            ));
        }

        self.file.set_len(position)?;
        self.file.sync_all()?;
        self.write_position = position;
        self.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }
}

/// Resource managers that own WAL record payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RmgrId {
    /// Log-internal records: checkpoints and full-page images
    Xlog = 0,
    /// Transaction commit/abort
    Xact = 1,
    /// Relation storage create/truncate
    Smgr = 2,
}

impl RmgrId {
    /// Decode a resource manager id.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RmgrId::Xlog),
            1 => Some(RmgrId::Xact),
            2 => Some(RmgrId::Smgr),
            _ => None,
        }
    }
}

impl std::fmt::Display for RmgrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RmgrId::Xlog => "XLOG",
            RmgrId::Xact => "Transaction",
            RmgrId::Smgr => "Storage",
        };
        f.write_str(name)
    }
}

/// A framed WAL record: resource manager, operation code and opaque payload.
///
/// Each record is self-delimiting with a length prefix and CRC32 checksum.
/// Records are immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Owning resource manager
    pub rmgr: RmgrId,

    /// Operation code within the resource manager
    pub info: u8,

    /// Encoded record body
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Create a new WAL record.
    pub fn new(rmgr: RmgrId, info: u8, payload: Vec<u8>) -> Self {
        WalRecord {
            rmgr,
            info,
            payload,
        }
    }

    /// Size of the record once framed.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }

    /// Serialize record to bytes.
    ///
    /// Format: length (4) + format_version (1) + rmgr (1) + info (1) + payload + crc32 (4)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(3 + self.payload.len());
        body.push(WAL_RECORD_FORMAT_VERSION);
        body.push(self.rmgr as u8);
        body.push(self.info);
        body.extend_from_slice(&self.payload);

        let crc = Self::compute_crc(&body);

        let total_len = body.len() + 4;
        let mut record = Vec::with_capacity(4 + total_len);
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc.to_le_bytes());
        record
    }

    /// Deserialize record from bytes.
    ///
    /// Returns (record, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalRecordError> {
        if bytes.len() < 4 {
            return Err(WalRecordError::InsufficientData);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[0..4]);
        let length = u32::from_le_bytes(len_bytes) as usize;

        // Minimum: format + rmgr + info + crc
        if length < 7 || length > MAX_RECORD_SIZE {
            return Err(WalRecordError::InvalidFormat);
        }

        if bytes.len() < 4 + length {
            return Err(WalRecordError::InsufficientData);
        }

        let body = &bytes[4..4 + length - 4];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[4 + length - 4..4 + length]);
        let stored_crc = u32::from_le_bytes(crc_bytes);

        let computed_crc = Self::compute_crc(body);
        if stored_crc != computed_crc {
            return Err(WalRecordError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let format_version = body[0];
        if format_version != WAL_RECORD_FORMAT_VERSION {
            return Err(WalRecordError::UnsupportedVersion(format_version));
        }

        let rmgr = RmgrId::from_u8(body[1]).ok_or(WalRecordError::UnknownRmgr(body[1]))?;

        Ok((
            WalRecord {
                rmgr,
                info: body[2],
                payload: body[3..].to_vec(),
            },
            4 + length,
        ))
    }

    fn compute_crc(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }
}

/// WAL record framing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalRecordError {
    /// Not enough bytes for a complete record (torn tail).
    #[error("insufficient data for WAL record")]
    InsufficientData,

    /// Length field is impossible.
    #[error("invalid WAL record format")]
    InvalidFormat,

    /// CRC mismatch.
    #[error("WAL record checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Stored CRC
        expected: u32,
        /// Computed CRC
        computed: u32,
    },

    /// Format version this build does not understand.
    #[error("unsupported WAL record format version {0}")]
    UnsupportedVersion(u8),

    /// Resource manager id this build does not understand.
    #[error("unknown resource manager id {0}")]
    UnknownRmgr(u8),
}

impl From<WalRecordError> for relstore_core::Error {
    fn from(e: WalRecordError) -> Self {
        relstore_core::Error::Wal(e.to_string())
    }
}
