//! On-disk byte formats for the WAL and the control file.
//!
//! Keeping serialization separate from operational logic (how the WAL is
//! written and replayed) keeps format evolution in one place.
//!
//! # Module Structure
//!
//! - `wal_record`: WAL segment header and record framing
//! - `records`: typed bodies of the records the storage layer emits
//! - `control`: the cluster control file

pub mod control;
pub mod records;
pub mod wal_record;

pub use control::{ClusterState, ControlFile, CONTROL_FILE_NAME};
pub use records::{
    LogRecord, NewPageImage, XlCheckpoint, XlNewPages, XlSmgrCreate, XlSmgrTruncate,
    XlXactFinish, SMGR_TRUNCATE_ALL, SMGR_TRUNCATE_FSM, SMGR_TRUNCATE_MAIN, SMGR_TRUNCATE_VM,
};
pub use wal_record::{
    RmgrId, SegmentHeader, WalRecord, WalRecordError, WalSegment, SEGMENT_FORMAT_VERSION,
    SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, WAL_RECORD_FORMAT_VERSION,
};
