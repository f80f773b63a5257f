//! Durability layer for relstore
//!
//! This crate handles the log-structured half of the storage manager:
//!
//! - WAL: segmented write-ahead log with LSN-addressed, CRC-framed records
//! - Record formats: SMGR create/truncate, bulk-write page images,
//!   checkpoints, transaction commit/abort
//! - Control file: checkpoint location, redo pointer, min-recovery-point

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod wal;

pub use format::{
    ClusterState, ControlFile, LogRecord, NewPageImage, RmgrId, WalRecord, WalRecordError,
    XlCheckpoint, XlNewPages, XlSmgrCreate, XlSmgrTruncate, XlXactFinish, SMGR_TRUNCATE_ALL,
    SMGR_TRUNCATE_FSM, SMGR_TRUNCATE_MAIN, SMGR_TRUNCATE_VM,
};
pub use wal::{
    LoggedRecord, ReadStopReason, WalConfig, WalConfigError, WalCounters, WalReadResult,
    WalReader, WalWriter,
};
