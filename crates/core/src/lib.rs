//! Core types for relstore
//!
//! This crate defines the foundational types used throughout the system:
//! - RelFileLocator / RelFileLocatorBackend: relation storage identity
//! - ForkNumber, BlockNumber, Lsn: addressing within relations and the log
//! - Limits: BLOCK_BYTES, BLOCKS_PER_SEGMENT, MAX_PENDING_WRITES
//! - Page: header layout, checksums, aligned page buffers
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod page;
pub mod types;

pub use error::{BlockRef, Error, IoOp, Result};
pub use limits::{
    BLOCKS_PER_SEGMENT, BLOCK_BYTES, DEFAULT_WAL_SKIP_THRESHOLD_BYTES, FIRST_NORMAL_OBJECT_ID,
    MAX_BLOCK_NUMBER, MAX_PENDING_WRITES,
};
pub use page::AlignedPage;
pub use types::{
    BackendOwner, BlockNumber, ForkNumber, Lsn, Oid, ProcNumber, RelFileLocator,
    RelFileLocatorBackend, RelPersistence, DEFAULT_TABLESPACE_OID, FORK_COUNT,
    GLOBAL_TABLESPACE_OID, INVALID_BLOCK_NUMBER, REL_FILE_LOCATOR_SIZE,
};
