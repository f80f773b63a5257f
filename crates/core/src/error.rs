//! Error types for relstore
//!
//! This module defines the error type shared by every layer of the storage
//! manager. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! Every I/O-flavoured error carries the resource it concerns (a relation
//! segment path such as `1663/5/16384_fsm.2`, or a plain file path) and,
//! when applicable, the block number. [`Error::code`] exposes a numeric
//! cause for callers that need one.

use crate::types::BlockNumber;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for relstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// The I/O operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// open / create
    Open,
    /// read
    Read,
    /// write
    Write,
    /// extend
    Extend,
    /// truncate
    Truncate,
    /// fsync
    Fsync,
    /// unlink
    Unlink,
    /// stat / seek to end
    Seek,
    /// rename
    Rename,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            IoOp::Open => "open",
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::Extend => "extend",
            IoOp::Truncate => "truncate",
            IoOp::Fsync => "fsync",
            IoOp::Unlink => "remove",
            IoOp::Seek => "seek to end of",
            IoOp::Rename => "rename",
        };
        f.write_str(verb)
    }
}

/// Optional block reference rendered inside error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockRef(pub Option<BlockNumber>);

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(block) => write!(f, " at block {}", block),
            None => Ok(()),
        }
    }
}

/// Error types for the storage manager
#[derive(Debug, Error)]
pub enum Error {
    /// A file that the operation requires does not exist.
    #[error("could not open file \"{path}\": {source}")]
    NotFound {
        /// Resource descriptor
        path: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// read/write/fsync/open failure.
    #[error("could not {op} file \"{path}\"{block}: {source}")]
    Io {
        /// Failed operation
        op: IoOp,
        /// Resource descriptor
        path: String,
        /// Block, if the operation addressed one
        block: BlockRef,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Short read not at EOF, misaligned file size, unknown WAL op code.
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Block number outside the addressable range of a fork.
    #[error("block {block} is out of range for file \"{path}\"")]
    OutOfRange {
        /// Resource descriptor
        path: String,
        /// Offending block
        block: BlockNumber,
    },

    /// Second shim installation, owner mismatch on create.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A relation handle was used after its cache entry was invalidated.
    #[error("stale relation handle for {0}")]
    StaleHandle(String),

    /// Write-ahead log failure.
    #[error("WAL error: {0}")]
    Wal(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an OS error from an operation on `path`.
    pub fn io(op: IoOp, path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            block: BlockRef(None),
            source,
        }
    }

    /// Wrap an OS error from an operation addressing `block` of `path`.
    pub fn block_io(
        op: IoOp,
        path: impl Into<String>,
        block: BlockNumber,
        source: io::Error,
    ) -> Self {
        Error::Io {
            op,
            path: path.into(),
            block: BlockRef(Some(block)),
            source,
        }
    }

    /// Classify an open failure: missing files become `NotFound`.
    pub fn open(path: impl Into<String>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Error::NotFound {
                path: path.into(),
                source,
            }
        } else {
            Error::io(IoOp::Open, path, source)
        }
    }

    /// Whether this error reports a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Numeric cause: the OS error number when one exists, otherwise a
    /// stable negative code per error kind.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound { source, .. } | Error::Io { source, .. } => {
                source.raw_os_error().unwrap_or(-1)
            }
            Error::Corruption(_) => -2,
            Error::OutOfRange { .. } => -3,
            Error::Conflict(_) => -4,
            Error::InvalidOperation(_) => -5,
            Error::StaleHandle(_) => -6,
            Error::Wal(_) => -7,
            Error::Config(_) => -8,
        }
    }
}
