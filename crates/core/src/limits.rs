//! Build-time storage limits
//!
//! These constants fix the physical layout of relation files. They are
//! shared by every crate so that the bulk-write batch size and the WAL
//! block-reference limit can never drift apart.

use crate::types::BlockNumber;

/// Size of one page in bytes.
pub const BLOCK_BYTES: usize = 8192;

/// Maximum number of blocks stored in one segment file (1 GiB at 8 KiB pages).
pub const BLOCKS_PER_SEGMENT: BlockNumber = 131072;

/// Maximum number of block references in a single WAL record.
///
/// The bulk-write engine batches exactly this many pages before emitting a
/// `NEWPAGES` record, and the record decoder rejects anything larger.
pub const MAX_PENDING_WRITES: usize = 32;

/// Largest addressable block number. `u32::MAX` is reserved as the invalid
/// sentinel.
pub const MAX_BLOCK_NUMBER: BlockNumber = u32::MAX - 1;

/// Relation numbers below this value belong to the system catalog.
pub const FIRST_NORMAL_OBJECT_ID: u32 = 16384;

/// Default commit-time WAL-vs-fsync threshold (2 MiB).
pub const DEFAULT_WAL_SKIP_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024;

/// Bytes in one full segment file.
pub const fn segment_bytes(blocks_per_segment: BlockNumber) -> u64 {
    blocks_per_segment as u64 * BLOCK_BYTES as u64
}
