//! WAL configuration.

use crate::format::wal_record::{MAX_RECORD_SIZE, SEGMENT_HEADER_SIZE};

/// Smallest segment that still holds the largest record the storage layer emits.
pub const MIN_SEGMENT_SIZE: u64 = 512 * 1024;

/// WAL configuration parameters.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum segment size in bytes (default: 16MB).
    ///
    /// A record that would not fit in the current segment starts a new one.
    /// Offsets inside a segment are 32-bit, which bounds this value.
    pub segment_size: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl WalConfig {
    /// Create a new WAL configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set segment size (builder pattern).
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(WalConfigError::SegmentSizeTooSmall);
        }
        if self.segment_size > u32::MAX as u64 {
            return Err(WalConfigError::SegmentSizeTooLarge);
        }
        Ok(())
    }

    /// Largest payload-bearing record this configuration can store.
    pub fn max_record_bytes(&self) -> u64 {
        (self.segment_size - SEGMENT_HEADER_SIZE as u64).min(MAX_RECORD_SIZE as u64)
    }

    /// Create a configuration optimized for testing (small segments).
    pub fn for_testing() -> Self {
        WalConfig {
            segment_size: MIN_SEGMENT_SIZE,
        }
    }
}

/// WAL configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// Segment size is too small to hold a full bulk-write record.
    #[error("WAL segment size must be at least {} bytes", MIN_SEGMENT_SIZE)]
    SegmentSizeTooSmall,

    /// Segment offsets would overflow 32 bits.
    #[error("WAL segment size must fit in 32 bits")]
    SegmentSizeTooLarge,
}

impl From<WalConfigError> for relstore_core::Error {
    fn from(e: WalConfigError) -> Self {
        relstore_core::Error::Config(e.to_string())
    }
}
