//! Storage manager configuration via `relstore.toml`
//!
//! On first open a default `relstore.toml` is written to the data directory.
//! To change settings, edit the file and restart the cluster.

use relstore_core::{BlockNumber, Error, BLOCKS_PER_SEGMENT, DEFAULT_WAL_SKIP_THRESHOLD_BYTES};
use relstore_durability::{WalConfig, WalConfigError};
use relstore_storage::{DEFAULT_SYNC_MAX_ATTEMPTS, DEFAULT_SYNC_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "relstore.toml";

/// How much information is written to the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalLevel {
    /// Relations created in the current transaction skip WAL and are
    /// synced or logged wholesale at commit
    Minimal,
    /// Every change to a permanent relation is logged
    Replica,
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Segments must hold at least one block.
    #[error("blocks_per_segment must be between 1 and {}", BLOCKS_PER_SEGMENT)]
    BlocksPerSegment,

    /// The WAL rejected the segment size.
    #[error("invalid wal_segment_size: {0}")]
    WalSegmentSize(#[from] WalConfigError),

    /// At least one fsync attempt is required.
    #[error("sync_max_attempts must be at least 1")]
    SyncMaxAttempts,

    /// The sync queue must hold at least one request.
    #[error("sync_queue_capacity must be at least 1")]
    SyncQueueCapacity,

    /// The config file could not be read or written.
    #[error("config file \"{path}\": {message}")]
    File {
        /// Config file path
        path: String,
        /// What went wrong
        message: String,
    },
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// Storage manager configuration loaded from `relstore.toml`.
///
/// # Example
///
/// ```toml
/// wal_level = "replica"
/// wal_skip_threshold_bytes = 2097152
/// blocks_per_segment = 131072
/// encryption = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmgrConfig {
    /// `minimal` enables skip-WAL for relations created in the current transaction.
    #[serde(default = "default_wal_level")]
    pub wal_level: WalLevel,
    /// Commit-time boundary between WAL-logging and fsyncing a new relation.
    #[serde(default = "default_wal_skip_threshold_bytes")]
    pub wal_skip_threshold_bytes: u64,
    /// Blocks per relation segment file.
    #[serde(default = "default_blocks_per_segment")]
    pub blocks_per_segment: BlockNumber,
    /// WAL segment file size in bytes.
    #[serde(default = "default_wal_segment_size")]
    pub wal_segment_size: u64,
    /// fsync attempts per pending-sync request before the failure is fatal.
    #[serde(default = "default_sync_max_attempts")]
    pub sync_max_attempts: u32,
    /// Distinct pending-sync requests held before writers fsync themselves.
    #[serde(default = "default_sync_queue_capacity")]
    pub sync_queue_capacity: usize,
    /// Stamp page checksums on bulk-written and replayed pages.
    #[serde(default = "default_true")]
    pub data_checksums: bool,
    /// Install the encryption shim.
    #[serde(default)]
    pub encryption: bool,
}

fn default_wal_level() -> WalLevel {
    WalLevel::Replica
}

fn default_wal_skip_threshold_bytes() -> u64 {
    DEFAULT_WAL_SKIP_THRESHOLD_BYTES
}

fn default_blocks_per_segment() -> BlockNumber {
    BLOCKS_PER_SEGMENT
}

fn default_wal_segment_size() -> u64 {
    WalConfig::default().segment_size
}

fn default_sync_max_attempts() -> u32 {
    DEFAULT_SYNC_MAX_ATTEMPTS
}

fn default_sync_queue_capacity() -> usize {
    DEFAULT_SYNC_QUEUE_CAPACITY
}

fn default_true() -> bool {
    true
}

impl Default for SmgrConfig {
    fn default() -> Self {
        SmgrConfig {
            wal_level: default_wal_level(),
            wal_skip_threshold_bytes: default_wal_skip_threshold_bytes(),
            blocks_per_segment: default_blocks_per_segment(),
            wal_segment_size: default_wal_segment_size(),
            sync_max_attempts: default_sync_max_attempts(),
            sync_queue_capacity: default_sync_queue_capacity(),
            data_checksums: true,
            encryption: false,
        }
    }
}

impl SmgrConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for tests: tiny relation and WAL segments.
    pub fn for_testing() -> Self {
        SmgrConfig {
            blocks_per_segment: 8,
            wal_segment_size: WalConfig::for_testing().segment_size,
            ..Self::default()
        }
    }

    /// Set the WAL level (builder pattern).
    pub fn with_wal_level(mut self, level: WalLevel) -> Self {
        self.wal_level = level;
        self
    }

    /// Set the WAL skip threshold (builder pattern).
    pub fn with_wal_skip_threshold(mut self, bytes: u64) -> Self {
        self.wal_skip_threshold_bytes = bytes;
        self
    }

    /// Set blocks per segment (builder pattern).
    pub fn with_blocks_per_segment(mut self, blocks: BlockNumber) -> Self {
        self.blocks_per_segment = blocks;
        self
    }

    /// Set the WAL segment size (builder pattern).
    pub fn with_wal_segment_size(mut self, bytes: u64) -> Self {
        self.wal_segment_size = bytes;
        self
    }

    /// Set the pending-sync retry bound (builder pattern).
    pub fn with_sync_max_attempts(mut self, attempts: u32) -> Self {
        self.sync_max_attempts = attempts;
        self
    }

    /// Set the pending-sync queue capacity (builder pattern).
    pub fn with_sync_queue_capacity(mut self, capacity: usize) -> Self {
        self.sync_queue_capacity = capacity;
        self
    }

    /// Enable or disable page checksums (builder pattern).
    pub fn with_data_checksums(mut self, enabled: bool) -> Self {
        self.data_checksums = enabled;
        self
    }

    /// Enable or disable the encryption shim (builder pattern).
    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    /// Whether new relations may skip WAL until commit.
    pub fn wal_skipping_enabled(&self) -> bool {
        self.wal_level == WalLevel::Minimal
    }

    /// WAL writer configuration derived from this config.
    pub fn wal_config(&self) -> WalConfig {
        WalConfig::new().with_segment_size(self.wal_segment_size)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks_per_segment == 0 || self.blocks_per_segment > BLOCKS_PER_SEGMENT {
            return Err(ConfigError::BlocksPerSegment);
        }
        self.wal_config().validate()?;
        if self.sync_max_attempts == 0 {
            return Err(ConfigError::SyncMaxAttempts);
        }
        if self.sync_queue_capacity == 0 {
            return Err(ConfigError::SyncQueueCapacity);
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# relstore storage manager configuration
#
# WAL level: "replica" (default) or "minimal"
#   "minimal" = relations created in a transaction skip WAL; at commit they
#               are WAL-logged wholesale when small, fsynced when large
wal_level = "replica"

# Commit-time boundary for "minimal": smaller relations are logged as
# full pages, larger ones are fsynced (default: 2 MiB)
wal_skip_threshold_bytes = 2097152

# Blocks per relation segment file (default: 131072, i.e. 1 GiB of 8 KiB blocks)
blocks_per_segment = 131072

# WAL segment file size in bytes (default: 16 MiB)
wal_segment_size = 16777216

# fsync attempts per pending sync request before giving up (default: 5)
sync_max_attempts = 5

# Pending sync requests held before writers fsync on their own (default: 65536)
sync_queue_capacity = 65536

# Stamp page checksums on bulk-written and replayed pages (default: true)
data_checksums = true

# Encrypt user relations; requires a principal key at open (default: false)
encryption = false
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file_err = |message: String| ConfigError::File {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let config: SmgrConfig = toml::from_str(&content).map_err(|e| file_err(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| ConfigError::File {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let file_err = |message: String| ConfigError::File {
            path: path.display().to_string(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| file_err(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| file_err(e.to_string()))
    }

    /// Load `relstore.toml` from `data_dir`, writing the default first if absent.
    pub fn load_or_default(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SmgrConfig::default();
        assert_eq!(config.wal_level, WalLevel::Replica);
        assert_eq!(config.wal_skip_threshold_bytes, 2 * 1024 * 1024);
        assert_eq!(config.blocks_per_segment, BLOCKS_PER_SEGMENT);
        assert!(config.data_checksums);
        assert!(!config.encryption);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_toml_matches_default() {
        let config: SmgrConfig = toml::from_str(SmgrConfig::default_toml()).unwrap();
        assert_eq!(config, SmgrConfig::default());
    }

    #[test]
    fn test_parse_minimal() {
        let config: SmgrConfig = toml::from_str("wal_level = \"minimal\"").unwrap();
        assert!(config.wal_skipping_enabled());
        assert_eq!(config.blocks_per_segment, BLOCKS_PER_SEGMENT);
    }

    #[test]
    fn test_parse_invalid_level() {
        assert!(toml::from_str::<SmgrConfig>("wal_level = \"logical\"").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = SmgrConfig::default().with_blocks_per_segment(0);
        assert_eq!(cfg.validate(), Err(ConfigError::BlocksPerSegment));
        let cfg = SmgrConfig::default().with_wal_segment_size(1024);
        assert!(matches!(cfg.validate(), Err(ConfigError::WalSegmentSize(_))));
        let cfg = SmgrConfig::default().with_sync_max_attempts(0);
        assert_eq!(cfg.validate(), Err(ConfigError::SyncMaxAttempts));
        let cfg = SmgrConfig::default().with_sync_queue_capacity(0);
        assert_eq!(cfg.validate(), Err(ConfigError::SyncQueueCapacity));
    }

    #[test]
    fn test_for_testing_is_valid() {
        assert!(SmgrConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let config = SmgrConfig::load_or_default(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(config, SmgrConfig::default());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = SmgrConfig::for_testing()
            .with_wal_level(WalLevel::Minimal)
            .with_encryption(true);
        config.write_to_file(&path).unwrap();
        assert_eq!(SmgrConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "wal_level = \"minimal\"\n").unwrap();
        SmgrConfig::write_default_if_missing(&path).unwrap();
        assert!(SmgrConfig::from_file(&path).unwrap().wal_skipping_enabled());
    }
}
