//! Cluster control file (`global/pg_control`).
//!
//! The control file records where crash recovery must start and how far
//! replay has to get before the data directory is consistent.
//!
//! # Binary Format (64 bytes)
//!
//! ```text
//! magic("RSCF", 4) + version(4) + cluster_uuid(16) + state(4)
//! + checkpoint(8) + redo(8) + min_recovery_point(8) + pad(8) + crc32(4)
//! ```
//!
//! Writes go to a temporary file that is fsynced and renamed over the old
//! one, so a reader sees either the previous or the new contents.

use crc32fast::Hasher;
use relstore_core::{Error, IoOp, Lsn, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the control file.
pub const CONTROL_MAGIC: &[u8; 4] = b"RSCF";

/// Current control file format version.
pub const CONTROL_VERSION: u32 = 1;

/// Serialized size.
pub const CONTROL_FILE_SIZE: usize = 64;

/// Path of the control file relative to the data directory.
pub const CONTROL_FILE_NAME: &str = "global/pg_control";

/// State recorded in the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClusterState {
    /// Cleanly shut down; no replay needed
    ShutDown = 1,
    /// Running; a crash leaves this behind
    InProduction = 2,
    /// Replay in progress
    InCrashRecovery = 3,
}

impl ClusterState {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ClusterState::ShutDown),
            2 => Some(ClusterState::InProduction),
            3 => Some(ClusterState::InCrashRecovery),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterState::ShutDown => "shut down",
            ClusterState::InProduction => "in production",
            ClusterState::InCrashRecovery => "in crash recovery",
        };
        f.write_str(s)
    }
}

/// Contents of the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFile {
    /// Identifies the cluster; matches every WAL segment header
    pub cluster_uuid: [u8; 16],
    /// Current state
    pub state: ClusterState,
    /// Start of the last checkpoint record
    pub checkpoint: Lsn,
    /// Replay start position of the last checkpoint
    pub redo: Lsn,
    /// Replay must reach this position before the data directory is consistent
    pub min_recovery_point: Lsn,
}

impl ControlFile {
    /// Control file for a freshly initialised cluster.
    pub fn new_cluster() -> Self {
        ControlFile {
            cluster_uuid: *uuid::Uuid::new_v4().as_bytes(),
            state: ClusterState::ShutDown,
            checkpoint: Lsn::INVALID,
            redo: Lsn::INVALID,
            min_recovery_point: Lsn::INVALID,
        }
    }

    /// Location of the control file in `data_dir`.
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONTROL_FILE_NAME)
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; CONTROL_FILE_SIZE] {
        let mut buf = [0u8; CONTROL_FILE_SIZE];
        buf[0..4].copy_from_slice(CONTROL_MAGIC);
        buf[4..8].copy_from_slice(&CONTROL_VERSION.to_le_bytes());
        buf[8..24].copy_from_slice(&self.cluster_uuid);
        buf[24..28].copy_from_slice(&(self.state as u32).to_le_bytes());
        buf[28..36].copy_from_slice(&self.checkpoint.0.to_le_bytes());
        buf[36..44].copy_from_slice(&self.redo.0.to_le_bytes());
        buf[44..52].copy_from_slice(&self.min_recovery_point.0.to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&buf[..60]);
        buf[60..64].copy_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    /// Deserialize, verifying magic, version and CRC.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != CONTROL_FILE_SIZE {
            return Err(Error::Corruption(format!(
                "control file is {} bytes, expected {}",
                buf.len(),
                CONTROL_FILE_SIZE
            )));
        }
        if &buf[0..4] != CONTROL_MAGIC {
            return Err(Error::Corruption("control file magic mismatch".into()));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let mut hasher = Hasher::new();
        hasher.update(&buf[..60]);
        if hasher.finalize() != u32_at(60) {
            return Err(Error::Corruption("control file checksum mismatch".into()));
        }
        let version = u32_at(4);
        if version != CONTROL_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported control file version {}",
                version
            )));
        }
        let state = ClusterState::from_u32(u32_at(24)).ok_or_else(|| {
            Error::Corruption(format!("invalid cluster state {}", u32_at(24)))
        })?;
        let mut cluster_uuid = [0u8; 16];
        cluster_uuid.copy_from_slice(&buf[8..24]);

        Ok(ControlFile {
            cluster_uuid,
            state,
            checkpoint: Lsn(u64_at(28)),
            redo: Lsn(u64_at(36)),
            min_recovery_point: Lsn(u64_at(44)),
        })
    }

    /// Load the control file of `data_dir`; `None` if it does not exist.
    pub fn load(data_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(data_dir);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::open(path.display().to_string(), e)),
        };
        let mut buf = Vec::with_capacity(CONTROL_FILE_SIZE);
        file.read_to_end(&mut buf)
            .map_err(|e| Error::io(IoOp::Read, path.display().to_string(), e))?;
        Self::from_bytes(&buf).map(Some)
    }

    /// Atomically replace the control file of `data_dir`.
    pub fn store(&self, data_dir: &Path) -> Result<()> {
        let path = Self::path(data_dir);
        let tmp = path.with_extension("tmp");
        let describe = |p: &Path| p.display().to_string();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(IoOp::Open, describe(parent), e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| Error::open(describe(&tmp), e))?;
        file.write_all(&self.to_bytes())
            .map_err(|e| Error::io(IoOp::Write, describe(&tmp), e))?;
        file.sync_all()
            .map_err(|e| Error::io(IoOp::Fsync, describe(&tmp), e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::io(IoOp::Rename, describe(&tmp), e))?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                dir.sync_all()
                    .map_err(|e| Error::io(IoOp::Fsync, describe(parent), e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_and_load() {
        let dir = tempdir().unwrap();
        assert!(ControlFile::load(dir.path()).unwrap().is_none());

        let mut control = ControlFile::new_cluster();
        control.state = ClusterState::InProduction;
        control.checkpoint = Lsn::from_parts(1, 4096);
        control.redo = Lsn::from_parts(1, 32);
        control.store(dir.path()).unwrap();

        let loaded = ControlFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, control);
        assert!(!ControlFile::path(dir.path()).with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_control_file_detected() {
        let control = ControlFile::new_cluster();
        let mut bytes = control.to_bytes();
        bytes[30] ^= 0x01;
        assert!(matches!(
            ControlFile::from_bytes(&bytes),
            Err(Error::Corruption(_))
        ));
        assert!(ControlFile::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_distinct_cluster_ids() {
        assert_ne!(
            ControlFile::new_cluster().cluster_uuid,
            ControlFile::new_cluster().cluster_uuid
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ClusterState::InCrashRecovery.to_string(), "in crash recovery");
    }
}
