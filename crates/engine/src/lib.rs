//! Storage manager engine for relstore
//!
//! This crate ties the lower layers together:
//! - Cluster: open/recover/shutdown of a data directory
//! - Session: per-backend relation cache and transaction storage state
//! - Transaction tracker: pending deletes and skip-WAL pending syncs
//! - Bulk writer and relation truncation
//! - Checkpoints and WAL redo
//!
//! The engine is the only component that knows about:
//! - Transaction end (commit, abort, two-phase)
//! - Cross-layer ordering (WAL before data, checkpoint delays)
//! - Replay logic

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bulk;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod critical;
pub mod redo;
pub mod session;
pub mod truncate;
pub mod xact;

pub use bulk::{BulkSyncOutcome, BulkWriteStats, BulkWriter};
pub use checkpoint::{CheckpointControl, CheckpointKind, CheckpointStats, DelayCheckpointGuard};
pub use cluster::{Cluster, ClusterBuilder, WAL_DIR_NAME};
pub use config::{ConfigError, SmgrConfig, WalLevel, CONFIG_FILE_NAME};
pub use critical::CriticalSection;
pub use redo::{RecoveryReport, RedoApplier, RedoCounts};
pub use session::{Session, XactOutcome};
pub use truncate::{AuxForkTruncation, FsmVmTruncation};
pub use xact::{PendingDelete, PendingSync, TransactionStorage, TwoPhaseStorage, WorkerSyncSet};
