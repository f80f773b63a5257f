//! Cluster: state shared by every session
//!
//! A cluster owns the data directory: the WAL, the control file, the
//! pending-sync queue and the backend registry. Sessions are created from
//! it and keep their own relation cache and transaction state.
//!
//! Dropping a cluster without [`Cluster::shutdown`] leaves the control file
//! "in production"; the next open replays the WAL from the last redo
//! pointer, exactly as after a crash.

use parking_lot::Mutex;
use relstore_core::{Error, Lsn, Result};
use relstore_durability::{
    ClusterState, ControlFile, LogRecord, WalCounters, WalRecord, WalWriter,
};
use relstore_storage::{
    BackendRegistry, BufferInvalidator, KeyStore, MdBackend, NoBufferPool, PrincipalKey,
    SyncQueue, TdeBackend,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::checkpoint::{run_checkpoint, CheckpointControl, CheckpointKind, CheckpointStats, DelayCheckpointGuard};
use crate::config::SmgrConfig;
use crate::redo::{recover, RecoveryReport};
use crate::session::Session;
use crate::truncate::{AuxForkTruncation, FsmVmTruncation};

/// WAL directory under the data directory.
pub const WAL_DIR_NAME: &str = "pg_wal";

/// Builder for [`Cluster`].
///
/// ```ignore
/// use relstore_engine::{Cluster, SmgrConfig};
///
/// // Settings from <data>/relstore.toml
/// let cluster = Cluster::open("/data/cluster")?;
///
/// // Explicit settings and collaborators
/// let cluster = Cluster::builder()
///     .config(SmgrConfig::for_testing())
///     .principal_key(key)
///     .open("/data/cluster")?;
/// ```
pub struct ClusterBuilder {
    config: Option<SmgrConfig>,
    principal_key: Option<PrincipalKey>,
    invalidator: Arc<dyn BufferInvalidator>,
    aux_forks: Arc<dyn AuxForkTruncation>,
}

impl ClusterBuilder {
    /// Builder with no overrides.
    pub fn new() -> Self {
        ClusterBuilder {
            config: None,
            principal_key: None,
            invalidator: Arc::new(NoBufferPool),
            aux_forks: Arc::new(FsmVmTruncation),
        }
    }

    /// Use `config` instead of reading `relstore.toml`.
    pub fn config(mut self, config: SmgrConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Principal key for the encryption shim.
    pub fn principal_key(mut self, key: PrincipalKey) -> Self {
        self.principal_key = Some(key);
        self
    }

    /// Buffer pool to notify before truncate and unlink.
    pub fn buffer_invalidator(mut self, invalidator: Arc<dyn BufferInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    /// Free-space and visibility map truncation collaborator.
    pub fn aux_fork_truncation(mut self, aux: Arc<dyn AuxForkTruncation>) -> Self {
        self.aux_forks = aux;
        self
    }

    /// Open (or initialise) the cluster in `data_dir`, replaying the WAL if
    /// it was not shut down cleanly.
    pub fn open(self, data_dir: impl AsRef<Path>) -> Result<Arc<Cluster>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::io(relstore_core::IoOp::Open, data_dir.display().to_string(), e))?;

        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => SmgrConfig::load_or_default(&data_dir)?,
        };

        let queue = Arc::new(SyncQueue::new(
            config.sync_queue_capacity,
            config.sync_max_attempts,
        ));
        let md = Arc::new(MdBackend::new(
            &data_dir,
            config.blocks_per_segment,
            Arc::clone(&queue),
        ));
        let registry = Arc::new(BackendRegistry::new(Arc::clone(&md)));

        let keys = if config.encryption {
            let principal = self.principal_key.ok_or_else(|| {
                Error::Config("encryption is enabled but no principal key was given".to_string())
            })?;
            let keys = Arc::new(KeyStore::open(&data_dir, principal)?);
            registry.install_shim(Arc::new(TdeBackend::new(md, Arc::clone(&keys))))?;
            Some(keys)
        } else {
            None
        };

        let (control, fresh) = match ControlFile::load(&data_dir)? {
            Some(control) => (control, false),
            None => (ControlFile::new_cluster(), true),
        };
        let wal = WalWriter::open(
            &data_dir.join(WAL_DIR_NAME),
            control.cluster_uuid,
            config.wal_config(),
        )?;

        let mut cluster = Cluster {
            data_dir,
            config,
            wal: Mutex::new(wal),
            control: Mutex::new(control),
            queue,
            registry,
            keys,
            checkpoints: Arc::new(CheckpointControl::new(control.redo)),
            invalidator: self.invalidator,
            aux_forks: self.aux_forks,
            next_proc: AtomicU32::new(1),
            recovery: None,
        };

        if fresh {
            cluster.update_control(|c| c.state = ClusterState::InProduction)?;
            run_checkpoint(&cluster, CheckpointKind::Immediate)?;
            info!(target: "relstore::checkpoint", dir = %cluster.data_dir.display(), "initialised cluster");
        } else if control.state != ClusterState::ShutDown {
            warn!(target: "relstore::redo", state = %control.state, "cluster was not shut down cleanly, starting recovery");
            let report = recover(&cluster)?;
            run_checkpoint(&cluster, CheckpointKind::EndOfRecovery)?;
            cluster.recovery = Some(report);
        } else {
            cluster.update_control(|c| c.state = ClusterState::InProduction)?;
        }

        Ok(Arc::new(cluster))
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared storage-manager state of one data directory.
pub struct Cluster {
    data_dir: PathBuf,
    config: SmgrConfig,
    wal: Mutex<WalWriter>,
    control: Mutex<ControlFile>,
    queue: Arc<SyncQueue>,
    registry: Arc<BackendRegistry>,
    keys: Option<Arc<KeyStore>>,
    checkpoints: Arc<CheckpointControl>,
    invalidator: Arc<dyn BufferInvalidator>,
    aux_forks: Arc<dyn AuxForkTruncation>,
    next_proc: AtomicU32,
    recovery: Option<RecoveryReport>,
}

impl Cluster {
    /// Open with settings from `<data_dir>/relstore.toml`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Arc<Cluster>> {
        ClusterBuilder::new().open(data_dir)
    }

    /// Builder for custom settings and collaborators.
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    /// Start a session.
    pub fn session(self: &Arc<Self>) -> Session {
        let proc = self.next_proc.fetch_add(1, Ordering::Relaxed);
        Session::new(Arc::clone(self), proc)
    }

    /// Data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// WAL directory.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join(WAL_DIR_NAME)
    }

    /// Active configuration.
    pub fn config(&self) -> &SmgrConfig {
        &self.config
    }

    /// Backend registry.
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Pending-sync queue.
    pub fn sync_queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Key store of the encryption shim, when installed.
    pub fn key_store(&self) -> Option<&Arc<KeyStore>> {
        self.keys.as_ref()
    }

    /// Buffer pool collaborator.
    pub fn buffer_invalidator(&self) -> &Arc<dyn BufferInvalidator> {
        &self.invalidator
    }

    /// FSM/VM truncation collaborator.
    pub fn aux_forks(&self) -> &Arc<dyn AuxForkTruncation> {
        &self.aux_forks
    }

    /// Checkpoint coordination state.
    pub fn checkpoint_control(&self) -> &Arc<CheckpointControl> {
        &self.checkpoints
    }

    /// Keep checkpoints from completing while the guard lives.
    pub fn delay_checkpoint(&self) -> DelayCheckpointGuard {
        self.checkpoints.delay()
    }

    /// Redo pointer of the most recently started checkpoint.
    pub fn redo_pointer(&self) -> Lsn {
        self.checkpoints.redo_pointer()
    }

    /// Snapshot of the control file.
    pub fn control(&self) -> ControlFile {
        *self.control.lock()
    }

    /// Report of the recovery run at open, if one ran.
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Position the next WAL record will start at.
    pub fn wal_insert_position(&self) -> Lsn {
        self.wal.lock().insert_position()
    }

    /// WAL counters.
    pub fn wal_counters(&self) -> WalCounters {
        self.wal.lock().counters()
    }

    /// Append a record to the WAL.
    pub(crate) fn log(&self, record: &LogRecord) -> Result<(Lsn, Lsn)> {
        self.log_raw(&record.encode()?)
    }

    pub(crate) fn log_raw(&self, record: &WalRecord) -> Result<(Lsn, Lsn)> {
        self.wal.lock().insert(record)
    }

    /// Make the WAL durable up to `upto`.
    pub fn flush_wal(&self, upto: Lsn) -> Result<()> {
        self.wal.lock().flush(upto)
    }

    pub(crate) fn remove_wal_before(&self, redo: Lsn) -> Result<usize> {
        self.wal.lock().remove_segments_before(redo)
    }

    /// Apply `f` to the control file and store it.
    pub(crate) fn update_control(&self, f: impl FnOnce(&mut ControlFile)) -> Result<()> {
        let mut control = self.control.lock();
        let mut updated = *control;
        f(&mut updated);
        updated.store(&self.data_dir)?;
        *control = updated;
        Ok(())
    }

    /// Move the min-recovery-point forward to `lsn`.
    pub(crate) fn advance_min_recovery_point(&self, lsn: Lsn) -> Result<()> {
        if self.control.lock().min_recovery_point >= lsn {
            return Ok(());
        }
        self.update_control(|c| c.min_recovery_point = c.min_recovery_point.max(lsn))
    }

    /// Run a checkpoint now.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        run_checkpoint(self, CheckpointKind::Immediate)
    }

    /// Checkpoint and mark the cluster cleanly shut down.
    pub fn shutdown(&self) -> Result<CheckpointStats> {
        let stats = run_checkpoint(self, CheckpointKind::Shutdown)?;
        info!(target: "relstore::checkpoint", "cluster shut down");
        Ok(stats)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("data_dir", &self.data_dir)
            .field("registry", &self.registry)
            .field("redo", &self.redo_pointer())
            .finish()
    }
}
