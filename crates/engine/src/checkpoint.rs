//! Checkpoints
//!
//! A checkpoint picks a new redo pointer, waits for sessions that asked to
//! delay it, fsyncs every file in the pending-sync queue, writes a
//! `CHECKPOINT` record and publishes the new redo pointer in the control
//! file. WAL segments wholly before the redo pointer are then removed.

use parking_lot::{Condvar, Mutex};
use relstore_core::{Lsn, Result};
use relstore_durability::{ClusterState, LogRecord, XlCheckpoint};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::critical::CriticalSection;

#[derive(Debug, Default)]
struct DelayState {
    delaying: usize,
}

/// Shared checkpoint coordination state.
#[derive(Debug)]
pub struct CheckpointControl {
    redo: Mutex<Lsn>,
    delays: Mutex<DelayState>,
    released: Condvar,
    // Serializes checkpoints.
    running: Mutex<()>,
}

impl CheckpointControl {
    pub(crate) fn new(redo: Lsn) -> Self {
        CheckpointControl {
            redo: Mutex::new(redo),
            delays: Mutex::new(DelayState::default()),
            released: Condvar::new(),
            running: Mutex::new(()),
        }
    }

    /// Redo pointer of the most recently started checkpoint.
    pub fn redo_pointer(&self) -> Lsn {
        *self.redo.lock()
    }

    /// Number of sessions currently delaying checkpoints.
    pub fn delaying(&self) -> usize {
        self.delays.lock().delaying
    }

    /// Keep checkpoints from completing until the guard is dropped.
    pub fn delay(self: &Arc<Self>) -> DelayCheckpointGuard {
        self.delays.lock().delaying += 1;
        DelayCheckpointGuard {
            control: Arc::clone(self),
        }
    }

    fn set_redo(&self, redo: Lsn) {
        *self.redo.lock() = redo;
    }

    fn wait_for_delays(&self) {
        let mut delays = self.delays.lock();
        if delays.delaying > 0 {
            debug!(target: "relstore::checkpoint", delaying = delays.delaying, "waiting for sessions delaying checkpoint");
        }
        while delays.delaying > 0 {
            self.released.wait(&mut delays);
        }
    }
}

/// Scoped checkpoint delay. Released on every exit path, unwinding included.
#[derive(Debug)]
pub struct DelayCheckpointGuard {
    control: Arc<CheckpointControl>,
}

impl Drop for DelayCheckpointGuard {
    fn drop(&mut self) {
        let mut delays = self.control.delays.lock();
        delays.delaying -= 1;
        if delays.delaying == 0 {
            self.control.released.notify_all();
        }
    }
}

/// Why a checkpoint runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Requested while running
    Immediate,
    /// Last act of recovery
    EndOfRecovery,
    /// Clean shutdown
    Shutdown,
}

/// Outcome of one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// New redo pointer
    pub redo: Lsn,
    /// Start of the checkpoint record
    pub checkpoint_lsn: Lsn,
    /// Files fsynced from the pending-sync queue
    pub synced: usize,
    /// Canceled requests skipped
    pub skipped: usize,
    /// Absorb rounds needed to drain the queue
    pub rounds: usize,
    /// WAL segments removed
    pub wal_segments_removed: usize,
}

/// Run a checkpoint against `cluster`.
pub(crate) fn run_checkpoint(cluster: &Cluster, kind: CheckpointKind) -> Result<CheckpointStats> {
    let started = Instant::now();
    let control = cluster.checkpoint_control();
    let _running = control.running.lock();

    let redo = cluster.wal_insert_position();
    control.set_redo(redo);
    control.wait_for_delays();

    let mut stats = CheckpointStats {
        redo,
        ..CheckpointStats::default()
    };
    // A file that cannot be fsynced may have lost writes the redo pointer
    // no longer covers.
    CriticalSection::run("checkpoint sync", || {
        loop {
            let batch = cluster.sync_queue().absorb_all();
            let report = cluster
                .sync_queue()
                .process(batch, cluster.registry().as_ref())?;
            stats.synced += report.synced;
            stats.skipped += report.skipped;
            stats.rounds += 1;
            if report.requeued == 0 {
                return Ok(());
            }
        }
    });

    let record = LogRecord::Checkpoint(XlCheckpoint { redo }).encode()?;
    let (start, end) = cluster.log_raw(&record)?;
    cluster.flush_wal(end)?;
    stats.checkpoint_lsn = start;

    let state = match kind {
        CheckpointKind::Shutdown => ClusterState::ShutDown,
        CheckpointKind::Immediate | CheckpointKind::EndOfRecovery => ClusterState::InProduction,
    };
    cluster.update_control(|c| {
        c.checkpoint = start;
        c.redo = redo;
        c.state = state;
    })?;
    stats.wal_segments_removed = cluster.remove_wal_before(redo)?;

    info!(
        target: "relstore::checkpoint",
        ?kind,
        %redo,
        checkpoint = %start,
        synced = stats.synced,
        skipped = stats.skipped,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "checkpoint complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_delay_guard_counts() {
        let control = Arc::new(CheckpointControl::new(Lsn::INVALID));
        let a = control.delay();
        let b = control.delay();
        assert_eq!(control.delaying(), 2);
        drop(a);
        assert_eq!(control.delaying(), 1);
        drop(b);
        assert_eq!(control.delaying(), 0);
    }

    #[test]
    fn test_wait_for_delays_blocks_until_release() {
        let control = Arc::new(CheckpointControl::new(Lsn::INVALID));
        let guard = control.delay();
        let waiter = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || {
                control.wait_for_delays();
                Instant::now()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        let released_at = Instant::now();
        drop(guard);
        let woke_at = waiter.join().unwrap();
        assert!(woke_at >= released_at);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let control = Arc::new(CheckpointControl::new(Lsn::INVALID));
        let c = Arc::clone(&control);
        let result = std::thread::spawn(move || {
            let _guard = c.delay();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(control.delaying(), 0);
    }
}
