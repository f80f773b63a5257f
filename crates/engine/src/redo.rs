//! WAL redo
//!
//! Replays storage records from the last redo pointer after an unclean
//! stop. Replay is idempotent: files may already reflect any prefix of the
//! log, so creates tolerate existing files, truncates tolerate shorter
//! forks and unlinks tolerate missing ones.

use relstore_core::{
    page::{set_page_checksum, set_page_lsn},
    Error, ForkNumber, Lsn, RelFileLocator, RelFileLocatorBackend, Result,
};
use relstore_durability::{
    ClusterState, LogRecord, LoggedRecord, ReadStopReason, WalReader, WalWriter, XlNewPages,
    XlSmgrTruncate,
};
use relstore_storage::{Smgr, SmgrHandle};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;

/// Summary of one recovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Where replay started
    pub start: Lsn,
    /// End of the valid log
    pub end_of_log: Lsn,
    /// Why reading stopped
    pub stop_reason: ReadStopReason,
    /// Records replayed, by kind
    pub counts: RedoCounts,
}

/// Records replayed, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedoCounts {
    /// SMGR CREATE
    pub creates: usize,
    /// SMGR TRUNCATE
    pub truncates: usize,
    /// NEWPAGES
    pub new_pages: usize,
    /// CHECKPOINT
    pub checkpoints: usize,
    /// XACT COMMIT
    pub commits: usize,
    /// XACT ABORT
    pub aborts: usize,
}

impl RedoCounts {
    /// Total records replayed.
    pub fn total(&self) -> usize {
        self.creates + self.truncates + self.new_pages + self.checkpoints + self.commits + self.aborts
    }
}

/// Applies logged records to the data directory.
pub struct RedoApplier<'c> {
    cluster: &'c Cluster,
    smgr: Smgr,
    touched: FxHashSet<(RelFileLocator, ForkNumber)>,
    counts: RedoCounts,
}

impl<'c> RedoApplier<'c> {
    /// Applier with its own recovery-mode relation cache.
    pub fn new(cluster: &'c Cluster) -> Self {
        let mut smgr = Smgr::new(
            Arc::clone(cluster.registry()),
            Arc::clone(cluster.buffer_invalidator()),
        );
        smgr.set_in_recovery(true);
        RedoApplier {
            cluster,
            smgr,
            touched: FxHashSet::default(),
            counts: RedoCounts::default(),
        }
    }

    /// Records applied so far.
    pub fn counts(&self) -> RedoCounts {
        self.counts
    }

    /// Apply one record.
    pub fn apply(&mut self, logged: &LoggedRecord) -> Result<()> {
        let record = LogRecord::decode(&logged.record)?;
        debug!(target: "relstore::redo", lsn = %logged.start, kind = record.name(), "redo");
        match record {
            LogRecord::SmgrCreate(x) => {
                let h = self.open(x.locator)?;
                self.smgr.create(h, x.fork, true)?;
                self.touched.insert((x.locator, x.fork));
                self.counts.creates += 1;
            }
            LogRecord::SmgrTruncate(x) => {
                self.redo_truncate(&x, logged.end)?;
                self.counts.truncates += 1;
            }
            LogRecord::NewPages(x) => {
                self.redo_new_pages(x, logged.end)?;
                self.counts.new_pages += 1;
            }
            LogRecord::Checkpoint(_) => self.counts.checkpoints += 1,
            LogRecord::XactCommit(x) => {
                self.redo_drops(&x.dropped)?;
                self.counts.commits += 1;
            }
            LogRecord::XactAbort(x) => {
                self.redo_drops(&x.dropped)?;
                self.counts.aborts += 1;
            }
        }
        Ok(())
    }

    /// Fsync every fork replay wrote to.
    pub fn finish(mut self) -> Result<RedoCounts> {
        let mut touched: Vec<_> = self.touched.drain().collect();
        touched.sort();
        for (locator, fork) in touched {
            let h = self.open(locator)?;
            if self.smgr.exists(h, fork)? {
                self.smgr.immedsync(h, fork)?;
            }
        }
        self.smgr.release_all();
        Ok(self.counts)
    }

    fn open(&mut self, locator: RelFileLocator) -> Result<SmgrHandle> {
        self.smgr.open(RelFileLocatorBackend::shared(locator))
    }

    fn redo_truncate(&mut self, x: &XlSmgrTruncate, end: Lsn) -> Result<()> {
        let h = self.open(x.locator)?;
        // The relation may be dropped later in the log. Recreate it and
        // replay until the drop is seen.
        self.smgr.create(h, ForkNumber::Main, true)?;

        // Once files shrink, recovery may not stop before this record.
        self.cluster.advance_min_recovery_point(end)?;

        let rel = h.rel();
        let aux = Arc::clone(self.cluster.aux_forks());
        let mut forks = Vec::new();
        let mut blocks = Vec::new();
        if x.truncates(ForkNumber::Main) {
            forks.push(ForkNumber::Main);
            blocks.push(x.blkno);
        }
        if x.truncates(ForkNumber::Fsm) && self.smgr.exists(h, ForkNumber::Fsm)? {
            let current = self.smgr.nblocks(h, ForkNumber::Fsm)?;
            if let Some(n) = aux.prepare_fsm_truncate(&rel, current, x.blkno) {
                forks.push(ForkNumber::Fsm);
                blocks.push(n);
            }
        }
        if x.truncates(ForkNumber::VisibilityMap)
            && self.smgr.exists(h, ForkNumber::VisibilityMap)?
        {
            let current = self.smgr.nblocks(h, ForkNumber::VisibilityMap)?;
            if let Some(n) = aux.prepare_vm_truncate(&rel, current, x.blkno) {
                forks.push(ForkNumber::VisibilityMap);
                blocks.push(n);
            }
        }
        if !forks.is_empty() {
            self.smgr.truncate(h, &forks, &blocks)?;
            for &fork in &forks {
                self.touched.insert((x.locator, fork));
            }
        }
        if forks.contains(&ForkNumber::Fsm) {
            aux.vacuum_fsm(&rel);
        }
        Ok(())
    }

    fn redo_new_pages(&mut self, x: XlNewPages, end: Lsn) -> Result<()> {
        let h = self.open(x.locator)?;
        self.smgr.create(h, x.fork, true)?;
        let checksums = self.cluster.config().data_checksums;
        for page in x.pages {
            let mut image = page.image;
            if page.standard_layout {
                set_page_lsn(&mut image, end);
            }
            if checksums {
                set_page_checksum(&mut image, page.blkno);
            }
            self.smgr.write(h, x.fork, page.blkno, &image, true)?;
        }
        self.touched.insert((x.locator, x.fork));
        Ok(())
    }

    fn redo_drops(&mut self, dropped: &[RelFileLocator]) -> Result<()> {
        if dropped.is_empty() {
            return Ok(());
        }
        let rels: Vec<_> = dropped
            .iter()
            .map(|l| RelFileLocatorBackend::shared(*l))
            .collect();
        self.smgr.unlink_all(&rels, true)?;
        self.touched.retain(|(locator, _)| !dropped.contains(locator));
        Ok(())
    }
}

/// Replay the WAL from the control file's redo pointer.
pub(crate) fn recover(cluster: &Cluster) -> Result<RecoveryReport> {
    let started = Instant::now();
    let control = cluster.control();
    let start = if control.redo.is_valid() {
        control.redo
    } else {
        WalWriter::segment_start(1)
    };
    cluster.update_control(|c| c.state = ClusterState::InCrashRecovery)?;
    info!(target: "relstore::redo", %start, "redo starts");

    let read = WalReader::new(cluster.wal_dir()).read_from(start)?;
    if !matches!(read.stop_reason, ReadStopReason::EndOfData) {
        warn!(target: "relstore::redo", reason = ?read.stop_reason, end = %read.end_of_log, "WAL ends in an unreadable record");
    }

    let mut applier = RedoApplier::new(cluster);
    for logged in &read.records {
        applier.apply(logged).map_err(|e| match e {
            Error::Corruption(msg) => Error::Corruption(format!(
                "WAL record at {}: {}",
                logged.start, msg
            )),
            other => other,
        })?;
    }
    let counts = applier.finish()?;

    info!(
        target: "relstore::redo",
        end = %read.end_of_log,
        records = counts.total(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "redo done"
    );
    Ok(RecoveryReport {
        start,
        end_of_log: read.end_of_log,
        stop_reason: read.stop_reason,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmgrConfig;
    use relstore_core::{page::page_lsn, AlignedPage, RelPersistence, BLOCK_BYTES};
    use relstore_durability::{NewPageImage, RmgrId, WalRecord, XlSmgrCreate};
    use tempfile::tempdir;

    fn loc() -> RelFileLocator {
        RelFileLocator::new(1663, 5, 16384)
    }

    fn logged(record: &LogRecord, end: u64) -> LoggedRecord {
        LoggedRecord {
            start: Lsn(end - 1),
            end: Lsn(end),
            record: record.encode().unwrap(),
        }
    }

    fn new_pages(blknos: &[u32]) -> LogRecord {
        LogRecord::NewPages(XlNewPages {
            locator: loc(),
            fork: ForkNumber::Main,
            pages: blknos
                .iter()
                .map(|&blkno| {
                    let mut image = vec![0u8; BLOCK_BYTES];
                    relstore_core::page::page_init(&mut image, 0);
                    image[200] = blkno as u8 + 1;
                    NewPageImage {
                        blkno,
                        standard_layout: true,
                        image,
                    }
                })
                .collect(),
        })
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let cluster = Cluster::builder()
            .config(SmgrConfig::for_testing())
            .open(dir.path())
            .unwrap();
        let create = LogRecord::SmgrCreate(XlSmgrCreate {
            locator: loc(),
            fork: ForkNumber::Main,
        });
        let pages = new_pages(&[0, 1, 2]);

        for _ in 0..2 {
            let mut applier = RedoApplier::new(&cluster);
            applier.apply(&logged(&create, 100)).unwrap();
            applier.apply(&logged(&pages, 200)).unwrap();
            assert_eq!(applier.finish().unwrap().total(), 2);
        }

        let mut s = cluster.session();
        let h = s.open(loc(), RelPersistence::Permanent).unwrap();
        assert_eq!(s.smgr().nblocks(h, ForkNumber::Main).unwrap(), 3);
        let mut page = AlignedPage::zeroed();
        s.smgr().read(h, ForkNumber::Main, 2, &mut page[..]).unwrap();
        assert_eq!(page[200], 3);
        assert_eq!(page_lsn(&page[..]), Lsn(200));
    }

    #[test]
    fn test_truncate_redo_tolerates_short_fork() {
        let dir = tempdir().unwrap();
        let cluster = Cluster::builder()
            .config(SmgrConfig::for_testing())
            .open(dir.path())
            .unwrap();
        let truncate = LogRecord::SmgrTruncate(XlSmgrTruncate {
            locator: loc(),
            blkno: 10,
            flags: relstore_durability::SMGR_TRUNCATE_ALL,
        });
        let mut applier = RedoApplier::new(&cluster);
        applier.apply(&logged(&new_pages(&[0, 1]), 100)).unwrap();
        applier.apply(&logged(&truncate, 300)).unwrap();
        applier.finish().unwrap();
        assert_eq!(cluster.control().min_recovery_point, Lsn(300));

        let mut s = cluster.session();
        let h = s.open(loc(), RelPersistence::Permanent).unwrap();
        assert_eq!(s.smgr().nblocks(h, ForkNumber::Main).unwrap(), 2);
    }

    #[test]
    fn test_commit_redo_unlinks_dropped() {
        let dir = tempdir().unwrap();
        let cluster = Cluster::builder()
            .config(SmgrConfig::for_testing())
            .open(dir.path())
            .unwrap();
        let commit = LogRecord::XactCommit(relstore_durability::XlXactFinish {
            dropped: vec![loc()],
        });
        let mut applier = RedoApplier::new(&cluster);
        applier.apply(&logged(&new_pages(&[0]), 100)).unwrap();
        applier.apply(&logged(&commit, 200)).unwrap();
        // Dropping again is harmless.
        applier.apply(&logged(&commit, 300)).unwrap();
        assert_eq!(applier.finish().unwrap().commits, 2);

        let mut s = cluster.session();
        let h = s.open(loc(), RelPersistence::Permanent).unwrap();
        assert!(!s.smgr().exists(h, ForkNumber::Main).unwrap());
    }

    #[test]
    fn test_unknown_record_is_corruption() {
        let dir = tempdir().unwrap();
        let cluster = Cluster::builder()
            .config(SmgrConfig::for_testing())
            .open(dir.path())
            .unwrap();
        let bogus = LoggedRecord {
            start: Lsn(1),
            end: Lsn(2),
            record: WalRecord::new(RmgrId::Smgr, 0x70, Vec::new()),
        };
        let err = RedoApplier::new(&cluster).apply(&bogus).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
