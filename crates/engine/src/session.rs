//! Sessions
//!
//! A session is one backend's view of the cluster: its relation cache and
//! the storage side of its current transaction. Transaction end drives the
//! pending deletes and pending syncs recorded in [`TransactionStorage`].

use relstore_core::{
    page::{page_has_standard_layout, page_is_new},
    AlignedPage, BackendOwner, BlockNumber, Error, ForkNumber, Lsn, Oid, ProcNumber,
    RelFileLocator, RelFileLocatorBackend, RelPersistence, Result, BLOCK_BYTES,
    MAX_PENDING_WRITES, REL_FILE_LOCATOR_SIZE,
};
use relstore_durability::{LogRecord, NewPageImage, XlNewPages, XlSmgrCreate, XlXactFinish};
use relstore_storage::{Smgr, SmgrHandle};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::critical::CriticalSection;
use crate::xact::{PendingSync, TransactionStorage, TwoPhaseStorage, WorkerSyncSet};

/// What transaction end did to storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XactOutcome {
    /// End record position, if one was written
    pub lsn: Option<Lsn>,
    /// Forks unlinked
    pub unlinked: usize,
    /// Skip-WAL relations fsynced
    pub synced: usize,
    /// Skip-WAL relations WAL-logged instead
    pub logged: usize,
}

/// One backend's storage session.
pub struct Session {
    cluster: Arc<Cluster>,
    proc: ProcNumber,
    smgr: Smgr,
    xact: Option<TransactionStorage>,
    worker: Option<WorkerSyncSet>,
}

impl Session {
    pub(crate) fn new(cluster: Arc<Cluster>, proc: ProcNumber) -> Self {
        let smgr = Smgr::new(
            Arc::clone(cluster.registry()),
            Arc::clone(cluster.buffer_invalidator()),
        );
        Session {
            cluster,
            proc,
            smgr,
            xact: None,
            worker: None,
        }
    }

    /// Owning cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Process number; owner tag of this session's temp relations.
    pub fn proc_number(&self) -> ProcNumber {
        self.proc
    }

    /// The session's relation cache and dispatcher.
    pub fn smgr(&mut self) -> &mut Smgr {
        &mut self.smgr
    }

    /// Open a relation in the session's cache.
    pub fn open(&mut self, locator: RelFileLocator, persistence: RelPersistence) -> Result<SmgrHandle> {
        let rel = self.qualify(locator, persistence);
        self.smgr.open(rel)
    }

    /// Qualified locator of a relation with `persistence` in this session.
    pub fn qualify(&self, locator: RelFileLocator, persistence: RelPersistence) -> RelFileLocatorBackend {
        match persistence {
            RelPersistence::Temp => RelFileLocatorBackend::new(locator, BackendOwner::Temp(self.proc)),
            RelPersistence::Permanent | RelPersistence::Unlogged => {
                RelFileLocatorBackend::shared(locator)
            }
        }
    }

    /// Storage tracker of the open transaction.
    pub fn transaction(&self) -> Option<&TransactionStorage> {
        self.xact.as_ref()
    }

    pub(crate) fn xact_mut(&mut self) -> Result<&mut TransactionStorage> {
        self.xact
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("no transaction in progress".to_string()))
    }

    /// Start a transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.xact.is_some() {
            return Err(Error::InvalidOperation(
                "transaction already in progress".to_string(),
            ));
        }
        self.xact = Some(TransactionStorage::new());
        Ok(())
    }

    /// Start a subtransaction.
    pub fn begin_subxact(&mut self) -> Result<()> {
        self.xact_mut()?.push_subxact();
        Ok(())
    }

    /// Create the main fork of a new relation and schedule its unlink at abort.
    pub fn record_create(
        &mut self,
        locator: RelFileLocator,
        persistence: RelPersistence,
    ) -> Result<SmgrHandle> {
        let rel = self.qualify(locator, persistence);
        let skip_wal = persistence == RelPersistence::Permanent
            && self.cluster.config().wal_skipping_enabled();
        let xact = self
            .xact
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("no transaction in progress".to_string()))?;

        if self.smgr.open_under_other_owner(&rel) {
            return Err(Error::Conflict(format!(
                "relation {} is already open under another owner",
                locator
            )));
        }
        let h = self.smgr.open(rel)?;
        self.smgr.create(h, ForkNumber::Main, false)?;
        if persistence == RelPersistence::Permanent {
            self.cluster.log(&LogRecord::SmgrCreate(XlSmgrCreate {
                locator,
                fork: ForkNumber::Main,
            }))?;
            xact.mark_wrote_wal();
        }
        xact.add_delete(rel, false);
        if skip_wal {
            xact.add_sync(locator);
        }
        debug!(target: "relstore::xact", rel = %rel, ?persistence, skip_wal, "created relation storage");
        Ok(h)
    }

    /// Schedule the relation behind `h` for unlink at commit.
    pub fn record_drop(&mut self, h: SmgrHandle) -> Result<()> {
        let rel = h.rel();
        self.xact_mut()?.add_delete(rel, true);
        debug!(target: "relstore::xact", rel = %rel, "scheduled relation drop");
        Ok(())
    }

    /// Cancel scheduled unlinks of `locator`. Returns how many were removed.
    pub fn preserve(&mut self, locator: &RelFileLocator, at_commit: bool) -> Result<usize> {
        Ok(self.xact_mut()?.preserve(locator, at_commit))
    }

    /// Note an upcoming truncation of `locator`.
    pub fn pre_truncate(&mut self, locator: &RelFileLocator) -> Result<()> {
        self.xact_mut()?.pre_truncate(locator);
        Ok(())
    }

    /// Whether WAL is being skipped for `locator`, in this session's
    /// transaction or in the leader's when running as a parallel worker.
    pub fn skipping_wal(&self, locator: &RelFileLocator) -> bool {
        self.xact
            .as_ref()
            .is_some_and(|xact| xact.skipping_wal(locator))
            || self
                .worker
                .as_ref()
                .is_some_and(|set| set.skipping_wal(locator))
    }

    /// Whether changes to a relation must be WAL-logged.
    pub fn relation_needs_wal(&self, locator: &RelFileLocator, persistence: RelPersistence) -> bool {
        persistence == RelPersistence::Permanent && !self.skipping_wal(locator)
    }

    /// Bytes needed to hand the skip-WAL set to a parallel worker.
    pub fn estimate_worker_space(&self) -> usize {
        self.xact
            .as_ref()
            .map_or(REL_FILE_LOCATOR_SIZE, |x| x.estimate_worker_space())
    }

    /// Encode the skip-WAL set for a parallel worker.
    pub fn serialize_for_worker(&self) -> Result<Vec<u8>> {
        let xact = self
            .xact
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("no transaction in progress".to_string()))?;
        let mut buf = Vec::with_capacity(xact.estimate_worker_space());
        xact.serialize_for_worker(&mut buf);
        Ok(buf)
    }

    /// Adopt the leader's skip-WAL set. The set is read-only here.
    pub fn enter_parallel_worker(&mut self, buf: &[u8]) -> Result<()> {
        self.worker = Some(WorkerSyncSet::deserialize(buf)?);
        Ok(())
    }

    /// Leave parallel-worker mode.
    pub fn exit_parallel_worker(&mut self) {
        self.worker = None;
    }

    /// Commit the current subtransaction.
    pub fn on_subxact_commit(&mut self) -> Result<()> {
        self.xact_mut()?.subxact_commit()
    }

    /// Abort the current subtransaction, unlinking relations it created.
    pub fn on_subxact_abort(&mut self) -> Result<XactOutcome> {
        let unlink = self.xact_mut()?.subxact_abort()?;
        let lsn = self.log_xact_end(&unlink, false)?;
        let unlinked = self.unlink(&unlink);
        Ok(XactOutcome {
            lsn,
            unlinked,
            ..XactOutcome::default()
        })
    }

    /// Commit: make skip-WAL relations durable, write the commit record,
    /// then unlink dropped relations.
    pub fn on_xact_commit(&mut self) -> Result<XactOutcome> {
        let mut xact = self
            .xact
            .take()
            .ok_or_else(|| Error::InvalidOperation("no transaction in progress".to_string()))?;
        xact.collapse_subxacts();

        let mut outcome = XactOutcome::default();
        let result = self.do_pending_syncs(&mut xact, &mut outcome);
        if let Err(e) = result {
            // The transaction is still open; the caller aborts it.
            self.xact = Some(xact);
            return Err(e);
        }

        let drops = xact.deletes_at(true);
        if xact.wrote_wal() || drops.iter().any(|rel| !rel.is_temp()) {
            outcome.lsn = self.log_xact_end(&drops, true)?;
        }
        outcome.unlinked = self.unlink(&drops);
        self.smgr.at_eoxact();
        debug!(target: "relstore::xact", unlinked = outcome.unlinked, synced = outcome.synced, logged = outcome.logged, "transaction committed");
        Ok(outcome)
    }

    /// Abort: unlink relations created in the transaction.
    pub fn on_xact_abort(&mut self) -> Result<XactOutcome> {
        let mut xact = self
            .xact
            .take()
            .ok_or_else(|| Error::InvalidOperation("no transaction in progress".to_string()))?;
        xact.collapse_subxacts();

        let drops = xact.deletes_at(false);
        let lsn = self.log_xact_end(&drops, false)?;
        let unlinked = self.unlink(&drops);
        self.smgr.at_eoxact();
        debug!(target: "relstore::xact", unlinked, "transaction aborted");
        Ok(XactOutcome {
            lsn,
            unlinked,
            ..XactOutcome::default()
        })
    }

    /// Prepare for two-phase commit.
    ///
    /// Skip-WAL relations are made durable now. The returned record holds
    /// the deletes of both outcomes; the session's lists are emptied.
    pub fn prepare_transaction(&mut self) -> Result<TwoPhaseStorage> {
        let mut xact = self
            .xact
            .take()
            .ok_or_else(|| Error::InvalidOperation("no transaction in progress".to_string()))?;
        xact.collapse_subxacts();

        let mut outcome = XactOutcome::default();
        if let Err(e) = self.do_pending_syncs(&mut xact, &mut outcome) {
            self.xact = Some(xact);
            return Err(e);
        }
        if xact.wrote_wal() {
            let upto = self.cluster.wal_insert_position();
            self.cluster.flush_wal(upto)?;
        }
        let record = xact.take_two_phase();
        self.smgr.at_eoxact();
        debug!(
            target: "relstore::xact",
            commit_deletes = record.commit_deletes.len(),
            abort_deletes = record.abort_deletes.len(),
            "transaction prepared"
        );
        Ok(record)
    }

    /// Finish a prepared transaction, unlinking the relations its outcome drops.
    pub fn finish_prepared(&mut self, record: &TwoPhaseStorage, commit: bool) -> Result<XactOutcome> {
        let locators = if commit {
            &record.commit_deletes
        } else {
            &record.abort_deletes
        };
        let rels: Vec<_> = locators
            .iter()
            .map(|l| RelFileLocatorBackend::shared(*l))
            .collect();
        let lsn = self.log_xact_end(&rels, commit)?;
        let unlinked = self.unlink(&rels);
        Ok(XactOutcome {
            lsn,
            unlinked,
            ..XactOutcome::default()
        })
    }

    /// Drop every relation of a database from this session and the disk.
    pub fn drop_database(&mut self, db_oid: Oid) -> Result<()> {
        self.smgr.drop_database(db_oid)
    }

    fn do_pending_syncs(
        &mut self,
        xact: &mut TransactionStorage,
        outcome: &mut XactOutcome,
    ) -> Result<()> {
        let threshold = self.cluster.config().wal_skip_threshold_bytes;
        for (locator, sync) in xact.syncs_for_commit() {
            if self.sync_relation(locator, sync, threshold)? {
                outcome.synced += 1;
            } else {
                outcome.logged += 1;
                xact.mark_wrote_wal();
            }
        }
        Ok(())
    }

    // Returns true when fsynced, false when WAL-logged.
    fn sync_relation(
        &mut self,
        locator: RelFileLocator,
        sync: PendingSync,
        threshold: u64,
    ) -> Result<bool> {
        let h = self.smgr.open(RelFileLocatorBackend::shared(locator))?;
        let mut forks = Vec::new();
        let mut total_bytes = 0u64;
        for fork in ForkNumber::ALL {
            if self.smgr.exists(h, fork)? {
                let n = self.smgr.nblocks(h, fork)?;
                total_bytes += n as u64 * BLOCK_BYTES as u64;
                forks.push((fork, n));
            }
        }

        if sync.is_truncated || total_bytes >= threshold {
            for &(fork, _) in &forks {
                self.smgr.immedsync(h, fork)?;
            }
            debug!(target: "relstore::xact", rel = %locator, total_bytes, truncated = sync.is_truncated, "fsynced skip-WAL relation");
            return Ok(true);
        }

        for &(fork, n) in &forks {
            self.log_fork_pages(h, locator, fork, n)?;
        }
        debug!(target: "relstore::xact", rel = %locator, total_bytes, "WAL-logged skip-WAL relation");
        Ok(false)
    }

    fn log_fork_pages(
        &mut self,
        h: SmgrHandle,
        locator: RelFileLocator,
        fork: ForkNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        let mut page = AlignedPage::zeroed();
        let mut blkno = 0;
        while blkno < nblocks {
            let end = nblocks.min(blkno + MAX_PENDING_WRITES as BlockNumber);
            let mut pages = Vec::with_capacity((end - blkno) as usize);
            for b in blkno..end {
                self.smgr.read(h, fork, b, &mut page[..])?;
                pages.push(NewPageImage {
                    blkno: b,
                    standard_layout: !page_is_new(&page[..]) && page_has_standard_layout(&page[..]),
                    image: page.to_vec(),
                });
            }
            self.cluster
                .log(&LogRecord::NewPages(XlNewPages { locator, fork, pages }))?;
            blkno = end;
        }
        Ok(())
    }

    // Commit/abort record naming the shared relations dropped. Written and
    // flushed inside a critical section.
    fn log_xact_end(&self, rels: &[RelFileLocatorBackend], commit: bool) -> Result<Option<Lsn>> {
        let dropped: Vec<RelFileLocator> = rels
            .iter()
            .filter(|rel| !rel.is_temp())
            .map(|rel| rel.locator)
            .collect();
        if !commit && dropped.is_empty() {
            return Ok(None);
        }
        let finish = XlXactFinish { dropped };
        let record = if commit {
            LogRecord::XactCommit(finish)
        } else {
            LogRecord::XactAbort(finish)
        };
        let start = CriticalSection::run(if commit { "commit" } else { "abort" }, || {
            let (start, end) = self.cluster.log(&record)?;
            self.cluster.flush_wal(end)?;
            Ok(start)
        });
        Ok(Some(start))
    }

    // Post-commit unlink failures leave garbage behind but cannot undo the
    // transaction, so they are logged and swallowed.
    fn unlink(&mut self, rels: &[RelFileLocatorBackend]) -> usize {
        if rels.is_empty() {
            return 0;
        }
        match self.smgr.unlink_all(rels, false) {
            Ok(n) => n,
            Err(e) => {
                warn!(target: "relstore::xact", error = %e, count = rels.len(), "could not remove relation files");
                0
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.xact.is_some() {
            if let Err(e) = self.on_xact_abort() {
                warn!(target: "relstore::xact", error = %e, "abort at session exit failed");
            }
        }
        self.smgr.release_all();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("proc", &self.proc)
            .field("smgr", &self.smgr)
            .field("in_transaction", &self.xact.is_some())
            .finish()
    }
}
